//! lattice-agent — per-host agent for the Lattice fleet plane.
//!
//! Pairs once with the master using a short code, then runs four long-lived
//! workers: heartbeat sender, websocket streamer, command poller and the
//! terminal manager. Commands translate to libvirt/docker/git invocations;
//! interactive terminals ride a PTY multiplexer.

pub mod capability;
pub mod config;
pub mod container_docker;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod log_mirror;
pub mod pairing;
pub mod poller;
pub mod runner;
pub mod state;
pub mod system;
pub mod terminal;
pub mod update_git;
pub mod vm_virsh;
pub mod ws;

pub use config::AgentConfig;
pub use error::{AgentError, AgentResult};
pub use state::PairingState;
