//! PTY multiplexer for interactive terminal sessions.
//!
//! Each session owns a pseudo-terminal pair and a child process (shell,
//! `virsh console`, `docker exec` or `docker logs`). A dedicated reader
//! thread pumps PTY output into the outbound frame queue, coalescing up to
//! 128 KiB per frame; input and resize arrive from the websocket streamer.

use crate::events::EventQueue;
use crate::runner::{is_root, run_sudo};
use base64::Engine;
use lattice_proto::AgentFrame;
use parking_lot::Mutex;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const READ_BUF_SIZE: usize = 128 * 1024;
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// What a session should attach to.
#[derive(Debug, Clone)]
pub enum OpenTarget {
    NodeShell,
    VmConsole { domain_name: String },
    ContainerShell { runtime_name: String },
    ContainerLogs { runtime_name: String, tail: u32 },
}

impl OpenTarget {
    /// Sessions for the same runtime target displace each other; node shells
    /// may coexist freely.
    fn key(&self) -> Option<String> {
        match self {
            Self::NodeShell => None,
            Self::VmConsole { domain_name } => Some(format!("vm:{domain_name}")),
            Self::ContainerShell { runtime_name } => Some(format!("container-shell:{runtime_name}")),
            Self::ContainerLogs { runtime_name, .. } => {
                Some(format!("container-logs:{runtime_name}"))
            }
        }
    }

    fn accepts_input(&self) -> bool {
        !matches!(self, Self::ContainerLogs { .. })
    }
}

struct SessionHandle {
    target_key: Option<String>,
    accepts_input: bool,
    writer: Arc<std::sync::Mutex<Box<dyn Write + Send>>>,
    master: Box<dyn MasterPty + Send>,
    killer: std::sync::Mutex<Box<dyn ChildKiller + Send + Sync>>,
    /// Set before an intentional kill (close or displacement) so the reader
    /// thread does not emit a spurious `terminal_exit`.
    closed: Arc<AtomicBool>,
}

pub struct TerminalManager {
    outbound: Arc<EventQueue>,
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

fn clamp_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        cols: if (20..=300).contains(&cols) { cols } else { DEFAULT_COLS },
        rows: if (5..=120).contains(&rows) { rows } else { DEFAULT_ROWS },
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

impl TerminalManager {
    pub fn new(outbound: Arc<EventQueue>) -> Self {
        Self {
            outbound,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn emit_error(&self, session_id: &str, error: impl Into<String>) {
        self.outbound.push(AgentFrame::TerminalError {
            session_id: session_id.to_string(),
            error: error.into(),
        });
    }

    /// Build the child command for a target. Privileged tools go through
    /// `sudo -n` when the agent is not root.
    fn build_command(target: &OpenTarget) -> CommandBuilder {
        let sudo_wrap = |args: &[&str]| -> CommandBuilder {
            let mut cmd = if is_root() {
                let mut cmd = CommandBuilder::new(args[0]);
                cmd.args(&args[1..]);
                cmd
            } else {
                let mut cmd = CommandBuilder::new("sudo");
                cmd.arg("-n");
                cmd.args(args);
                cmd
            };
            cmd.env("TERM", "xterm-256color");
            cmd
        };

        match target {
            OpenTarget::NodeShell => {
                let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
                let mut cmd = CommandBuilder::new(shell);
                cmd.env("TERM", "xterm-256color");
                cmd
            }
            OpenTarget::VmConsole { domain_name } => {
                sudo_wrap(&["virsh", "console", domain_name, "--force"])
            }
            OpenTarget::ContainerShell { runtime_name } => sudo_wrap(&[
                "docker",
                "exec",
                "-it",
                runtime_name,
                "/bin/sh",
                "-lc",
                "exec bash || exec sh",
            ]),
            OpenTarget::ContainerLogs { runtime_name, tail } => {
                let tail = (*tail).clamp(1, 2000).to_string();
                sudo_wrap(&["docker", "logs", "--tail", &tail, "-f", runtime_name])
            }
        }
    }

    /// Verify the target exists and is running before burning a PTY on it.
    async fn probe_target(target: &OpenTarget) -> Result<(), String> {
        match target {
            OpenTarget::NodeShell | OpenTarget::ContainerLogs { .. } => Ok(()),
            OpenTarget::VmConsole { domain_name } => {
                let out = run_sudo(&["virsh", "domstate", domain_name], Duration::from_secs(30)).await;
                if !out.ok() {
                    return Err(format!("VM domain '{domain_name}' was not found"));
                }
                let state = out.stdout.trim().to_lowercase();
                if !state.contains("running") {
                    return Err(format!("VM domain '{domain_name}' is not running ({state})"));
                }
                Ok(())
            }
            OpenTarget::ContainerShell { runtime_name } => {
                let out = run_sudo(
                    &["docker", "inspect", "-f", "{{.State.Running}}", runtime_name],
                    Duration::from_secs(30),
                )
                .await;
                if !out.ok() {
                    return Err(format!("Container '{runtime_name}' was not found"));
                }
                if out.stdout.trim() != "true" {
                    return Err(format!("Container '{runtime_name}' is not running"));
                }
                Ok(())
            }
        }
    }

    pub async fn open(&self, session_id: &str, target: OpenTarget, cols: u16, rows: u16) {
        if !cfg!(target_os = "linux") {
            self.emit_error(session_id, "terminal sessions require a Linux agent");
            return;
        }
        if let Err(reason) = Self::probe_target(&target).await {
            self.emit_error(session_id, reason);
            return;
        }

        // An older session for the same runtime target is displaced quietly.
        if let Some(key) = target.key() {
            let displaced: Vec<String> = {
                let sessions = self.sessions.lock();
                sessions
                    .iter()
                    .filter(|(_, handle)| handle.target_key.as_deref() == Some(key.as_str()))
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for old_id in displaced {
                debug!(session_id = %old_id, target = %key, "displacing terminal session");
                self.close(&old_id);
            }
        }

        let pty_system = native_pty_system();
        let pair = match pty_system.openpty(clamp_size(cols, rows)) {
            Ok(pair) => pair,
            Err(e) => {
                self.emit_error(session_id, format!("unable to open PTY: {e}"));
                return;
            }
        };
        let child = match pair.slave.spawn_command(Self::build_command(&target)) {
            Ok(child) => child,
            Err(e) => {
                self.emit_error(session_id, format!("unable to spawn terminal child: {e}"));
                return;
            }
        };
        drop(pair.slave);

        let killer = child.clone_killer();
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                self.emit_error(session_id, format!("unable to attach PTY writer: {e}"));
                return;
            }
        };
        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                self.emit_error(session_id, format!("unable to attach PTY reader: {e}"));
                return;
            }
        };

        let closed = Arc::new(AtomicBool::new(false));
        let handle = SessionHandle {
            target_key: target.key(),
            accepts_input: target.accepts_input(),
            writer: Arc::new(std::sync::Mutex::new(writer)),
            master: pair.master,
            killer: std::sync::Mutex::new(killer),
            closed: Arc::clone(&closed),
        };
        self.sessions.lock().insert(session_id.to_string(), handle);
        info!(session_id, ?target, "terminal session opened");

        self.spawn_reader(session_id.to_string(), reader, child, closed);
    }

    fn spawn_reader(
        &self,
        session_id: String,
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn Child + Send + Sync>,
        closed: Arc<AtomicBool>,
    ) {
        let outbound = Arc::clone(&self.outbound);
        let sessions = Arc::clone(&self.sessions);
        std::thread::spawn(move || {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match reader.read(&mut buf) {
                    // EOF, or EIO once the child side hangs up.
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if closed.load(Ordering::Relaxed) {
                            continue;
                        }
                        outbound.push(AgentFrame::TerminalData {
                            session_id: session_id.clone(),
                            data: encode(&buf[..n]),
                        });
                    }
                }
            }

            let exit_code = child.wait().ok().map(|status| status.exit_code() as i32);
            sessions.lock().remove(&session_id);
            if !closed.load(Ordering::Relaxed) {
                outbound.push(AgentFrame::TerminalExit {
                    session_id: session_id.clone(),
                    exit_code,
                });
            }
            debug!(session_id = %session_id, ?exit_code, "terminal reader finished");
        });
    }

    /// Write UI input to the child. Log-tail sessions ignore input.
    pub fn input(&self, session_id: &str, data: &str) {
        let writer = {
            let sessions = self.sessions.lock();
            let Some(handle) = sessions.get(session_id) else {
                return;
            };
            if !handle.accepts_input {
                return;
            }
            Arc::clone(&handle.writer)
        };
        if let Ok(mut writer) = writer.lock() {
            if let Err(e) = writer.write_all(data.as_bytes()) {
                warn!(session_id, error = %e, "terminal input write failed");
            }
        }
    }

    /// Resize the PTY; errors are swallowed.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        let sessions = self.sessions.lock();
        if let Some(handle) = sessions.get(session_id) {
            let _ = handle.master.resize(clamp_size(cols, rows));
        }
    }

    /// Kill a session's child and drop the handle without emitting an exit
    /// frame.
    pub fn close(&self, session_id: &str) {
        let handle = self.sessions.lock().remove(session_id);
        if let Some(handle) = handle {
            handle.closed.store(true, Ordering::Relaxed);
            if let Ok(mut killer) = handle.killer.lock() {
                let _ = killer.kill();
            }
            info!(session_id, "terminal session closed");
        }
    }

    /// Tear down every session (agent shutdown or re-pair).
    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for id in ids {
            self.close(&id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
