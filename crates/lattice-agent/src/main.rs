//! lattice-agent — Lattice node agent.
//!
//! Config load → pair → four supervised workers (heartbeat, websocket
//! streamer, command poller, terminal manager). An auth failure from the
//! master tears the workers down, clears local state and re-pairs.

use clap::Parser;
use lattice_agent::capability::CAPABILITY_TTL;
use lattice_agent::config::AgentConfig;
use lattice_agent::dispatch::Dispatcher;
use lattice_agent::events::{EVENT_QUEUE_CAP, EventQueue};
use lattice_agent::heartbeat::{self, HeartbeatContext};
use lattice_agent::log_mirror::WsLogLayer;
use lattice_agent::poller::{self, PollerContext};
use lattice_agent::state::PairingState;
use lattice_agent::system::{self, SystemProbe};
use lattice_agent::terminal::TerminalManager;
use lattice_agent::ws::{self, WsContext};
use lattice_agent::pairing;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const WORKER_RESTART_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "lattice-agent")]
#[command(about = "Lattice node agent")]
#[command(version)]
struct Cli {
    /// Path to the agent config file (created with defaults when absent)
    #[arg(short, long, default_value = "agent-config.json")]
    config: PathBuf,
}

/// Keep a worker alive: restart it after a bounded backoff if it returns or
/// panics, stop it when the generation shuts down.
fn spawn_supervised<F, Fut>(
    name: &'static str,
    mut shutdown: watch::Receiver<bool>,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let mut worker = tokio::spawn(factory());
            tokio::select! {
                result = &mut worker => {
                    match result {
                        Ok(()) => warn!(worker = name, "worker exited; restarting"),
                        Err(e) if e.is_panic() => {
                            error!(worker = name, "worker panicked; restarting");
                        }
                        Err(_) => return,
                    }
                }
                _ = shutdown.changed() => {
                    worker.abort();
                    let _ = worker.await;
                    return;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(WORKER_RESTART_BACKOFF) => {}
                _ = shutdown.changed() => return,
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The outbound queue outlives worker generations so the log mirror can be
    // installed once, before anything logs.
    let outbound = Arc::new(EventQueue::new(EVENT_QUEUE_CAP));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("lattice_agent=info".parse()?))
        .with(WsLogLayer::new(Arc::clone(&outbound)))
        .init();

    let config = match AgentConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed loading config");
            std::process::exit(1);
        }
    };
    info!(master_url = %config.master_url, "Lattice agent started");
    let system_info = system::system_info();
    info!(
        os = %system_info["os"]["name"],
        release = %system_info["os"]["release"],
        arch = %system_info["arch"]["machine"],
        "Detected host system"
    );

    let state_path = cli
        .config
        .parent()
        .map(|dir| dir.join("state.json"))
        .unwrap_or_else(|| PathBuf::from("state.json"));

    let probe = Arc::new(SystemProbe::new());
    let dispatcher = Arc::new(Dispatcher::new());
    let terminals = Arc::new(TerminalManager::new(Arc::clone(&outbound)));

    // Warm the capability caches so the first heartbeat is informative.
    let vm_capability = dispatcher.vms.capability(CAPABILITY_TTL).await;
    info!(
        ready = vm_capability.ready,
        message = %vm_capability.message,
        "VM capability probed"
    );
    if !vm_capability.ready && !vm_capability.missing_tools.is_empty() {
        let report = dispatcher.vms.auto_install(false).await;
        info!(report = %report, "VM prerequisite auto-install attempted");
    }
    let container_capability = dispatcher.containers.capability(CAPABILITY_TTL).await;
    info!(
        ready = container_capability.ready,
        message = %container_capability.message,
        "Container capability probed"
    );

    loop {
        let session = match PairingState::load(&state_path) {
            Some(state) => {
                info!(node_id = %state.node_id, "Using existing pairing state");
                state
            }
            None => pairing::pair_until_success(&config, &state_path).await,
        };

        let auth_failed = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let heartbeat_ctx = HeartbeatContext {
            master_url: config.master_url.clone(),
            node_id: session.node_id.clone(),
            pair_token: session.pair_token.clone(),
            interval: Duration::from_secs(config.heartbeat_interval_seconds),
            timeout: Duration::from_secs(config.heartbeat_timeout_seconds),
            probe: Arc::clone(&probe),
            vms: Arc::clone(&dispatcher.vms),
            containers: Arc::clone(&dispatcher.containers),
            auth_failed: Arc::clone(&auth_failed),
        };
        let ws_ctx = WsContext {
            master_url: config.master_url.clone(),
            node_id: session.node_id.clone(),
            pair_token: session.pair_token.clone(),
            outbound: Arc::clone(&outbound),
            dispatcher: Arc::clone(&dispatcher),
            terminals: Arc::clone(&terminals),
        };
        let poller_ctx = PollerContext {
            master_url: config.master_url.clone(),
            node_id: session.node_id.clone(),
            pair_token: session.pair_token.clone(),
            hostname: system::hostname(),
            dispatcher: Arc::clone(&dispatcher),
            auth_failed: Arc::clone(&auth_failed),
        };

        let workers = [
            spawn_supervised("heartbeat", shutdown_rx.clone(), move || {
                heartbeat::run_heartbeat(heartbeat_ctx.clone())
            }),
            spawn_supervised("ws-streamer", shutdown_rx.clone(), move || {
                ws::run_streamer(ws_ctx.clone())
            }),
            spawn_supervised("command-poller", shutdown_rx.clone(), move || {
                poller::run_poller(poller_ctx.clone())
            }),
        ];

        auth_failed.notified().await;
        warn!("Auth failure requires re-pair; stopping workers");
        let _ = shutdown_tx.send(true);
        for worker in workers {
            let _ = worker.await;
        }
        terminals.close_all();
        PairingState::clear(&state_path);
        info!("Cleared local state; retrying pair flow");
    }
}
