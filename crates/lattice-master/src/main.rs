//! lattice-master — central coordinator for the Lattice fleet plane.
//!
//! Serves the REST API and UI websockets, accepts agent websocket sessions,
//! and owns the durable store plus the in-memory command router.

mod agent_ws;
mod api;
mod config;
mod log_ws;
mod state;
mod terminal_ws;

use clap::Parser;
use config::MasterConfig;
use lattice_router::{CommandRouter, TerminalRegistry};
use lattice_store::Store;
use state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "lattice-master")]
#[command(about = "Lattice master — fleet coordination plane")]
#[command(version)]
struct Cli {
    /// Path to the master config file (created with defaults when absent)
    #[arg(short, long, default_value = "master-config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("lattice_master=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = MasterConfig::load(&cli.config)?;
    info!(
        listen_addr = %config.listen_addr,
        db_path = %config.db_path.display(),
        "Lattice master started"
    );

    let store = Arc::new(Store::open(&config.db_path)?);
    let swept = store.fail_unfinished_vm_operations("Master restarted before operation dispatch")?;
    if swept > 0 {
        info!(swept, "failed operations left over from a previous run");
    }

    let state = AppState {
        store,
        router: Arc::new(CommandRouter::new()),
        terminals: Arc::new(TerminalRegistry::new()),
    };

    let app = api::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Starting master endpoint");
    axum::serve(listener, app).await?;
    Ok(())
}
