//! Durable control-plane state for the Lattice master.
//!
//! A single embedded SQLite database holds nodes, their append-only log
//! streams, VM images, VMs, VM operations and queued shell commands. Every
//! mutating call runs as one transaction behind a single-writer mutex and
//! returns a tagged outcome; secrets (pair tokens, guest passwords) never
//! leave the store except in the transient payloads that need them.

#![forbid(unsafe_code)]

mod exec;
mod logs;
mod nodes;
mod vms;

pub use exec::{TerminalExecOutcome, TerminalResultOutcome};
pub use logs::{AppendLogOutcome, LogListOutcome, clamp_log_limit};
pub use nodes::{AgentAuth, HeartbeatOutcome, PairOutcome, RenameOutcome};
pub use vms::{ApplyResultOutcome, STALE_OPERATION_SECS, VmActionOutcome, VmCreateOutcome};

use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unable to generate a unique {0}")]
    SecretSpaceExhausted(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    pair_code TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL CHECK (state IN ('pending', 'paired')),
    pair_token TEXT UNIQUE,
    created_at TEXT NOT NULL,
    paired_at TEXT,
    last_heartbeat_at TEXT,
    agent_hostname TEXT,
    agent_info_json TEXT,
    agent_commit TEXT,
    last_metrics_json TEXT,
    capabilities_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_nodes_state ON nodes (state);
CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_pair_code ON nodes (pair_code);
CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_pair_token ON nodes (pair_token);

CREATE TABLE IF NOT EXISTS node_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    meta_json TEXT,
    FOREIGN KEY (node_id) REFERENCES nodes(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_node_logs_node_id_id ON node_logs (node_id, id);

CREATE TABLE IF NOT EXISTS vm_images (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    os_family TEXT NOT NULL CHECK (os_family IN ('linux', 'windows')),
    architecture TEXT,
    source_url TEXT NOT NULL,
    sha256 TEXT,
    default_username TEXT NOT NULL,
    cloud_init_enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS node_vms (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    name TEXT NOT NULL,
    domain_name TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL,
    provider TEXT NOT NULL DEFAULT 'libvirt',
    image_id TEXT NOT NULL,
    vcpu INTEGER NOT NULL,
    memory_mb INTEGER NOT NULL,
    disk_gb INTEGER NOT NULL,
    bridge TEXT NOT NULL,
    ip_address TEXT,
    domain_uuid TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (node_id) REFERENCES nodes(id) ON DELETE CASCADE,
    FOREIGN KEY (image_id) REFERENCES vm_images(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_node_vms_node_name ON node_vms (node_id, name);

CREATE TABLE IF NOT EXISTS vm_operations (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    vm_id TEXT,
    operation_type TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'succeeded', 'failed')),
    request_json TEXT,
    result_json TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    FOREIGN KEY (node_id) REFERENCES nodes(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_vm_operations_recent
    ON vm_operations (node_id, vm_id, created_at DESC);

CREATE TABLE IF NOT EXISTS terminal_commands (
    command_id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    command_text TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('queued', 'running', 'succeeded', 'failed')),
    exit_code INTEGER,
    output TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    FOREIGN KEY (node_id) REFERENCES nodes(id) ON DELETE CASCADE
);
";

/// Single-writer transactional store. Cheap to share behind an `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the database at `path`, apply the schema and
    /// seed the default VM image catalogue.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        Self::initialise(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::initialise(Connection::open_in_memory()?)
    }

    fn initialise(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        vms::seed_default_images(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }
}

// ─── Shared helpers ───────────────────────────────────────────────────────────

/// RFC 3339 with fixed microsecond precision so stored timestamps compare
/// lexicographically in chronological order.
pub(crate) fn utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

/// Coerce a loose JSON value into a float; strings are parsed, booleans
/// rejected.
pub(crate) fn as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub(crate) fn as_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Bool(_) => None,
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
