//! Node lifecycle: creation, pairing, heartbeats, rename/delete, agent auth.

use crate::logs::insert_node_log;
use crate::{StoreError, StoreResult, as_f64, as_i64, round2, utc_now};
use base64::Engine;
use lattice_proto::{Node, NodeState, is_valid_pair_code, normalize_pair_code};
use rand::Rng;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value, json};
use uuid::Uuid;

const ADJECTIVES: &[&str] = &[
    "friendly",
    "resourceful",
    "steady",
    "bright",
    "nimble",
    "curious",
    "solid",
    "brisk",
    "keen",
    "calm",
];

const NOUNS: &[&str] = &[
    "badger",
    "otter",
    "falcon",
    "lynx",
    "beacon",
    "compass",
    "harbor",
    "keyboard",
    "lantern",
    "quartz",
];

const PAIR_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const GENERATION_ATTEMPTS: usize = 64;

// ─── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum PairOutcome {
    Paired(lattice_proto::PairGrant),
    InvalidCode,
    NotFound,
    AlreadyPaired,
}

#[derive(Debug)]
pub enum HeartbeatOutcome {
    Ok(Box<Node>),
    MissingToken,
    InvalidToken,
    NodeMismatch,
}

#[derive(Debug)]
pub enum RenameOutcome {
    Ok(Box<Node>),
    InvalidName,
    NotFound,
}

/// Result of authenticating an agent-scoped HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAuth {
    Ok,
    Unauthorized,
    HostnameMismatch,
}

// ─── Row mapping ──────────────────────────────────────────────────────────────

fn parse_json_column(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

pub(crate) fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    let state: String = row.get("state")?;
    Ok(Node {
        id: row.get("id")?,
        name: row.get("name")?,
        pair_code: row.get("pair_code")?,
        state: if state == "paired" {
            NodeState::Paired
        } else {
            NodeState::Pending
        },
        created_at: row.get("created_at")?,
        paired_at: row.get("paired_at")?,
        last_heartbeat_at: row.get("last_heartbeat_at")?,
        agent_hostname: row.get("agent_hostname")?,
        agent_info: parse_json_column(row.get("agent_info_json")?),
        agent_commit: row.get("agent_commit")?,
        runtime_metrics: parse_json_column(row.get("last_metrics_json")?),
        capabilities: parse_json_column(row.get("capabilities_json")?),
    })
}

pub(crate) fn fetch_node(conn: &Connection, node_id: &str) -> StoreResult<Option<Node>> {
    let node = conn
        .query_row(
            "SELECT * FROM nodes WHERE id = ? LIMIT 1;",
            params![node_id.trim()],
            node_from_row,
        )
        .optional()?;
    Ok(node)
}

// ─── Generation ───────────────────────────────────────────────────────────────

fn node_name_taken(conn: &Connection, name: &str) -> StoreResult<bool> {
    let row: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM nodes WHERE name = ? LIMIT 1;",
            params![name],
            |r| r.get(0),
        )
        .optional()?;
    Ok(row.is_some())
}

fn generate_friendly_name(conn: &Connection) -> StoreResult<String> {
    let mut rng = rand::thread_rng();
    let base = format!(
        "{}-{}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        NOUNS[rng.gen_range(0..NOUNS.len())]
    );
    if !node_name_taken(conn, &base)? {
        return Ok(base);
    }
    let mut suffix = 2u64;
    loop {
        let candidate = format!("{base}-{suffix}");
        if !node_name_taken(conn, &candidate)? {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

fn generate_unique_pair_code(conn: &Connection) -> StoreResult<String> {
    let mut rng = rand::thread_rng();
    for _ in 0..GENERATION_ATTEMPTS {
        let code: String = (0..lattice_proto::PAIR_CODE_LEN)
            .map(|_| PAIR_CODE_ALPHABET[rng.gen_range(0..PAIR_CODE_ALPHABET.len())] as char)
            .collect();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM nodes WHERE pair_code = ? LIMIT 1;",
                params![code],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(code);
        }
    }
    Err(StoreError::SecretSpaceExhausted("pair code"))
}

fn generate_unique_pair_token(conn: &Connection) -> StoreResult<String> {
    let mut rng = rand::thread_rng();
    for _ in 0..GENERATION_ATTEMPTS {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM nodes WHERE pair_token = ? LIMIT 1;",
                params![token],
                |r| r.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Ok(token);
        }
    }
    Err(StoreError::SecretSpaceExhausted("pair token"))
}

// ─── Heartbeat normalisation ─────────────────────────────────────────────────

/// Clamp reported usage into sane bounds: percents to [0, 100] (2 decimals),
/// byte counts to >= 0. Unknown keys are dropped here; the raw payload is
/// still preserved in the heartbeat log meta.
fn normalize_runtime_metrics(value: &Value) -> Option<Map<String, Value>> {
    let obj = value.as_object()?;
    let mut metrics = Map::new();

    for key in ["cpu_percent", "memory_percent", "storage_percent"] {
        if let Some(v) = obj.get(key).and_then(as_f64) {
            metrics.insert(key.to_string(), json!(round2(v.clamp(0.0, 100.0))));
        }
    }
    for key in [
        "memory_used_bytes",
        "memory_total_bytes",
        "storage_used_bytes",
        "storage_total_bytes",
    ] {
        if let Some(v) = obj.get(key).and_then(as_i64) {
            metrics.insert(key.to_string(), json!(v.max(0)));
        }
    }

    if metrics.is_empty() { None } else { Some(metrics) }
}

// ─── Store operations ─────────────────────────────────────────────────────────

impl crate::Store {
    /// Create a pending node with a fresh pair code. A blank name gets a
    /// generated `<adjective>-<noun>` slug, suffixed on collision.
    pub fn create_node(&self, name: Option<&str>) -> StoreResult<Node> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let clean_name = name.map(str::trim).filter(|s| !s.is_empty());
            let node_name = match clean_name {
                Some(n) => n.to_string(),
                None => generate_friendly_name(&tx)?,
            };

            let node_id = Uuid::new_v4().to_string();
            let pair_code = generate_unique_pair_code(&tx)?;
            let created_at = utc_now();
            tx.execute(
                "INSERT INTO nodes (id, name, pair_code, state, pair_token, created_at)
                 VALUES (?, ?, ?, 'pending', NULL, ?);",
                params![node_id, node_name, pair_code, created_at],
            )?;
            insert_node_log(
                &tx,
                &node_id,
                "info",
                "Node created and waiting for pairing",
                Some(&json!({ "pair_code": pair_code })),
                Some(&created_at),
            )?;
            let node = tx.query_row(
                "SELECT * FROM nodes WHERE id = ?;",
                params![node_id],
                node_from_row,
            )?;
            tx.commit()?;
            Ok(node)
        })
    }

    pub fn list_nodes(&self) -> StoreResult<Vec<Node>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM nodes ORDER BY created_at DESC;")?;
            let nodes = stmt
                .query_map([], node_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(nodes)
        })
    }

    pub fn get_node(&self, node_id: &str) -> StoreResult<Option<Node>> {
        self.with_conn(|conn| fetch_node(conn, node_id))
    }

    pub fn rename_node(&self, node_id: &str, name: &str) -> StoreResult<RenameOutcome> {
        let clean_name = name.trim();
        if clean_name.is_empty() {
            return Ok(RenameOutcome::InvalidName);
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(node) = fetch_node(&tx, node_id)? else {
                return Ok(RenameOutcome::NotFound);
            };
            if node.name != clean_name {
                tx.execute(
                    "UPDATE nodes SET name = ? WHERE id = ?;",
                    params![clean_name, node.id],
                )?;
                insert_node_log(
                    &tx,
                    &node.id,
                    "info",
                    "Node renamed",
                    Some(&json!({ "from": node.name, "to": clean_name })),
                    None,
                )?;
            }
            let updated = tx.query_row(
                "SELECT * FROM nodes WHERE id = ?;",
                params![node.id],
                node_from_row,
            )?;
            tx.commit()?;
            Ok(RenameOutcome::Ok(Box::new(updated)))
        })
    }

    /// Delete a node and everything hanging off it (logs, VMs, operations
    /// cascade). Returns the deleted record, if any.
    pub fn delete_node(&self, node_id: &str) -> StoreResult<Option<Node>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(node) = fetch_node(&tx, node_id)? else {
                return Ok(None);
            };
            tx.execute("DELETE FROM nodes WHERE id = ?;", params![node.id])?;
            tx.commit()?;
            Ok(Some(node))
        })
    }

    /// Pair an agent by code. The pair token is generated exactly here, once;
    /// a delete-and-recreate is the only way to reissue it.
    pub fn pair_node(&self, pair_code: &str, agent_info: Option<&Value>) -> StoreResult<PairOutcome> {
        let code = normalize_pair_code(pair_code);
        if !is_valid_pair_code(&code) {
            return Ok(PairOutcome::InvalidCode);
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(node) = tx
                .query_row(
                    "SELECT * FROM nodes WHERE pair_code = ? LIMIT 1;",
                    params![code],
                    node_from_row,
                )
                .optional()?
            else {
                return Ok(PairOutcome::NotFound);
            };
            if node.state != NodeState::Pending {
                return Ok(PairOutcome::AlreadyPaired);
            }

            let token = generate_unique_pair_token(&tx)?;
            let paired_at = utc_now();
            let agent_hostname = agent_info
                .and_then(|info| info.get("hostname"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let agent_info_json =
                serde_json::to_string(agent_info.unwrap_or(&json!({})))?;
            tx.execute(
                "UPDATE nodes
                 SET state = 'paired', pair_token = ?, paired_at = ?,
                     agent_hostname = ?, agent_info_json = ?
                 WHERE id = ?;",
                params![token, paired_at, agent_hostname, agent_info_json, node.id],
            )?;
            let meta = agent_hostname
                .as_ref()
                .map(|h| json!({ "hostname": h }));
            insert_node_log(
                &tx,
                &node.id,
                "info",
                "Node paired with agent",
                meta.as_ref(),
                Some(&paired_at),
            )?;
            tx.commit()?;
            Ok(PairOutcome::Paired(lattice_proto::PairGrant {
                node_id: node.id,
                node_name: node.name,
                pair_token: token,
                state: NodeState::Paired,
            }))
        })
    }

    /// Record a heartbeat authenticated by pair token. Metrics, agent commit
    /// and capability summaries merge with COALESCE semantics: absent fields
    /// keep their previous value.
    pub fn record_heartbeat(
        &self,
        pair_token: &str,
        node_id: &str,
        payload: &Value,
    ) -> StoreResult<HeartbeatOutcome> {
        let token = pair_token.trim();
        if token.is_empty() {
            return Ok(HeartbeatOutcome::MissingToken);
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(node) = tx
                .query_row(
                    "SELECT * FROM nodes WHERE pair_token = ? LIMIT 1;",
                    params![token],
                    node_from_row,
                )
                .optional()?
            else {
                return Ok(HeartbeatOutcome::InvalidToken);
            };
            if node.id != node_id.trim() {
                return Ok(HeartbeatOutcome::NodeMismatch);
            }

            let last_heartbeat_at = payload
                .get("timestamp")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(utc_now);
            let status_value = payload.get("status").and_then(Value::as_str);
            let hostname_value = payload
                .get("hostname")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty());
            let extra_value = payload.get("extra").and_then(Value::as_object);

            let commit_value = extra_value
                .and_then(|e| e.get("git_commit"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string);

            let metrics_json = extra_value
                .and_then(|e| e.get("usage"))
                .and_then(normalize_runtime_metrics)
                .map(|mut metrics| {
                    metrics.insert("updated_at".to_string(), json!(last_heartbeat_at));
                    serde_json::to_string(&Value::Object(metrics))
                })
                .transpose()?;

            let capabilities_json = {
                let vm = extra_value.and_then(|e| e.get("vm"));
                let container = extra_value.and_then(|e| e.get("container"));
                if vm.is_some() || container.is_some() {
                    let mut caps = Map::new();
                    if let Some(vm) = vm {
                        caps.insert("vm".to_string(), vm.clone());
                    }
                    if let Some(container) = container {
                        caps.insert("container".to_string(), container.clone());
                    }
                    Some(serde_json::to_string(&Value::Object(caps))?)
                } else {
                    None
                }
            };

            tx.execute(
                "UPDATE nodes
                 SET last_heartbeat_at = ?,
                     last_metrics_json = COALESCE(?, last_metrics_json),
                     agent_commit = COALESCE(?, agent_commit),
                     capabilities_json = COALESCE(?, capabilities_json)
                 WHERE id = ?;",
                params![
                    last_heartbeat_at,
                    metrics_json,
                    commit_value,
                    capabilities_json,
                    node.id
                ],
            )?;

            let mut log_meta = Map::new();
            if let Some(hostname) = hostname_value {
                log_meta.insert("hostname".to_string(), json!(hostname));
            }
            if let Some(extra) = extra_value {
                if !extra.is_empty() {
                    log_meta.insert("extra".to_string(), Value::Object(extra.clone()));
                }
            }
            let message = match status_value {
                Some(status) => format!("Heartbeat {status}"),
                None => "Heartbeat received".to_string(),
            };
            let meta = if log_meta.is_empty() {
                None
            } else {
                Some(Value::Object(log_meta))
            };
            insert_node_log(
                &tx,
                &node.id,
                "info",
                &message,
                meta.as_ref(),
                Some(&last_heartbeat_at),
            )?;

            let updated = tx.query_row(
                "SELECT * FROM nodes WHERE id = ?;",
                params![node.id],
                node_from_row,
            )?;
            tx.commit()?;
            Ok(HeartbeatOutcome::Ok(Box::new(updated)))
        })
    }

    pub fn is_valid_node_token(&self, node_id: &str, pair_token: &str) -> StoreResult<bool> {
        let node_id = node_id.trim();
        let token = pair_token.trim();
        if node_id.is_empty() || token.is_empty() {
            return Ok(false);
        }
        self.with_conn(|conn| {
            let row: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM nodes WHERE id = ? AND pair_token = ? LIMIT 1;",
                    params![node_id, token],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(row.is_some())
        })
    }

    /// Authenticate an agent-scoped HTTP request: bearer token must match the
    /// node, and when both sides know a hostname they must agree
    /// (case-insensitive). Catches a cloned token presented from another host.
    pub fn authenticate_agent(
        &self,
        node_id: &str,
        pair_token: &str,
        agent_hostname: Option<&str>,
    ) -> StoreResult<AgentAuth> {
        self.with_conn(|conn| {
            let Some(node) = fetch_node(conn, node_id)? else {
                return Ok(AgentAuth::Unauthorized);
            };
            let stored_token: Option<String> = conn
                .query_row(
                    "SELECT pair_token FROM nodes WHERE id = ?;",
                    params![node.id],
                    |r| r.get(0),
                )
                .optional()?
                .flatten();
            if stored_token.as_deref() != Some(pair_token.trim()) || pair_token.trim().is_empty() {
                return Ok(AgentAuth::Unauthorized);
            }
            if let (Some(stored), Some(presented)) =
                (node.agent_hostname.as_deref(), agent_hostname)
            {
                if !stored.eq_ignore_ascii_case(presented.trim()) {
                    return Ok(AgentAuth::HostnameMismatch);
                }
            }
            Ok(AgentAuth::Ok)
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
