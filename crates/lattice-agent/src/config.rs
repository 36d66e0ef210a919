//! Agent configuration.

use crate::error::{AgentError, AgentResult};
use lattice_proto::is_valid_pair_code;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Master base URL, e.g. `http://127.0.0.1:8000`.
    pub master_url: String,

    /// Six-character pairing code shown next to the node in the UI.
    pub pair_code: String,

    pub pair_retry_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            master_url: "http://127.0.0.1:8000".to_string(),
            pair_code: "ABC123".to_string(),
            pair_retry_seconds: 5,
            heartbeat_interval_seconds: 10,
            heartbeat_timeout_seconds: 5,
        }
    }
}

fn require_interval(payload: &Value, key: &str) -> AgentResult<u64> {
    match payload.get(key) {
        Some(Value::Number(n)) if n.is_u64() || n.is_i64() => {
            let value = n.as_i64().unwrap_or(0);
            if value >= 1 {
                Ok(value as u64)
            } else {
                Err(AgentError::Config(format!("{key} must be an integer >= 1")))
            }
        }
        _ => Err(AgentError::Config(format!("{key} must be an integer >= 1"))),
    }
}

impl AgentConfig {
    /// Load and validate the config, seeding the file with defaults when it
    /// does not exist. Invalid values are startup errors.
    pub fn load(path: &Path) -> AgentResult<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let defaults = Self::default();
            std::fs::write(path, serde_json::to_string_pretty(&defaults)? + "\n")?;
        }

        let raw = std::fs::read_to_string(path)?;
        let payload: Value = serde_json::from_str(&raw)
            .map_err(|e| AgentError::Config(format!("parse {}: {e}", path.display())))?;

        let master_url = payload
            .get("master_url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .trim_end_matches('/')
            .to_string();
        if !master_url.starts_with("http://") && !master_url.starts_with("https://") {
            return Err(AgentError::Config(
                "master_url must start with http:// or https://".to_string(),
            ));
        }

        let pair_code = payload
            .get("pair_code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_uppercase();
        if !is_valid_pair_code(&pair_code) {
            return Err(AgentError::Config(
                "pair_code must be 6 alphanumeric characters".to_string(),
            ));
        }

        Ok(Self {
            master_url,
            pair_code,
            pair_retry_seconds: require_interval(&payload, "pair_retry_seconds")?,
            heartbeat_interval_seconds: require_interval(&payload, "heartbeat_interval_seconds")?,
            heartbeat_timeout_seconds: require_interval(&payload, "heartbeat_timeout_seconds")?,
        })
    }
}
