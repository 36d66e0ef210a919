//! Persisted pairing state, kept beside the config file as `state.json`.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingState {
    pub node_id: String,
    pub pair_token: String,
    pub paired_at: String,
    pub master_url: String,
}

impl PairingState {
    /// Load the persisted state; absent, unreadable or incomplete files all
    /// read as "not paired".
    pub fn load(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        let state: Self = serde_json::from_str(&raw).ok()?;
        if state.node_id.trim().is_empty()
            || state.pair_token.trim().is_empty()
            || state.paired_at.trim().is_empty()
        {
            return None;
        }
        Some(Self {
            node_id: state.node_id.trim().to_string(),
            pair_token: state.pair_token.trim().to_string(),
            paired_at: state.paired_at.trim().to_string(),
            master_url: state.master_url.trim().to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, body + "\n")
    }

    pub fn clear(path: &Path) {
        let _ = std::fs::remove_file(path);
    }
}
