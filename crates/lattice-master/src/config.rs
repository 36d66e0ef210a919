//! Master configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Bind address for the HTTP/websocket endpoint.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path to the embedded database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("master.db")
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            db_path: default_db_path(),
        }
    }
}

impl MasterConfig {
    /// Load the config, seeding the file with defaults when it does not
    /// exist. An unparseable file or bind address is a startup error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, serde_json::to_string_pretty(&config)? + "\n")?;
            return Ok(config);
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
        config
            .listen_addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow::anyhow!("invalid listen_addr {}: {e}", config.listen_addr))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_seeded_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master-config.json");
        let config = MasterConfig::load(&path).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8000");
        assert!(path.exists());

        // Reloading parses the seeded file.
        let reloaded = MasterConfig::load(&path).unwrap();
        assert_eq!(reloaded.db_path, PathBuf::from("master.db"));
    }

    #[test]
    fn invalid_listen_addr_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master-config.json");
        std::fs::write(&path, r#"{"listen_addr": "not-an-addr"}"#).unwrap();
        assert!(MasterConfig::load(&path).is_err());
    }

    #[test]
    fn invalid_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master-config.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(MasterConfig::load(&path).is_err());
    }
}
