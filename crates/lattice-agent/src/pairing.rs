//! Pairing flow: exchange the short code for a long-lived node token.

use crate::config::AgentConfig;
use crate::state::PairingState;
use crate::system;
use lattice_proto::{PairGrant, PairRequest};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const PAIR_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn request_pair_once(
    client: &reqwest::Client,
    config: &AgentConfig,
) -> Result<PairGrant, String> {
    let payload = PairRequest {
        pair_code: config.pair_code.clone(),
        agent: Some(system::agent_info()),
    };
    let response = client
        .post(format!("{}/api/pair", config.master_url))
        .timeout(PAIR_REQUEST_TIMEOUT)
        .json(&payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("status={status} details={body}"));
    }
    response
        .json::<PairGrant>()
        .await
        .map_err(|e| format!("pair response missing required fields: {e}"))
}

/// Retry pairing forever. Every agent eventually either pairs or is told a
/// better pair code by its operator.
pub async fn pair_until_success(config: &AgentConfig, state_path: &Path) -> PairingState {
    let client = reqwest::Client::new();
    loop {
        match request_pair_once(&client, config).await {
            Ok(grant) => {
                let state = PairingState {
                    node_id: grant.node_id,
                    pair_token: grant.pair_token,
                    paired_at: chrono::Utc::now().to_rfc3339(),
                    master_url: config.master_url.clone(),
                };
                if let Err(e) = state.save(state_path) {
                    warn!(error = %e, "failed to persist pairing state");
                }
                info!(node_id = %state.node_id, "Paired with master");
                return state;
            }
            Err(details) => {
                info!(%details, "Pair attempt failed");
            }
        }
        tokio::time::sleep(Duration::from_secs(config.pair_retry_seconds)).await;
    }
}
