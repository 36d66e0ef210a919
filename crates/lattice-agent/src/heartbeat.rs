//! Periodic heartbeat over HTTP, carrying the host snapshot and capability
//! summaries.

use crate::capability::CAPABILITY_TTL;
use crate::container_docker::ContainerSubsystem;
use crate::system::{self, SystemProbe};
use crate::vm_virsh::VmSubsystem;
use lattice_proto::{HeartbeatExtra, HeartbeatPayload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Clone)]
pub struct HeartbeatContext {
    pub master_url: String,
    pub node_id: String,
    pub pair_token: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub probe: Arc<SystemProbe>,
    pub vms: Arc<VmSubsystem>,
    pub containers: Arc<ContainerSubsystem>,
    /// Signalled on 401/403 so the control loop can re-pair.
    pub auth_failed: Arc<Notify>,
}

pub async fn build_payload(ctx: &HeartbeatContext) -> HeartbeatPayload {
    let info = system::system_info();
    HeartbeatPayload {
        node_id: ctx.node_id.clone(),
        status: "alive".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        hostname: system::hostname(),
        extra: Some(HeartbeatExtra {
            os: info.get("os").cloned(),
            arch: info.get("arch").cloned(),
            hardware: info.get("hardware").cloned(),
            usage: Some(ctx.probe.runtime_metrics()),
            vm: Some(ctx.vms.capability(CAPABILITY_TTL).await),
            container: Some(ctx.containers.capability(CAPABILITY_TTL).await),
            local_ip: ctx.probe.local_ip(&ctx.master_url),
            git_commit: system::git_commit(),
        }),
    }
}

/// Heartbeat sender worker; runs until its task is shut down.
pub async fn run_heartbeat(ctx: HeartbeatContext) {
    let client = reqwest::Client::new();
    info!(master_url = %ctx.master_url, "Heartbeat sender started");
    loop {
        let payload = build_payload(&ctx).await;
        let result = client
            .post(format!("{}/api/heartbeat", ctx.master_url))
            .timeout(ctx.timeout)
            .bearer_auth(&ctx.pair_token)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!(status = status.as_u16(), "Heartbeat sent");
                } else if status.as_u16() == 401 || status.as_u16() == 403 {
                    let body = response.text().await.unwrap_or_default();
                    info!(status = status.as_u16(), details = %body, "Heartbeat auth failed");
                    ctx.auth_failed.notify_one();
                } else {
                    info!(status = status.as_u16(), "Heartbeat failed");
                }
            }
            Err(e) => {
                info!(details = %e, "Heartbeat failed");
            }
        }
        tokio::time::sleep(ctx.interval).await;
    }
}
