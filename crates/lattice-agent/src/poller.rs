//! HTTP long-poll fallback for command delivery.
//!
//! Agents must consume commands over both transports; this worker covers the
//! windows when the websocket is down and drains whatever the master parked
//! on the pending queue.

use crate::dispatch::Dispatcher;
use lattice_proto::MasterFrame;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const POLL_TIMEOUT: Duration = Duration::from_secs(15);
const ERROR_BACKOFF: Duration = Duration::from_secs(3);
const AUTH_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct PollerContext {
    pub master_url: String,
    pub node_id: String,
    pub pair_token: String,
    pub hostname: String,
    pub dispatcher: Arc<Dispatcher>,
    pub auth_failed: Arc<Notify>,
}

pub async fn run_poller(ctx: PollerContext) {
    let client = reqwest::Client::new();
    info!("Command poller started");
    loop {
        let response = client
            .post(format!(
                "{}/api/nodes/{}/commands/next",
                ctx.master_url, ctx.node_id
            ))
            .timeout(POLL_TIMEOUT)
            .bearer_auth(&ctx.pair_token)
            .header("X-Agent-Hostname", &ctx.hostname)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(details = %e, "command poll failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        match response.status().as_u16() {
            204 => continue,
            200 => {
                let body: Value = match response.json().await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(details = %e, "unreadable command payload");
                        continue;
                    }
                };
                let Some(command) = body.get("command").cloned() else {
                    continue;
                };
                match serde_json::from_value::<MasterFrame>(command) {
                    Ok(MasterFrame::Command(envelope)) => {
                        let result = ctx.dispatcher.execute(envelope).await;
                        post_result(&client, &ctx, &result).await;
                    }
                    Ok(other) => {
                        debug!(frame = ?other, "ignoring non-command frame from poll");
                    }
                    Err(e) => {
                        warn!(details = %e, "unparseable command from poll");
                    }
                }
            }
            401 | 403 => {
                warn!(status = response.status().as_u16(), "command poll rejected; re-pair needed");
                ctx.auth_failed.notify_one();
                tokio::time::sleep(AUTH_BACKOFF).await;
            }
            other => {
                debug!(status = other, "unexpected poll status");
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

async fn post_result(
    client: &reqwest::Client,
    ctx: &PollerContext,
    result: &lattice_proto::CommandResult,
) {
    let outcome = client
        .post(format!(
            "{}/api/nodes/{}/commands/result",
            ctx.master_url, ctx.node_id
        ))
        .timeout(POLL_TIMEOUT)
        .bearer_auth(&ctx.pair_token)
        .header("X-Agent-Hostname", &ctx.hostname)
        .json(result)
        .send()
        .await;
    match outcome {
        Ok(response) if response.status().is_success() => {}
        Ok(response) => {
            warn!(
                status = response.status().as_u16(),
                command_id = %result.command_id,
                "command result rejected"
            );
        }
        Err(e) => {
            warn!(details = %e, command_id = %result.command_id, "failed to post command result");
        }
    }
}
