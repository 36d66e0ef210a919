//! Websocket streamer: the preferred transport between agent and master.
//!
//! Authenticates with the node token, pumps queued frames out, and fans
//! incoming master frames to the dispatcher and terminal manager.

use crate::dispatch::Dispatcher;
use crate::events::EventQueue;
use crate::terminal::{OpenTarget, TerminalManager};
use anyhow::{Context, bail};
use futures_util::{SinkExt, StreamExt};
use lattice_proto::{AgentFrame, MasterFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Clone)]
pub struct WsContext {
    pub master_url: String,
    pub node_id: String,
    pub pair_token: String,
    pub outbound: Arc<EventQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub terminals: Arc<TerminalManager>,
}

/// Derive the `/ws/agent` URL from the configured master base URL.
pub fn build_agent_ws_url(master_url: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(master_url.trim_end_matches('/'))?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    let _ = url.set_scheme(scheme);
    url.set_path("/ws/agent");
    url.set_query(None);
    Ok(url.to_string())
}

pub async fn run_streamer(ctx: WsContext) {
    loop {
        if let Err(e) = connect_and_stream(&ctx).await {
            info!(details = %e, "agent websocket disconnected; reconnecting");
        }
        // The master has closed our sessions on its side; free the PTYs too.
        ctx.terminals.close_all();
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn connect_and_stream(ctx: &WsContext) -> anyhow::Result<()> {
    let ws_url = build_agent_ws_url(&ctx.master_url).context("invalid master url")?;
    let (stream, _) = timeout(CONNECT_TIMEOUT, connect_async(&ws_url))
        .await
        .context("websocket connection timeout")??;
    let (mut write, mut read) = stream.split();

    let auth = AgentFrame::Auth {
        node_id: ctx.node_id.clone(),
        pair_token: ctx.pair_token.clone(),
    };
    write
        .send(Message::Text(serde_json::to_string(&auth)?))
        .await?;

    let first = timeout(CONNECT_TIMEOUT, read.next())
        .await
        .context("auth response timeout")?
        .context("connection closed during auth")??;
    match first {
        Message::Text(text) => match serde_json::from_str::<MasterFrame>(&text) {
            Ok(MasterFrame::AuthOk) => {}
            Ok(MasterFrame::Error { error }) => bail!("websocket auth failed: {error}"),
            _ => bail!("unexpected auth response: {text}"),
        },
        other => bail!("unexpected auth response: {other:?}"),
    }
    info!("Agent websocket connected");

    loop {
        tokio::select! {
            frame = ctx.outbound.recv() => {
                write.send(Message::Text(serde_json::to_string(&frame)?)).await?;
            }

            message = read.next() => {
                match message {
                    None => bail!("connection closed"),
                    Some(Err(e)) => bail!("websocket error: {e}"),
                    Some(Ok(Message::Text(text))) => handle_master_frame(ctx, &text).await,
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) => bail!("connection closed by master"),
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn handle_master_frame(ctx: &WsContext, text: &str) {
    let frame = match serde_json::from_str::<MasterFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(details = %e, "unparseable master frame");
            return;
        }
    };

    match frame {
        MasterFrame::Command(envelope) => {
            // Execute off the streamer loop so long commands never stall the
            // terminal traffic; the guards in the dispatcher answer `busy`.
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let result = ctx.dispatcher.execute(envelope).await;
                ctx.outbound.push(AgentFrame::CommandResult(result));
            });
        }

        MasterFrame::TerminalOpen { session_id, cols, rows } => {
            ctx.terminals
                .open(&session_id, OpenTarget::NodeShell, cols, rows)
                .await;
        }
        MasterFrame::VmTerminalOpen { session_id, cols, rows, domain_name, .. } => {
            ctx.terminals
                .open(&session_id, OpenTarget::VmConsole { domain_name }, cols, rows)
                .await;
        }
        MasterFrame::ContainerTerminalOpen { session_id, cols, rows, runtime_name } => {
            ctx.terminals
                .open(
                    &session_id,
                    OpenTarget::ContainerShell { runtime_name },
                    cols,
                    rows,
                )
                .await;
        }
        MasterFrame::ContainerLogsOpen { session_id, runtime_name, tail } => {
            ctx.terminals
                .open(
                    &session_id,
                    OpenTarget::ContainerLogs { runtime_name, tail },
                    80,
                    24,
                )
                .await;
        }

        MasterFrame::TerminalInput { session_id, data }
        | MasterFrame::VmTerminalInput { session_id, data }
        | MasterFrame::ContainerTerminalInput { session_id, data } => {
            ctx.terminals.input(&session_id, &data);
        }

        MasterFrame::TerminalResize { session_id, cols, rows }
        | MasterFrame::VmTerminalResize { session_id, cols, rows }
        | MasterFrame::ContainerTerminalResize { session_id, cols, rows } => {
            ctx.terminals.resize(&session_id, cols, rows);
        }

        MasterFrame::TerminalClose { session_id }
        | MasterFrame::VmTerminalClose { session_id }
        | MasterFrame::ContainerTerminalClose { session_id }
        | MasterFrame::ContainerLogsClose { session_id } => {
            ctx.terminals.close(&session_id);
        }

        MasterFrame::Error { error } => {
            warn!(%error, "error frame from master");
        }

        MasterFrame::AuthOk | MasterFrame::Pong => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_derivation_tracks_scheme_and_path() {
        assert_eq!(
            build_agent_ws_url("http://127.0.0.1:8000").unwrap(),
            "ws://127.0.0.1:8000/ws/agent"
        );
        assert_eq!(
            build_agent_ws_url("https://master.example.com/").unwrap(),
            "wss://master.example.com/ws/agent"
        );
        assert!(build_agent_ws_url("not a url").is_err());
    }
}
