//! Agent websocket endpoint (`/ws/agent`).
//!
//! Per-connection state machine: unauthenticated → authenticated → fanout
//! loop, with a `subscribe_logs` escape hatch into log-stream-only mode.
//! The fanout loop alternates between draining the node's outbound buffer
//! and a short-timeout receive, so one task serves both directions.

use crate::state::{AppState, ResultDisposition};
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use lattice_proto::{AgentFrame, MasterFrame};
use lattice_router::TerminalEvent;
use lattice_store::{AppendLogOutcome, HeartbeatOutcome};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Frames drained from the outbound buffer per loop tick.
const MAX_DRAIN: usize = 200;
/// Receive timeout that interleaves receives with queue drains.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

struct AuthedAgent {
    node_id: String,
    pair_token: String,
}

enum Flow {
    Continue,
    Break,
}

pub async fn agent_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn send_frame(socket: &mut WebSocket, frame: &MasterFrame) -> Result<(), axum::Error> {
    let Ok(text) = serde_json::to_string(frame) else {
        return Ok(());
    };
    socket.send(Message::Text(text)).await
}

async fn send_error(socket: &mut WebSocket, error: &str) -> Result<(), axum::Error> {
    send_frame(
        socket,
        &MasterFrame::Error {
            error: error.to_string(),
        },
    )
    .await
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    let connection_id = Uuid::new_v4().to_string();
    let mut authed: Option<AuthedAgent> = None;

    loop {
        if let Some(agent) = &authed {
            // A newer connection for this node owns the writer role now.
            if !state.router.is_current(&agent.node_id, &connection_id) {
                info!(node_id = %agent.node_id, connection_id = %connection_id, "connection superseded");
                let _ = send_error(&mut socket, "superseded_connection").await;
                break;
            }
            let mut send_failed = false;
            for frame in state.router.drain_ws(&agent.node_id, MAX_DRAIN) {
                if let MasterFrame::Command(command) = &frame {
                    state.append_log(
                        &agent.node_id,
                        "info",
                        &format!("Sent agent command {}", command.command_type()),
                        Some(&json!({ "command_id": command.command_id() })),
                    );
                }
                if send_frame(&mut socket, &frame).await.is_err() {
                    send_failed = true;
                    break;
                }
            }
            if send_failed {
                break;
            }
        }

        let message = match tokio::time::timeout(RECV_TIMEOUT, socket.recv()).await {
            Err(_) => continue,
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(message))) => message,
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<AgentFrame>(&text) {
            Ok(frame) => frame,
            Err(_) => {
                let error = if serde_json::from_str::<Value>(&text).is_err() {
                    "invalid_json"
                } else if authed.is_none() {
                    "auth_required"
                } else {
                    "unsupported_type"
                };
                if send_error(&mut socket, error).await.is_err() || authed.is_none() {
                    break;
                }
                continue;
            }
        };

        match &authed {
            None => match frame {
                AgentFrame::Auth {
                    node_id,
                    pair_token,
                } => {
                    let node_id = node_id.trim().to_string();
                    let pair_token = pair_token.trim().to_string();
                    if node_id.is_empty() || pair_token.is_empty() {
                        let _ = send_error(&mut socket, "invalid_auth_payload").await;
                        break;
                    }
                    match state.store.is_valid_node_token(&node_id, &pair_token) {
                        Ok(true) => {}
                        Ok(false) => {
                            let _ = send_error(&mut socket, "unauthorized").await;
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "token validation failed");
                            let _ = send_error(&mut socket, "unauthorized").await;
                            break;
                        }
                    }
                    if let Some(old) = state.router.activate(&node_id, &connection_id) {
                        state.append_log(
                            &node_id,
                            "info",
                            "Agent websocket connection replaced an existing session",
                            Some(&json!({ "superseded_connection": old })),
                        );
                    }
                    state.append_log(&node_id, "info", "Agent websocket connected", None);
                    info!(node_id = %node_id, connection_id = %connection_id, "agent websocket connected");
                    if send_frame(&mut socket, &MasterFrame::AuthOk).await.is_err() {
                        break;
                    }
                    authed = Some(AuthedAgent {
                        node_id,
                        pair_token,
                    });
                }
                AgentFrame::SubscribeLogs { node_id, limit } => {
                    // Log-stream-only mode is terminal for this connection.
                    let limit = lattice_store::clamp_log_limit(limit);
                    crate::log_ws::stream_node_logs(&mut socket, &state, &node_id, limit).await;
                    return;
                }
                _ => {
                    let _ = send_error(&mut socket, "auth_required").await;
                    break;
                }
            },
            Some(agent) => match handle_agent_frame(&state, &mut socket, agent, frame).await {
                Flow::Continue => {}
                Flow::Break => break,
            },
        }
    }

    if let Some(agent) = &authed {
        let was_current = state.router.deactivate(&agent.node_id, &connection_id);
        if was_current {
            state.router.clear_ws(&agent.node_id);
        }
        let closed = state
            .terminals
            .close_for_node(&agent.node_id, "Agent websocket disconnected");
        state.append_log(&agent.node_id, "warning", "Agent websocket disconnected", None);
        info!(
            node_id = %agent.node_id,
            connection_id = %connection_id,
            was_current,
            closed_terminals = closed,
            "agent websocket disconnected"
        );
    }
}

async fn handle_agent_frame(
    state: &AppState,
    socket: &mut WebSocket,
    agent: &AuthedAgent,
    frame: AgentFrame,
) -> Flow {
    match frame {
        AgentFrame::Log {
            level,
            message,
            meta,
            timestamp,
        } => {
            if message.trim().is_empty() {
                if send_error(socket, "message is required").await.is_err() {
                    return Flow::Break;
                }
                return Flow::Continue;
            }
            match state.store.append_node_log(
                &agent.node_id,
                level.as_deref().unwrap_or("info"),
                &message,
                meta.as_ref(),
                timestamp.as_deref(),
            ) {
                Ok(AppendLogOutcome::Ok) => Flow::Continue,
                Ok(AppendLogOutcome::NotFound) => {
                    let _ = send_error(socket, "node_not_found").await;
                    Flow::Break
                }
                Err(e) => {
                    warn!(error = %e, "failed to append agent log");
                    Flow::Continue
                }
            }
        }

        AgentFrame::Heartbeat { payload } => {
            let mut payload = if payload.is_object() {
                payload
            } else {
                json!({})
            };
            payload["node_id"] = json!(agent.node_id);
            match state
                .store
                .record_heartbeat(&agent.pair_token, &agent.node_id, &payload)
            {
                Ok(HeartbeatOutcome::Ok(_)) => Flow::Continue,
                Ok(_) => {
                    // Token revoked mid-session; the agent must re-pair.
                    let _ = send_error(socket, "unauthorized").await;
                    Flow::Break
                }
                Err(e) => {
                    warn!(error = %e, "heartbeat record failed");
                    Flow::Continue
                }
            }
        }

        AgentFrame::CommandResult(result) => {
            match state.apply_command_result(&agent.node_id, &result) {
                Ok(ResultDisposition::Invalid) => {
                    if send_error(socket, "command_id is required").await.is_err() {
                        return Flow::Break;
                    }
                    Flow::Continue
                }
                Ok(ResultDisposition::NotFound) => {
                    if send_error(socket, "unknown operation").await.is_err() {
                        return Flow::Break;
                    }
                    Flow::Continue
                }
                Ok(_) => Flow::Continue,
                Err(e) => {
                    warn!(error = %e, "failed to apply command result");
                    Flow::Continue
                }
            }
        }

        AgentFrame::TerminalData { session_id, data } => {
            route_terminal_event(state, socket, &session_id, TerminalEvent::Data { data }).await
        }
        AgentFrame::TerminalExit {
            session_id,
            exit_code,
        } => {
            route_terminal_event(state, socket, &session_id, TerminalEvent::Exit { exit_code })
                .await
        }
        AgentFrame::TerminalError { session_id, error } => {
            route_terminal_event(state, socket, &session_id, TerminalEvent::Error { error }).await
        }

        AgentFrame::Ping => {
            if send_frame(socket, &MasterFrame::Pong).await.is_err() {
                return Flow::Break;
            }
            Flow::Continue
        }

        AgentFrame::Auth { .. } | AgentFrame::SubscribeLogs { .. } => {
            if send_error(socket, "unsupported_type").await.is_err() {
                return Flow::Break;
            }
            Flow::Continue
        }
    }
}

async fn route_terminal_event(
    state: &AppState,
    socket: &mut WebSocket,
    session_id: &str,
    event: TerminalEvent,
) -> Flow {
    if !state.terminals.push_event(session_id, event) {
        if send_error(socket, "unknown_session").await.is_err() {
            return Flow::Break;
        }
    }
    Flow::Continue
}
