//! UI terminal endpoints: node shell, VM serial console, container shell and
//! container log tail, all multiplexed to the node's agent websocket by
//! session id.

use crate::state::AppState;
use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use base64::Engine;
use lattice_proto::{MasterFrame, NodeState, UiEvent, UiFrame};
use lattice_router::{TerminalEvent, TerminalKind};
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;
const COLS_RANGE: std::ops::RangeInclusive<u16> = 20..=300;
const ROWS_RANGE: std::ops::RangeInclusive<u16> = 5..=120;
const TAIL_DEFAULT: u32 = 200;
const TAIL_MAX: u32 = 2000;

const WAITING_MESSAGE: &str = "[waiting for agent websocket connection...]";

/// What the session drives on the agent side.
enum TerminalTarget {
    NodeShell,
    VmConsole { vm_id: String, domain_name: String },
    ContainerShell { runtime_name: String },
    ContainerLogs { runtime_name: String, tail: u32 },
}

impl TerminalTarget {
    fn kind(&self) -> TerminalKind {
        match self {
            Self::NodeShell => TerminalKind::NodeShell,
            Self::VmConsole { .. } => TerminalKind::VmConsole,
            Self::ContainerShell { .. } => TerminalKind::ContainerShell,
            Self::ContainerLogs { .. } => TerminalKind::ContainerLogs,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::NodeShell => "node_shell",
            Self::VmConsole { .. } => "vm_console",
            Self::ContainerShell { .. } => "container_shell",
            Self::ContainerLogs { .. } => "container_logs",
        }
    }

    fn open_frame(&self, session_id: &str, cols: u16, rows: u16) -> MasterFrame {
        let session_id = session_id.to_string();
        match self {
            Self::NodeShell => MasterFrame::TerminalOpen {
                session_id,
                cols,
                rows,
            },
            Self::VmConsole {
                vm_id,
                domain_name,
            } => MasterFrame::VmTerminalOpen {
                session_id,
                cols,
                rows,
                vm_id: vm_id.clone(),
                domain_name: domain_name.clone(),
            },
            Self::ContainerShell { runtime_name } => MasterFrame::ContainerTerminalOpen {
                session_id,
                cols,
                rows,
                runtime_name: runtime_name.clone(),
            },
            Self::ContainerLogs { runtime_name, tail } => MasterFrame::ContainerLogsOpen {
                session_id,
                runtime_name: runtime_name.clone(),
                tail: *tail,
            },
        }
    }

    /// Log tails are read-only; input from the UI is dropped.
    fn input_frame(&self, session_id: &str, data: String) -> Option<MasterFrame> {
        let session_id = session_id.to_string();
        match self {
            Self::NodeShell => Some(MasterFrame::TerminalInput { session_id, data }),
            Self::VmConsole { .. } => Some(MasterFrame::VmTerminalInput { session_id, data }),
            Self::ContainerShell { .. } => {
                Some(MasterFrame::ContainerTerminalInput { session_id, data })
            }
            Self::ContainerLogs { .. } => None,
        }
    }

    fn resize_frame(&self, session_id: &str, cols: u16, rows: u16) -> Option<MasterFrame> {
        let session_id = session_id.to_string();
        match self {
            Self::NodeShell => Some(MasterFrame::TerminalResize {
                session_id,
                cols,
                rows,
            }),
            Self::VmConsole { .. } => Some(MasterFrame::VmTerminalResize {
                session_id,
                cols,
                rows,
            }),
            Self::ContainerShell { .. } => Some(MasterFrame::ContainerTerminalResize {
                session_id,
                cols,
                rows,
            }),
            Self::ContainerLogs { .. } => None,
        }
    }

    fn close_frame(&self, session_id: &str) -> MasterFrame {
        let session_id = session_id.to_string();
        match self {
            Self::NodeShell => MasterFrame::TerminalClose { session_id },
            Self::VmConsole { .. } => MasterFrame::VmTerminalClose { session_id },
            Self::ContainerShell { .. } => MasterFrame::ContainerTerminalClose { session_id },
            Self::ContainerLogs { .. } => MasterFrame::ContainerLogsClose { session_id },
        }
    }
}

/// Out-of-range dimensions fall back to the 80x24 defaults per axis.
fn sanitize_dims(cols: Option<u16>, rows: Option<u16>) -> (u16, u16) {
    let cols = cols.filter(|c| COLS_RANGE.contains(c)).unwrap_or(DEFAULT_COLS);
    let rows = rows.filter(|r| ROWS_RANGE.contains(r)).unwrap_or(DEFAULT_ROWS);
    (cols, rows)
}

fn query_dims(query: &HashMap<String, String>) -> (u16, u16) {
    sanitize_dims(
        query.get("cols").and_then(|v| v.parse().ok()),
        query.get("rows").and_then(|v| v.parse().ok()),
    )
}

fn query_tail(query: &HashMap<String, String>) -> u32 {
    query
        .get("tail")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(TAIL_DEFAULT)
        .clamp(1, TAIL_MAX)
}

async fn send_ui(socket: &mut WebSocket, event: &UiEvent) -> Result<(), axum::Error> {
    let Ok(text) = serde_json::to_string(event) else {
        return Ok(());
    };
    socket.send(Message::Text(text)).await
}

async fn reject(mut socket: WebSocket, error: &str) {
    let _ = send_ui(
        &mut socket,
        &UiEvent::TerminalError {
            error: error.to_string(),
        },
    )
    .await;
}

/// Look up the node and require it to be paired before opening any terminal.
fn paired_node(state: &AppState, node_id: &str) -> Result<String, &'static str> {
    match state.store.get_node(node_id) {
        Ok(Some(node)) if node.state == NodeState::Paired => Ok(node.id),
        Ok(Some(_)) => Err("node is not paired"),
        Ok(None) => Err("node not found"),
        Err(_) => Err("internal error"),
    }
}

// ─── Endpoints ───────────────────────────────────────────────────────────────

pub async fn node_terminal_ws(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let (cols, rows) = query_dims(&query);
    ws.on_upgrade(move |socket| async move {
        match paired_node(&state, &node_id) {
            Ok(node_id) => {
                run_terminal(state, socket, node_id, TerminalTarget::NodeShell, cols, rows).await;
            }
            Err(error) => reject(socket, error).await,
        }
    })
}

pub async fn vm_terminal_ws(
    State(state): State<AppState>,
    Path((node_id, vm_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let (cols, rows) = query_dims(&query);
    ws.on_upgrade(move |socket| async move {
        let node_id = match paired_node(&state, &node_id) {
            Ok(node_id) => node_id,
            Err(error) => return reject(socket, error).await,
        };
        let vm = match state.store.get_vm(&node_id, &vm_id) {
            Ok(Some(vm)) => vm,
            Ok(None) => return reject(socket, "vm not found").await,
            Err(_) => return reject(socket, "internal error").await,
        };
        let target = TerminalTarget::VmConsole {
            vm_id: vm.id,
            domain_name: vm.domain_name,
        };
        run_terminal(state, socket, node_id, target, cols, rows).await;
    })
}

pub async fn container_terminal_ws(
    State(state): State<AppState>,
    Path((node_id, name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let (cols, rows) = query_dims(&query);
    ws.on_upgrade(move |socket| async move {
        match paired_node(&state, &node_id) {
            Ok(node_id) => {
                let target = TerminalTarget::ContainerShell { runtime_name: name };
                run_terminal(state, socket, node_id, target, cols, rows).await;
            }
            Err(error) => reject(socket, error).await,
        }
    })
}

pub async fn container_logs_ws(
    State(state): State<AppState>,
    Path((node_id, name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let (cols, rows) = query_dims(&query);
    let tail = query_tail(&query);
    ws.on_upgrade(move |socket| async move {
        match paired_node(&state, &node_id) {
            Ok(node_id) => {
                let target = TerminalTarget::ContainerLogs {
                    runtime_name: name,
                    tail,
                };
                run_terminal(state, socket, node_id, target, cols, rows).await;
            }
            Err(error) => reject(socket, error).await,
        }
    })
}

// ─── Session pump ────────────────────────────────────────────────────────────

async fn run_terminal(
    state: AppState,
    mut socket: WebSocket,
    node_id: String,
    target: TerminalTarget,
    cols: u16,
    rows: u16,
) {
    let session = state.terminals.register(&node_id, target.kind());
    let session_id = session.session_id.clone();

    state
        .router
        .enqueue_ws(&node_id, target.open_frame(&session_id, cols, rows));
    if !state.router.has_active_connection(&node_id) {
        state.terminals.push_event(
            &session_id,
            TerminalEvent::Data {
                data: base64::engine::general_purpose::STANDARD.encode(WAITING_MESSAGE),
            },
        );
    }

    info!(node_id = %node_id, session_id = %session_id, kind = target.kind_name(), "terminal session opened");
    if send_ui(
        &mut socket,
        &UiEvent::TerminalReady {
            session_id: session_id.clone(),
        },
    )
    .await
    .is_ok()
    {
        pump(&state, &mut socket, &node_id, &session, &target).await;
    }

    state.terminals.unregister(&session_id);
    state
        .router
        .enqueue_ws(&node_id, target.close_frame(&session_id));
    state.append_log(
        &node_id,
        "info",
        "Terminal session closed",
        Some(&json!({ "session_id": session_id, "kind": target.kind_name() })),
    );
    info!(node_id = %node_id, session_id = %session_id, "terminal session closed");
}

async fn pump(
    state: &AppState,
    socket: &mut WebSocket,
    node_id: &str,
    session: &lattice_router::TerminalSession,
    target: &TerminalTarget,
) {
    let session_id = session.session_id.clone();
    loop {
        tokio::select! {
            event = session.recv() => {
                let (ui_event, is_final) = match event {
                    TerminalEvent::Data { data } => (UiEvent::TerminalData { data }, false),
                    TerminalEvent::Exit { exit_code } => (UiEvent::TerminalExit { exit_code }, true),
                    TerminalEvent::Error { error } => (UiEvent::TerminalError { error }, true),
                };
                if send_ui(socket, &ui_event).await.is_err() || is_final {
                    return;
                }
            }

            message = socket.recv() => {
                let text = match message {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };
                let frame = match serde_json::from_str::<UiFrame>(&text) {
                    Ok(frame) => frame,
                    Err(_) => {
                        let unsupported = UiEvent::TerminalError {
                            error: "unsupported frame".to_string(),
                        };
                        if send_ui(socket, &unsupported).await.is_err() {
                            return;
                        }
                        continue;
                    }
                };
                match frame {
                    UiFrame::Input { data } => {
                        if let Some(frame) = target.input_frame(&session_id, data) {
                            state.router.enqueue_ws(node_id, frame);
                        }
                    }
                    UiFrame::Resize { cols, rows } => {
                        let (cols, rows) = sanitize_dims(Some(cols), Some(rows));
                        if let Some(frame) = target.resize_frame(&session_id, cols, rows) {
                            state.router.enqueue_ws(node_id, frame);
                        }
                    }
                    UiFrame::Ping => {
                        if send_ui(socket, &UiEvent::Pong).await.is_err() {
                            return;
                        }
                    }
                    UiFrame::Close => return,
                }
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_outside_bounds_fall_back_to_defaults() {
        assert_eq!(sanitize_dims(Some(80), Some(24)), (80, 24));
        assert_eq!(sanitize_dims(Some(301), Some(24)), (80, 24));
        assert_eq!(sanitize_dims(Some(120), Some(4)), (120, 24));
        assert_eq!(sanitize_dims(Some(19), Some(121)), (80, 24));
        assert_eq!(sanitize_dims(None, None), (80, 24));
        assert_eq!(sanitize_dims(Some(300), Some(120)), (300, 120));
        assert_eq!(sanitize_dims(Some(20), Some(5)), (20, 5));
    }

    #[test]
    fn tail_is_clamped_into_range() {
        let mut query = HashMap::new();
        assert_eq!(query_tail(&query), 200);
        query.insert("tail".to_string(), "50000".to_string());
        assert_eq!(query_tail(&query), 2000);
        query.insert("tail".to_string(), "0".to_string());
        assert_eq!(query_tail(&query), 1);
        query.insert("tail".to_string(), "junk".to_string());
        assert_eq!(query_tail(&query), 200);
    }

    #[test]
    fn open_frames_carry_target_identity() {
        let target = TerminalTarget::VmConsole {
            vm_id: "vm-1".to_string(),
            domain_name: "lattice-abcd1234".to_string(),
        };
        match target.open_frame("s-1", 80, 24) {
            MasterFrame::VmTerminalOpen { domain_name, cols, rows, .. } => {
                assert_eq!(domain_name, "lattice-abcd1234");
                assert_eq!((cols, rows), (80, 24));
            }
            other => panic!("unexpected {other:?}"),
        }

        let logs = TerminalTarget::ContainerLogs {
            runtime_name: "web".to_string(),
            tail: 500,
        };
        match logs.open_frame("s-2", 80, 24) {
            MasterFrame::ContainerLogsOpen { runtime_name, tail, .. } => {
                assert_eq!(runtime_name, "web");
                assert_eq!(tail, 500);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn log_tail_sessions_ignore_input_and_resize() {
        let logs = TerminalTarget::ContainerLogs {
            runtime_name: "web".to_string(),
            tail: 200,
        };
        assert!(logs.input_frame("s-1", "x".to_string()).is_none());
        assert!(logs.resize_frame("s-1", 80, 24).is_none());
        assert!(matches!(
            logs.close_frame("s-1"),
            MasterFrame::ContainerLogsClose { .. }
        ));

        let shell = TerminalTarget::NodeShell;
        assert!(shell.input_frame("s-1", "x".to_string()).is_some());
        assert!(shell.resize_frame("s-1", 80, 24).is_some());
    }
}
