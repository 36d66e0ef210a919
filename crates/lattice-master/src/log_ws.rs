//! Node log push stream: snapshot on open, polled appends every second.

use crate::state::AppState;
use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use lattice_proto::LogStreamFrame;
use lattice_store::LogListOutcome;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

fn query_limit(query: &HashMap<String, String>) -> i64 {
    lattice_store::clamp_log_limit(query.get("limit").and_then(|raw| raw.parse::<i64>().ok()))
}

pub async fn node_logs_ws(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let node_id = query.get("node_id").cloned().unwrap_or_default();
    let limit = query_limit(&query);
    ws.on_upgrade(move |mut socket| async move {
        stream_node_logs(&mut socket, &state, &node_id, limit).await;
    })
}

/// Path variant of the log stream endpoint.
pub async fn node_logs_ws_path(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let limit = query_limit(&query);
    ws.on_upgrade(move |mut socket| async move {
        stream_node_logs(&mut socket, &state, &node_id, limit).await;
    })
}

async fn send_frame(socket: &mut WebSocket, frame: &LogStreamFrame) -> Result<(), axum::Error> {
    let Ok(text) = serde_json::to_string(frame) else {
        return Ok(());
    };
    socket.send(Message::Text(text)).await
}

async fn send_stream_error(socket: &mut WebSocket, error: &str) {
    let _ = send_frame(
        socket,
        &LogStreamFrame::Error {
            error: error.to_string(),
        },
    )
    .await;
}

/// Serve the snapshot-then-append protocol until the client goes away or the
/// node disappears. Shared with the `subscribe_logs` mode of `/ws/agent`.
pub async fn stream_node_logs(
    socket: &mut WebSocket,
    state: &AppState,
    node_id: &str,
    limit: i64,
) {
    let node_id = node_id.trim();
    if node_id.is_empty() {
        send_stream_error(socket, "node_not_found").await;
        return;
    }

    let mut since_id: Option<i64> = None;
    match state.store.list_node_logs(node_id, limit, None) {
        Ok(LogListOutcome::Ok(items)) => {
            since_id = items.last().map(|e| e.id);
            if send_frame(
                socket,
                &LogStreamFrame::Snapshot {
                    items,
                    next_since_id: since_id,
                },
            )
            .await
            .is_err()
            {
                return;
            }
        }
        Ok(LogListOutcome::NotFound) => {
            send_stream_error(socket, "node_not_found").await;
            return;
        }
        Err(e) => {
            debug!(error = %e, "log snapshot failed");
            return;
        }
    }

    loop {
        // Poll for deltas, bailing out as soon as the client hangs up.
        tokio::select! {
            message = socket.recv() => {
                match message {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => continue,
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        match state.store.list_node_logs(node_id, limit, since_id) {
            Ok(LogListOutcome::Ok(items)) => {
                if items.is_empty() {
                    continue;
                }
                since_id = items.last().map(|e| e.id);
                if send_frame(
                    socket,
                    &LogStreamFrame::Append {
                        items,
                        next_since_id: since_id,
                    },
                )
                .await
                .is_err()
                {
                    return;
                }
            }
            Ok(LogListOutcome::NotFound) => {
                send_stream_error(socket, "node_not_found").await;
                return;
            }
            Err(e) => {
                debug!(error = %e, node_id, "log delta poll failed");
                return;
            }
        }
    }
}
