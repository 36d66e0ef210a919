//! REST surface for UI clients and the agent HTTP fallback paths.

use crate::state::{AppState, ResultDisposition};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use lattice_proto::{CommandEnvelope, CommandResult, MasterFrame, NodeState, VmAction, VmCreateRequest};
use lattice_store::{
    AgentAuth, HeartbeatOutcome, LogListOutcome, PairOutcome, RenameOutcome, TerminalExecOutcome,
    VmActionOutcome, VmCreateOutcome,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

/// How long a command long-poll is held before answering 204.
const LONG_POLL_WINDOW: Duration = Duration::from_secs(8);
const LONG_POLL_TICK: Duration = Duration::from_millis(200);

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-agent-hostname"),
        ]);

    Router::new()
        .route("/health", get(health))
        .route("/api/pair", post(pair))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/nodes", get(list_nodes).post(create_node))
        .route("/api/nodes/:node_id", patch(rename_node).delete(delete_node))
        .route("/api/nodes/:node_id/logs", get(node_logs))
        .route("/api/nodes/:node_id/actions/update-agent", post(update_agent))
        .route("/api/nodes/:node_id/actions/exec", post(exec_command))
        .route("/api/vm-images", get(list_images))
        .route("/api/nodes/:node_id/vms", get(list_vms).post(create_vm))
        .route("/api/nodes/:node_id/vms/:vm_id", get(get_vm))
        .route("/api/nodes/:node_id/vms/:vm_id/operations", get(vm_operations))
        .route("/api/nodes/:node_id/vms/:vm_id/actions/:action", post(vm_action))
        .route("/api/nodes/:node_id/commands/next", post(commands_next))
        .route("/api/nodes/:node_id/commands/result", post(commands_result))
        .route("/ws/agent", get(crate::agent_ws::agent_ws))
        .route("/ws/node-logs", get(crate::log_ws::node_logs_ws))
        .route("/ws/nodes/:node_id/logs", get(crate::log_ws::node_logs_ws_path))
        .route("/ws/nodes/:node_id/terminal", get(crate::terminal_ws::node_terminal_ws))
        .route(
            "/ws/nodes/:node_id/vms/:vm_id/terminal",
            get(crate::terminal_ws::vm_terminal_ws),
        )
        .route(
            "/ws/nodes/:node_id/containers/:name/terminal",
            get(crate::terminal_ws::container_terminal_ws),
        )
        .route(
            "/ws/nodes/:node_id/containers/:name/logs",
            get(crate::terminal_ws::container_logs_ws),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

pub fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

pub fn internal_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "store operation failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn agent_hostname(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-agent-hostname")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Authorise an agent-scoped request: bearer must match the node's token,
/// and a presented hostname must agree with the recorded one.
fn authorize_agent(state: &AppState, node_id: &str, headers: &HeaderMap) -> Result<(), Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(json_error(StatusCode::UNAUTHORIZED, "missing bearer token"));
    };
    match state
        .store
        .authenticate_agent(node_id, &token, agent_hostname(headers).as_deref())
    {
        Ok(AgentAuth::Ok) => Ok(()),
        Ok(AgentAuth::Unauthorized) => {
            Err(json_error(StatusCode::UNAUTHORIZED, "invalid token"))
        }
        Ok(AgentAuth::HostnameMismatch) => Err(json_error(
            StatusCode::FORBIDDEN,
            "token does not match agent hostname",
        )),
        Err(e) => Err(internal_error(e)),
    }
}

// ─── Health & nodes ──────────────────────────────────────────────────────────

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn list_nodes(State(state): State<AppState>) -> Response {
    match state.store.list_nodes() {
        Ok(nodes) => Json(nodes).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn create_node(State(state): State<AppState>, payload: Option<Json<Value>>) -> Response {
    let name = payload
        .as_ref()
        .and_then(|Json(p)| p.get("name"))
        .and_then(Value::as_str);
    match state.store.create_node(name) {
        Ok(node) => {
            info!(node_id = %node.id, name = %node.name, "node created");
            (StatusCode::CREATED, Json(node)).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn rename_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    let Some(name) = payload.get("name").and_then(Value::as_str) else {
        return json_error(StatusCode::BAD_REQUEST, "name is required");
    };
    match state.store.rename_node(&node_id, name) {
        Ok(RenameOutcome::Ok(node)) => {
            info!(node_id = %node.id, name = %node.name, "node renamed");
            Json(*node).into_response()
        }
        Ok(RenameOutcome::InvalidName) => json_error(StatusCode::BAD_REQUEST, "name is required"),
        Ok(RenameOutcome::NotFound) => json_error(StatusCode::NOT_FOUND, "node not found"),
        Err(e) => internal_error(e),
    }
}

async fn delete_node(State(state): State<AppState>, Path(node_id): Path<String>) -> Response {
    match state.store.delete_node(&node_id) {
        Ok(Some(node)) => {
            info!(node_id = %node.id, name = %node.name, "node deleted");
            Json(json!({ "ok": true })).into_response()
        }
        Ok(None) => json_error(StatusCode::NOT_FOUND, "node not found"),
        Err(e) => internal_error(e),
    }
}

// ─── Pairing & heartbeat ─────────────────────────────────────────────────────

async fn pair(State(state): State<AppState>, Json(payload): Json<Value>) -> Response {
    let Some(pair_code) = payload.get("pair_code").and_then(Value::as_str) else {
        return json_error(StatusCode::BAD_REQUEST, "pair_code is required");
    };
    let agent_info = payload.get("agent");
    if agent_info.is_some_and(|v| !v.is_object()) {
        return json_error(StatusCode::BAD_REQUEST, "agent must be an object");
    }
    match state.store.pair_node(pair_code, agent_info) {
        Ok(PairOutcome::Paired(grant)) => {
            info!(node_id = %grant.node_id, "node paired");
            Json(grant).into_response()
        }
        Ok(PairOutcome::InvalidCode) => {
            json_error(StatusCode::BAD_REQUEST, "invalid pair code format")
        }
        Ok(PairOutcome::NotFound) => json_error(StatusCode::NOT_FOUND, "pair code not found"),
        Ok(PairOutcome::AlreadyPaired) => {
            json_error(StatusCode::CONFLICT, "pair code already paired")
        }
        Err(e) => internal_error(e),
    }
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return json_error(StatusCode::UNAUTHORIZED, "missing bearer token");
    };
    let Some(node_id) = payload.get("node_id").and_then(Value::as_str) else {
        return json_error(StatusCode::BAD_REQUEST, "node_id is required");
    };
    match state.store.record_heartbeat(&token, node_id, &payload) {
        Ok(HeartbeatOutcome::Ok(_)) => Json(json!({ "ok": true })).into_response(),
        Ok(HeartbeatOutcome::MissingToken | HeartbeatOutcome::InvalidToken) => {
            json_error(StatusCode::UNAUTHORIZED, "invalid token")
        }
        Ok(HeartbeatOutcome::NodeMismatch) => {
            json_error(StatusCode::FORBIDDEN, "token does not match node")
        }
        Err(e) => internal_error(e),
    }
}

// ─── Logs ────────────────────────────────────────────────────────────────────

async fn node_logs(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let limit = match query.get("limit") {
        Some(raw) => match raw.parse::<i64>() {
            Ok(v) => v,
            Err(_) => return json_error(StatusCode::BAD_REQUEST, "limit must be an integer"),
        },
        None => 200,
    };
    let since_id = match query.get("since_id") {
        Some(raw) => match raw.parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => return json_error(StatusCode::BAD_REQUEST, "since_id must be an integer"),
        },
        None => None,
    };

    match state.store.list_node_logs(&node_id, limit, since_id) {
        Ok(LogListOutcome::Ok(items)) => {
            let next_since_id = items.last().map(|e| e.id).or(since_id);
            Json(json!({ "items": items, "next_since_id": next_since_id })).into_response()
        }
        // Missing nodes read as an empty stream so UI polling stays quiet.
        Ok(LogListOutcome::NotFound) => {
            Json(json!({ "items": [], "next_since_id": since_id })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ─── Node actions ────────────────────────────────────────────────────────────

async fn update_agent(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    payload: Option<Json<Value>>,
) -> Response {
    let payload = payload.map(|Json(p)| p).unwrap_or_else(|| json!({}));
    let force = match payload.get("force") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return json_error(StatusCode::BAD_REQUEST, "force must be a boolean"),
    };
    let branch = match payload.get("branch") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::String(_)) => None,
        Some(_) => return json_error(StatusCode::BAD_REQUEST, "branch must be a string"),
    };

    let node = match state.store.get_node(&node_id) {
        Ok(Some(node)) => node,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "node not found"),
        Err(e) => return internal_error(e),
    };
    if node.state != NodeState::Paired {
        return json_error(StatusCode::CONFLICT, "node must be paired before updating");
    }

    let command_id = Uuid::new_v4().to_string();
    let command = CommandEnvelope::UpdateAgent {
        command_id: command_id.clone(),
        force,
        branch: branch.clone(),
    };
    let connected = state.dispatch_command(&node.id, command);
    state.append_log(
        &node.id,
        "info",
        "Agent update requested from UI",
        Some(&json!({ "command_id": command_id, "force": force, "branch": branch })),
    );
    info!(node_id = %node.id, command_id = %command_id, connected, "queued update command");
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "ok": true,
            "command_id": command_id,
            "queued": true,
            "agent_connected": connected,
        })),
    )
        .into_response()
}

async fn exec_command(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    let Some(command_text) = payload.get("command").and_then(Value::as_str) else {
        return json_error(StatusCode::BAD_REQUEST, "command is required");
    };
    match state.store.queue_terminal_command(&node_id, command_text) {
        Ok(TerminalExecOutcome::Queued { record, command }) => {
            let connected = state.dispatch_command(&node_id, *command);
            (
                StatusCode::ACCEPTED,
                Json(json!({
                    "ok": true,
                    "command_id": record.command_id,
                    "agent_connected": connected,
                })),
            )
                .into_response()
        }
        Ok(TerminalExecOutcome::NodeNotFound) => {
            json_error(StatusCode::NOT_FOUND, "node not found")
        }
        Ok(TerminalExecOutcome::NodeNotPaired) => {
            json_error(StatusCode::CONFLICT, "node must be paired")
        }
        Ok(TerminalExecOutcome::InvalidRequest { message }) => {
            json_error(StatusCode::BAD_REQUEST, &message)
        }
        Err(e) => internal_error(e),
    }
}

// ─── VM surface ──────────────────────────────────────────────────────────────

async fn list_images(State(state): State<AppState>) -> Response {
    match state.store.list_vm_images() {
        Ok(images) => Json(images).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn list_vms(State(state): State<AppState>, Path(node_id): Path<String>) -> Response {
    // Surface abandoned requests as failures before the UI reads the list.
    if let Err(e) = state
        .store
        .fail_stale_vm_operations(lattice_store::STALE_OPERATION_SECS)
    {
        return internal_error(e);
    }
    match state.store.list_node_vms(&node_id) {
        Ok(Some(vms)) => Json(vms).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "node not found"),
        Err(e) => internal_error(e),
    }
}

async fn get_vm(
    State(state): State<AppState>,
    Path((node_id, vm_id)): Path<(String, String)>,
) -> Response {
    match state.store.get_vm(&node_id, &vm_id) {
        Ok(Some(vm)) => Json(vm).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "vm not found"),
        Err(e) => internal_error(e),
    }
}

async fn vm_operations(
    State(state): State<AppState>,
    Path((node_id, vm_id)): Path<(String, String)>,
) -> Response {
    match state.store.list_vm_operations(&node_id, &vm_id) {
        Ok(Some(operations)) => Json(operations).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "vm not found"),
        Err(e) => internal_error(e),
    }
}

async fn create_vm(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    let request: VmCreateRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("invalid request body: {e}"));
        }
    };
    match state.store.create_vm_request(&node_id, &request) {
        Ok(VmCreateOutcome::Created { vm, command }) => {
            let connected = state.dispatch_command(&node_id, *command);
            info!(node_id = %node_id, vm_id = %vm.id, connected, "queued vm create");
            (StatusCode::ACCEPTED, Json(*vm)).into_response()
        }
        Ok(VmCreateOutcome::NodeNotFound) => json_error(StatusCode::NOT_FOUND, "node not found"),
        Ok(VmCreateOutcome::NodeNotPaired) => {
            json_error(StatusCode::CONFLICT, "node must be paired before creating VMs")
        }
        Ok(VmCreateOutcome::CapabilityNotReady { message }) => {
            json_error(StatusCode::CONFLICT, &message)
        }
        Ok(VmCreateOutcome::ImageNotFound) => json_error(StatusCode::BAD_REQUEST, "image not found"),
        Ok(VmCreateOutcome::DuplicateName) => {
            json_error(StatusCode::CONFLICT, "vm name already exists on this node")
        }
        Ok(VmCreateOutcome::InvalidRequest { message }) => {
            json_error(StatusCode::BAD_REQUEST, &message)
        }
        Err(e) => internal_error(e),
    }
}

async fn vm_action(
    State(state): State<AppState>,
    Path((node_id, vm_id, action)): Path<(String, String, String)>,
) -> Response {
    let Some(action) = VmAction::parse(&action) else {
        return json_error(StatusCode::BAD_REQUEST, "unknown vm action");
    };
    match state.store.queue_vm_action(&node_id, &vm_id, action) {
        Ok(VmActionOutcome::Queued {
            vm,
            operation_id,
            command,
        }) => {
            let connected = state.dispatch_command(&node_id, *command);
            info!(node_id = %node_id, vm_id = %vm.id, operation_id = %operation_id, connected, "queued vm action");
            (
                StatusCode::ACCEPTED,
                Json(json!({ "ok": true, "operation_id": operation_id, "vm": *vm })),
            )
                .into_response()
        }
        Ok(VmActionOutcome::NodeNotFound) => json_error(StatusCode::NOT_FOUND, "node not found"),
        Ok(VmActionOutcome::VmNotFound) => json_error(StatusCode::NOT_FOUND, "vm not found"),
        Ok(VmActionOutcome::InvalidState { message }) => {
            json_error(StatusCode::CONFLICT, &message)
        }
        Err(e) => internal_error(e),
    }
}

// ─── Agent command fallback (HTTP long-poll) ─────────────────────────────────

async fn commands_next(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(response) = authorize_agent(&state, &node_id, &headers) {
        return response;
    }

    let deadline = tokio::time::Instant::now() + LONG_POLL_WINDOW;
    loop {
        if let Some(command) = state.router.dequeue_pending(&node_id) {
            state.append_log(
                &node_id,
                "info",
                &format!("Sent agent command {}", command.command_type()),
                Some(&json!({ "command_id": command.command_id() })),
            );
            return Json(json!({ "command": MasterFrame::Command(command) })).into_response();
        }
        if tokio::time::Instant::now() >= deadline {
            return StatusCode::NO_CONTENT.into_response();
        }
        tokio::time::sleep(LONG_POLL_TICK).await;
    }
}

async fn commands_result(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    if let Err(response) = authorize_agent(&state, &node_id, &headers) {
        return response;
    }
    let result: CommandResult = match serde_json::from_value(payload) {
        Ok(result) => result,
        Err(e) => {
            return json_error(StatusCode::BAD_REQUEST, &format!("invalid result body: {e}"));
        }
    };
    match state.apply_command_result(&node_id, &result) {
        Ok(ResultDisposition::Applied | ResultDisposition::LoggedOnly) => {
            Json(json!({ "ok": true })).into_response()
        }
        Ok(ResultDisposition::NotFound) => json_error(StatusCode::NOT_FOUND, "operation not found"),
        Ok(ResultDisposition::Invalid) => {
            json_error(StatusCode::BAD_REQUEST, "command_id is required")
        }
        Err(e) => internal_error(e),
    }
}
