//! Protocol types for the Lattice fleet plane.
//!
//! Defines the message vocabulary exchanged between the master, its agents and
//! UI terminal clients, plus the public record shapes served over the REST API.
//! Every wire shape is a closed tagged union; unknown frame types surface as an
//! explicit error instead of being dropped.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Node & VM state ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Pending,
    Paired,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paired => write!(f, "paired"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Creating,
    Running,
    Stopped,
    Rebooting,
    Deleting,
    Error,
    Unknown,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Rebooting => "rebooting",
            Self::Deleting => "deleting",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

impl VmState {
    pub fn parse(value: &str) -> Self {
        match value {
            "creating" => Self::Creating,
            "running" => Self::Running,
            "stopped" => Self::Stopped,
            "rebooting" => Self::Rebooting,
            "deleting" => Self::Deleting,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Linux,
    Windows,
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Windows => write!(f, "windows"),
        }
    }
}

// ─── Operations ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmAction {
    Start,
    Stop,
    Reboot,
    Delete,
}

impl VmAction {
    pub fn command_type(&self) -> &'static str {
        match self {
            Self::Start => "vm_start",
            Self::Stop => "vm_stop",
            Self::Reboot => "vm_reboot",
            Self::Delete => "vm_delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "reboot" => Some(Self::Reboot),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Start,
    Stop,
    Reboot,
    Delete,
    Sync,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
            Self::Delete => "delete",
            Self::Sync => "sync",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ─── Public records ──────────────────────────────────────────────────────────

/// A managed node as served to the UI. Never carries the pair token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub pair_code: String,
    pub state: NodeState,
    pub created_at: String,
    pub paired_at: Option<String>,
    pub last_heartbeat_at: Option<String>,
    pub agent_hostname: Option<String>,
    pub agent_info: Option<Value>,
    pub agent_commit: Option<String>,
    pub runtime_metrics: Option<Value>,
    pub capabilities: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub node_id: String,
    pub created_at: String,
    pub level: String,
    pub message: String,
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmImage {
    pub id: String,
    pub name: String,
    pub os_family: OsFamily,
    pub architecture: Option<String>,
    pub source_url: String,
    pub sha256: Option<String>,
    pub default_username: String,
    pub cloud_init_enabled: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub node_id: String,
    pub name: String,
    pub domain_name: String,
    pub state: VmState,
    pub provider: String,
    pub image_id: String,
    pub vcpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub bridge: String,
    pub ip_address: Option<String>,
    pub domain_uuid: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub node_id: String,
    pub vm_id: Option<String>,
    pub operation_type: OperationType,
    pub status: OperationStatus,
    pub request: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

/// A fire-and-forget shell execution queued for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalCommand {
    pub command_id: String,
    pub node_id: String,
    pub command_text: String,
    pub status: OperationStatus,
    pub exit_code: Option<i64>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
}

// ─── Pairing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub hardware: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRequest {
    pub pair_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentInfo>,
}

/// Successful pairing response. The only place the pair token crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairGrant {
    pub node_id: String,
    pub node_name: String,
    pub pair_token: String,
    pub state: NodeState,
}

// ─── Heartbeat ───────────────────────────────────────────────────────────────

/// Runtime usage snapshot reported by the agent. All fields are optional on
/// the wire; the store clamps percents to [0, 100] and byte counts to >= 0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_used_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_total_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_used_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_total_bytes: Option<i64>,
}

/// Typed heartbeat extras built by the agent. The master stores the raw JSON
/// verbatim in the heartbeat log meta and only parses the known fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatExtra {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<CapabilityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<CapabilityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub node_id: String,
    pub status: String,
    pub timestamp: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<HeartbeatExtra>,
}

/// Agent-reported readiness of a subsystem (VM via libvirt, container via
/// Docker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub provider: String,
    pub ready: bool,
    pub message: String,
    #[serde(default)]
    pub missing_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

// ─── Command envelopes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuestCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    pub id: String,
    pub name: String,
    pub os_family: OsFamily,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    pub source_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub default_username: String,
    pub cloud_init_enabled: bool,
}

/// Everything the agent needs to provision a VM. Carries the unredacted guest
/// password and therefore must never be persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCreateSpec {
    pub vm_id: String,
    pub domain_name: String,
    pub vcpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub bridge: String,
    pub image: ImageSpec,
    pub guest: GuestCredentials,
}

/// Compact VM identity shipped with lifecycle commands so the agent can
/// recover the domain name if the top-level field is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpecInfo {
    pub name: String,
    pub domain_name: String,
    pub vcpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub bridge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerCreateSpec {
    pub container_id: String,
    pub name: String,
    pub runtime_name: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_text: Option<String>,
    #[serde(default = "default_true")]
    pub start_immediately: bool,
}

fn default_true() -> bool {
    true
}

/// A command dispatched from the master to an agent, tagged by `command_type`
/// on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command_type", rename_all = "snake_case")]
pub enum CommandEnvelope {
    VmCreate {
        command_id: String,
        operation_id: String,
        vm_id: String,
        spec: VmCreateSpec,
    },
    VmStart {
        command_id: String,
        operation_id: String,
        vm_id: String,
        domain_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        vm_spec: Option<VmSpecInfo>,
    },
    VmStop {
        command_id: String,
        operation_id: String,
        vm_id: String,
        domain_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        vm_spec: Option<VmSpecInfo>,
    },
    VmReboot {
        command_id: String,
        operation_id: String,
        vm_id: String,
        domain_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        vm_spec: Option<VmSpecInfo>,
    },
    VmDelete {
        command_id: String,
        operation_id: String,
        vm_id: String,
        domain_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        vm_spec: Option<VmSpecInfo>,
    },
    VmSync {
        command_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
    },
    UpdateAgent {
        command_id: String,
        force: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    TerminalExec {
        command_id: String,
        command_text: String,
    },
    ContainerCreate {
        command_id: String,
        spec: ContainerCreateSpec,
    },
    ContainerStart {
        command_id: String,
        runtime_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
    },
    ContainerStop {
        command_id: String,
        runtime_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
    },
    ContainerRestart {
        command_id: String,
        runtime_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
    },
    ContainerDelete {
        command_id: String,
        runtime_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
    },
    ContainerSync {
        command_id: String,
    },
}

impl CommandEnvelope {
    pub fn command_id(&self) -> &str {
        match self {
            Self::VmCreate { command_id, .. }
            | Self::VmStart { command_id, .. }
            | Self::VmStop { command_id, .. }
            | Self::VmReboot { command_id, .. }
            | Self::VmDelete { command_id, .. }
            | Self::VmSync { command_id, .. }
            | Self::UpdateAgent { command_id, .. }
            | Self::TerminalExec { command_id, .. }
            | Self::ContainerCreate { command_id, .. }
            | Self::ContainerStart { command_id, .. }
            | Self::ContainerStop { command_id, .. }
            | Self::ContainerRestart { command_id, .. }
            | Self::ContainerDelete { command_id, .. }
            | Self::ContainerSync { command_id } => command_id,
        }
    }

    pub fn command_type(&self) -> &'static str {
        match self {
            Self::VmCreate { .. } => "vm_create",
            Self::VmStart { .. } => "vm_start",
            Self::VmStop { .. } => "vm_stop",
            Self::VmReboot { .. } => "vm_reboot",
            Self::VmDelete { .. } => "vm_delete",
            Self::VmSync { .. } => "vm_sync",
            Self::UpdateAgent { .. } => "update_agent",
            Self::TerminalExec { .. } => "terminal_exec",
            Self::ContainerCreate { .. } => "container_create",
            Self::ContainerStart { .. } => "container_start",
            Self::ContainerStop { .. } => "container_stop",
            Self::ContainerRestart { .. } => "container_restart",
            Self::ContainerDelete { .. } => "container_delete",
            Self::ContainerSync { .. } => "container_sync",
        }
    }
}

// ─── Command results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Running,
    Succeeded,
    Failed,
    Busy,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Busy => "busy",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub command_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm_id: Option<String>,
    pub status: CommandStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

// ─── Agent websocket frames ──────────────────────────────────────────────────

/// Frames sent by the agent over `/ws/agent`, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentFrame {
    Auth {
        node_id: String,
        pair_token: String,
    },
    SubscribeLogs {
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<i64>,
    },
    Log {
        #[serde(skip_serializing_if = "Option::is_none")]
        level: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
    },
    Heartbeat {
        payload: Value,
    },
    CommandResult(CommandResult),
    TerminalData {
        session_id: String,
        /// Raw PTY bytes, base64-encoded to survive JSON transport.
        data: String,
    },
    TerminalExit {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    TerminalError {
        session_id: String,
        error: String,
    },
    Ping,
}

/// Frames sent by the master over `/ws/agent`, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MasterFrame {
    AuthOk,
    Command(CommandEnvelope),
    TerminalOpen {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    TerminalInput {
        session_id: String,
        data: String,
    },
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    TerminalClose {
        session_id: String,
    },
    VmTerminalOpen {
        session_id: String,
        cols: u16,
        rows: u16,
        vm_id: String,
        domain_name: String,
    },
    VmTerminalInput {
        session_id: String,
        data: String,
    },
    VmTerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    VmTerminalClose {
        session_id: String,
    },
    ContainerTerminalOpen {
        session_id: String,
        cols: u16,
        rows: u16,
        runtime_name: String,
    },
    ContainerTerminalInput {
        session_id: String,
        data: String,
    },
    ContainerTerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    ContainerTerminalClose {
        session_id: String,
    },
    ContainerLogsOpen {
        session_id: String,
        runtime_name: String,
        tail: u32,
    },
    ContainerLogsClose {
        session_id: String,
    },
    Pong,
    Error {
        error: String,
    },
}

// ─── UI terminal frames ──────────────────────────────────────────────────────

/// Frames a UI terminal client sends to the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Ping,
    Close,
}

/// Frames the master sends to a UI terminal client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    TerminalReady {
        session_id: String,
    },
    TerminalData {
        data: String,
    },
    TerminalExit {
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    TerminalError {
        error: String,
    },
    Pong,
}

// ─── Log stream frames ───────────────────────────────────────────────────────

/// Frames pushed over the node-log websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogStreamFrame {
    Snapshot {
        items: Vec<LogEntry>,
        next_since_id: Option<i64>,
    },
    Append {
        items: Vec<LogEntry>,
        next_since_id: Option<i64>,
    },
    Error {
        error: String,
    },
}

// ─── REST payloads ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCreateRequest {
    pub name: String,
    pub image_id: String,
    pub vcpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub bridge: String,
    pub guest: GuestCredentials,
}

// ─── Validation ──────────────────────────────────────────────────────────────

pub const PAIR_CODE_LEN: usize = 6;

pub fn normalize_pair_code(value: &str) -> String {
    value.trim().to_uppercase()
}

/// Pair codes are exactly six uppercase alphanumerics.
pub fn is_valid_pair_code(value: &str) -> bool {
    let code = normalize_pair_code(value);
    code.len() == PAIR_CODE_LEN
        && code.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// VM names are 3-32 chars of lowercase alphanumerics and dashes.
pub fn is_valid_vm_name(value: &str) -> bool {
    let len = value.len();
    (3..=32).contains(&len)
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pair_code_validation_accepts_six_uppercase_alphanumerics() {
        assert!(is_valid_pair_code("K7Q2JM"));
        assert!(is_valid_pair_code("  k7q2jm "), "normalised before checking");
        assert!(!is_valid_pair_code("K7Q2J"));
        assert!(!is_valid_pair_code("K7Q2JM1"));
        assert!(!is_valid_pair_code("K7Q-JM"));
        assert!(!is_valid_pair_code(""));
    }

    #[test]
    fn vm_name_validation_enforces_charset_and_length() {
        assert!(is_valid_vm_name("db-1"));
        assert!(is_valid_vm_name("abc"));
        assert!(!is_valid_vm_name("ab"));
        assert!(!is_valid_vm_name("UPPER"));
        assert!(!is_valid_vm_name("name_with_underscore"));
        assert!(!is_valid_vm_name(&"a".repeat(33)));
    }

    #[test]
    fn agent_frame_roundtrips_with_type_tag() {
        let frame = AgentFrame::Log {
            level: Some("info".to_string()),
            message: "hello".to_string(),
            meta: None,
            timestamp: None,
        };
        let s = serde_json::to_string(&frame).unwrap();
        assert!(s.contains(r#""type":"log""#), "missing tag: {s}");
        let back: AgentFrame = serde_json::from_str(&s).unwrap();
        assert!(matches!(back, AgentFrame::Log { .. }));
    }

    #[test]
    fn agent_auth_frame_parses_from_raw_json() {
        let raw = r#"{"type":"auth","node_id":"n-1","pair_token":"tok"}"#;
        let frame: AgentFrame = serde_json::from_str(raw).unwrap();
        match frame {
            AgentFrame::Auth { node_id, pair_token } => {
                assert_eq!(node_id, "n-1");
                assert_eq!(pair_token, "tok");
            }
            other => panic!("expected auth frame, got {other:?}"),
        }
    }

    #[test]
    fn command_result_frame_flattens_fields() {
        let frame = AgentFrame::CommandResult(CommandResult {
            command_id: "cmd-1".to_string(),
            command_type: "vm_start".to_string(),
            operation_id: Some("op-1".to_string()),
            vm_id: None,
            status: CommandStatus::Succeeded,
            message: "VM started".to_string(),
            details: Some(json!({"power_state": "running"})),
        });
        let s = serde_json::to_string(&frame).unwrap();
        assert!(s.contains(r#""type":"command_result""#));
        assert!(s.contains(r#""command_id":"cmd-1""#));
        assert!(s.contains(r#""status":"succeeded""#));
        let back: AgentFrame = serde_json::from_str(&s).unwrap();
        match back {
            AgentFrame::CommandResult(result) => {
                assert_eq!(result.operation_id.as_deref(), Some("op-1"));
            }
            other => panic!("expected command_result, got {other:?}"),
        }
    }

    #[test]
    fn unknown_command_status_deserialises_to_unknown() {
        let status: CommandStatus = serde_json::from_str(r#""exploded""#).unwrap();
        assert_eq!(status, CommandStatus::Unknown);
    }

    #[test]
    fn master_command_frame_nests_command_type_tag() {
        let frame = MasterFrame::Command(CommandEnvelope::VmStart {
            command_id: "op-9".to_string(),
            operation_id: "op-9".to_string(),
            vm_id: "vm-1".to_string(),
            domain_name: "lattice-abcd1234".to_string(),
            vm_spec: None,
        });
        let s = serde_json::to_string(&frame).unwrap();
        assert!(s.contains(r#""type":"command""#), "missing outer tag: {s}");
        assert!(s.contains(r#""command_type":"vm_start""#), "missing inner tag: {s}");
        let back: MasterFrame = serde_json::from_str(&s).unwrap();
        match back {
            MasterFrame::Command(cmd) => assert_eq!(cmd.command_type(), "vm_start"),
            other => panic!("expected command, got {other:?}"),
        }
    }

    #[test]
    fn terminal_open_frames_use_kind_prefixed_types() {
        let open = MasterFrame::VmTerminalOpen {
            session_id: "s-1".to_string(),
            cols: 80,
            rows: 24,
            vm_id: "vm-1".to_string(),
            domain_name: "lattice-abcd1234".to_string(),
        };
        let s = serde_json::to_string(&open).unwrap();
        assert!(s.contains(r#""type":"vm_terminal_open""#), "got {s}");

        let logs = MasterFrame::ContainerLogsOpen {
            session_id: "s-2".to_string(),
            runtime_name: "web".to_string(),
            tail: 200,
        };
        let s = serde_json::to_string(&logs).unwrap();
        assert!(s.contains(r#""type":"container_logs_open""#), "got {s}");
    }

    #[test]
    fn unknown_master_frame_type_is_a_parse_error() {
        let raw = r#"{"type":"warp_drive","session_id":"s-1"}"#;
        assert!(serde_json::from_str::<MasterFrame>(raw).is_err());
    }

    #[test]
    fn vm_create_spec_carries_guest_credentials() {
        let spec = VmCreateSpec {
            vm_id: "vm-1".to_string(),
            domain_name: "lattice-abcd1234".to_string(),
            vcpu: 2,
            memory_mb: 2048,
            disk_gb: 20,
            bridge: "br0".to_string(),
            image: ImageSpec {
                id: "ubuntu-24-04".to_string(),
                name: "Ubuntu 24.04 LTS".to_string(),
                os_family: OsFamily::Linux,
                architecture: Some("amd64".to_string()),
                source_url: "https://example.com/noble.img".to_string(),
                sha256: None,
                default_username: "ubuntu".to_string(),
                cloud_init_enabled: true,
            },
            guest: GuestCredentials {
                username: "u".to_string(),
                password: "p".to_string(),
            },
        };
        let s = serde_json::to_string(&spec).unwrap();
        assert!(s.contains(r#""password":"p""#));
        let back: VmCreateSpec = serde_json::from_str(&s).unwrap();
        assert_eq!(back.image.os_family, OsFamily::Linux);
    }

    #[test]
    fn container_create_spec_defaults_start_immediately() {
        let raw = r#"{
            "container_id": "c-1",
            "name": "web",
            "runtime_name": "lattice-web",
            "image": "nginx:alpine"
        }"#;
        let spec: ContainerCreateSpec = serde_json::from_str(raw).unwrap();
        assert!(spec.start_immediately);
        assert!(spec.command_text.is_none());
    }

    #[test]
    fn ui_frame_vocabulary_roundtrips() {
        let raw = r#"{"type":"resize","cols":120,"rows":40}"#;
        let frame: UiFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, UiFrame::Resize { cols: 120, rows: 40 }));

        let s = serde_json::to_string(&UiEvent::TerminalReady {
            session_id: "s-1".to_string(),
        })
        .unwrap();
        assert!(s.contains(r#""type":"terminal_ready""#));
    }

    #[test]
    fn operation_status_terminality() {
        assert!(OperationStatus::Succeeded.is_terminal());
        assert!(OperationStatus::Failed.is_terminal());
        assert!(!OperationStatus::Queued.is_terminal());
        assert!(!OperationStatus::Running.is_terminal());
    }

    #[test]
    fn vm_action_maps_to_command_types() {
        assert_eq!(VmAction::Start.command_type(), "vm_start");
        assert_eq!(VmAction::Delete.command_type(), "vm_delete");
        assert_eq!(VmAction::parse("reboot"), Some(VmAction::Reboot));
        assert_eq!(VmAction::parse("explode"), None);
    }
}
