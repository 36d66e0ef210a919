//! VM images, VM rows and the operation state machine.
//!
//! Every VM state transition goes through an Operation row; the store
//! validates the current state inside the transaction so conflicting
//! transitions can never interleave.

use crate::logs::insert_node_log;
use crate::nodes::fetch_node;
use crate::{StoreResult, utc_now};
use lattice_proto::{
    CommandEnvelope, CommandStatus, GuestCredentials, ImageSpec, Node, NodeState, Operation,
    OperationStatus, OperationType, OsFamily, Vm, VmAction, VmCreateRequest, VmCreateSpec,
    VmImage, VmSpecInfo, VmState, is_valid_vm_name,
};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Value, json};
use uuid::Uuid;

pub const VCPU_RANGE: std::ops::RangeInclusive<u32> = 1..=32;
pub const MEMORY_MB_RANGE: std::ops::RangeInclusive<u64> = 512..=262_144;
pub const DISK_GB_RANGE: std::ops::RangeInclusive<u64> = 10..=4_096;

/// Operations still queued after this long have no agent to run them.
pub const STALE_OPERATION_SECS: i64 = 600;

// ─── Outcomes ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum VmCreateOutcome {
    /// VM row and queued operation inserted; the returned command carries the
    /// unredacted guest password and must be dispatched, never persisted.
    Created {
        vm: Box<Vm>,
        command: Box<CommandEnvelope>,
    },
    NodeNotFound,
    NodeNotPaired,
    CapabilityNotReady { message: String },
    ImageNotFound,
    DuplicateName,
    InvalidRequest { message: String },
}

#[derive(Debug)]
pub enum VmActionOutcome {
    Queued {
        vm: Box<Vm>,
        operation_id: String,
        command: Box<CommandEnvelope>,
    },
    NodeNotFound,
    VmNotFound,
    InvalidState { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResultOutcome {
    Applied,
    /// The operation already reached a terminal status; redelivery is a no-op.
    AlreadyFinal,
    OperationNotFound,
    /// Busy/unknown statuses never advance the operation.
    Ignored,
}

// ─── Row mapping ──────────────────────────────────────────────────────────────

fn image_from_row(row: &Row<'_>) -> rusqlite::Result<VmImage> {
    let os_family: String = row.get("os_family")?;
    Ok(VmImage {
        id: row.get("id")?,
        name: row.get("name")?,
        os_family: if os_family == "windows" {
            OsFamily::Windows
        } else {
            OsFamily::Linux
        },
        architecture: row.get("architecture")?,
        source_url: row.get("source_url")?,
        sha256: row.get("sha256")?,
        default_username: row.get("default_username")?,
        cloud_init_enabled: row.get::<_, i64>("cloud_init_enabled")? != 0,
        created_at: row.get("created_at")?,
    })
}

fn vm_from_row(row: &Row<'_>) -> rusqlite::Result<Vm> {
    let state: String = row.get("state")?;
    Ok(Vm {
        id: row.get("id")?,
        node_id: row.get("node_id")?,
        name: row.get("name")?,
        domain_name: row.get("domain_name")?,
        state: VmState::parse(&state),
        provider: row.get("provider")?,
        image_id: row.get("image_id")?,
        vcpu: row.get::<_, i64>("vcpu")? as u32,
        memory_mb: row.get::<_, i64>("memory_mb")? as u64,
        disk_gb: row.get::<_, i64>("disk_gb")? as u64,
        bridge: row.get("bridge")?,
        ip_address: row.get("ip_address")?,
        domain_uuid: row.get("domain_uuid")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<Operation> {
    let op_type: String = row.get("operation_type")?;
    let status: String = row.get("status")?;
    let request_raw: Option<String> = row.get("request_json")?;
    let result_raw: Option<String> = row.get("result_json")?;
    Ok(Operation {
        id: row.get("id")?,
        node_id: row.get("node_id")?,
        vm_id: row.get("vm_id")?,
        operation_type: match op_type.as_str() {
            "create" => OperationType::Create,
            "start" => OperationType::Start,
            "stop" => OperationType::Stop,
            "reboot" => OperationType::Reboot,
            "delete" => OperationType::Delete,
            _ => OperationType::Sync,
        },
        status: match status.as_str() {
            "queued" => OperationStatus::Queued,
            "running" => OperationStatus::Running,
            "succeeded" => OperationStatus::Succeeded,
            _ => OperationStatus::Failed,
        },
        request: request_raw.and_then(|s| serde_json::from_str(&s).ok()),
        result: result_raw.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
    })
}

fn fetch_vm(conn: &Connection, node_id: &str, vm_id: &str) -> StoreResult<Option<Vm>> {
    let vm = conn
        .query_row(
            "SELECT * FROM node_vms WHERE id = ? AND node_id = ? LIMIT 1;",
            params![vm_id.trim(), node_id.trim()],
            vm_from_row,
        )
        .optional()?;
    Ok(vm)
}

// ─── Seeding ──────────────────────────────────────────────────────────────────

/// Seed the default cloud-image catalogue on first initialisation.
pub(crate) fn seed_default_images(conn: &Connection) -> StoreResult<()> {
    let defaults: &[(&str, &str, &str, Option<&str>, &str, &str)] = &[
        (
            "ubuntu-24-04",
            "Ubuntu 24.04 LTS",
            "linux",
            Some("amd64"),
            "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img",
            "ubuntu",
        ),
        (
            "ubuntu-24-04-arm64",
            "Ubuntu 24.04 LTS (arm64)",
            "linux",
            Some("arm64"),
            "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-arm64.img",
            "ubuntu",
        ),
        (
            "debian-12",
            "Debian 12",
            "linux",
            Some("amd64"),
            "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2",
            "debian",
        ),
    ];
    let now = utc_now();
    for (id, name, family, arch, url, username) in defaults {
        conn.execute(
            "INSERT OR IGNORE INTO vm_images
                 (id, name, os_family, architecture, source_url, sha256,
                  default_username, cloud_init_enabled, created_at)
             VALUES (?, ?, ?, ?, ?, NULL, ?, 1, ?);",
            params![id, name, family, arch, url, username, now],
        )?;
    }
    Ok(())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn derive_domain_name(vm_id: &str) -> String {
    let prefix: String = vm_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("lattice-{prefix}")
}

fn vm_capability_ready(node: &Node) -> bool {
    node.capabilities
        .as_ref()
        .and_then(|caps| caps.get("vm"))
        .and_then(|vm| vm.get("ready"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn image_to_spec(image: &VmImage) -> ImageSpec {
    ImageSpec {
        id: image.id.clone(),
        name: image.name.clone(),
        os_family: image.os_family,
        architecture: image.architecture.clone(),
        source_url: image.source_url.clone(),
        sha256: image.sha256.clone(),
        default_username: image.default_username.clone(),
        cloud_init_enabled: image.cloud_init_enabled,
    }
}

fn vm_spec_info(vm: &Vm) -> VmSpecInfo {
    VmSpecInfo {
        name: vm.name.clone(),
        domain_name: vm.domain_name.clone(),
        vcpu: vm.vcpu,
        memory_mb: vm.memory_mb,
        disk_gb: vm.disk_gb,
        bridge: vm.bridge.clone(),
    }
}

fn validate_create_request(req: &VmCreateRequest) -> Result<(), String> {
    if !is_valid_vm_name(&req.name) {
        return Err("name must be 3-32 lowercase alphanumerics or dashes".to_string());
    }
    if !VCPU_RANGE.contains(&req.vcpu) {
        return Err("vcpu must be between 1 and 32".to_string());
    }
    if !MEMORY_MB_RANGE.contains(&req.memory_mb) {
        return Err("memory_mb must be between 512 and 262144".to_string());
    }
    if !DISK_GB_RANGE.contains(&req.disk_gb) {
        return Err("disk_gb must be between 10 and 4096".to_string());
    }
    if req.guest.username.trim().is_empty() || req.guest.password.trim().is_empty() {
        return Err("guest username and password are required".to_string());
    }
    Ok(())
}

fn update_vm_state(
    conn: &Connection,
    vm_id: &str,
    state: VmState,
    last_error: Option<&str>,
) -> StoreResult<()> {
    conn.execute(
        "UPDATE node_vms SET state = ?, last_error = ?, updated_at = ? WHERE id = ?;",
        params![state.to_string(), last_error, utc_now(), vm_id],
    )?;
    Ok(())
}

// ─── Store operations ─────────────────────────────────────────────────────────

impl crate::Store {
    pub fn list_vm_images(&self) -> StoreResult<Vec<VmImage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM vm_images ORDER BY name ASC;")?;
            let images = stmt
                .query_map([], image_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(images)
        })
    }

    pub fn get_vm_image(&self, image_id: &str) -> StoreResult<Option<VmImage>> {
        self.with_conn(|conn| {
            let image = conn
                .query_row(
                    "SELECT * FROM vm_images WHERE id = ? LIMIT 1;",
                    params![image_id.trim()],
                    image_from_row,
                )
                .optional()?;
            Ok(image)
        })
    }

    pub fn list_node_vms(&self, node_id: &str) -> StoreResult<Option<Vec<Vm>>> {
        self.with_conn(|conn| {
            if fetch_node(conn, node_id)?.is_none() {
                return Ok(None);
            }
            let mut stmt = conn.prepare(
                "SELECT * FROM node_vms WHERE node_id = ? ORDER BY created_at ASC;",
            )?;
            let vms = stmt
                .query_map(params![node_id.trim()], vm_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(vms))
        })
    }

    pub fn get_vm(&self, node_id: &str, vm_id: &str) -> StoreResult<Option<Vm>> {
        self.with_conn(|conn| fetch_vm(conn, node_id, vm_id))
    }

    pub fn list_vm_operations(
        &self,
        node_id: &str,
        vm_id: &str,
    ) -> StoreResult<Option<Vec<Operation>>> {
        self.with_conn(|conn| {
            if fetch_vm(conn, node_id, vm_id)?.is_none() {
                return Ok(None);
            }
            let mut stmt = conn.prepare(
                "SELECT * FROM vm_operations
                 WHERE node_id = ? AND vm_id = ?
                 ORDER BY created_at DESC;",
            )?;
            let operations = stmt
                .query_map(params![node_id.trim(), vm_id.trim()], operation_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(operations))
        })
    }

    pub fn get_operation(&self, operation_id: &str) -> StoreResult<Option<Operation>> {
        self.with_conn(|conn| {
            let op = conn
                .query_row(
                    "SELECT * FROM vm_operations WHERE id = ? LIMIT 1;",
                    params![operation_id.trim()],
                    operation_from_row,
                )
                .optional()?;
            Ok(op)
        })
    }

    /// Validate and queue a VM creation. One transaction inserts the VM row
    /// (state `creating`), a queued create operation with the password
    /// redacted, and a log entry; the returned command is the only place the
    /// plaintext password exists.
    pub fn create_vm_request(
        &self,
        node_id: &str,
        req: &VmCreateRequest,
    ) -> StoreResult<VmCreateOutcome> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(node) = fetch_node(&tx, node_id)? else {
                return Ok(VmCreateOutcome::NodeNotFound);
            };
            if node.state != NodeState::Paired {
                return Ok(VmCreateOutcome::NodeNotPaired);
            }
            if let Err(message) = validate_create_request(req) {
                return Ok(VmCreateOutcome::InvalidRequest { message });
            }
            let Some(image) = tx
                .query_row(
                    "SELECT * FROM vm_images WHERE id = ? LIMIT 1;",
                    params![req.image_id.trim()],
                    image_from_row,
                )
                .optional()?
            else {
                return Ok(VmCreateOutcome::ImageNotFound);
            };
            if !vm_capability_ready(&node) {
                return Ok(VmCreateOutcome::CapabilityNotReady {
                    message: "node has not reported VM capability as ready".to_string(),
                });
            }
            let duplicate: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM node_vms WHERE node_id = ? AND name = ? LIMIT 1;",
                    params![node.id, req.name],
                    |r| r.get(0),
                )
                .optional()?;
            if duplicate.is_some() {
                return Ok(VmCreateOutcome::DuplicateName);
            }

            let vm_id = Uuid::new_v4().to_string();
            let domain_name = derive_domain_name(&vm_id);
            let bridge = if req.bridge.trim().is_empty() {
                "br0".to_string()
            } else {
                req.bridge.trim().to_string()
            };
            let now = utc_now();
            tx.execute(
                "INSERT INTO node_vms
                     (id, node_id, name, domain_name, state, provider, image_id,
                      vcpu, memory_mb, disk_gb, bridge, created_at, updated_at)
                 VALUES (?, ?, ?, ?, 'creating', 'libvirt', ?, ?, ?, ?, ?, ?, ?);",
                params![
                    vm_id,
                    node.id,
                    req.name,
                    domain_name,
                    image.id,
                    req.vcpu as i64,
                    req.memory_mb as i64,
                    req.disk_gb as i64,
                    bridge,
                    now,
                    now
                ],
            )?;

            let operation_id = Uuid::new_v4().to_string();
            let mut redacted = serde_json::to_value(req)?;
            redacted["guest"]["password"] = json!("***");
            tx.execute(
                "INSERT INTO vm_operations
                     (id, node_id, vm_id, operation_type, status, request_json, created_at)
                 VALUES (?, ?, ?, 'create', 'queued', ?, ?);",
                params![
                    operation_id,
                    node.id,
                    vm_id,
                    serde_json::to_string(&redacted)?,
                    now
                ],
            )?;
            insert_node_log(
                &tx,
                &node.id,
                "info",
                &format!("VM create requested for '{}'", req.name),
                Some(&json!({
                    "operation_id": operation_id,
                    "vm_id": vm_id,
                    "image_id": image.id,
                })),
                Some(&now),
            )?;

            let vm = tx.query_row(
                "SELECT * FROM node_vms WHERE id = ?;",
                params![vm_id],
                vm_from_row,
            )?;
            tx.commit()?;

            let command = CommandEnvelope::VmCreate {
                command_id: operation_id.clone(),
                operation_id,
                vm_id: vm.id.clone(),
                spec: VmCreateSpec {
                    vm_id: vm.id.clone(),
                    domain_name: vm.domain_name.clone(),
                    vcpu: vm.vcpu,
                    memory_mb: vm.memory_mb,
                    disk_gb: vm.disk_gb,
                    bridge: vm.bridge.clone(),
                    image: image_to_spec(&image),
                    guest: GuestCredentials {
                        username: req.guest.username.clone(),
                        password: req.guest.password.clone(),
                    },
                },
            };
            Ok(VmCreateOutcome::Created {
                vm: Box::new(vm),
                command: Box::new(command),
            })
        })
    }

    /// Queue a lifecycle action, enforcing the state machine and setting the
    /// speculative next state inside the same transaction.
    pub fn queue_vm_action(
        &self,
        node_id: &str,
        vm_id: &str,
        action: VmAction,
    ) -> StoreResult<VmActionOutcome> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if fetch_node(&tx, node_id)?.is_none() {
                return Ok(VmActionOutcome::NodeNotFound);
            }
            let Some(vm) = fetch_vm(&tx, node_id, vm_id)? else {
                return Ok(VmActionOutcome::VmNotFound);
            };

            if matches!(vm.state, VmState::Creating | VmState::Deleting) {
                return Ok(VmActionOutcome::InvalidState {
                    message: format!("vm is busy ({})", vm.state),
                });
            }
            let invalid = match action {
                VmAction::Start if vm.state == VmState::Running => {
                    Some("vm is already running")
                }
                VmAction::Stop if vm.state == VmState::Stopped => {
                    Some("vm is already stopped")
                }
                VmAction::Reboot if vm.state != VmState::Running => Some("vm is not running"),
                _ => None,
            };
            if let Some(message) = invalid {
                return Ok(VmActionOutcome::InvalidState {
                    message: message.to_string(),
                });
            }

            let next_state = match action {
                VmAction::Start | VmAction::Stop => VmState::Unknown,
                VmAction::Reboot => VmState::Rebooting,
                VmAction::Delete => VmState::Deleting,
            };
            update_vm_state(&tx, &vm.id, next_state, vm.last_error.as_deref())?;

            let operation_id = Uuid::new_v4().to_string();
            let op_type = match action {
                VmAction::Start => "start",
                VmAction::Stop => "stop",
                VmAction::Reboot => "reboot",
                VmAction::Delete => "delete",
            };
            let now = utc_now();
            tx.execute(
                "INSERT INTO vm_operations
                     (id, node_id, vm_id, operation_type, status, request_json, created_at)
                 VALUES (?, ?, ?, ?, 'queued', ?, ?);",
                params![
                    operation_id,
                    vm.node_id,
                    vm.id,
                    op_type,
                    serde_json::to_string(&json!({ "action": op_type }))?,
                    now
                ],
            )?;
            insert_node_log(
                &tx,
                &vm.node_id,
                "info",
                &format!("VM {op_type} requested for '{}'", vm.name),
                Some(&json!({ "operation_id": operation_id, "vm_id": vm.id })),
                Some(&now),
            )?;

            let updated = tx.query_row(
                "SELECT * FROM node_vms WHERE id = ?;",
                params![vm.id],
                vm_from_row,
            )?;
            tx.commit()?;

            let spec = vm_spec_info(&updated);
            let command = match action {
                VmAction::Start => CommandEnvelope::VmStart {
                    command_id: operation_id.clone(),
                    operation_id: operation_id.clone(),
                    vm_id: updated.id.clone(),
                    domain_name: updated.domain_name.clone(),
                    vm_spec: Some(spec),
                },
                VmAction::Stop => CommandEnvelope::VmStop {
                    command_id: operation_id.clone(),
                    operation_id: operation_id.clone(),
                    vm_id: updated.id.clone(),
                    domain_name: updated.domain_name.clone(),
                    vm_spec: Some(spec),
                },
                VmAction::Reboot => CommandEnvelope::VmReboot {
                    command_id: operation_id.clone(),
                    operation_id: operation_id.clone(),
                    vm_id: updated.id.clone(),
                    domain_name: updated.domain_name.clone(),
                    vm_spec: Some(spec),
                },
                VmAction::Delete => CommandEnvelope::VmDelete {
                    command_id: operation_id.clone(),
                    operation_id: operation_id.clone(),
                    vm_id: updated.id.clone(),
                    domain_name: updated.domain_name.clone(),
                    vm_spec: Some(spec),
                },
            };
            Ok(VmActionOutcome::Queued {
                vm: Box::new(updated),
                operation_id,
                command: Box::new(command),
            })
        })
    }

    /// Apply an agent-reported result to an operation and reconcile the VM
    /// row. Status progression is monotonic and terminal states are
    /// immutable; redelivering a terminal result is a no-op.
    pub fn apply_vm_command_result(
        &self,
        node_id: &str,
        operation_id: &str,
        status: CommandStatus,
        message: &str,
        details: Option<&Value>,
    ) -> StoreResult<ApplyResultOutcome> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(op) = tx
                .query_row(
                    "SELECT * FROM vm_operations WHERE id = ? AND node_id = ? LIMIT 1;",
                    params![operation_id.trim(), node_id.trim()],
                    operation_from_row,
                )
                .optional()?
            else {
                return Ok(ApplyResultOutcome::OperationNotFound);
            };

            if matches!(status, CommandStatus::Busy | CommandStatus::Unknown) {
                return Ok(ApplyResultOutcome::Ignored);
            }
            if op.status.is_terminal() {
                return Ok(ApplyResultOutcome::AlreadyFinal);
            }

            let now = utc_now();
            match status {
                CommandStatus::Running => {
                    tx.execute(
                        "UPDATE vm_operations
                         SET status = 'running', started_at = COALESCE(started_at, ?)
                         WHERE id = ?;",
                        params![now, op.id],
                    )?;
                }
                CommandStatus::Succeeded => {
                    tx.execute(
                        "UPDATE vm_operations
                         SET status = 'succeeded',
                             started_at = COALESCE(started_at, ?),
                             ended_at = ?,
                             result_json = ?
                         WHERE id = ?;",
                        params![
                            now,
                            now,
                            details.map(serde_json::to_string).transpose()?,
                            op.id
                        ],
                    )?;
                    if let Some(vm_id) = op.vm_id.as_deref() {
                        reconcile_vm_success(&tx, vm_id, op.operation_type, details)?;
                    }
                }
                _ => {
                    tx.execute(
                        "UPDATE vm_operations
                         SET status = 'failed',
                             started_at = COALESCE(started_at, ?),
                             ended_at = ?,
                             error = ?
                         WHERE id = ?;",
                        params![now, now, message, op.id],
                    )?;
                    if let Some(vm_id) = op.vm_id.as_deref() {
                        if fetch_vm(&tx, node_id, vm_id)?.is_some() {
                            update_vm_state(&tx, vm_id, VmState::Error, Some(message))?;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(ApplyResultOutcome::Applied)
        })
    }

    /// Mark every non-terminal operation failed. Run once at master startup:
    /// in-memory queues did not survive, so nothing will ever dispatch them.
    pub fn fail_unfinished_vm_operations(&self, reason: &str) -> StoreResult<u64> {
        self.fail_operations_where("status IN ('queued', 'running')", reason)
    }

    /// Fail operations still queued after the staleness cutoff; called from
    /// list paths so abandoned requests surface as errors instead of spinning.
    pub fn fail_stale_vm_operations(&self, stale_after_secs: i64) -> StoreResult<u64> {
        let cutoff = (chrono::Utc::now()
            - chrono::Duration::seconds(stale_after_secs.max(0)))
        .to_rfc3339();
        self.fail_operations_where_with_cutoff(
            "status = 'queued' AND created_at < ?",
            &cutoff,
            "Timed out waiting for agent connection",
        )
    }

    fn fail_operations_where(&self, predicate: &str, reason: &str) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let sql = format!(
                "SELECT * FROM vm_operations WHERE {predicate};"
            );
            let ops: Vec<Operation> = {
                let mut stmt = tx.prepare(&sql)?;
                stmt.query_map([], operation_from_row)?
                    .collect::<Result<Vec<_>, _>>()?
            };
            let count = fail_operation_rows(&tx, &ops, reason)?;
            tx.commit()?;
            Ok(count)
        })
    }

    fn fail_operations_where_with_cutoff(
        &self,
        predicate: &str,
        cutoff: &str,
        reason: &str,
    ) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let sql = format!("SELECT * FROM vm_operations WHERE {predicate};");
            let ops: Vec<Operation> = {
                let mut stmt = tx.prepare(&sql)?;
                stmt.query_map(params![cutoff], operation_from_row)?
                    .collect::<Result<Vec<_>, _>>()?
            };
            let count = fail_operation_rows(&tx, &ops, reason)?;
            tx.commit()?;
            Ok(count)
        })
    }
}

fn fail_operation_rows(
    conn: &Connection,
    ops: &[Operation],
    reason: &str,
) -> StoreResult<u64> {
    let now = utc_now();
    for op in ops {
        conn.execute(
            "UPDATE vm_operations
             SET status = 'failed',
                 started_at = COALESCE(started_at, ?),
                 ended_at = ?,
                 error = ?
             WHERE id = ?;",
            params![now, now, reason, op.id],
        )?;
        if let Some(vm_id) = op.vm_id.as_deref() {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM node_vms WHERE id = ? LIMIT 1;",
                    params![vm_id],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_some() {
                update_vm_state(conn, vm_id, VmState::Error, Some(reason))?;
            }
        }
    }
    Ok(ops.len() as u64)
}

/// Reconcile a VM row after a succeeded operation. Delete removes the row (a
/// second delete-success on a gone VM is a no-op); other ops derive the state
/// from the reported power state and clear `last_error`.
fn reconcile_vm_success(
    conn: &Connection,
    vm_id: &str,
    op_type: OperationType,
    details: Option<&Value>,
) -> StoreResult<()> {
    if op_type == OperationType::Delete {
        conn.execute("DELETE FROM node_vms WHERE id = ?;", params![vm_id])?;
        return Ok(());
    }

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM node_vms WHERE id = ? LIMIT 1;",
            params![vm_id],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Ok(());
    }

    if op_type == OperationType::Sync {
        return Ok(());
    }

    let power_state = details
        .and_then(|d| d.get("power_state"))
        .and_then(Value::as_str)
        .map(str::to_lowercase);
    let new_state = match power_state.as_deref() {
        Some(p) if p.contains("running") => VmState::Running,
        Some(p) if p.contains("shut") || p.contains("off") || p.contains("stopped") => {
            VmState::Stopped
        }
        _ => match op_type {
            OperationType::Stop => VmState::Stopped,
            _ => VmState::Unknown,
        },
    };
    update_vm_state(conn, vm_id, new_state, None)?;

    let ip_address = details
        .and_then(|d| d.get("ip_address"))
        .and_then(Value::as_str);
    let domain_uuid = details
        .and_then(|d| d.get("domain_uuid"))
        .and_then(Value::as_str);
    if ip_address.is_some() {
        conn.execute(
            "UPDATE node_vms SET ip_address = ? WHERE id = ?;",
            params![ip_address, vm_id],
        )?;
    }
    if domain_uuid.is_some() {
        conn.execute(
            "UPDATE node_vms SET domain_uuid = ? WHERE id = ?;",
            params![domain_uuid, vm_id],
        )?;
    }
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeartbeatOutcome, PairOutcome, Store};

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    /// Create, pair, and mark a node VM-capable via a heartbeat.
    fn ready_node(store: &Store) -> (String, String) {
        let node = store.create_node(None).unwrap();
        let grant = match store
            .pair_node(&node.pair_code, Some(&json!({"hostname": "h1"})))
            .unwrap()
        {
            PairOutcome::Paired(grant) => grant,
            other => panic!("unexpected {other:?}"),
        };
        let payload = json!({
            "node_id": node.id,
            "status": "alive",
            "extra": {
                "vm": {"provider": "libvirt", "ready": true, "message": "libvirt ready"},
            }
        });
        match store
            .record_heartbeat(&grant.pair_token, &node.id, &payload)
            .unwrap()
        {
            HeartbeatOutcome::Ok(_) => {}
            other => panic!("unexpected {other:?}"),
        }
        (node.id, grant.pair_token)
    }

    fn create_request(name: &str) -> VmCreateRequest {
        VmCreateRequest {
            name: name.to_string(),
            image_id: "ubuntu-24-04".to_string(),
            vcpu: 2,
            memory_mb: 2048,
            disk_gb: 20,
            bridge: "br0".to_string(),
            guest: GuestCredentials {
                username: "u".to_string(),
                password: "p".to_string(),
            },
        }
    }

    fn created_vm(store: &Store, node_id: &str, name: &str) -> (Vm, String) {
        match store.create_vm_request(node_id, &create_request(name)).unwrap() {
            VmCreateOutcome::Created { vm, command } => {
                let operation_id = command.command_id().to_string();
                (*vm, operation_id)
            }
            other => panic!("expected created, got {other:?}"),
        }
    }

    fn succeed(store: &Store, node_id: &str, operation_id: &str, power_state: &str) {
        let outcome = store
            .apply_vm_command_result(
                node_id,
                operation_id,
                CommandStatus::Succeeded,
                "done",
                Some(&json!({"power_state": power_state})),
            )
            .unwrap();
        assert_eq!(outcome, ApplyResultOutcome::Applied);
    }

    // ── Images ────────────────────────────────────────────────────────────────

    #[test]
    fn default_images_are_seeded_once() {
        let store = store();
        let images = store.list_vm_images().unwrap();
        assert!(images.len() >= 3);
        let ubuntu = store.get_vm_image("ubuntu-24-04").unwrap().unwrap();
        assert_eq!(ubuntu.default_username, "ubuntu");
        assert_eq!(ubuntu.os_family, OsFamily::Linux);
        assert!(ubuntu.cloud_init_enabled);
    }

    // ── Create ────────────────────────────────────────────────────────────────

    #[test]
    fn create_vm_request_inserts_row_operation_and_command() {
        let store = store();
        let (node_id, _) = ready_node(&store);

        let outcome = store
            .create_vm_request(&node_id, &create_request("db-1"))
            .unwrap();
        let (vm, command) = match outcome {
            VmCreateOutcome::Created { vm, command } => (vm, command),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(vm.state, VmState::Creating);
        assert!(vm.domain_name.starts_with("lattice-"));

        // The transient command carries the plaintext password...
        match *command {
            CommandEnvelope::VmCreate { ref spec, ref command_id, ref operation_id, .. } => {
                assert_eq!(spec.guest.password, "p");
                assert_eq!(command_id, operation_id);
            }
            ref other => panic!("unexpected command {other:?}"),
        }

        // ...while the persisted operation request is redacted.
        let ops = store.list_vm_operations(&node_id, &vm.id).unwrap().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].status, OperationStatus::Queued);
        assert_eq!(ops[0].request.as_ref().unwrap()["guest"]["password"], json!("***"));
    }

    #[test]
    fn create_vm_request_rejects_invalid_payloads() {
        let store = store();
        let (node_id, _) = ready_node(&store);

        let mut bad = create_request("ab");
        assert!(matches!(
            store.create_vm_request(&node_id, &bad).unwrap(),
            VmCreateOutcome::InvalidRequest { .. }
        ));

        bad = create_request("ok-name");
        bad.vcpu = 64;
        assert!(matches!(
            store.create_vm_request(&node_id, &bad).unwrap(),
            VmCreateOutcome::InvalidRequest { .. }
        ));

        bad = create_request("ok-name");
        bad.guest.password = String::new();
        assert!(matches!(
            store.create_vm_request(&node_id, &bad).unwrap(),
            VmCreateOutcome::InvalidRequest { .. }
        ));

        bad = create_request("ok-name");
        bad.image_id = "missing-image".to_string();
        assert!(matches!(
            store.create_vm_request(&node_id, &bad).unwrap(),
            VmCreateOutcome::ImageNotFound
        ));
    }

    #[test]
    fn create_vm_request_requires_paired_capable_node() {
        let store = store();

        assert!(matches!(
            store.create_vm_request("missing", &create_request("db-1")).unwrap(),
            VmCreateOutcome::NodeNotFound
        ));

        let pending = store.create_node(None).unwrap();
        assert!(matches!(
            store.create_vm_request(&pending.id, &create_request("db-1")).unwrap(),
            VmCreateOutcome::NodeNotPaired
        ));

        // Paired but no vm capability reported yet.
        let node = store.create_node(None).unwrap();
        store.pair_node(&node.pair_code, None).unwrap();
        assert!(matches!(
            store.create_vm_request(&node.id, &create_request("db-1")).unwrap(),
            VmCreateOutcome::CapabilityNotReady { .. }
        ));
    }

    #[test]
    fn duplicate_vm_name_on_same_node_is_rejected() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        created_vm(&store, &node_id, "db-1");
        assert!(matches!(
            store.create_vm_request(&node_id, &create_request("db-1")).unwrap(),
            VmCreateOutcome::DuplicateName
        ));
    }

    // ── Actions ───────────────────────────────────────────────────────────────

    #[test]
    fn vm_create_success_transitions_to_running_with_details() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (vm, operation_id) = created_vm(&store, &node_id, "db-1");

        let outcome = store
            .apply_vm_command_result(
                &node_id,
                &operation_id,
                CommandStatus::Succeeded,
                "VM created",
                Some(&json!({
                    "power_state": "running",
                    "domain_uuid": "8d4c2a9e",
                    "ip_address": "10.0.0.12",
                })),
            )
            .unwrap();
        assert_eq!(outcome, ApplyResultOutcome::Applied);

        let fetched = store.get_vm(&node_id, &vm.id).unwrap().unwrap();
        assert_eq!(fetched.state, VmState::Running);
        assert_eq!(fetched.ip_address.as_deref(), Some("10.0.0.12"));
        assert_eq!(fetched.domain_uuid.as_deref(), Some("8d4c2a9e"));

        let op = store.get_operation(&operation_id).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Succeeded);
        assert!(op.started_at.is_some());
        assert!(op.ended_at.is_some());

        // Redelivery of a terminal result is a no-op.
        let again = store
            .apply_vm_command_result(
                &node_id,
                &operation_id,
                CommandStatus::Succeeded,
                "VM created",
                Some(&json!({"power_state": "running"})),
            )
            .unwrap();
        assert_eq!(again, ApplyResultOutcome::AlreadyFinal);
    }

    #[test]
    fn start_on_running_vm_is_a_state_machine_violation() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (vm, op_id) = created_vm(&store, &node_id, "db-1");
        succeed(&store, &node_id, &op_id, "running");

        match store.queue_vm_action(&node_id, &vm.id, VmAction::Start).unwrap() {
            VmActionOutcome::InvalidState { message } => {
                assert_eq!(message, "vm is already running");
            }
            other => panic!("unexpected {other:?}"),
        }
        // No extra operation row was created.
        let ops = store.list_vm_operations(&node_id, &vm.id).unwrap().unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn actions_on_busy_vms_are_rejected() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (vm, _) = created_vm(&store, &node_id, "db-1");

        // Still creating.
        assert!(matches!(
            store.queue_vm_action(&node_id, &vm.id, VmAction::Start).unwrap(),
            VmActionOutcome::InvalidState { .. }
        ));
    }

    #[test]
    fn stop_sets_speculative_state_and_succeeds_to_stopped() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (vm, op_id) = created_vm(&store, &node_id, "db-1");
        succeed(&store, &node_id, &op_id, "running");

        let (vm_after, stop_op) =
            match store.queue_vm_action(&node_id, &vm.id, VmAction::Stop).unwrap() {
                VmActionOutcome::Queued { vm, operation_id, .. } => (vm, operation_id),
                other => panic!("unexpected {other:?}"),
            };
        assert_eq!(vm_after.state, VmState::Unknown);

        succeed(&store, &node_id, &stop_op, "shut off");
        let fetched = store.get_vm(&node_id, &vm.id).unwrap().unwrap();
        assert_eq!(fetched.state, VmState::Stopped);
    }

    #[test]
    fn reboot_requires_running_state() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (vm, op_id) = created_vm(&store, &node_id, "db-1");
        succeed(&store, &node_id, &op_id, "shut off");

        assert!(matches!(
            store.queue_vm_action(&node_id, &vm.id, VmAction::Reboot).unwrap(),
            VmActionOutcome::InvalidState { .. }
        ));
    }

    #[test]
    fn failed_result_marks_vm_error_with_last_error() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (vm, op_id) = created_vm(&store, &node_id, "db-1");

        store
            .apply_vm_command_result(
                &node_id,
                &op_id,
                CommandStatus::Failed,
                "virt-install failed: no KVM",
                None,
            )
            .unwrap();
        let fetched = store.get_vm(&node_id, &vm.id).unwrap().unwrap();
        assert_eq!(fetched.state, VmState::Error);
        assert_eq!(fetched.last_error.as_deref(), Some("virt-install failed: no KVM"));

        let op = store.get_operation(&op_id).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error.as_deref(), Some("virt-install failed: no KVM"));
    }

    #[test]
    fn succeeding_operation_clears_previous_error() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (vm, op_id) = created_vm(&store, &node_id, "db-1");
        store
            .apply_vm_command_result(&node_id, &op_id, CommandStatus::Failed, "boom", None)
            .unwrap();

        let (_, start_op) =
            match store.queue_vm_action(&node_id, &vm.id, VmAction::Start).unwrap() {
                VmActionOutcome::Queued { vm, operation_id, .. } => (vm, operation_id),
                other => panic!("unexpected {other:?}"),
            };
        succeed(&store, &node_id, &start_op, "running");

        let fetched = store.get_vm(&node_id, &vm.id).unwrap().unwrap();
        assert_eq!(fetched.state, VmState::Running);
        assert!(fetched.last_error.is_none());
    }

    #[test]
    fn delete_success_removes_row_and_second_delete_sees_vm_not_found() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (vm, op_id) = created_vm(&store, &node_id, "db-1");
        succeed(&store, &node_id, &op_id, "running");

        let delete_op = match store
            .queue_vm_action(&node_id, &vm.id, VmAction::Delete)
            .unwrap()
        {
            VmActionOutcome::Queued { operation_id, .. } => operation_id,
            other => panic!("unexpected {other:?}"),
        };
        succeed(&store, &node_id, &delete_op, "deleted");
        assert!(store.get_vm(&node_id, &vm.id).unwrap().is_none());

        // Redelivered delete success: operation is terminal, row is gone, no-op.
        let again = store
            .apply_vm_command_result(
                &node_id,
                &delete_op,
                CommandStatus::Succeeded,
                "VM deleted",
                None,
            )
            .unwrap();
        assert_eq!(again, ApplyResultOutcome::AlreadyFinal);

        assert!(matches!(
            store.queue_vm_action(&node_id, &vm.id, VmAction::Delete).unwrap(),
            VmActionOutcome::VmNotFound
        ));
    }

    #[test]
    fn running_result_sets_started_at_only_once() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (_, op_id) = created_vm(&store, &node_id, "db-1");

        store
            .apply_vm_command_result(&node_id, &op_id, CommandStatus::Running, "working", None)
            .unwrap();
        let first = store.get_operation(&op_id).unwrap().unwrap();
        assert_eq!(first.status, OperationStatus::Running);
        let started = first.started_at.clone().unwrap();

        store
            .apply_vm_command_result(&node_id, &op_id, CommandStatus::Running, "working", None)
            .unwrap();
        let second = store.get_operation(&op_id).unwrap().unwrap();
        assert_eq!(second.started_at.as_deref(), Some(started.as_str()));
    }

    #[test]
    fn busy_results_do_not_advance_operations() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (_, op_id) = created_vm(&store, &node_id, "db-1");

        let outcome = store
            .apply_vm_command_result(&node_id, &op_id, CommandStatus::Busy, "agent busy", None)
            .unwrap();
        assert_eq!(outcome, ApplyResultOutcome::Ignored);
        let op = store.get_operation(&op_id).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Queued);
    }

    #[test]
    fn unknown_operation_id_is_reported() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let outcome = store
            .apply_vm_command_result(&node_id, "nope", CommandStatus::Succeeded, "m", None)
            .unwrap();
        assert_eq!(outcome, ApplyResultOutcome::OperationNotFound);
    }

    // ── Sweeps ────────────────────────────────────────────────────────────────

    #[test]
    fn startup_sweep_fails_unfinished_operations_and_errors_vms() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (vm, op_id) = created_vm(&store, &node_id, "db-1");

        let swept = store
            .fail_unfinished_vm_operations("Master restarted before operation dispatch")
            .unwrap();
        assert_eq!(swept, 1);

        let op = store.get_operation(&op_id).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(
            op.error.as_deref(),
            Some("Master restarted before operation dispatch")
        );
        assert!(op.ended_at.is_some());

        let fetched = store.get_vm(&node_id, &vm.id).unwrap().unwrap();
        assert_eq!(fetched.state, VmState::Error);
    }

    #[test]
    fn stale_sweep_only_touches_old_queued_operations() {
        let store = store();
        let (node_id, _) = ready_node(&store);
        let (_, op_id) = created_vm(&store, &node_id, "db-1");

        // Fresh operation survives the sweep.
        assert_eq!(store.fail_stale_vm_operations(STALE_OPERATION_SECS).unwrap(), 0);

        // With a zero cutoff everything queued is stale.
        assert_eq!(store.fail_stale_vm_operations(0).unwrap(), 1);
        let op = store.get_operation(&op_id).unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.error.as_deref(), Some("Timed out waiting for agent connection"));
    }

    #[test]
    fn domain_names_are_deterministic_and_prefixed() {
        assert_eq!(
            derive_domain_name("8d4c2a9e-0000-4000-8000-000000000000"),
            "lattice-8d4c2a9e"
        );
    }
}
