//! Shared handler state and command-result routing.

use lattice_proto::{CommandEnvelope, CommandResult, CommandStatus, MasterFrame};
use lattice_router::{CommandRouter, TerminalRegistry};
use lattice_store::{
    ApplyResultOutcome, Store, StoreResult, TerminalResultOutcome,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub router: Arc<CommandRouter>,
    pub terminals: Arc<TerminalRegistry>,
}

/// Where a posted command result ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultDisposition {
    /// Routed to its operation (or was an idempotent redelivery).
    Applied,
    /// vm_*/terminal_exec result referencing an unknown operation.
    NotFound,
    /// Result types without a durable operation are logged only.
    LoggedOnly,
    Invalid,
}

impl AppState {
    /// Queue a command for a node. The live websocket is the preferred path;
    /// the pending queue covers agents that are between connections and drain
    /// over HTTP long-poll.
    pub fn dispatch_command(&self, node_id: &str, command: CommandEnvelope) -> bool {
        if self.router.has_active_connection(node_id) {
            self.router
                .enqueue_ws(node_id, MasterFrame::Command(command));
            true
        } else {
            self.router.enqueue_pending(node_id, command);
            false
        }
    }

    /// Best-effort node log append; storage failures are traced, not fatal.
    pub fn append_log(
        &self,
        node_id: &str,
        level: &str,
        message: &str,
        meta: Option<&serde_json::Value>,
    ) {
        if let Err(e) = self.store.append_node_log(node_id, level, message, meta, None) {
            warn!(node_id, error = %e, "failed to append node log");
        }
    }

    /// Apply an agent command result: `vm_*` and `terminal_exec` results move
    /// their durable records forward, everything else is logged only. Always
    /// appends a node log entry describing the result.
    pub fn apply_command_result(
        &self,
        node_id: &str,
        result: &CommandResult,
    ) -> StoreResult<ResultDisposition> {
        if result.command_id.trim().is_empty() {
            return Ok(ResultDisposition::Invalid);
        }

        let level = match result.status {
            CommandStatus::Failed => "error",
            CommandStatus::Busy => "warning",
            _ => "info",
        };
        self.store.append_node_log(
            node_id,
            level,
            &format!(
                "Agent command {} -> {}: {}",
                result.command_type, result.status, result.message
            ),
            Some(&json!({
                "command_id": result.command_id,
                "command_type": result.command_type,
                "status": result.status.to_string(),
                "details": result.details,
            })),
            None,
        )?;

        if result.command_type.starts_with("vm_") {
            let operation_id = result
                .operation_id
                .as_deref()
                .unwrap_or(&result.command_id);
            let outcome = self.store.apply_vm_command_result(
                node_id,
                operation_id,
                result.status,
                &result.message,
                result.details.as_ref(),
            )?;
            info!(
                node_id,
                operation_id,
                command_type = %result.command_type,
                status = %result.status,
                "agent command result"
            );
            return Ok(match outcome {
                ApplyResultOutcome::OperationNotFound => ResultDisposition::NotFound,
                _ => ResultDisposition::Applied,
            });
        }

        if result.command_type == "terminal_exec" {
            let command_id = result
                .operation_id
                .as_deref()
                .unwrap_or(&result.command_id);
            let outcome = self.store.apply_terminal_command_result(
                node_id,
                command_id,
                result.status,
                &result.message,
                result.details.as_ref(),
            )?;
            return Ok(match outcome {
                TerminalResultOutcome::CommandNotFound => ResultDisposition::NotFound,
                _ => ResultDisposition::Applied,
            });
        }

        Ok(ResultDisposition::LoggedOnly)
    }
}
