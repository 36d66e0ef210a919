//! Translates queued commands into executor calls and shapes their results.
//!
//! At most one VM command, one container command and one shell execution run
//! at a time; overlapping requests get an immediate `busy` result and their
//! operation is left untouched on the master.

use crate::container_docker::ContainerSubsystem;
use crate::runner;
use crate::update_git;
use crate::vm_virsh::VmSubsystem;
use lattice_proto::{CommandEnvelope, CommandResult, CommandStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::info;

const EXEC_TIMEOUT: Duration = Duration::from_secs(120);
const EXEC_CAPTURE_LIMIT: usize = 20_000;

pub struct Dispatcher {
    pub vms: Arc<VmSubsystem>,
    pub containers: Arc<ContainerSubsystem>,
    vm_guard: Arc<Semaphore>,
    container_guard: Arc<Semaphore>,
    exec_guard: Arc<Semaphore>,
}

fn truncate_capture(text: &str) -> String {
    if text.len() <= EXEC_CAPTURE_LIMIT {
        return text.to_string();
    }
    let mut end = EXEC_CAPTURE_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            vms: Arc::new(VmSubsystem::new()),
            containers: Arc::new(ContainerSubsystem::new()),
            vm_guard: Arc::new(Semaphore::new(1)),
            container_guard: Arc::new(Semaphore::new(1)),
            exec_guard: Arc::new(Semaphore::new(1)),
        }
    }

    fn busy(command: &CommandEnvelope, what: &str) -> CommandResult {
        CommandResult {
            command_id: command.command_id().to_string(),
            command_type: command.command_type().to_string(),
            operation_id: operation_id_of(command),
            vm_id: vm_id_of(command),
            status: CommandStatus::Busy,
            message: format!("Another {what} command is already running"),
            details: None,
        }
    }

    /// Execute one command to completion and shape the result for the master.
    pub async fn execute(&self, command: CommandEnvelope) -> CommandResult {
        info!(
            command_type = command.command_type(),
            command_id = command.command_id(),
            "executing command"
        );
        let command_id = command.command_id().to_string();
        let command_type = command.command_type().to_string();
        let operation_id = operation_id_of(&command);
        let vm_id = vm_id_of(&command);

        let (status, message, details) = match &command {
            CommandEnvelope::VmCreate { spec, vm_id, .. } => {
                let Ok(_permit) = self.vm_guard.try_acquire() else {
                    return Self::busy(&command, "VM");
                };
                self.vms
                    .execute("vm_create", vm_id, &spec.domain_name, Some(spec))
                    .await
            }
            CommandEnvelope::VmStart { vm_id, domain_name, vm_spec, .. }
            | CommandEnvelope::VmStop { vm_id, domain_name, vm_spec, .. }
            | CommandEnvelope::VmReboot { vm_id, domain_name, vm_spec, .. }
            | CommandEnvelope::VmDelete { vm_id, domain_name, vm_spec, .. } => {
                let Ok(_permit) = self.vm_guard.try_acquire() else {
                    return Self::busy(&command, "VM");
                };
                let domain = if domain_name.trim().is_empty() {
                    vm_spec
                        .as_ref()
                        .map(|spec| spec.domain_name.clone())
                        .unwrap_or_default()
                } else {
                    domain_name.clone()
                };
                self.vms
                    .execute(command.command_type(), vm_id, &domain, None)
                    .await
            }
            CommandEnvelope::VmSync { .. } => {
                let Ok(_permit) = self.vm_guard.try_acquire() else {
                    return Self::busy(&command, "VM");
                };
                self.vms.execute("vm_sync", "", "", None).await
            }

            CommandEnvelope::ContainerCreate { spec, .. } => {
                let Ok(_permit) = self.container_guard.try_acquire() else {
                    return Self::busy(&command, "container");
                };
                self.containers
                    .execute("container_create", &spec.container_id, &spec.runtime_name, Some(spec))
                    .await
            }
            CommandEnvelope::ContainerStart { runtime_name, container_id, .. }
            | CommandEnvelope::ContainerStop { runtime_name, container_id, .. }
            | CommandEnvelope::ContainerRestart { runtime_name, container_id, .. }
            | CommandEnvelope::ContainerDelete { runtime_name, container_id, .. } => {
                let Ok(_permit) = self.container_guard.try_acquire() else {
                    return Self::busy(&command, "container");
                };
                self.containers
                    .execute(
                        command.command_type(),
                        container_id.as_deref().unwrap_or_default(),
                        runtime_name,
                        None,
                    )
                    .await
            }
            CommandEnvelope::ContainerSync { .. } => {
                let Ok(_permit) = self.container_guard.try_acquire() else {
                    return Self::busy(&command, "container");
                };
                self.containers.execute("container_sync", "", "", None).await
            }

            CommandEnvelope::TerminalExec { command_text, .. } => {
                let Ok(_permit) = self.exec_guard.try_acquire() else {
                    return Self::busy(&command, "shell");
                };
                run_shell(command_text).await
            }

            CommandEnvelope::UpdateAgent { force, branch, .. } => {
                update_git::execute(*force, branch.as_deref()).await
            }
        };

        info!(
            command_type = %command_type,
            command_id = %command_id,
            status = %status,
            "command finished"
        );
        CommandResult {
            command_id,
            command_type,
            operation_id,
            vm_id,
            status,
            message,
            details: Some(details),
        }
    }
}

/// One-shot shell execution with bounded output capture.
async fn run_shell(command_text: &str) -> (CommandStatus, String, serde_json::Value) {
    let out = runner::run(&["/bin/sh", "-lc", command_text], EXEC_TIMEOUT).await;
    let status = if out.ok() {
        CommandStatus::Succeeded
    } else {
        CommandStatus::Failed
    };
    (
        status,
        format!("Command exited with code {}", out.exit_code),
        json!({
            "exit_code": out.exit_code,
            "stdout": truncate_capture(&out.stdout),
            "stderr": truncate_capture(&out.stderr),
        }),
    )
}

fn operation_id_of(command: &CommandEnvelope) -> Option<String> {
    match command {
        CommandEnvelope::VmCreate { operation_id, .. }
        | CommandEnvelope::VmStart { operation_id, .. }
        | CommandEnvelope::VmStop { operation_id, .. }
        | CommandEnvelope::VmReboot { operation_id, .. }
        | CommandEnvelope::VmDelete { operation_id, .. } => Some(operation_id.clone()),
        CommandEnvelope::VmSync { operation_id, .. } => operation_id.clone(),
        _ => None,
    }
}

fn vm_id_of(command: &CommandEnvelope) -> Option<String> {
    match command {
        CommandEnvelope::VmCreate { vm_id, .. }
        | CommandEnvelope::VmStart { vm_id, .. }
        | CommandEnvelope::VmStop { vm_id, .. }
        | CommandEnvelope::VmReboot { vm_id, .. }
        | CommandEnvelope::VmDelete { vm_id, .. } => Some(vm_id.clone()),
        _ => None,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_command(id: &str, text: &str) -> CommandEnvelope {
        CommandEnvelope::TerminalExec {
            command_id: id.to_string(),
            command_text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn shell_execution_captures_exit_code_and_output() {
        let dispatcher = Dispatcher::new();
        let result = dispatcher
            .execute(exec_command("c1", "echo out; echo err >&2; exit 7"))
            .await;
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(result.message, "Command exited with code 7");
        let details = result.details.unwrap();
        assert_eq!(details["exit_code"], 7);
        assert_eq!(details["stdout"], "out");
        assert_eq!(details["stderr"], "err");
    }

    #[tokio::test]
    async fn successful_shell_execution_reports_succeeded() {
        let dispatcher = Dispatcher::new();
        let result = dispatcher.execute(exec_command("c2", "true")).await;
        assert_eq!(result.status, CommandStatus::Succeeded);
        assert_eq!(result.command_type, "terminal_exec");
        assert_eq!(result.command_id, "c2");
        assert!(result.operation_id.is_none());
    }

    #[tokio::test]
    async fn overlapping_shell_commands_get_busy() {
        let dispatcher = Arc::new(Dispatcher::new());
        let slow = Arc::clone(&dispatcher);
        let slow_task =
            tokio::spawn(async move { slow.execute(exec_command("slow", "sleep 2")).await });
        tokio::time::sleep(Duration::from_millis(200)).await;

        let result = dispatcher.execute(exec_command("fast", "true")).await;
        assert_eq!(result.status, CommandStatus::Busy);
        assert!(result.message.contains("shell"));

        slow_task.abort();
    }

    #[test]
    fn capture_truncation_respects_char_boundaries() {
        let long = "x".repeat(EXEC_CAPTURE_LIMIT + 100);
        assert_eq!(truncate_capture(&long).len(), EXEC_CAPTURE_LIMIT);

        let multibyte = "é".repeat(EXEC_CAPTURE_LIMIT);
        let truncated = truncate_capture(&multibyte);
        assert!(truncated.len() <= EXEC_CAPTURE_LIMIT);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn vm_commands_carry_operation_and_vm_ids() {
        let command = CommandEnvelope::VmStart {
            command_id: "op-1".to_string(),
            operation_id: "op-1".to_string(),
            vm_id: "vm-1".to_string(),
            domain_name: "lattice-abcd1234".to_string(),
            vm_spec: None,
        };
        assert_eq!(operation_id_of(&command).as_deref(), Some("op-1"));
        assert_eq!(vm_id_of(&command).as_deref(), Some("vm-1"));
        assert!(operation_id_of(&exec_command("c", "true")).is_none());
    }
}
