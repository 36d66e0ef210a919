//! Fire-and-forget shell execution records, mirroring the VM operation
//! pattern: queue → running → terminal, with idempotent result application.

use crate::logs::insert_node_log;
use crate::nodes::fetch_node;
use crate::{StoreResult, utc_now};
use lattice_proto::{
    CommandEnvelope, CommandStatus, NodeState, OperationStatus, TerminalCommand,
};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::{Value, json};
use uuid::Uuid;

#[derive(Debug)]
pub enum TerminalExecOutcome {
    Queued {
        record: Box<TerminalCommand>,
        command: Box<CommandEnvelope>,
    },
    NodeNotFound,
    NodeNotPaired,
    InvalidRequest { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalResultOutcome {
    Applied,
    AlreadyFinal,
    CommandNotFound,
    Ignored,
}

fn command_from_row(row: &Row<'_>) -> rusqlite::Result<TerminalCommand> {
    let status: String = row.get("status")?;
    Ok(TerminalCommand {
        command_id: row.get("command_id")?,
        node_id: row.get("node_id")?,
        command_text: row.get("command_text")?,
        status: match status.as_str() {
            "queued" => OperationStatus::Queued,
            "running" => OperationStatus::Running,
            "succeeded" => OperationStatus::Succeeded,
            _ => OperationStatus::Failed,
        },
        exit_code: row.get("exit_code")?,
        output: row.get("output")?,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        ended_at: row.get("ended_at")?,
    })
}

impl crate::Store {
    /// Queue a shell command for a paired node and return the dispatchable
    /// envelope.
    pub fn queue_terminal_command(
        &self,
        node_id: &str,
        command_text: &str,
    ) -> StoreResult<TerminalExecOutcome> {
        let text = command_text.trim();
        if text.is_empty() {
            return Ok(TerminalExecOutcome::InvalidRequest {
                message: "command is required".to_string(),
            });
        }
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(node) = fetch_node(&tx, node_id)? else {
                return Ok(TerminalExecOutcome::NodeNotFound);
            };
            if node.state != NodeState::Paired {
                return Ok(TerminalExecOutcome::NodeNotPaired);
            }

            let command_id = Uuid::new_v4().to_string();
            let now = utc_now();
            tx.execute(
                "INSERT INTO terminal_commands
                     (command_id, node_id, command_text, status, created_at)
                 VALUES (?, ?, ?, 'queued', ?);",
                params![command_id, node.id, text, now],
            )?;
            insert_node_log(
                &tx,
                &node.id,
                "info",
                "Shell command queued from UI",
                Some(&json!({ "command_id": command_id })),
                Some(&now),
            )?;
            let record = tx.query_row(
                "SELECT * FROM terminal_commands WHERE command_id = ?;",
                params![command_id],
                command_from_row,
            )?;
            tx.commit()?;

            let command = CommandEnvelope::TerminalExec {
                command_id,
                command_text: text.to_string(),
            };
            Ok(TerminalExecOutcome::Queued {
                record: Box::new(record),
                command: Box::new(command),
            })
        })
    }

    /// Apply an agent-reported `terminal_exec` result. Same monotonicity rules
    /// as VM operations: terminal rows are immutable, busy never advances.
    pub fn apply_terminal_command_result(
        &self,
        node_id: &str,
        command_id: &str,
        status: CommandStatus,
        message: &str,
        details: Option<&Value>,
    ) -> StoreResult<TerminalResultOutcome> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let Some(record) = tx
                .query_row(
                    "SELECT * FROM terminal_commands
                     WHERE command_id = ? AND node_id = ? LIMIT 1;",
                    params![command_id.trim(), node_id.trim()],
                    command_from_row,
                )
                .optional()?
            else {
                return Ok(TerminalResultOutcome::CommandNotFound);
            };
            if matches!(status, CommandStatus::Busy | CommandStatus::Unknown) {
                return Ok(TerminalResultOutcome::Ignored);
            }
            if record.status.is_terminal() {
                return Ok(TerminalResultOutcome::AlreadyFinal);
            }

            let now = utc_now();
            match status {
                CommandStatus::Running => {
                    tx.execute(
                        "UPDATE terminal_commands
                         SET status = 'running', started_at = COALESCE(started_at, ?)
                         WHERE command_id = ?;",
                        params![now, record.command_id],
                    )?;
                }
                CommandStatus::Succeeded => {
                    let exit_code = details
                        .and_then(|d| d.get("exit_code"))
                        .and_then(Value::as_i64);
                    let output = details
                        .and_then(|d| d.get("stdout"))
                        .and_then(Value::as_str);
                    tx.execute(
                        "UPDATE terminal_commands
                         SET status = 'succeeded',
                             started_at = COALESCE(started_at, ?),
                             ended_at = ?,
                             exit_code = ?,
                             output = ?
                         WHERE command_id = ?;",
                        params![now, now, exit_code, output, record.command_id],
                    )?;
                }
                _ => {
                    let exit_code = details
                        .and_then(|d| d.get("exit_code"))
                        .and_then(Value::as_i64);
                    let stderr = details
                        .and_then(|d| d.get("stderr"))
                        .and_then(Value::as_str)
                        .filter(|s| !s.trim().is_empty());
                    tx.execute(
                        "UPDATE terminal_commands
                         SET status = 'failed',
                             started_at = COALESCE(started_at, ?),
                             ended_at = ?,
                             exit_code = ?,
                             error = ?
                         WHERE command_id = ?;",
                        params![now, now, exit_code, stderr.unwrap_or(message), record.command_id],
                    )?;
                }
            }
            tx.commit()?;
            Ok(TerminalResultOutcome::Applied)
        })
    }

    pub fn list_terminal_commands(
        &self,
        node_id: &str,
        limit: i64,
    ) -> StoreResult<Option<Vec<TerminalCommand>>> {
        self.with_conn(|conn| {
            if fetch_node(conn, node_id)?.is_none() {
                return Ok(None);
            }
            let mut stmt = conn.prepare(
                "SELECT * FROM terminal_commands
                 WHERE node_id = ?
                 ORDER BY created_at DESC
                 LIMIT ?;",
            )?;
            let commands = stmt
                .query_map(params![node_id.trim(), limit.clamp(1, 500)], command_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(commands))
        })
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PairOutcome, Store};

    fn paired_node(store: &Store) -> String {
        let node = store.create_node(None).unwrap();
        match store.pair_node(&node.pair_code, None).unwrap() {
            PairOutcome::Paired(grant) => grant.node_id,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn queue_requires_paired_node_and_nonempty_command() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.queue_terminal_command("missing", "ls").unwrap(),
            TerminalExecOutcome::NodeNotFound
        ));
        let pending = store.create_node(None).unwrap();
        assert!(matches!(
            store.queue_terminal_command(&pending.id, "ls").unwrap(),
            TerminalExecOutcome::NodeNotPaired
        ));
        let node_id = paired_node(&store);
        assert!(matches!(
            store.queue_terminal_command(&node_id, "   ").unwrap(),
            TerminalExecOutcome::InvalidRequest { .. }
        ));
    }

    #[test]
    fn queued_command_carries_the_shell_text() {
        let store = Store::open_in_memory().unwrap();
        let node_id = paired_node(&store);
        let (record, command) = match store
            .queue_terminal_command(&node_id, "uname -a")
            .unwrap()
        {
            TerminalExecOutcome::Queued { record, command } => (record, command),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(record.status, OperationStatus::Queued);
        match *command {
            CommandEnvelope::TerminalExec { ref command_text, ref command_id } => {
                assert_eq!(command_text, "uname -a");
                assert_eq!(command_id, &record.command_id);
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn result_application_is_monotonic_and_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let node_id = paired_node(&store);
        let record = match store.queue_terminal_command(&node_id, "true").unwrap() {
            TerminalExecOutcome::Queued { record, .. } => record,
            other => panic!("unexpected {other:?}"),
        };

        assert_eq!(
            store
                .apply_terminal_command_result(
                    &node_id,
                    &record.command_id,
                    CommandStatus::Running,
                    "started",
                    None,
                )
                .unwrap(),
            TerminalResultOutcome::Applied
        );
        assert_eq!(
            store
                .apply_terminal_command_result(
                    &node_id,
                    &record.command_id,
                    CommandStatus::Succeeded,
                    "exit 0",
                    Some(&json!({"exit_code": 0, "stdout": "ok\n"})),
                )
                .unwrap(),
            TerminalResultOutcome::Applied
        );

        let listed = store
            .list_terminal_commands(&node_id, 10)
            .unwrap()
            .unwrap();
        assert_eq!(listed[0].status, OperationStatus::Succeeded);
        assert_eq!(listed[0].exit_code, Some(0));
        assert_eq!(listed[0].output.as_deref(), Some("ok\n"));

        // Terminal rows are immutable.
        assert_eq!(
            store
                .apply_terminal_command_result(
                    &node_id,
                    &record.command_id,
                    CommandStatus::Failed,
                    "late failure",
                    None,
                )
                .unwrap(),
            TerminalResultOutcome::AlreadyFinal
        );
    }

    #[test]
    fn failed_result_prefers_stderr_over_message() {
        let store = Store::open_in_memory().unwrap();
        let node_id = paired_node(&store);
        let record = match store.queue_terminal_command(&node_id, "false").unwrap() {
            TerminalExecOutcome::Queued { record, .. } => record,
            other => panic!("unexpected {other:?}"),
        };
        store
            .apply_terminal_command_result(
                &node_id,
                &record.command_id,
                CommandStatus::Failed,
                "exit 1",
                Some(&json!({"exit_code": 1, "stderr": "permission denied"})),
            )
            .unwrap();
        let listed = store.list_terminal_commands(&node_id, 10).unwrap().unwrap();
        assert_eq!(listed[0].error.as_deref(), Some("permission denied"));
        assert_eq!(listed[0].exit_code, Some(1));
    }

    #[test]
    fn unknown_command_and_busy_are_reported() {
        let store = Store::open_in_memory().unwrap();
        let node_id = paired_node(&store);
        assert_eq!(
            store
                .apply_terminal_command_result(&node_id, "nope", CommandStatus::Succeeded, "m", None)
                .unwrap(),
            TerminalResultOutcome::CommandNotFound
        );
        let record = match store.queue_terminal_command(&node_id, "sleep 1").unwrap() {
            TerminalExecOutcome::Queued { record, .. } => record,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(
            store
                .apply_terminal_command_result(
                    &node_id,
                    &record.command_id,
                    CommandStatus::Busy,
                    "busy",
                    None,
                )
                .unwrap(),
            TerminalResultOutcome::Ignored
        );
    }
}
