//! End-to-end control-plane flows across store and router:
//! pairing → heartbeat → VM lifecycle → command routing → supersession →
//! terminal session bookkeeping.

use lattice_proto::{
    CommandEnvelope, CommandStatus, MasterFrame, NodeState, OperationStatus, PairGrant, VmAction,
    VmCreateRequest, VmState, is_valid_pair_code,
};
use lattice_router::{CommandRouter, TerminalEvent, TerminalKind, TerminalRegistry};
use lattice_store::{
    ApplyResultOutcome, HeartbeatOutcome, LogListOutcome, PairOutcome, Store, VmActionOutcome,
    VmCreateOutcome,
};
use serde_json::json;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn store() -> Store {
    Store::open_in_memory().expect("in-memory store")
}

fn pair(store: &Store) -> PairGrant {
    let node = store.create_node(None).unwrap();
    match store
        .pair_node(&node.pair_code, Some(&json!({"hostname": "h1"})))
        .unwrap()
    {
        PairOutcome::Paired(grant) => grant,
        other => panic!("expected pairing to succeed, got {other:?}"),
    }
}

/// Pair a node and report VM capability so create requests pass the gate.
fn vm_ready_node(store: &Store) -> PairGrant {
    let grant = pair(store);
    let payload = json!({
        "node_id": grant.node_id,
        "status": "alive",
        "hostname": "h1",
        "extra": {
            "vm": {"provider": "libvirt", "ready": true, "message": "libvirt ready"},
            "container": {"provider": "docker", "ready": true, "message": "docker ready"},
        }
    });
    match store
        .record_heartbeat(&grant.pair_token, &grant.node_id, &payload)
        .unwrap()
    {
        HeartbeatOutcome::Ok(_) => grant,
        other => panic!("expected heartbeat ok, got {other:?}"),
    }
}

fn create_request(name: &str) -> VmCreateRequest {
    VmCreateRequest {
        name: name.to_string(),
        image_id: "ubuntu-24-04".to_string(),
        vcpu: 2,
        memory_mb: 2048,
        disk_gb: 20,
        bridge: "br0".to_string(),
        guest: lattice_proto::GuestCredentials {
            username: "u".to_string(),
            password: "p".to_string(),
        },
    }
}

fn logs(store: &Store, node_id: &str) -> Vec<lattice_proto::LogEntry> {
    match store.list_node_logs(node_id, 500, None).unwrap() {
        LogListOutcome::Ok(items) => items,
        other => panic!("unexpected {other:?}"),
    }
}

// ─── Scenario 1: pairing ──────────────────────────────────────────────────────

#[test]
fn pairing_flow_issues_token_once_and_rejects_reuse() {
    let store = store();
    let node = store.create_node(None).unwrap();
    assert!(is_valid_pair_code(&node.pair_code));
    assert_eq!(node.state, NodeState::Pending);

    let grant = match store
        .pair_node(&node.pair_code, Some(&json!({"hostname": "h1", "os": "Linux 6.8"})))
        .unwrap()
    {
        PairOutcome::Paired(grant) => grant,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(grant.node_id, node.id);
    assert!(!grant.pair_token.is_empty());

    // Repeating the same pair code conflicts.
    assert!(matches!(
        store.pair_node(&node.pair_code, None).unwrap(),
        PairOutcome::AlreadyPaired
    ));

    // state == paired <=> pair_token exists: the old token authenticates.
    assert!(store.is_valid_node_token(&node.id, &grant.pair_token).unwrap());
    let listed = &store.list_nodes().unwrap()[0];
    assert_eq!(listed.state, NodeState::Paired);
}

// ─── Scenario 2: heartbeat normalisation ──────────────────────────────────────

#[test]
fn heartbeat_metrics_are_clamped_and_logged() {
    let store = store();
    let grant = pair(&store);

    let payload = json!({
        "node_id": grant.node_id,
        "status": "alive",
        "timestamp": "2025-01-01T00:00:00Z",
        "hostname": "h1",
        "extra": {
            "usage": {
                "cpu_percent": 250.0,
                "memory_percent": -5,
                "memory_used_bytes": -1
            }
        }
    });
    let node = match store
        .record_heartbeat(&grant.pair_token, &grant.node_id, &payload)
        .unwrap()
    {
        HeartbeatOutcome::Ok(node) => node,
        other => panic!("unexpected {other:?}"),
    };
    let metrics = node.runtime_metrics.unwrap();
    assert_eq!(metrics["cpu_percent"], json!(100.0));
    assert_eq!(metrics["memory_percent"], json!(0.0));
    assert_eq!(metrics["memory_used_bytes"], json!(0));

    let heartbeat_logs: Vec<_> = logs(&store, &grant.node_id)
        .into_iter()
        .filter(|e| e.message.starts_with("Heartbeat"))
        .collect();
    assert_eq!(heartbeat_logs.len(), 1);
    assert_eq!(heartbeat_logs[0].message, "Heartbeat alive");
    // The raw extras survive verbatim in the log meta.
    assert_eq!(
        heartbeat_logs[0].meta.as_ref().unwrap()["extra"]["usage"]["cpu_percent"],
        json!(250.0)
    );
}

// ─── Scenario 3: VM create happy path ─────────────────────────────────────────

#[test]
fn vm_create_happy_path_reaches_running_and_is_idempotent() {
    let store = store();
    let router = CommandRouter::new();
    let grant = vm_ready_node(&store);

    let (vm, command) = match store
        .create_vm_request(&grant.node_id, &create_request("db-1"))
        .unwrap()
    {
        VmCreateOutcome::Created { vm, command } => (vm, command),
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(vm.state, VmState::Creating);
    let operation_id = command.command_id().to_string();

    // No websocket: the command parks on the pending queue for long-poll.
    router.enqueue_pending(&grant.node_id, *command);
    let delivered = router.dequeue_pending(&grant.node_id).unwrap();
    match &delivered {
        CommandEnvelope::VmCreate { spec, .. } => {
            assert_eq!(spec.guest.password, "p", "dispatch carries the plaintext");
            assert_eq!(spec.domain_name, vm.domain_name);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Agent reports success.
    let outcome = store
        .apply_vm_command_result(
            &grant.node_id,
            &operation_id,
            CommandStatus::Succeeded,
            "VM created",
            Some(&json!({
                "power_state": "running",
                "domain_uuid": "8d4c2a9e-1111-2222-3333-444455556666",
                "ip_address": "10.0.0.12",
            })),
        )
        .unwrap();
    assert_eq!(outcome, ApplyResultOutcome::Applied);

    let fetched = store.get_vm(&grant.node_id, &vm.id).unwrap().unwrap();
    assert_eq!(fetched.state, VmState::Running);
    assert_eq!(fetched.ip_address.as_deref(), Some("10.0.0.12"));

    let ops = store
        .list_vm_operations(&grant.node_id, &vm.id)
        .unwrap()
        .unwrap();
    assert_eq!(ops[0].status, OperationStatus::Succeeded);
    assert!(ops[0].started_at.is_some() && ops[0].ended_at.is_some());

    // Re-applying the same result is a no-op.
    let again = store
        .apply_vm_command_result(
            &grant.node_id,
            &operation_id,
            CommandStatus::Succeeded,
            "VM created",
            Some(&json!({"power_state": "running"})),
        )
        .unwrap();
    assert_eq!(again, ApplyResultOutcome::AlreadyFinal);
}

// ─── Scenario 4: state machine violation ──────────────────────────────────────

#[test]
fn start_on_running_vm_conflicts_without_creating_an_operation() {
    let store = store();
    let grant = vm_ready_node(&store);
    let (vm, command) = match store
        .create_vm_request(&grant.node_id, &create_request("db-1"))
        .unwrap()
    {
        VmCreateOutcome::Created { vm, command } => (vm, command),
        other => panic!("unexpected {other:?}"),
    };
    store
        .apply_vm_command_result(
            &grant.node_id,
            command.command_id(),
            CommandStatus::Succeeded,
            "VM created",
            Some(&json!({"power_state": "running"})),
        )
        .unwrap();

    match store
        .queue_vm_action(&grant.node_id, &vm.id, VmAction::Start)
        .unwrap()
    {
        VmActionOutcome::InvalidState { message } => assert_eq!(message, "vm is already running"),
        other => panic!("unexpected {other:?}"),
    }
    let ops = store
        .list_vm_operations(&grant.node_id, &vm.id)
        .unwrap()
        .unwrap();
    assert_eq!(ops.len(), 1, "no operation row for the rejected action");
}

// ─── Scenario: delete removes the row ─────────────────────────────────────────

#[test]
fn delete_lifecycle_removes_vm_and_subsequent_delete_is_not_found() {
    let store = store();
    let grant = vm_ready_node(&store);
    let (vm, command) = match store
        .create_vm_request(&grant.node_id, &create_request("db-1"))
        .unwrap()
    {
        VmCreateOutcome::Created { vm, command } => (vm, command),
        other => panic!("unexpected {other:?}"),
    };
    store
        .apply_vm_command_result(
            &grant.node_id,
            command.command_id(),
            CommandStatus::Succeeded,
            "VM created",
            Some(&json!({"power_state": "running"})),
        )
        .unwrap();

    let operation_id = match store
        .queue_vm_action(&grant.node_id, &vm.id, VmAction::Delete)
        .unwrap()
    {
        VmActionOutcome::Queued { operation_id, vm, .. } => {
            assert_eq!(vm.state, VmState::Deleting);
            operation_id
        }
        other => panic!("unexpected {other:?}"),
    };
    store
        .apply_vm_command_result(
            &grant.node_id,
            &operation_id,
            CommandStatus::Succeeded,
            "VM deleted",
            Some(&json!({"power_state": "deleted"})),
        )
        .unwrap();

    assert!(store.get_vm(&grant.node_id, &vm.id).unwrap().is_none());
    assert!(matches!(
        store
            .queue_vm_action(&grant.node_id, &vm.id, VmAction::Delete)
            .unwrap(),
        VmActionOutcome::VmNotFound
    ));
}

// ─── Scenario 5: supersession ─────────────────────────────────────────────────

#[test]
fn newer_connection_supersedes_and_stale_writer_cannot_clean_up_the_new_one() {
    let store = store();
    let router = CommandRouter::new();
    let grant = pair(&store);

    assert!(router.activate(&grant.node_id, "alpha").is_none());
    let superseded = router.activate(&grant.node_id, "beta");
    assert_eq!(superseded.as_deref(), Some("alpha"));

    // The session handler logs the replacement when it observes one.
    store
        .append_node_log(
            &grant.node_id,
            "info",
            "Agent websocket connection replaced an existing session",
            Some(&json!({"superseded_connection": "alpha"})),
            None,
        )
        .unwrap();
    assert!(
        logs(&store, &grant.node_id)
            .iter()
            .any(|e| e.message.contains("replaced an existing session"))
    );

    // Alpha observes it is no longer current and exits; its cleanup must not
    // evict beta.
    assert!(!router.is_current(&grant.node_id, "alpha"));
    assert!(!router.deactivate(&grant.node_id, "alpha"));
    assert!(router.is_current(&grant.node_id, "beta"));
}

// ─── Command router FIFO across transports ────────────────────────────────────

#[test]
fn enqueue_order_is_dequeue_order() {
    let router = CommandRouter::new();
    for i in 0..10 {
        router.enqueue_pending(
            "n1",
            CommandEnvelope::TerminalExec {
                command_id: format!("c{i}"),
                command_text: "true".to_string(),
            },
        );
    }
    for i in 0..10 {
        assert_eq!(
            router.dequeue_pending("n1").unwrap().command_id(),
            format!("c{i}")
        );
    }
    assert!(router.dequeue_pending("n1").is_none());
}

// ─── Scenario 6: terminal session ordering ────────────────────────────────────

#[test]
fn terminal_frames_stay_ordered_between_open_and_close() {
    let router = CommandRouter::new();
    let registry = TerminalRegistry::new();
    let session = registry.register("n1", TerminalKind::NodeShell);
    let sid = session.session_id.clone();

    router.enqueue_ws(
        "n1",
        MasterFrame::TerminalOpen {
            session_id: sid.clone(),
            cols: 80,
            rows: 24,
        },
    );
    for data in ["a", "b", "c"] {
        router.enqueue_ws(
            "n1",
            MasterFrame::TerminalInput {
                session_id: sid.clone(),
                data: data.to_string(),
            },
        );
    }
    router.enqueue_ws(
        "n1",
        MasterFrame::TerminalResize {
            session_id: sid.clone(),
            cols: 120,
            rows: 40,
        },
    );
    router.enqueue_ws(
        "n1",
        MasterFrame::TerminalClose {
            session_id: sid.clone(),
        },
    );

    let drained = router.drain_ws("n1", 200);
    assert_eq!(drained.len(), 6);
    assert!(matches!(drained[0], MasterFrame::TerminalOpen { .. }));
    let inputs: Vec<String> = drained
        .iter()
        .filter_map(|f| match f {
            MasterFrame::TerminalInput { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(inputs, vec!["a", "b", "c"]);
    assert!(matches!(drained[4], MasterFrame::TerminalResize { .. }));
    assert!(matches!(drained[5], MasterFrame::TerminalClose { .. }));

    // Agent disconnect forcibly ends the session with a terminal error.
    assert_eq!(registry.close_for_node("n1", "Agent websocket disconnected"), 1);
    match session.try_recv().unwrap() {
        TerminalEvent::Error { error } => assert_eq!(error, "Agent websocket disconnected"),
        other => panic!("unexpected {other:?}"),
    }
}

// ─── Log pagination property ──────────────────────────────────────────────────

#[test]
fn log_pagination_returns_ordered_strictly_greater_prefixes() {
    let store = store();
    let grant = pair(&store);
    for i in 0..50 {
        store
            .append_node_log(&grant.node_id, "info", &format!("event {i}"), None, None)
            .unwrap();
    }
    let all = logs(&store, &grant.node_id);

    for (since_idx, limit) in [(0, 5), (10, 500), (48, 3)] {
        let since = all[since_idx].id;
        let page = match store
            .list_node_logs(&grant.node_id, limit, Some(since))
            .unwrap()
        {
            LogListOutcome::Ok(items) => items,
            other => panic!("unexpected {other:?}"),
        };
        let expected: Vec<i64> = all
            .iter()
            .map(|e| e.id)
            .filter(|id| *id > since)
            .take(limit as usize)
            .collect();
        let got: Vec<i64> = page.iter().map(|e| e.id).collect();
        assert_eq!(got, expected, "since={since} limit={limit}");
    }
}

// ─── Operation status monotonicity ───────────────────────────────────────────

#[test]
fn operation_status_never_regresses() {
    let store = store();
    let grant = vm_ready_node(&store);
    let (_, command) = match store
        .create_vm_request(&grant.node_id, &create_request("db-1"))
        .unwrap()
    {
        VmCreateOutcome::Created { vm, command } => (vm, command),
        other => panic!("unexpected {other:?}"),
    };
    let op_id = command.command_id().to_string();

    store
        .apply_vm_command_result(&grant.node_id, &op_id, CommandStatus::Running, "working", None)
        .unwrap();
    store
        .apply_vm_command_result(
            &grant.node_id,
            &op_id,
            CommandStatus::Succeeded,
            "done",
            Some(&json!({"power_state": "running"})),
        )
        .unwrap();

    // A late "running" or "failed" cannot rewind a terminal operation.
    for (status, message) in [
        (CommandStatus::Running, "late running"),
        (CommandStatus::Failed, "late failure"),
    ] {
        let outcome = store
            .apply_vm_command_result(&grant.node_id, &op_id, status, message, None)
            .unwrap();
        assert_eq!(outcome, ApplyResultOutcome::AlreadyFinal);
    }
    let op = store.get_operation(&op_id).unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Succeeded);
    assert!(op.error.is_none());
}

// ─── Re-pair invalidates the old token ────────────────────────────────────────

#[test]
fn heartbeat_with_revoked_token_is_unauthorized() {
    let store = store();
    let grant = pair(&store);

    // The operator resets the node; the agent's stored token dies with it.
    store.delete_node(&grant.node_id).unwrap();
    let fresh = store.create_node(None).unwrap();
    let refreshed = match store.pair_node(&fresh.pair_code, None).unwrap() {
        PairOutcome::Paired(g) => g,
        other => panic!("unexpected {other:?}"),
    };

    let payload = json!({"node_id": refreshed.node_id});
    assert!(matches!(
        store
            .record_heartbeat(&grant.pair_token, &refreshed.node_id, &payload)
            .unwrap(),
        HeartbeatOutcome::InvalidToken
    ));
}
