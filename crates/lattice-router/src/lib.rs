//! In-memory command routing for the Lattice master.
//!
//! Three per-node structures, each behind its own short-lived mutex:
//! a pending FIFO consumed by HTTP long-poll, an outbound frame buffer for
//! the live agent websocket, and the active-connection registry that enforces
//! at-most-one-writer per node. None of this survives a restart; the store's
//! startup sweep restores consistency for the UI.

#![forbid(unsafe_code)]

use lattice_proto::{CommandEnvelope, MasterFrame};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

/// Outbound websocket buffer cap per node. On overflow the oldest half is
/// dropped so a dead connection cannot pin unbounded memory.
pub const WS_OUTBOUND_CAP: usize = 2000;

/// Bound on a terminal session's inbound queue; oldest entries are dropped
/// when the UI cannot keep up.
pub const TERMINAL_QUEUE_CAP: usize = 512;

// ─── Command router ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CommandRouter {
    pending: Mutex<HashMap<String, VecDeque<CommandEnvelope>>>,
    active: Mutex<HashMap<String, String>>,
    ws_outbound: Mutex<HashMap<String, VecDeque<MasterFrame>>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Pending long-poll queue ────────────────────────────────────────────

    pub fn enqueue_pending(&self, node_id: &str, command: CommandEnvelope) {
        let mut pending = self.pending.lock();
        pending
            .entry(node_id.to_string())
            .or_default()
            .push_back(command);
    }

    /// Pop the head of a node's pending queue, removing the map entry when it
    /// empties.
    pub fn dequeue_pending(&self, node_id: &str) -> Option<CommandEnvelope> {
        let mut pending = self.pending.lock();
        let queue = pending.get_mut(node_id)?;
        let command = queue.pop_front();
        if queue.is_empty() {
            pending.remove(node_id);
        }
        command
    }

    pub fn pending_len(&self, node_id: &str) -> usize {
        self.pending.lock().get(node_id).map_or(0, VecDeque::len)
    }

    // ── Active connection registry ─────────────────────────────────────────

    /// Register `connection_id` as the node's only writer. Returns the
    /// superseded connection id, if any; its writer must observe
    /// `is_current == false` and exit.
    pub fn activate(&self, node_id: &str, connection_id: &str) -> Option<String> {
        self.active
            .lock()
            .insert(node_id.to_string(), connection_id.to_string())
    }

    pub fn is_current(&self, node_id: &str, connection_id: &str) -> bool {
        self.active
            .lock()
            .get(node_id)
            .is_some_and(|current| current == connection_id)
    }

    /// Remove the registration only if `connection_id` still owns it.
    pub fn deactivate(&self, node_id: &str, connection_id: &str) -> bool {
        let mut active = self.active.lock();
        if active.get(node_id).is_some_and(|c| c == connection_id) {
            active.remove(node_id);
            true
        } else {
            false
        }
    }

    pub fn active_connection(&self, node_id: &str) -> Option<String> {
        self.active.lock().get(node_id).cloned()
    }

    pub fn has_active_connection(&self, node_id: &str) -> bool {
        self.active.lock().contains_key(node_id)
    }

    // ── Websocket outbound buffer ──────────────────────────────────────────

    pub fn enqueue_ws(&self, node_id: &str, frame: MasterFrame) {
        let mut outbound = self.ws_outbound.lock();
        let queue = outbound.entry(node_id.to_string()).or_default();
        if queue.len() >= WS_OUTBOUND_CAP {
            let dropped = queue.len() / 2;
            queue.drain(..dropped);
            tracing::warn!(node_id, dropped, "ws outbound buffer overflow, dropped oldest half");
        }
        queue.push_back(frame);
    }

    /// Take up to `max` frames in enqueue order.
    pub fn drain_ws(&self, node_id: &str, max: usize) -> Vec<MasterFrame> {
        let mut outbound = self.ws_outbound.lock();
        let Some(queue) = outbound.get_mut(node_id) else {
            return Vec::new();
        };
        let take = max.min(queue.len());
        let drained: Vec<MasterFrame> = queue.drain(..take).collect();
        if queue.is_empty() {
            outbound.remove(node_id);
        }
        drained
    }

    pub fn clear_ws(&self, node_id: &str) {
        self.ws_outbound.lock().remove(node_id);
    }
}

// ─── Terminal sessions ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    NodeShell,
    VmConsole,
    ContainerShell,
    ContainerLogs,
}

/// Events flowing from the agent (or synthesised by the master) towards a UI
/// terminal client.
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    Data { data: String },
    Exit { exit_code: Option<i32> },
    Error { error: String },
}

/// One live UI terminal, owned by its websocket handler for the lifetime of
/// the connection.
pub struct TerminalSession {
    pub session_id: String,
    pub node_id: String,
    pub kind: TerminalKind,
    queue: Mutex<VecDeque<TerminalEvent>>,
    notify: Notify,
}

impl TerminalSession {
    fn push(&self, event: TerminalEvent) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= TERMINAL_QUEUE_CAP {
                queue.pop_front();
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    pub fn try_recv(&self) -> Option<TerminalEvent> {
        self.queue.lock().pop_front()
    }

    /// Wait for the next inbound event.
    pub async fn recv(&self) -> TerminalEvent {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Default)]
pub struct TerminalRegistry {
    sessions: Mutex<HashMap<String, Arc<TerminalSession>>>,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: &str, kind: TerminalKind) -> Arc<TerminalSession> {
        let session = Arc::new(TerminalSession {
            session_id: Uuid::new_v4().to_string(),
            node_id: node_id.to_string(),
            kind,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        self.sessions
            .lock()
            .insert(session.session_id.clone(), Arc::clone(&session));
        session
    }

    pub fn unregister(&self, session_id: &str) -> Option<Arc<TerminalSession>> {
        self.sessions.lock().remove(session_id)
    }

    /// Route an agent terminal event to its session. Returns false when the
    /// session id is unknown so the caller can answer with an error frame.
    pub fn push_event(&self, session_id: &str, event: TerminalEvent) -> bool {
        let session = self.sessions.lock().get(session_id).cloned();
        match session {
            Some(session) => {
                session.push(event);
                true
            }
            None => false,
        }
    }

    /// Forcibly end every session bound to a node, delivering a synthetic
    /// terminal error. Used when the agent websocket drops.
    pub fn close_for_node(&self, node_id: &str, error: &str) -> usize {
        let sessions: Vec<Arc<TerminalSession>> = {
            let mut map = self.sessions.lock();
            let ids: Vec<String> = map
                .values()
                .filter(|s| s.node_id == node_id)
                .map(|s| s.session_id.clone())
                .collect();
            ids.iter().filter_map(|id| map.remove(id)).collect()
        };
        for session in &sessions {
            session.push(TerminalEvent::Error {
                error: error.to_string(),
            });
        }
        sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
