//! Mirrors the agent's own tracing output to the master as `log` frames.

use crate::events::EventQueue;
use lattice_proto::AgentFrame;
use serde_json::json;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub struct WsLogLayer {
    queue: Arc<EventQueue>,
}

impl WsLogLayer {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self { queue }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

impl<S: Subscriber> Layer<S> for WsLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // Mirror only the agent's own info-and-up events.
        if *metadata.level() > Level::INFO {
            return;
        }
        let target = metadata.target();
        if !target.starts_with("lattice_agent") {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let Some(message) = visitor.message else {
            return;
        };
        if message.trim().is_empty() {
            return;
        }

        let level = match *metadata.level() {
            Level::ERROR => "error",
            Level::WARN => "warning",
            _ => "info",
        };
        self.queue.push(AgentFrame::Log {
            level: Some(level.to_string()),
            message,
            meta: Some(json!({ "logger": target })),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    #[test]
    fn agent_events_are_mirrored_with_mapped_levels() {
        let queue = Arc::new(EventQueue::new(100));
        let subscriber =
            tracing_subscriber::registry().with(WsLogLayer::new(Arc::clone(&queue)));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "lattice_agent::test", "hello from the agent");
            tracing::warn!(target: "lattice_agent::test", "something odd");
            tracing::debug!(target: "lattice_agent::test", "too verbose to mirror");
            tracing::info!(target: "hyper::client", "third-party noise");
        });

        let mut frames = Vec::new();
        while let Some(frame) = queue.try_pop() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 2, "got {frames:?}");
        match &frames[0] {
            AgentFrame::Log { level, message, meta, timestamp } => {
                assert_eq!(level.as_deref(), Some("info"));
                assert_eq!(message, "hello from the agent");
                assert_eq!(meta.as_ref().unwrap()["logger"], "lattice_agent::test");
                assert!(timestamp.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        match &frames[1] {
            AgentFrame::Log { level, .. } => assert_eq!(level.as_deref(), Some("warning")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
