//! Bounded outbound frame queue feeding the websocket streamer.
//!
//! Producers (log mirror, terminal manager, command dispatch) never block:
//! when the queue is full the oldest frame is dropped, trading history for
//! liveness while the websocket is down.

use lattice_proto::AgentFrame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

pub const EVENT_QUEUE_CAP: usize = 1000;

pub struct EventQueue {
    queue: Mutex<VecDeque<AgentFrame>>,
    notify: Notify,
    cap: usize,
}

impl EventQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap: cap.max(10),
        }
    }

    pub fn push(&self, frame: AgentFrame) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.cap {
                queue.pop_front();
            }
            queue.push_back(frame);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<AgentFrame> {
        self.queue.lock().pop_front()
    }

    /// Wait for the next frame.
    pub async fn recv(&self) -> AgentFrame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_frame(message: &str) -> AgentFrame {
        AgentFrame::Log {
            level: Some("info".to_string()),
            message: message.to_string(),
            meta: None,
            timestamp: None,
        }
    }

    fn message_of(frame: &AgentFrame) -> String {
        match frame {
            AgentFrame::Log { message, .. } => message.clone(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn frames_pop_in_push_order() {
        let queue = EventQueue::new(10);
        queue.push(log_frame("a"));
        queue.push(log_frame("b"));
        assert_eq!(message_of(&queue.try_pop().unwrap()), "a");
        assert_eq!(message_of(&queue.try_pop().unwrap()), "b");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn overflow_drops_the_oldest_frame() {
        let queue = EventQueue::new(10);
        for i in 0..12 {
            queue.push(log_frame(&format!("m{i}")));
        }
        assert_eq!(queue.len(), 10);
        assert_eq!(message_of(&queue.try_pop().unwrap()), "m2");
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let queue = std::sync::Arc::new(EventQueue::new(10));
        let waiter = std::sync::Arc::clone(&queue);
        let handle = tokio::spawn(async move { waiter.recv().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue.push(log_frame("wake"));
        assert_eq!(message_of(&handle.await.unwrap()), "wake");
    }
}
