//! A single accepted WebSocket connection and the envelope format every
//! broadcast event is wrapped in before being sent down the wire.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

/// No ping/pong activity for this long and a connection is considered dead
/// and dropped.
pub const STALE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-connection outbound queue depth. Past this, `push` drops the oldest
/// queued non-heartbeat frame rather than growing without bound — a slow
/// client must not let its backlog consume unbounded memory.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastEnvelope<'a> {
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub timestamp: String,
    pub data: &'a serde_json::Value,
}

struct QueueState {
    frames: VecDeque<Message>,
    closed: bool,
}

/// Bounded outbound queue for one connection, shared between the
/// [`ConnectionHandle`] (pushes) and the connection's write task (drains).
/// A `std::sync::Mutex` is enough here since every critical section is a
/// few `VecDeque` operations, never an await point.
#[derive(Clone)]
pub struct OutboundQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    dropped: Arc<AtomicU64>,
}

impl OutboundQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState { frames: VecDeque::with_capacity(OUTBOUND_QUEUE_CAPACITY), closed: false })),
            notify: Arc::new(Notify::new()),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue a frame. At capacity, drops the oldest non-heartbeat frame
    /// to make room for it; a heartbeat `Ping` offered while full is simply
    /// discarded instead of evicting real event traffic. Returns `false`
    /// once the queue has been closed, meaning the caller should treat the
    /// connection as gone.
    fn push(&self, message: Message) -> bool {
        let mut state = self.state.lock().expect("outbound queue lock poisoned");
        if state.closed {
            return false;
        }
        if state.frames.len() >= OUTBOUND_QUEUE_CAPACITY {
            if matches!(message, Message::Ping(_)) {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            let evict = state.frames.iter().position(|m| !matches!(m, Message::Ping(_))).unwrap_or(0);
            state.frames.remove(evict);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("outbound queue full, dropped oldest non-heartbeat frame");
        }
        state.frames.push_back(message);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Wait for and remove the next queued frame, or `None` once the queue
    /// is closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        loop {
            {
                let mut state = self.state.lock().expect("outbound queue lock poisoned");
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Mark the queue closed and wake the drain loop so it can exit after
    /// flushing whatever is already queued.
    pub fn close(&self) {
        self.state.lock().expect("outbound queue lock poisoned").closed = true;
        self.notify.notify_one();
    }

    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one accepted connection, held by the broadcaster. Sending is
/// decoupled from the connection's own read/write task via a bounded
/// [`OutboundQueue`] so `broadcast_event` never blocks on a slow client.
pub struct ConnectionHandle {
    pub conn_id: String,
    pub user_id: String,
    pub user_role: String,
    pub connected_at: Instant,
    last_activity: Instant,
    queue: OutboundQueue,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(
        conn_id: impl Into<String>,
        user_id: impl Into<String>,
        user_role: impl Into<String>,
        queue: OutboundQueue,
    ) -> Self {
        let now = Instant::now();
        Self {
            conn_id: conn_id.into(),
            user_id: user_id.into(),
            user_role: user_role.into(),
            connected_at: now,
            last_activity: now,
            queue,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    #[must_use]
    pub fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) > STALE_CONNECTION_TIMEOUT
    }

    /// Send a text frame; failure means the connection's write half is gone
    /// and it should be dropped by the caller.
    pub fn send_text(&self, text: String) -> bool {
        self.queue.push(Message::Text(text.into()))
    }

    pub fn send_ping(&self) -> bool {
        self.queue.push(Message::Ping(Vec::new().into()))
    }

    /// Send a close frame with `code`, e.g. [`super::close_code::POLICY_VIOLATION`].
    pub fn send_close(&self, code: u16) -> bool {
        self.queue.push(Message::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
            code: code.into(),
            reason: "".into(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn full_queue_drops_oldest_non_heartbeat_frame() {
        let queue = OutboundQueue::new();
        for i in 0..OUTBOUND_QUEUE_CAPACITY {
            queue.push(Message::Text(format!("event-{i}").into()));
        }
        queue.push(Message::Text("overflow".to_string().into()));

        assert_eq!(queue.dropped_count(), 1);
        let first = queue.recv().await.unwrap();
        assert_eq!(first, Message::Text("event-1".to_string().into()));
    }

    #[tokio::test]
    async fn full_queue_discards_heartbeat_rather_than_evicting_events() {
        let queue = OutboundQueue::new();
        for i in 0..OUTBOUND_QUEUE_CAPACITY {
            queue.push(Message::Text(format!("event-{i}").into()));
        }
        queue.push(Message::Ping(Vec::new().into()));

        assert_eq!(queue.dropped_count(), 1);
        let first = queue.recv().await.unwrap();
        assert_eq!(first, Message::Text("event-0".to_string().into()));
    }

    #[tokio::test]
    async fn recv_returns_none_after_close_and_drain() {
        let queue = OutboundQueue::new();
        queue.push(Message::Text("hello".to_string().into()));
        queue.close();

        assert!(queue.recv().await.is_some());
        assert!(queue.recv().await.is_none());
    }
}
