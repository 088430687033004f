//! Refresh notifications.
//!
//! After a view refresh succeeds the scheduler publishes a [`RefreshEvent`].
//! Delivery to end subscribers (WebSocket fan-out, webhooks) belongs to
//! whoever consumes the channel; publishing never blocks or fails.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;

/// Default buffer size for the broadcast channel.
/// Slow receivers lose the oldest events beyond this limit.
const DEFAULT_BUFFER_SIZE: usize = 256;

/// Payload published after a successful view refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshEvent {
    pub view: String,
    #[serde(with = "time::serde::rfc3339")]
    pub refreshed_at: OffsetDateTime,
    /// Answers rebuilt by the refresh.
    pub rebuilt: usize,
}

/// Sink for refresh events.
pub trait RefreshNotifier: Send + Sync {
    fn publish(&self, event: RefreshEvent);
}

/// Publishes refresh events on a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<RefreshEvent>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Events published before subscribing are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BroadcastNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastNotifier")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl RefreshNotifier for BroadcastNotifier {
    fn publish(&self, event: RefreshEvent) {
        let delivered = self.sender.send(event).unwrap_or_default();
        tracing::trace!(delivered, "refresh event published");
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl RefreshNotifier for NoopNotifier {
    fn publish(&self, _event: RefreshEvent) {}
}
