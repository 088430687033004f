//! Redis Pub/Sub for cross-instance local cache invalidation.
//!
//! ```text
//! Instance 1: mutation of root.acme
//!   -> PUBLISH lineage:invalidate "prefix:root.acme"
//! Instance 2: listener receives it -> LocalCache::invalidate_related(root.acme)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lineage_storage::{EntityId, EntityPath};
use tokio::sync::watch;

use crate::local::LocalCache;

/// Channel carrying invalidation messages.
pub const INVALIDATION_CHANNEL: &str = "lineage:invalidate";

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// What another process should evict from its local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationMessage {
    /// One cached answer.
    Key(EntityId),
    /// Everything related to a mutated path.
    Prefix(EntityPath),
}

impl InvalidationMessage {
    /// Parses the wire form, `key:<id>` or `prefix:<path>`.
    pub fn parse(payload: &str) -> Option<Self> {
        if let Some(id) = payload.strip_prefix("key:") {
            return (!id.is_empty()).then(|| Self::Key(EntityId::new(id)));
        }
        payload
            .strip_prefix("prefix:")
            .and_then(|p| EntityPath::parse(p).ok())
            .map(Self::Prefix)
    }

    /// Applies the message to a local cache. Returns entries removed.
    pub fn apply(&self, cache: &LocalCache) -> usize {
        match self {
            Self::Key(id) => usize::from(cache.invalidate(id)),
            Self::Prefix(path) => cache.invalidate_related(path),
        }
    }
}

impl fmt::Display for InvalidationMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(id) => write!(f, "key:{id}"),
            Self::Prefix(path) => write!(f, "prefix:{path}"),
        }
    }
}

/// Subscribes to [`INVALIDATION_CHANNEL`] and evicts from the local cache.
///
/// Reconnects with exponential backoff if the connection is lost.
pub struct InvalidationListener {
    pub redis_url: String,
    pub local_cache: Arc<LocalCache>,
}

impl InvalidationListener {
    /// Spawns the listener. Send `true` on the returned sender to stop it.
    pub fn start(self) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                tokio::select! {
                    result = self.run() => match result {
                        Ok(()) => backoff = Duration::from_secs(1),
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                backoff_secs = backoff.as_secs(),
                                "Cache invalidation listener error, reconnecting"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = shutdown_rx.changed() => {}
                            }
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    },
                    _ = shutdown_rx.changed() => {}
                }
                if *shutdown_rx.borrow() {
                    tracing::info!("Cache invalidation listener stopped");
                    break;
                }
            }
        });

        shutdown_tx
    }

    async fn run(&self) -> Result<(), String> {
        use futures_util::StreamExt;

        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create Redis client: {e}"))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;

        pubsub
            .subscribe(INVALIDATION_CHANNEL)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        tracing::info!(channel = INVALIDATION_CHANNEL, "Subscribed to invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let Ok(payload) = msg.get_payload::<String>() else {
                tracing::warn!("failed to read invalidation message payload");
                continue;
            };
            match InvalidationMessage::parse(&payload) {
                Some(message) => {
                    let removed = message.apply(&self.local_cache);
                    tracing::debug!(invalidation = %message, removed, "received cache invalidation");
                }
                None => tracing::warn!(payload = %payload, "unrecognized invalidation message"),
            }
        }
        Err("pub/sub connection closed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let key = InvalidationMessage::Key(EntityId::new("e-1"));
        assert_eq!(key.to_string(), "key:e-1");
        assert_eq!(InvalidationMessage::parse("key:e-1"), Some(key));

        let prefix = InvalidationMessage::Prefix(EntityPath::parse("root.acme").unwrap());
        assert_eq!(prefix.to_string(), "prefix:root.acme");
        assert_eq!(InvalidationMessage::parse("prefix:root.acme"), Some(prefix));

        assert_eq!(InvalidationMessage::parse("key:"), None);
        assert_eq!(InvalidationMessage::parse("prefix:root..x"), None);
        assert_eq!(InvalidationMessage::parse("bogus"), None);
    }
}
