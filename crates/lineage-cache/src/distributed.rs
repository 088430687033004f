//! The shared, TTL-based cache tier (L2).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::CacheError;
use crate::listener::InvalidationMessage;

/// Network-backed byte cache shared between processes.
///
/// Every operation can fail transiently; wrap implementations in
/// [`crate::RetryingCache`] before using them on the request path.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Announces an invalidation to other processes' local caches.
    async fn publish(&self, message: &InvalidationMessage) -> Result<(), CacheError>;

    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct StoredValue {
    data: Vec<u8>,
    stored_at: Instant,
    ttl: Duration,
}

/// Published messages kept by [`InMemoryDistributedCache`].
pub const PUBLISHED_HISTORY: usize = 1024;

/// Process-local stand-in for a distributed cache.
///
/// Used by tests and single-node deployments. It can be switched to
/// unreachable, or made to fail a number of upcoming calls, to exercise
/// retry and fallback paths. Only the last [`PUBLISHED_HISTORY`] published
/// messages are kept.
#[derive(Debug, Default)]
pub struct InMemoryDistributedCache {
    values: DashMap<String, StoredValue>,
    unreachable: AtomicBool,
    failures_remaining: AtomicU32,
    calls: AtomicU64,
    published: Mutex<VecDeque<InvalidationMessage>>,
}

impl InMemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `Unavailable` until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fails the next `count` calls with `Timeout`.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Total calls received, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Recently published messages, oldest first.
    pub fn published(&self) -> Vec<InvalidationMessage> {
        self.published.lock().iter().cloned().collect()
    }

    fn admit(&self) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CacheError::unavailable("in-memory cache marked unreachable"));
        }
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(CacheError::timeout("injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.admit()?;
        let expired = match self.values.get(key) {
            Some(value) if value.stored_at.elapsed() <= value.ttl => {
                return Ok(Some(value.data.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.values.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CacheError> {
        self.admit()?;
        self.values.insert(
            key.to_string(),
            StoredValue {
                data: value.to_vec(),
                stored_at: Instant::now(),
                ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.admit()?;
        self.values.remove(key);
        Ok(())
    }

    async fn publish(&self, message: &InvalidationMessage) -> Result<(), CacheError> {
        self.admit()?;
        let mut published = self.published.lock();
        if published.len() == PUBLISHED_HISTORY {
            published.pop_front();
        }
        published.push_back(message.clone());
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
