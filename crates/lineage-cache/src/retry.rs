//! Retry with exponential backoff and jitter around a distributed cache.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::distributed::DistributedCache;
use crate::error::CacheError;
use crate::listener::InvalidationMessage;

/// Backoff configuration for distributed cache calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter factor in `[0, 1]`; the delay varies by up to this fraction.
    pub jitter: f64,
    /// Deadline for a single attempt. An attempt that outlives it counts as
    /// a transient timeout.
    pub op_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 25,
            max_delay_ms: 400,
            jitter: 0.25,
            op_timeout_ms: 50,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    /// Delay before retry number `retry` (0-based): base * 2^retry, capped,
    /// then jittered.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = Duration::from_millis(self.base_delay_ms);
        let capped = base
            .saturating_mul(2u32.saturating_pow(retry))
            .min(Duration::from_millis(self.max_delay_ms));

        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter > 0.0 {
            let range = capped.as_secs_f64() * jitter;
            let offset = rand::thread_rng().gen_range(-range..=range);
            Duration::from_secs_f64((capped.as_secs_f64() + offset).max(0.0))
        } else {
            capped
        }
    }
}

/// Counters for retry behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStats {
    /// Retries issued after a failed attempt.
    pub retries: u64,
    /// Operations that gave up after the last attempt.
    pub exhausted: u64,
}

/// Distributed cache wrapper that never fails.
///
/// Transient errors are retried per the [`RetryPolicy`]; when attempts are
/// exhausted, reads become misses and writes become no-ops, with a `warn!`
/// event. The tier is an optimization, not a dependency.
pub struct RetryingCache {
    inner: Arc<dyn DistributedCache>,
    policy: RetryPolicy,
    retries: AtomicU64,
    exhausted: AtomicU64,
}

impl RetryingCache {
    pub fn new(inner: Arc<dyn DistributedCache>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            retries: self.retries.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
        }
    }

    async fn run<T, F, Fut>(&self, op: &'static str, key: &str, call: F) -> Option<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let deadline = self.policy.op_timeout();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(deadline, call()).await {
                Ok(result) => result,
                Err(_) => Err(CacheError::timeout(format!(
                    "{op} did not complete within {}ms",
                    deadline.as_millis()
                ))),
            };
            match result {
                Ok(value) => return Some(value),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.policy.delay_for_retry(attempt - 1);
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        op,
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying distributed cache call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.exhausted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        op,
                        key = %key,
                        attempts = attempt,
                        backend = self.inner.backend_name(),
                        error = %e,
                        "distributed cache call failed, degrading to next tier"
                    );
                    return None;
                }
            }
        }
    }

    /// Reads a value; `None` on miss or exhausted retries.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.run("get", key, || self.inner.get(key)).await.flatten()
    }

    /// Writes a value. Returns `false` if the write was abandoned.
    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> bool {
        self.run("set", key, || self.inner.set(key, value, ttl))
            .await
            .is_some()
    }

    /// Deletes a value. Returns `false` if the delete was abandoned.
    pub async fn delete(&self, key: &str) -> bool {
        self.run("delete", key, || self.inner.delete(key))
            .await
            .is_some()
    }

    /// Publishes an invalidation. Returns `false` if it was abandoned.
    pub async fn publish(&self, message: &InvalidationMessage) -> bool {
        let key = message.to_string();
        self.run("publish", &key, || self.inner.publish(message))
            .await
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::InMemoryDistributedCache;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter: 0.0,
            op_timeout_ms: 20,
        }
    }

    /// Backend whose calls never complete.
    struct StalledCache;

    #[async_trait::async_trait]
    impl DistributedCache for StalledCache {
        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            std::future::pending().await
        }

        async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), CacheError> {
            std::future::pending().await
        }

        async fn delete(&self, _key: &str) -> Result<(), CacheError> {
            std::future::pending().await
        }

        async fn publish(&self, _message: &InvalidationMessage) -> Result<(), CacheError> {
            std::future::pending().await
        }

        fn backend_name(&self) -> &'static str {
            "stalled"
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_retry(0), Duration::from_millis(25));
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(10), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay_for_retry(1);
            assert!(delay >= Duration::from_micros(37_500));
            assert!(delay <= Duration::from_micros(62_500));
        }
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let backend = Arc::new(InMemoryDistributedCache::new());
        let cache = RetryingCache::new(backend.clone(), fast_policy());
        backend.set("k", b"v", Duration::from_secs(5)).await.unwrap();

        backend.fail_next(2);
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));
        assert_eq!(cache.stats().retries, 2);
        assert_eq!(cache.stats().exhausted, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_is_a_miss() {
        let backend = Arc::new(InMemoryDistributedCache::new());
        let cache = RetryingCache::new(backend.clone(), fast_policy());
        backend.set_unreachable(true);

        assert_eq!(cache.get("k").await, None);
        assert!(!cache.set("k", b"v", Duration::from_secs(1)).await);
        assert_eq!(backend.calls(), 6);
        assert_eq!(cache.stats().exhausted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_backend_times_out_to_miss() {
        let cache = RetryingCache::new(Arc::new(StalledCache), fast_policy());

        assert_eq!(cache.get("k").await, None);
        assert!(!cache.delete("k").await);
        assert_eq!(cache.stats().retries, 4);
        assert_eq!(cache.stats().exhausted, 2);
    }
}
