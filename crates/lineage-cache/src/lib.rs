//! Cache tiers for the lineage resolution engine.
//!
//! - [`LocalCache`] (L1): in-process, strict LRU, lazy TTL expiry, path index
//!   for subtree/ancestor invalidation.
//! - [`DistributedCache`] (L2): shared byte cache. [`RedisCache`] for
//!   deployments, [`InMemoryDistributedCache`] for tests and single nodes.
//! - [`RetryingCache`]: exponential backoff with jitter; exhausted retries
//!   become misses.
//! - [`AnswerCodec`]: MessagePack encoding of answers for L2.
//! - [`InvalidationListener`]: evicts local entries on messages from other
//!   instances.

mod codec;
mod distributed;
mod error;
mod listener;
mod local;
mod redis_cache;
mod retry;

pub use codec::AnswerCodec;
pub use distributed::{DistributedCache, InMemoryDistributedCache, PUBLISHED_HISTORY};
pub use error::CacheError;
pub use listener::{INVALIDATION_CHANNEL, InvalidationListener, InvalidationMessage};
pub use local::{DEFAULT_LOCAL_CAPACITY, LocalCache, LocalCacheStats};
pub use redis_cache::{RedisCache, RedisConfig, create_redis_cache};
pub use retry::{RetryPolicy, RetryStats, RetryingCache};
