//! Error types for the distributed cache tier.

/// Errors raised by a [`crate::DistributedCache`] backend.
///
/// These never reach resolution callers: [`crate::RetryingCache`] retries
/// transient failures and turns exhaustion into a miss.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Backend unreachable or no pooled connection available.
    #[error("Cache unavailable: {message}")]
    Unavailable { message: String },

    /// The operation did not complete in time.
    #[error("Cache operation timed out: {message}")]
    Timeout { message: String },

    /// A value could not be encoded or decoded.
    #[error("Cache codec error: {message}")]
    Codec { message: String },

    /// The backend rejected the command.
    #[error("Cache backend error: {message}")]
    Backend { message: String },
}

impl CacheError {
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// `true` when retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout { .. } | Self::Backend { .. }
        )
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::unavailable(err.to_string())
        } else {
            Self::backend(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        match err {
            deadpool_redis::PoolError::Timeout(_) => Self::timeout(err.to_string()),
            other => Self::unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CacheError::unavailable("down").is_transient());
        assert!(CacheError::timeout("slow").is_transient());
        assert!(!CacheError::codec("bad bytes").is_transient());
    }
}
