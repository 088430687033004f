//! Errors surfaced to resolution callers.

use lineage_storage::{ErrorCategory, StorageError};

/// Errors returned by the resolution facade and the engine write path.
///
/// Only [`ResolveError::SchemaInvariantViolation`] and
/// [`ResolveError::CapacityExceeded`] are failures of the serving path;
/// distributed cache trouble never reaches this type.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The entity does not exist or is no longer active.
    #[error("Entity not found: {id}")]
    NotFound { id: String },

    /// The entity/answer join missed a row known to exist.
    #[error(
        "Schema invariant violated for entity {entity_id} (join column '{join_column}'): {message}"
    )]
    SchemaInvariantViolation {
        entity_id: String,
        join_column: String,
        message: String,
    },

    /// A bounded resource was saturated.
    #[error("Capacity exceeded: {message}")]
    CapacityExceeded { message: String, retryable: bool },

    /// Any other storage failure, including rejected mutations.
    #[error(transparent)]
    Storage(StorageError),
}

impl ResolveError {
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    #[must_use]
    pub fn capacity(message: impl Into<String>) -> Self {
        Self::CapacityExceeded {
            message: message.into(),
            retryable: true,
        }
    }

    /// `true` when the caller may retry the same request later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { retryable: true, .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    #[must_use]
    pub fn is_schema_violation(&self) -> bool {
        matches!(self, Self::SchemaInvariantViolation { .. })
    }

    /// Category used for logging and HTTP mapping.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::SchemaInvariantViolation { .. } => ErrorCategory::Schema,
            Self::CapacityExceeded { .. } => ErrorCategory::Capacity,
            Self::Storage(err) => err.category(),
        }
    }
}

impl From<StorageError> for ResolveError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { id } => Self::NotFound { id },
            StorageError::SchemaInvariantViolation {
                entity_id,
                join_column,
                message,
            } => Self::SchemaInvariantViolation {
                entity_id,
                join_column,
                message,
            },
            StorageError::PoolExhausted { message } => Self::CapacityExceeded {
                message,
                retryable: true,
            },
            other => Self::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ResolveError>;
