//! Storage error types for the hierarchy storage abstraction layer.
//!
//! This module defines all error types that can occur during storage operations.

use std::fmt;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested entity was not found (or is no longer active).
    #[error("Entity not found: {id}")]
    NotFound {
        /// The identity that was looked up.
        id: String,
    },

    /// Attempted to create an entity whose id or path already exists.
    #[error("Entity already exists: {what}")]
    AlreadyExists {
        /// The conflicting id or path.
        what: String,
    },

    /// A hierarchy path failed validation.
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending path text.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The entity data is invalid.
    #[error("Invalid entity: {message}")]
    InvalidEntity {
        /// Description of why the entity is invalid.
        message: String,
    },

    /// The parent of a path is not an existing active entity.
    #[error("Orphaned path '{path}': parent '{parent}' is not an active entity")]
    OrphanedPath {
        /// The path being written.
        path: String,
        /// The missing parent path.
        parent: String,
    },

    /// The entity cannot be deactivated while active children exist.
    #[error("Entity {id} still has {count} active descendant(s)")]
    HasActiveDescendants {
        /// The entity being deactivated.
        id: String,
        /// Number of active descendants found.
        count: u64,
    },

    /// A join between entities and materialized answers failed to match
    /// a row that is known to exist.
    #[error(
        "Schema invariant violated for entity {entity_id} (join column '{join_column}'): {message}"
    )]
    SchemaInvariantViolation {
        /// Entity whose join failed.
        entity_id: String,
        /// Column the join was performed on.
        join_column: String,
        /// Description of the mismatch.
        message: String,
    },

    /// No connection could be acquired from the pool in time.
    #[error("Connection pool exhausted: {message}")]
    PoolExhausted {
        /// Description of the saturation.
        message: String,
    },

    /// Failed to connect to the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(what: impl Into<String>) -> Self {
        Self::AlreadyExists { what: what.into() }
    }

    /// Creates a new `InvalidPath` error.
    #[must_use]
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new `InvalidEntity` error.
    #[must_use]
    pub fn invalid_entity(message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            message: message.into(),
        }
    }

    /// Creates a new `OrphanedPath` error.
    #[must_use]
    pub fn orphaned_path(path: impl Into<String>, parent: impl Into<String>) -> Self {
        Self::OrphanedPath {
            path: path.into(),
            parent: parent.into(),
        }
    }

    /// Creates a new `HasActiveDescendants` error.
    #[must_use]
    pub fn has_active_descendants(id: impl Into<String>, count: u64) -> Self {
        Self::HasActiveDescendants {
            id: id.into(),
            count,
        }
    }

    /// Creates a new `SchemaInvariantViolation` error.
    #[must_use]
    pub fn schema_violation(
        entity_id: impl Into<String>,
        join_column: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::SchemaInvariantViolation {
            entity_id: entity_id.into(),
            join_column: join_column.into(),
            message: message.into(),
        }
    }

    /// Creates a new `PoolExhausted` error.
    #[must_use]
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is a schema invariant violation.
    #[must_use]
    pub fn is_schema_violation(&self) -> bool {
        matches!(self, Self::SchemaInvariantViolation { .. })
    }

    /// Returns `true` if the pool was saturated.
    #[must_use]
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists { .. } | Self::HasActiveDescendants { .. } => {
                ErrorCategory::Conflict
            }
            Self::InvalidPath { .. } | Self::InvalidEntity { .. } | Self::OrphanedPath { .. } => {
                ErrorCategory::Validation
            }
            Self::SchemaInvariantViolation { .. } => ErrorCategory::Schema,
            Self::PoolExhausted { .. } => ErrorCategory::Capacity,
            Self::ConnectionError { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Entity not found.
    NotFound,
    /// Conflict (existence or descendants).
    Conflict,
    /// Validation error.
    Validation,
    /// Join/schema mismatch.
    Schema,
    /// Pool saturation.
    Capacity,
    /// Infrastructure/connection error.
    Infrastructure,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Validation => write!(f, "validation"),
            Self::Schema => write!(f, "schema"),
            Self::Capacity => write!(f, "capacity"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::not_found("e-1");
        assert_eq!(err.to_string(), "Entity not found: e-1");

        let err = StorageError::orphaned_path("root.a.b", "root.a");
        assert_eq!(
            err.to_string(),
            "Orphaned path 'root.a.b': parent 'root.a' is not an active entity"
        );
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            StorageError::not_found("x").category(),
            ErrorCategory::NotFound
        );
        assert_eq!(
            StorageError::schema_violation("x", "row_id", "no match").category(),
            ErrorCategory::Schema
        );
        assert_eq!(
            StorageError::pool_exhausted("timeout").category(),
            ErrorCategory::Capacity
        );
        assert_eq!(
            StorageError::has_active_descendants("x", 2).category(),
            ErrorCategory::Conflict
        );
    }

    #[test]
    fn test_predicates() {
        assert!(StorageError::not_found("x").is_not_found());
        assert!(StorageError::schema_violation("x", "c", "m").is_schema_violation());
        assert!(StorageError::pool_exhausted("m").is_pool_exhausted());
        assert!(!StorageError::internal("m").is_pool_exhausted());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Schema.to_string(), "schema");
        assert_eq!(ErrorCategory::Capacity.to_string(), "capacity");
    }
}
