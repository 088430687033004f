//! Storage traits for the hierarchy storage abstraction layer.
//!
//! This module defines the contracts that all storage backends must implement.

use async_trait::async_trait;

use crate::error::StorageError;
use crate::path::EntityPath;
use crate::types::{Entity, EntityId, JoinColumn, MaterializedAnswer, MutationOutcome, NewEntity};

/// The durable source of truth for entities.
///
/// The store is the only writer of entity rows. Every write bumps the global
/// revision and stamps it on every entity whose answer changed: the entity,
/// its ancestors (descendant counts) and, for renames and moves, its
/// descendants (ancestor arrays). Implementations must be thread-safe.
///
/// # Example
///
/// ```ignore
/// use lineage_storage::{EntityPath, PathIndexStore, StorageError};
///
/// async fn children(store: &dyn PathIndexStore, path: &str) -> Result<usize, StorageError> {
///     let prefix = EntityPath::parse(path)?;
///     Ok(store.query_by_path_prefix(&prefix).await?.len())
/// }
/// ```
#[async_trait]
pub trait PathIndexStore: Send + Sync {
    // ==================== Lookups ====================

    /// Reads an active entity by identity.
    ///
    /// Returns `None` if the entity does not exist or was deactivated.
    async fn get_by_id(&self, id: &EntityId) -> Result<Option<Entity>, StorageError>;

    /// Reads an active entity by its path.
    async fn get_by_path(&self, path: &EntityPath) -> Result<Option<Entity>, StorageError>;

    /// Reads the active entities at the given paths. Missing paths are skipped;
    /// the result order is unspecified.
    async fn get_by_paths(&self, paths: &[EntityPath]) -> Result<Vec<Entity>, StorageError>;

    /// Returns every active strict descendant of `prefix`, ordered by path.
    async fn query_by_path_prefix(&self, prefix: &EntityPath)
    -> Result<Vec<Entity>, StorageError>;

    /// Counts active strict descendants of `prefix`.
    async fn count_descendants(&self, prefix: &EntityPath) -> Result<u64, StorageError>;

    /// Lists active entity ids at or below `scope`, or all of them.
    async fn list_ids(&self, scope: Option<&EntityPath>) -> Result<Vec<EntityId>, StorageError>;

    /// Joins an entity with its materialized answer on [`Self::join_column`].
    ///
    /// Returns `None` when no materialized row exists or the row predates the
    /// entity's revision. Returns `StorageError::SchemaInvariantViolation`
    /// when a row for the entity exists but the join did not match it.
    async fn get_ancestors_by_join(
        &self,
        id: &EntityId,
    ) -> Result<Option<MaterializedAnswer>, StorageError>;

    /// The latest revision assigned by any write.
    async fn current_revision(&self) -> Result<u64, StorageError>;

    // ==================== Mutations ====================

    /// Creates an entity under an existing active parent.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the id or path is taken.
    /// Returns `StorageError::OrphanedPath` if the parent path is not active.
    async fn create_entity(&self, entity: NewEntity) -> Result<MutationOutcome, StorageError>;

    /// Changes the display name of an entity.
    async fn rename_entity(
        &self,
        id: &EntityId,
        name: &str,
    ) -> Result<MutationOutcome, StorageError>;

    /// Moves an entity and its subtree under `new_parent`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidPath` when moving under its own subtree.
    async fn move_entity(
        &self,
        id: &EntityId,
        new_parent: &EntityPath,
    ) -> Result<MutationOutcome, StorageError>;

    /// Deactivates a leaf entity.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::HasActiveDescendants` while active children exist.
    async fn deactivate_entity(&self, id: &EntityId) -> Result<MutationOutcome, StorageError>;

    /// Sets or clears the confidence score.
    async fn set_confidence(
        &self,
        id: &EntityId,
        confidence: Option<f64>,
    ) -> Result<MutationOutcome, StorageError>;

    // ==================== Metadata ====================

    /// Column used by [`Self::get_ancestors_by_join`].
    fn join_column(&self) -> &JoinColumn;

    /// Returns the name of the storage backend.
    fn backend_name(&self) -> &'static str;
}

/// Persistence for materialized answers, kept alongside the primary store.
#[async_trait]
pub trait ViewStore: Send + Sync {
    /// Writes an answer row, keyed by entity id.
    ///
    /// Last writer wins, except that a row is never replaced by one with an
    /// older source hash. Returns `false` when the write was skipped.
    async fn upsert_answer(&self, answer: &MaterializedAnswer) -> Result<bool, StorageError>;

    /// Deletes the row for an entity. Returns `true` when a row existed.
    async fn delete_answer(&self, id: &EntityId) -> Result<bool, StorageError>;

    /// Reads a row directly by entity id, without joining.
    async fn get_answer(&self, id: &EntityId) -> Result<Option<MaterializedAnswer>, StorageError>;
}
