//! # lineage-storage
//!
//! Storage abstraction layer for the lineage hierarchy resolution engine.
//!
//! This crate defines the entity model and the traits that all storage
//! backends must implement. It does not contain any implementations - those
//! are provided by `lineage-db-memory` and `lineage-db-postgres`.
//!
//! ## Overview
//!
//! - [`PathIndexStore`] owns entity rows: lookups by id and path, path-prefix
//!   scans, the entity/answer join and all mutations.
//! - [`ViewStore`] persists [`MaterializedAnswer`] rows written by the view
//!   materializer.
//!
//! ## Example
//!
//! ```ignore
//! use lineage_storage::{EntityId, PathIndexStore, StorageError};
//!
//! async fn depth_of(store: &dyn PathIndexStore, id: &str) -> Result<u32, StorageError> {
//!     store
//!         .get_by_id(&EntityId::new(id))
//!         .await?
//!         .map(|entity| entity.depth)
//!         .ok_or_else(|| StorageError::not_found(id))
//! }
//! ```

mod error;
mod path;
mod traits;
mod types;

pub use error::{ErrorCategory, StorageError};
pub use path::{EntityPath, MAX_LABEL_LEN, PATH_SEPARATOR};
pub use traits::{PathIndexStore, ViewStore};
pub use types::{
    Entity, EntityId, JoinColumn, MaterializedAnswer, MutationKind, MutationOutcome, NewEntity,
    SourceHash, normalize_confidence,
};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Type alias for a shared path index store.
pub type DynPathIndexStore = std::sync::Arc<dyn PathIndexStore>;

/// Type alias for a shared view store.
pub type DynViewStore = std::sync::Arc<dyn ViewStore>;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use lineage_storage::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{ErrorCategory, StorageError};
    pub use crate::path::EntityPath;
    pub use crate::traits::{PathIndexStore, ViewStore};
    pub use crate::types::{
        Entity, EntityId, JoinColumn, MaterializedAnswer, MutationKind, MutationOutcome,
        NewEntity, SourceHash,
    };
    pub use crate::{DynPathIndexStore, DynViewStore, StorageResult};
}
