//! Computes and persists materialized hierarchy answers (L4).

use std::collections::HashMap;

use futures_util::{StreamExt, stream};
use lineage_storage::{
    DynPathIndexStore, DynViewStore, Entity, EntityId, EntityPath, MaterializedAnswer,
    SourceHash, StorageError,
};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

pub const DEFAULT_REBUILD_CONCURRENCY: usize = 8;

/// Outcome of a scoped rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebuildReport {
    /// Answers written.
    pub rebuilt: usize,
    /// Entities that disappeared between listing and rebuilding.
    pub skipped: usize,
}

/// Builds [`MaterializedAnswer`] rows from the path index.
///
/// A rebuild reads the store revision first, then the entity, its ancestors
/// and its descendant count, and writes one row. Rows are never replaced by
/// ones computed from an older revision, so concurrent rebuilds of the same
/// entity converge on the newest answer.
pub struct ViewMaterializer {
    store: DynPathIndexStore,
    views: DynViewStore,
    concurrency: usize,
}

impl ViewMaterializer {
    pub fn new(store: DynPathIndexStore, views: DynViewStore) -> Self {
        Self {
            store,
            views,
            concurrency: DEFAULT_REBUILD_CONCURRENCY,
        }
    }

    /// Bounds concurrent rebuilds inside [`Self::rebuild_all`].
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Computes the answer for an entity without persisting it.
    pub async fn compute(&self, id: &EntityId) -> Result<MaterializedAnswer, StorageError> {
        let source_hash = SourceHash(self.store.current_revision().await?);
        let entity = self
            .store
            .get_by_id(id)
            .await?
            .ok_or_else(|| StorageError::not_found(id.as_str()))?;

        let ancestors = self.ancestor_names(&entity).await?;
        let descendant_count = self.store.count_descendants(&entity.path).await?;

        Ok(MaterializedAnswer {
            entity_id: entity.id,
            path: entity.path,
            ancestors,
            descendant_count,
            computed_at: OffsetDateTime::now_utc(),
            source_hash,
        })
    }

    /// Computes and persists the answer for an entity.
    pub async fn rebuild(&self, id: &EntityId) -> Result<MaterializedAnswer, StorageError> {
        let answer = self.compute(id).await?;
        self.persist(&answer).await?;
        Ok(answer)
    }

    /// Upserts a computed answer. Returns `false` when a newer answer is
    /// already stored.
    pub async fn persist(&self, answer: &MaterializedAnswer) -> Result<bool, StorageError> {
        let written = self.views.upsert_answer(answer).await?;
        if !written {
            debug!(
                entity_id = %answer.entity_id,
                source_hash = %answer.source_hash,
                "newer materialized answer already stored"
            );
        }
        Ok(written)
    }

    /// Rebuilds every active entity at or below `scope` (all when `None`).
    ///
    /// Entities deactivated mid-run are skipped; any other failure aborts the
    /// run and is returned.
    pub async fn rebuild_all(
        &self,
        scope: Option<&EntityPath>,
    ) -> Result<RebuildReport, StorageError> {
        let ids = self.store.list_ids(scope).await?;
        let mut results = stream::iter(ids)
            .map(|id| async move { self.rebuild(&id).await })
            .buffer_unordered(self.concurrency);

        let mut report = RebuildReport::default();
        while let Some(result) = results.next().await {
            match result {
                Ok(_) => report.rebuilt += 1,
                Err(err) if err.is_not_found() => report.skipped += 1,
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    /// Removes the persisted answer of a deactivated entity.
    pub async fn remove(&self, id: &EntityId) -> Result<bool, StorageError> {
        self.views.delete_answer(id).await
    }

    /// Ancestor display names, root first. A missing ancestor row falls back
    /// to its path label so the array length always matches the depth.
    async fn ancestor_names(&self, entity: &Entity) -> Result<Vec<String>, StorageError> {
        let paths = entity.path.ancestors();
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let mut by_path: HashMap<EntityPath, String> = self
            .store
            .get_by_paths(&paths)
            .await?
            .into_iter()
            .map(|e| (e.path, e.name))
            .collect();

        Ok(paths
            .into_iter()
            .map(|path| {
                by_path.remove(&path).unwrap_or_else(|| {
                    warn!(
                        entity_id = %entity.id,
                        ancestor = %path,
                        "ancestor row missing, using path label"
                    );
                    path.leaf_label().to_string()
                })
            })
            .collect())
    }
}

impl std::fmt::Debug for ViewMaterializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewMaterializer")
            .field("backend", &self.store.backend_name())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use lineage_db_memory::InMemoryStore;
    use lineage_storage::{NewEntity, PathIndexStore, ViewStore};

    fn path(p: &str) -> EntityPath {
        EntityPath::parse(p).unwrap()
    }

    async fn seeded() -> (Arc<InMemoryStore>, ViewMaterializer) {
        let store = Arc::new(InMemoryStore::new());
        for (id, p, name) in [
            ("root", "root", "Root"),
            ("acme", "root.acme", "Acme Corp"),
            ("div-a", "root.acme.division_a", "Division A"),
            ("div-b", "root.acme.division_b", "Division B"),
        ] {
            store
                .create_entity(NewEntity::new(path(p), "organization").with_id(id).with_name(name))
                .await
                .unwrap();
        }
        let materializer = ViewMaterializer::new(store.clone(), store.clone());
        (store, materializer)
    }

    #[tokio::test]
    async fn test_compute_walks_ancestors_root_first() {
        let (_store, materializer) = seeded().await;
        let answer = materializer.compute(&EntityId::new("div-a")).await.unwrap();
        assert_eq!(answer.ancestors, vec!["Root", "Acme Corp"]);
        assert_eq!(answer.descendant_count, 0);

        let answer = materializer.compute(&EntityId::new("acme")).await.unwrap();
        assert_eq!(answer.ancestors, vec!["Root"]);
        assert_eq!(answer.descendant_count, 2);

        let answer = materializer.compute(&EntityId::new("root")).await.unwrap();
        assert!(answer.ancestors.is_empty());
        assert_eq!(answer.descendant_count, 3);
    }

    #[tokio::test]
    async fn test_rebuild_persists_row() {
        let (store, materializer) = seeded().await;
        let id = EntityId::new("acme");
        let answer = materializer.rebuild(&id).await.unwrap();

        let stored = store.get_answer(&id).await.unwrap().unwrap();
        assert_eq!(stored, answer);
        let joined = store.get_ancestors_by_join(&id).await.unwrap().unwrap();
        assert_eq!(joined.ancestors, answer.ancestors);
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let (_store, materializer) = seeded().await;
        let id = EntityId::new("div-b");
        let first = materializer.rebuild(&id).await.unwrap();
        let second = materializer.rebuild(&id).await.unwrap();
        assert_eq!(first.ancestors, second.ancestors);
        assert_eq!(first.descendant_count, second.descendant_count);
        assert_eq!(first.source_hash, second.source_hash);
    }

    #[tokio::test]
    async fn test_concurrent_rebuilds_converge() {
        let (store, materializer) = seeded().await;
        let materializer = Arc::new(materializer);
        let id = EntityId::new("acme");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let m = materializer.clone();
                let id = id.clone();
                tokio::spawn(async move { m.rebuild(&id).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = store.get_answer(&id).await.unwrap().unwrap();
        assert_eq!(stored.ancestors, vec!["Root"]);
        assert_eq!(stored.descendant_count, 2);
    }

    #[tokio::test]
    async fn test_rebuild_all_scoped() {
        let (store, materializer) = seeded().await;
        let report = materializer
            .rebuild_all(Some(&path("root.acme")))
            .await
            .unwrap();
        assert_eq!(report.rebuilt, 3);
        assert!(store.get_answer(&EntityId::new("root")).await.unwrap().is_none());

        let report = materializer.rebuild_all(None).await.unwrap();
        assert_eq!(report.rebuilt, 4);
    }

    #[tokio::test]
    async fn test_unknown_entity_is_not_found() {
        let (_store, materializer) = seeded().await;
        let err = materializer
            .rebuild(&EntityId::new("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_deletes_row() {
        let (store, materializer) = seeded().await;
        let id = EntityId::new("div-a");
        materializer.rebuild(&id).await.unwrap();
        assert!(materializer.remove(&id).await.unwrap());
        assert!(store.get_answer(&id).await.unwrap().is_none());
        assert!(!materializer.remove(&id).await.unwrap());
    }
}
