//! Cascading invalidation after entity mutations.
//!
//! Order matters: the local cache is evicted synchronously before anything
//! awaits, so a caller that mutates and then resolves in the same process
//! never sees the old answer. Distributed deletes and pub/sub messages are
//! best effort; view change counters are bumped last.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lineage_cache::{InvalidationMessage, LocalCache, RetryingCache};
use lineage_storage::{DynPathIndexStore, EntityId, EntityPath, MutationOutcome};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::scheduler::ViewRegistry;

/// What an invalidation touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReport {
    pub local_evicted: usize,
    pub distributed_deleted: usize,
    pub views_touched: usize,
}

#[derive(Debug, Clone, Copy)]
struct MutationMark {
    revision: u64,
    recorded_at: Instant,
}

/// Drives the L1 -> L2 -> change-counter cascade.
///
/// It also remembers the latest mutation revision per affected entity for
/// `retention` (the longest cache TTL), so answers computed before that
/// mutation can be recognised on any tier.
pub struct InvalidationCoordinator {
    local: Arc<LocalCache>,
    distributed: Option<Arc<RetryingCache>>,
    store: DynPathIndexStore,
    views: Arc<ViewRegistry>,
    latest: DashMap<EntityId, MutationMark>,
    retention: Duration,
}

impl InvalidationCoordinator {
    pub fn new(
        local: Arc<LocalCache>,
        distributed: Option<Arc<RetryingCache>>,
        store: DynPathIndexStore,
        views: Arc<ViewRegistry>,
        retention: Duration,
    ) -> Self {
        Self {
            local,
            distributed,
            store,
            views,
            latest: DashMap::new(),
            retention,
        }
    }

    /// Latest known mutation revision affecting `id`'s answer.
    pub fn latest_mutation(&self, id: &EntityId) -> Option<u64> {
        self.latest.get(id).map(|mark| mark.revision)
    }

    /// Invalidates after a write made through the engine.
    pub async fn on_mutation(&self, outcome: &MutationOutcome) -> InvalidationReport {
        self.on_entity_mutated(
            &outcome.entity.id,
            &outcome.affected_prefixes,
            Some(outcome.revision),
            outcome.kind.affects_descendants(),
        )
        .await
    }

    /// Invalidates after a write made outside the engine.
    ///
    /// The mutation revision is unknown, so the store's current revision is
    /// used, and descendants are always included.
    pub async fn invalidate(
        &self,
        id: &EntityId,
        affected_prefixes: &[EntityPath],
    ) -> InvalidationReport {
        let revision = match self.store.current_revision().await {
            Ok(revision) => Some(revision),
            Err(err) => {
                warn!(entity_id = %id, error = %err, "could not read store revision");
                None
            }
        };
        self.on_entity_mutated(id, affected_prefixes, revision, true)
            .await
    }

    /// Runs the cascade for one mutation.
    pub async fn on_entity_mutated(
        &self,
        id: &EntityId,
        affected_prefixes: &[EntityPath],
        revision: Option<u64>,
        include_descendants: bool,
    ) -> InvalidationReport {
        let mut report = InvalidationReport::default();

        // L1, before any await
        report.local_evicted += usize::from(self.local.invalidate(id));
        for prefix in affected_prefixes {
            report.local_evicted += self.local.invalidate_related(prefix);
        }
        if let Some(revision) = revision {
            self.mark(id, revision);
        }

        // Ids whose answers depend on the mutation, resolved through the store
        let dependents = self
            .dependent_ids(id, affected_prefixes, include_descendants)
            .await;
        if let Some(revision) = revision {
            for dependent in &dependents {
                self.mark(dependent, revision);
            }
        }

        // L2
        if let Some(distributed) = &self.distributed {
            for key in std::iter::once(id).chain(dependents.iter()) {
                if distributed.delete(key.as_str()).await {
                    report.distributed_deleted += 1;
                }
            }
            distributed
                .publish(&InvalidationMessage::Key(id.clone()))
                .await;
            for prefix in affected_prefixes {
                distributed
                    .publish(&InvalidationMessage::Prefix(prefix.clone()))
                    .await;
            }
        }

        // View change counters
        report.views_touched = self.views.record_mutation(affected_prefixes);

        debug!(
            entity_id = %id,
            prefixes = affected_prefixes.len(),
            local_evicted = report.local_evicted,
            distributed_deleted = report.distributed_deleted,
            views_touched = report.views_touched,
            "invalidation cascade finished"
        );
        report
    }

    /// Drops mutation marks older than the retention window.
    pub fn prune(&self) -> usize {
        let before = self.latest.len();
        let retention = self.retention;
        self.latest
            .retain(|_, mark| mark.recorded_at.elapsed() < retention);
        before.saturating_sub(self.latest.len())
    }

    pub fn tracked_mutations(&self) -> usize {
        self.latest.len()
    }

    fn mark(&self, id: &EntityId, revision: u64) {
        let now = Instant::now();
        self.latest
            .entry(id.clone())
            .and_modify(|mark| {
                mark.revision = mark.revision.max(revision);
                mark.recorded_at = now;
            })
            .or_insert(MutationMark {
                revision,
                recorded_at: now,
            });
    }

    /// Ancestors of every affected prefix (their descendant counts changed),
    /// the entities at the prefixes and, when requested, their descendants
    /// (their ancestor arrays changed). Lookup failures shrink the set to
    /// what could be resolved.
    async fn dependent_ids(
        &self,
        id: &EntityId,
        prefixes: &[EntityPath],
        include_descendants: bool,
    ) -> BTreeSet<EntityId> {
        let mut paths: BTreeSet<EntityPath> = BTreeSet::new();
        for prefix in prefixes {
            paths.extend(prefix.ancestors());
            paths.insert(prefix.clone());
        }

        let mut ids = BTreeSet::new();
        if !paths.is_empty() {
            let paths: Vec<EntityPath> = paths.into_iter().collect();
            match self.store.get_by_paths(&paths).await {
                Ok(entities) => ids.extend(entities.into_iter().map(|e| e.id)),
                Err(err) => warn!(
                    entity_id = %id,
                    error = %err,
                    "could not resolve ancestors for invalidation"
                ),
            }
        }

        if include_descendants {
            for prefix in prefixes {
                match self.store.query_by_path_prefix(prefix).await {
                    Ok(entities) => ids.extend(entities.into_iter().map(|e| e.id)),
                    Err(err) => warn!(
                        entity_id = %id,
                        prefix = %prefix,
                        error = %err,
                        "could not resolve descendants for invalidation"
                    ),
                }
            }
        }

        ids.remove(id);
        ids
    }
}

impl std::fmt::Debug for InvalidationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationCoordinator")
            .field("distributed", &self.distributed.is_some())
            .field("views", &self.views.len())
            .field("tracked_mutations", &self.latest.len())
            .field("retention", &self.retention)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_cache::{DistributedCache, InMemoryDistributedCache, RetryPolicy};
    use lineage_db_memory::InMemoryStore;
    use lineage_storage::{MaterializedAnswer, NewEntity, PathIndexStore, SourceHash};
    use time::OffsetDateTime;

    use crate::scheduler::ViewConfig;

    fn path(p: &str) -> EntityPath {
        EntityPath::parse(p).unwrap()
    }

    fn answer(id: &str, p: &str) -> Arc<MaterializedAnswer> {
        Arc::new(MaterializedAnswer {
            entity_id: EntityId::new(id),
            path: path(p),
            ancestors: Vec::new(),
            descendant_count: 0,
            computed_at: OffsetDateTime::now_utc(),
            source_hash: SourceHash(1),
        })
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        local: Arc<LocalCache>,
        remote: Arc<InMemoryDistributedCache>,
        views: Arc<ViewRegistry>,
        coordinator: InvalidationCoordinator,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        for (id, p) in [
            ("root", "root"),
            ("acme", "root.acme"),
            ("div-a", "root.acme.division_a"),
            ("team-1", "root.acme.division_a.team_1"),
            ("globex", "root.globex"),
        ] {
            store
                .create_entity(NewEntity::new(path(p), "organization").with_id(id))
                .await
                .unwrap();
        }
        let local = Arc::new(LocalCache::new(100, Duration::from_secs(60)));
        let remote = Arc::new(InMemoryDistributedCache::new());
        let views = Arc::new(ViewRegistry::new([
            ViewConfig::new("acme").with_scope(path("root.acme")),
            ViewConfig::new("globex").with_scope(path("root.globex")),
        ]));
        let coordinator = InvalidationCoordinator::new(
            local.clone(),
            Some(Arc::new(RetryingCache::new(
                remote.clone(),
                RetryPolicy::no_retry(),
            ))),
            store.clone(),
            views.clone(),
            Duration::from_secs(300),
        );
        Fixture {
            store,
            local,
            remote,
            views,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_cascade_evicts_related_local_entries() {
        let f = fixture().await;
        f.local.put_default(answer("acme", "root.acme"));
        f.local.put_default(answer("div-a", "root.acme.division_a"));
        f.local.put_default(answer("team-1", "root.acme.division_a.team_1"));
        f.local.put_default(answer("globex", "root.globex"));

        let report = f
            .coordinator
            .on_entity_mutated(
                &EntityId::new("div-a"),
                &[path("root.acme.division_a")],
                Some(42),
                true,
            )
            .await;

        assert_eq!(report.local_evicted, 3);
        assert!(f.local.get(&EntityId::new("globex")).is_some());
        assert_eq!(f.views.get("acme").unwrap().pending_changes(), 1);
        assert_eq!(f.views.get("globex").unwrap().pending_changes(), 0);
        assert_eq!(report.views_touched, 1);
    }

    #[tokio::test]
    async fn test_distributed_deletes_cover_ancestors_and_descendants() {
        let f = fixture().await;
        for key in ["root", "acme", "div-a", "team-1", "globex"] {
            f.remote
                .set(key, b"x", Duration::from_secs(60))
                .await
                .unwrap();
        }

        f.coordinator
            .on_entity_mutated(
                &EntityId::new("div-a"),
                &[path("root.acme.division_a")],
                Some(42),
                true,
            )
            .await;

        for key in ["root", "acme", "div-a", "team-1"] {
            assert!(!f.remote.contains(key), "{key} should be deleted");
        }
        assert!(f.remote.contains("globex"));
        let published = f.remote.published();
        assert!(published.contains(&InvalidationMessage::Key(EntityId::new("div-a"))));
        assert!(published.contains(&InvalidationMessage::Prefix(path("root.acme.division_a"))));
    }

    #[tokio::test]
    async fn test_descendants_skipped_when_not_requested() {
        let f = fixture().await;
        f.remote
            .set("team-1", b"x", Duration::from_secs(60))
            .await
            .unwrap();
        f.coordinator
            .on_entity_mutated(
                &EntityId::new("div-a"),
                &[path("root.acme.division_a")],
                Some(7),
                false,
            )
            .await;
        assert!(f.remote.contains("team-1"));
        assert_eq!(f.coordinator.latest_mutation(&EntityId::new("acme")), Some(7));
        assert_eq!(f.coordinator.latest_mutation(&EntityId::new("team-1")), None);
    }

    #[tokio::test]
    async fn test_unreachable_distributed_tier_is_absorbed() {
        let f = fixture().await;
        f.remote.set_unreachable(true);
        f.local.put_default(answer("acme", "root.acme"));

        let report = f
            .coordinator
            .on_entity_mutated(&EntityId::new("acme"), &[path("root.acme")], Some(3), false)
            .await;
        assert_eq!(report.local_evicted, 1);
        assert_eq!(report.distributed_deleted, 0);
        assert_eq!(f.views.get("acme").unwrap().pending_changes(), 1);
    }

    #[tokio::test]
    async fn test_latest_mutation_keeps_maximum() {
        let f = fixture().await;
        let id = EntityId::new("globex");
        f.coordinator
            .on_entity_mutated(&id, &[path("root.globex")], Some(9), false)
            .await;
        f.coordinator
            .on_entity_mutated(&id, &[path("root.globex")], Some(4), false)
            .await;
        assert_eq!(f.coordinator.latest_mutation(&id), Some(9));
    }

    #[tokio::test]
    async fn test_external_invalidate_uses_store_revision() {
        let f = fixture().await;
        let revision = f.store.current_revision().await.unwrap();
        f.coordinator
            .invalidate(&EntityId::new("team-1"), &[path("root.acme.division_a.team_1")])
            .await;
        assert_eq!(
            f.coordinator.latest_mutation(&EntityId::new("team-1")),
            Some(revision)
        );
        assert_eq!(
            f.coordinator.latest_mutation(&EntityId::new("root")),
            Some(revision)
        );
    }

    #[tokio::test]
    async fn test_prune_drops_old_marks() {
        let f = fixture().await;
        let coordinator = InvalidationCoordinator::new(
            f.local.clone(),
            None,
            f.store.clone(),
            f.views.clone(),
            Duration::ZERO,
        );
        coordinator
            .on_entity_mutated(&EntityId::new("globex"), &[path("root.globex")], Some(1), false)
            .await;
        // globex and its ancestor root
        assert_eq!(coordinator.tracked_mutations(), 2);
        assert_eq!(coordinator.prune(), 2);
        assert_eq!(coordinator.tracked_mutations(), 0);
    }
}
