use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lineage_storage::{
    Entity, EntityId, EntityPath, JoinColumn, MaterializedAnswer, MutationKind, MutationOutcome,
    NewEntity, PATH_SEPARATOR, PathIndexStore, StorageError, normalize_confidence,
};
use parking_lot::RwLock;
use time::OffsetDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A materialized answer row with its surrogate key.
#[derive(Debug, Clone)]
pub(crate) struct AnswerRow {
    pub(crate) row_id: u64,
    pub(crate) answer: MaterializedAnswer,
}

/// Entity and answer tables guarded by a single lock.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    /// All entities ever created, including deactivated ones.
    pub(crate) entities: HashMap<EntityId, Entity>,
    /// Active entities by path; ordered so prefix scans are range queries.
    pub(crate) by_path: BTreeMap<String, EntityId>,
    /// Materialized answers keyed by entity id.
    pub(crate) answers: HashMap<EntityId, AnswerRow>,
}

impl Tables {
    fn active(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id).filter(|e| e.active)
    }

    fn active_by_path(&self, path: &EntityPath) -> Option<&Entity> {
        self.by_path
            .get(path.as_str())
            .and_then(|id| self.entities.get(id))
    }

    /// Ids of active strict descendants of `prefix`, in path order.
    fn descendant_ids(&self, prefix: &EntityPath) -> Vec<EntityId> {
        // '/' sorts immediately after the separator
        let start = format!("{prefix}{PATH_SEPARATOR}");
        let end = format!("{prefix}/");
        self.by_path
            .range(start..end)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn touch(&mut self, id: &EntityId, revision: u64, now: OffsetDateTime) {
        if let Some(entity) = self.entities.get_mut(id) {
            entity.revision = revision;
            entity.updated_at = now;
        }
    }

    fn touch_ancestors(&mut self, path: &EntityPath, revision: u64, now: OffsetDateTime) {
        let ids: Vec<EntityId> = path
            .ancestors()
            .iter()
            .filter_map(|p| self.by_path.get(p.as_str()).cloned())
            .collect();
        for id in ids {
            self.touch(&id, revision, now);
        }
    }

    fn touch_descendants(&mut self, path: &EntityPath, revision: u64, now: OffsetDateTime) {
        for id in self.descendant_ids(path) {
            self.touch(&id, revision, now);
        }
    }
}

/// In-memory implementation of [`PathIndexStore`] and
/// [`lineage_storage::ViewStore`].
///
/// Entity rows and answer rows share one `RwLock`; every critical section is
/// synchronous and short. Optionally simulates a bounded connection pool and
/// per-call I/O latency so capacity and tier-latency behaviour can be
/// exercised without a database.
#[derive(Debug)]
pub struct InMemoryStore {
    pub(crate) tables: RwLock<Tables>,
    revision: AtomicU64,
    pub(crate) next_row_id: AtomicU64,
    join_column: JoinColumn,
    pool: Option<Arc<Semaphore>>,
    acquire_timeout: Duration,
    latency: Option<Duration>,
    view_writes_failing: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Creates an empty store joining on the identity column.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            revision: AtomicU64::new(0),
            next_row_id: AtomicU64::new(1),
            join_column: JoinColumn::entity_id(),
            pool: None,
            acquire_timeout: Duration::from_millis(500),
            latency: None,
            view_writes_failing: AtomicBool::new(false),
        }
    }

    /// Joins answers on a different column.
    ///
    /// `entity_id` matches the identity column; `row_id` compares the
    /// surrogate row key; anything else never matches.
    #[must_use]
    pub fn with_join_column(mut self, column: JoinColumn) -> Self {
        self.join_column = column;
        self
    }

    /// Bounds concurrent calls as a connection pool would.
    #[must_use]
    pub fn with_pool_limit(mut self, connections: usize, acquire_timeout: Duration) -> Self {
        self.pool = Some(Arc::new(Semaphore::new(connections)));
        self.acquire_timeout = acquire_timeout;
        self
    }

    /// Adds a fixed delay to every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes answer upserts fail until reset. Reads are unaffected.
    pub fn fail_view_writes(&self, failing: bool) {
        self.view_writes_failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn view_writes_failing(&self) -> bool {
        self.view_writes_failing.load(Ordering::SeqCst)
    }

    /// The simulated pool, if one is configured.
    pub fn pool_handle(&self) -> Option<Arc<Semaphore>> {
        self.pool.clone()
    }

    /// Number of active entities.
    pub fn active_count(&self) -> usize {
        self.tables.read().by_path.len()
    }

    /// Waits for a simulated connection and latency.
    pub(crate) async fn checkout(&self) -> Result<Option<OwnedSemaphorePermit>, StorageError> {
        let permit = match &self.pool {
            Some(pool) => {
                match tokio::time::timeout(self.acquire_timeout, pool.clone().acquire_owned())
                    .await
                {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => return Err(StorageError::connection_error("pool closed")),
                    Err(_) => {
                        return Err(StorageError::pool_exhausted(format!(
                            "no connection available within {:?}",
                            self.acquire_timeout
                        )));
                    }
                }
            }
            None => None,
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        Ok(permit)
    }

    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn require_active(tables: &Tables, id: &EntityId) -> Result<Entity, StorageError> {
        tables
            .active(id)
            .cloned()
            .ok_or_else(|| StorageError::not_found(id.as_str()))
    }

    fn require_parent(tables: &Tables, path: &EntityPath) -> Result<(), StorageError> {
        if let Some(parent) = path.parent()
            && tables.active_by_path(&parent).is_none()
        {
            return Err(StorageError::orphaned_path(path.as_str(), parent.as_str()));
        }
        Ok(())
    }
}

#[async_trait]
impl PathIndexStore for InMemoryStore {
    async fn get_by_id(&self, id: &EntityId) -> Result<Option<Entity>, StorageError> {
        let _conn = self.checkout().await?;
        Ok(self.tables.read().active(id).cloned())
    }

    async fn get_by_path(&self, path: &EntityPath) -> Result<Option<Entity>, StorageError> {
        let _conn = self.checkout().await?;
        Ok(self.tables.read().active_by_path(path).cloned())
    }

    async fn get_by_paths(&self, paths: &[EntityPath]) -> Result<Vec<Entity>, StorageError> {
        let _conn = self.checkout().await?;
        let tables = self.tables.read();
        Ok(paths
            .iter()
            .filter_map(|p| tables.active_by_path(p).cloned())
            .collect())
    }

    async fn query_by_path_prefix(
        &self,
        prefix: &EntityPath,
    ) -> Result<Vec<Entity>, StorageError> {
        let _conn = self.checkout().await?;
        let tables = self.tables.read();
        Ok(tables
            .descendant_ids(prefix)
            .iter()
            .filter_map(|id| tables.entities.get(id).cloned())
            .collect())
    }

    async fn count_descendants(&self, prefix: &EntityPath) -> Result<u64, StorageError> {
        let _conn = self.checkout().await?;
        Ok(self.tables.read().descendant_ids(prefix).len() as u64)
    }

    async fn list_ids(&self, scope: Option<&EntityPath>) -> Result<Vec<EntityId>, StorageError> {
        let _conn = self.checkout().await?;
        let tables = self.tables.read();
        Ok(match scope {
            Some(scope) => {
                let mut ids: Vec<EntityId> = tables
                    .active_by_path(scope)
                    .map(|e| e.id.clone())
                    .into_iter()
                    .collect();
                ids.extend(tables.descendant_ids(scope));
                ids
            }
            None => tables.by_path.values().cloned().collect(),
        })
    }

    async fn get_ancestors_by_join(
        &self,
        id: &EntityId,
    ) -> Result<Option<MaterializedAnswer>, StorageError> {
        let _conn = self.checkout().await?;
        let tables = self.tables.read();
        let Some(entity) = tables.active(id) else {
            return Ok(None);
        };

        let joined = match self.join_column.as_str() {
            JoinColumn::ENTITY_ID => tables.answers.get(&entity.id),
            "row_id" => tables
                .answers
                .values()
                .find(|row| row.row_id.to_string() == entity.id.as_str()),
            _ => None,
        };

        match joined {
            Some(row) => {
                if row.answer.source_hash.predates(entity.revision) {
                    return Ok(None);
                }
                let mut answer = row.answer.clone();
                answer.path = entity.path.clone();
                Ok(Some(answer))
            }
            None if tables.answers.contains_key(&entity.id) => {
                tracing::error!(
                    entity_id = %entity.id,
                    join_column = %self.join_column,
                    "materialized row exists but entity join returned no match"
                );
                Err(StorageError::schema_violation(
                    entity.id.as_str(),
                    self.join_column.as_str(),
                    "materialized row exists but the join returned no match",
                ))
            }
            None => Ok(None),
        }
    }

    async fn current_revision(&self) -> Result<u64, StorageError> {
        let _conn = self.checkout().await?;
        Ok(self.revision.load(Ordering::SeqCst))
    }

    async fn create_entity(&self, new: NewEntity) -> Result<MutationOutcome, StorageError> {
        let _conn = self.checkout().await?;
        if new.name.trim().is_empty() {
            return Err(StorageError::invalid_entity("name must not be empty"));
        }
        let confidence = normalize_confidence(new.confidence)?;
        let id = new
            .id
            .unwrap_or_else(|| EntityId::new(uuid::Uuid::new_v4().to_string()));

        let mut tables = self.tables.write();
        if tables.entities.contains_key(&id) {
            return Err(StorageError::already_exists(id.as_str()));
        }
        if tables.active_by_path(&new.path).is_some() {
            return Err(StorageError::already_exists(new.path.as_str()));
        }
        Self::require_parent(&tables, &new.path)?;

        let revision = self.next_revision();
        let now = OffsetDateTime::now_utc();
        let mut entity = Entity {
            id: id.clone(),
            name: new.name,
            entity_type: new.entity_type,
            depth: 0,
            content_hash: String::new(),
            path: new.path.clone(),
            confidence,
            active: true,
            revision,
            created_at: now,
            updated_at: now,
        };
        entity.refresh_derived();

        tables.by_path.insert(new.path.as_str().to_string(), id.clone());
        tables.entities.insert(id, entity.clone());
        tables.touch_ancestors(&new.path, revision, now);

        Ok(MutationOutcome {
            affected_prefixes: vec![entity.path.clone()],
            entity,
            kind: MutationKind::Created,
            revision,
        })
    }

    async fn rename_entity(
        &self,
        id: &EntityId,
        name: &str,
    ) -> Result<MutationOutcome, StorageError> {
        let _conn = self.checkout().await?;
        if name.trim().is_empty() {
            return Err(StorageError::invalid_entity("name must not be empty"));
        }
        let mut tables = self.tables.write();
        let current = Self::require_active(&tables, id)?;

        let revision = self.next_revision();
        let now = OffsetDateTime::now_utc();
        let entity = {
            let entity = tables
                .entities
                .get_mut(id)
                .ok_or_else(|| StorageError::not_found(id.as_str()))?;
            entity.name = name.to_string();
            entity.refresh_derived();
            entity.revision = revision;
            entity.updated_at = now;
            entity.clone()
        };
        tables.touch_descendants(&current.path, revision, now);

        Ok(MutationOutcome {
            affected_prefixes: vec![entity.path.clone()],
            entity,
            kind: MutationKind::Renamed,
            revision,
        })
    }

    async fn move_entity(
        &self,
        id: &EntityId,
        new_parent: &EntityPath,
    ) -> Result<MutationOutcome, StorageError> {
        let _conn = self.checkout().await?;
        let mut guard = self.tables.write();
        let tables = &mut *guard;
        let current = Self::require_active(tables, id)?;
        let old_path = current.path.clone();

        if old_path.is_prefix_of(new_parent) {
            return Err(StorageError::invalid_path(
                new_parent.as_str(),
                format!("cannot move '{old_path}' under its own subtree"),
            ));
        }
        if tables.active_by_path(new_parent).is_none() {
            return Err(StorageError::orphaned_path(
                old_path.as_str(),
                new_parent.as_str(),
            ));
        }
        let new_path = new_parent.child(old_path.leaf_label())?;
        if tables.active_by_path(&new_path).is_some() {
            return Err(StorageError::already_exists(new_path.as_str()));
        }

        let revision = self.next_revision();
        let now = OffsetDateTime::now_utc();
        tables.touch_ancestors(&old_path, revision, now);

        let mut subtree = vec![id.clone()];
        subtree.extend(tables.descendant_ids(&old_path));
        for member in &subtree {
            let Some(entity) = tables.entities.get_mut(member) else {
                continue;
            };
            let Some(rebased) = entity.path.rebase(&old_path, &new_path) else {
                continue;
            };
            let previous = std::mem::replace(&mut entity.path, rebased.clone());
            entity.refresh_derived();
            entity.revision = revision;
            entity.updated_at = now;
            tables.by_path.remove(previous.as_str());
            tables
                .by_path
                .insert(rebased.as_str().to_string(), member.clone());
        }
        tables.touch_ancestors(&new_path, revision, now);

        let entity = Self::require_active(tables, id)?;
        tracing::debug!(
            entity_id = %id,
            from = %old_path,
            to = %new_path,
            moved = subtree.len(),
            "moved subtree"
        );
        Ok(MutationOutcome {
            entity,
            kind: MutationKind::Moved,
            revision,
            affected_prefixes: vec![old_path, new_path],
        })
    }

    async fn deactivate_entity(&self, id: &EntityId) -> Result<MutationOutcome, StorageError> {
        let _conn = self.checkout().await?;
        let mut tables = self.tables.write();
        let current = Self::require_active(&tables, id)?;
        let children = tables.descendant_ids(&current.path).len() as u64;
        if children > 0 {
            return Err(StorageError::has_active_descendants(id.as_str(), children));
        }

        let revision = self.next_revision();
        let now = OffsetDateTime::now_utc();
        tables.by_path.remove(current.path.as_str());
        let entity = {
            let entity = tables
                .entities
                .get_mut(id)
                .ok_or_else(|| StorageError::not_found(id.as_str()))?;
            entity.active = false;
            entity.revision = revision;
            entity.updated_at = now;
            entity.clone()
        };
        tables.touch_ancestors(&current.path, revision, now);

        Ok(MutationOutcome {
            affected_prefixes: vec![current.path],
            entity,
            kind: MutationKind::Deactivated,
            revision,
        })
    }

    async fn set_confidence(
        &self,
        id: &EntityId,
        confidence: Option<f64>,
    ) -> Result<MutationOutcome, StorageError> {
        let _conn = self.checkout().await?;
        let confidence = normalize_confidence(confidence)?;
        let mut tables = self.tables.write();
        Self::require_active(&tables, id)?;

        let revision = self.next_revision();
        let entity = {
            let entity = tables
                .entities
                .get_mut(id)
                .ok_or_else(|| StorageError::not_found(id.as_str()))?;
            entity.confidence = confidence;
            entity.revision = revision;
            entity.updated_at = OffsetDateTime::now_utc();
            entity.clone()
        };

        Ok(MutationOutcome {
            affected_prefixes: vec![entity.path.clone()],
            entity,
            kind: MutationKind::Updated,
            revision,
        })
    }

    fn join_column(&self) -> &JoinColumn {
        &self.join_column
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_storage::{SourceHash, ViewStore};

    fn p(s: &str) -> EntityPath {
        EntityPath::parse(s).unwrap()
    }

    async fn seed(store: &InMemoryStore, paths: &[&str]) {
        for path in paths {
            store
                .create_entity(NewEntity::new(p(path), "organization").with_id(*path))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_create_requires_active_parent() {
        let store = InMemoryStore::new();
        let err = store
            .create_entity(NewEntity::new(p("root.acme"), "organization"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::OrphanedPath { .. }));

        seed(&store, &["root", "root.acme"]).await;
        assert_eq!(store.active_count(), 2);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_path() {
        let store = InMemoryStore::new();
        seed(&store, &["root"]).await;
        let err = store
            .create_entity(NewEntity::new(p("root"), "organization").with_id("other"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_prefix_scan_is_label_wise() {
        let store = InMemoryStore::new();
        seed(
            &store,
            &["root", "root.ac", "root.acme", "root.acme.x", "root.ac.y"],
        )
        .await;
        let found = store.query_by_path_prefix(&p("root.ac")).await.unwrap();
        let paths: Vec<_> = found.iter().map(|e| e.path.as_str().to_string()).collect();
        assert_eq!(paths, vec!["root.ac.y"]);
        assert_eq!(store.count_descendants(&p("root")).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_create_bumps_ancestor_revisions() {
        let store = InMemoryStore::new();
        seed(&store, &["root", "root.acme"]).await;
        let outcome = store
            .create_entity(NewEntity::new(p("root.acme.team"), "unit"))
            .await
            .unwrap();
        let root = store.get_by_id(&"root".into()).await.unwrap().unwrap();
        let acme = store.get_by_id(&"root.acme".into()).await.unwrap().unwrap();
        assert_eq!(root.revision, outcome.revision);
        assert_eq!(acme.revision, outcome.revision);
        assert_eq!(store.current_revision().await.unwrap(), outcome.revision);
    }

    #[tokio::test]
    async fn test_move_rewrites_subtree() {
        let store = InMemoryStore::new();
        seed(
            &store,
            &["root", "root.a", "root.b", "root.a.team", "root.a.team.squad"],
        )
        .await;
        let outcome = store
            .move_entity(&"root.a.team".into(), &p("root.b"))
            .await
            .unwrap();
        assert_eq!(outcome.entity.path, p("root.b.team"));
        assert_eq!(outcome.affected_prefixes, vec![p("root.a.team"), p("root.b.team")]);

        let squad = store
            .get_by_id(&"root.a.team.squad".into())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(squad.path, p("root.b.team.squad"));
        assert_eq!(squad.depth, 4);
        assert!(store.get_by_path(&p("root.a.team")).await.unwrap().is_none());
        assert_eq!(store.count_descendants(&p("root.a")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_move_under_own_subtree_rejected() {
        let store = InMemoryStore::new();
        seed(&store, &["root", "root.a", "root.a.b"]).await;
        let err = store
            .move_entity(&"root.a".into(), &p("root.a.b"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn test_deactivate_requires_leaf() {
        let store = InMemoryStore::new();
        seed(&store, &["root", "root.a"]).await;
        let err = store.deactivate_entity(&"root".into()).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::HasActiveDescendants { count: 1, .. }
        ));

        store.deactivate_entity(&"root.a".into()).await.unwrap();
        assert!(store.get_by_id(&"root.a".into()).await.unwrap().is_none());
        // path becomes free again
        seed(&store, &["root.a2"]).await;
    }

    #[tokio::test]
    async fn test_rename_bumps_descendants() {
        let store = InMemoryStore::new();
        seed(&store, &["root", "root.a", "root.a.b"]).await;
        let outcome = store
            .rename_entity(&"root.a".into(), "Alpha")
            .await
            .unwrap();
        let child = store.get_by_id(&"root.a.b".into()).await.unwrap().unwrap();
        assert_eq!(child.revision, outcome.revision);
        assert_eq!(outcome.entity.name, "Alpha");
    }

    #[tokio::test]
    async fn test_join_on_identity_column() {
        let store = InMemoryStore::new();
        seed(&store, &["root"]).await;
        assert!(store.get_ancestors_by_join(&"root".into()).await.unwrap().is_none());

        let revision = store.current_revision().await.unwrap();
        store
            .upsert_answer(&MaterializedAnswer {
                entity_id: "root".into(),
                path: p("root"),
                ancestors: vec![],
                descendant_count: 0,
                computed_at: OffsetDateTime::now_utc(),
                source_hash: SourceHash(revision),
            })
            .await
            .unwrap();
        let joined = store.get_ancestors_by_join(&"root".into()).await.unwrap();
        assert!(joined.is_some());
    }

    #[tokio::test]
    async fn test_join_on_wrong_column_is_violation() {
        let store = InMemoryStore::new().with_join_column(JoinColumn::new("row_id").unwrap());
        seed(&store, &["root"]).await;
        store
            .upsert_answer(&MaterializedAnswer {
                entity_id: "root".into(),
                path: p("root"),
                ancestors: vec![],
                descendant_count: 0,
                computed_at: OffsetDateTime::now_utc(),
                source_hash: SourceHash(1),
            })
            .await
            .unwrap();
        let err = store
            .get_ancestors_by_join(&"root".into())
            .await
            .unwrap_err();
        assert!(err.is_schema_violation());
    }

    #[tokio::test]
    async fn test_stale_row_is_not_joined() {
        let store = InMemoryStore::new();
        seed(&store, &["root"]).await;
        store
            .upsert_answer(&MaterializedAnswer {
                entity_id: "root".into(),
                path: p("root"),
                ancestors: vec![],
                descendant_count: 0,
                computed_at: OffsetDateTime::now_utc(),
                source_hash: SourceHash(1),
            })
            .await
            .unwrap();
        seed(&store, &["root.child"]).await;
        assert!(store.get_ancestors_by_join(&"root".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pool_saturation() {
        let store = InMemoryStore::new().with_pool_limit(1, Duration::from_millis(20));
        let pool = store.pool_handle().unwrap();
        let _held = pool.acquire_owned().await.unwrap();
        let err = store.get_by_id(&"x".into()).await.unwrap_err();
        assert!(err.is_pool_exhausted());
    }

    #[tokio::test]
    async fn test_confidence_clamped() {
        let store = InMemoryStore::new();
        seed(&store, &["root"]).await;
        let outcome = store
            .set_confidence(&"root".into(), Some(4.0))
            .await
            .unwrap();
        assert_eq!(outcome.entity.confidence, Some(1.0));
        assert_eq!(outcome.kind, MutationKind::Updated);
    }
}
