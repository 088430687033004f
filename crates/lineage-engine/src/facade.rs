//! Tiered resolution entry point.
//!
//! Lookup order is L1 (local) -> L2 (distributed) -> L3 (entity/answer join)
//! -> L4 (on-demand rebuild). A hit below L1 is written through to every
//! faster tier before returning. The local cache lock is only taken inside
//! `LocalCache` calls and never across an `.await`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lineage_cache::{AnswerCodec, LocalCache, RetryingCache};
use lineage_storage::{
    DynPathIndexStore, EntityId, EntityPath, MaterializedAnswer, SourceHash,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error, warn};

use crate::error::{ResolveError, Result};
use crate::invalidation::{InvalidationCoordinator, InvalidationReport};
use crate::materializer::ViewMaterializer;
use crate::stats::{PerformanceTracker, Tier};

/// Resolution behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Latency objective used for compliance accounting.
    pub latency_target_ms: u64,
    /// Drop cached answers older than the latest known mutation of their
    /// entity and fall through to the store. When `false` they are served
    /// and flagged `stale`.
    pub reject_stale_hits: bool,
    /// Number of recent latency samples kept for percentiles.
    pub latency_window: usize,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            latency_target_ms: 10,
            reject_stale_hits: true,
            latency_window: crate::stats::DEFAULT_LATENCY_WINDOW,
        }
    }
}

impl ResolutionConfig {
    pub fn latency_target(&self) -> Duration {
        Duration::from_millis(self.latency_target_ms)
    }
}

/// The answer returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub entity_id: EntityId,
    pub path: EntityPath,
    /// Ancestor names, root first.
    pub ancestors: Vec<String>,
    pub descendant_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub resolved_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
    /// Diagnostic only.
    pub source: Tier,
    pub source_hash: SourceHash,
    /// Older than the latest mutation known to this process.
    pub stale: bool,
}

impl Resolution {
    fn new(answer: &MaterializedAnswer, source: Tier, stale: bool) -> Self {
        Self {
            entity_id: answer.entity_id.clone(),
            path: answer.path.clone(),
            ancestors: answer.ancestors.clone(),
            descendant_count: answer.descendant_count,
            resolved_at: OffsetDateTime::now_utc(),
            computed_at: answer.computed_at,
            source,
            source_hash: answer.source_hash,
            stale,
        }
    }
}

enum Freshness {
    Fresh,
    Stale,
    Rejected,
}

/// Orchestrates the four tiers for every resolve call.
pub struct ResolutionFacade {
    local: Arc<LocalCache>,
    distributed: Option<Arc<RetryingCache>>,
    store: DynPathIndexStore,
    materializer: Arc<ViewMaterializer>,
    coordinator: Arc<InvalidationCoordinator>,
    tracker: Arc<PerformanceTracker>,
    codec: AnswerCodec,
    local_ttl: Duration,
    distributed_ttl: Duration,
    reject_stale: bool,
}

impl ResolutionFacade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Arc<LocalCache>,
        distributed: Option<Arc<RetryingCache>>,
        store: DynPathIndexStore,
        materializer: Arc<ViewMaterializer>,
        coordinator: Arc<InvalidationCoordinator>,
        tracker: Arc<PerformanceTracker>,
        local_ttl: Duration,
        distributed_ttl: Duration,
        reject_stale: bool,
    ) -> Self {
        Self {
            local,
            distributed,
            store,
            materializer,
            coordinator,
            tracker,
            codec: AnswerCodec,
            local_ttl,
            distributed_ttl,
            reject_stale,
        }
    }

    /// Resolves an entity's ancestors and descendant count.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or inactive entities,
    /// `SchemaInvariantViolation` when the view join is misconfigured,
    /// `CapacityExceeded` when the store pool is saturated.
    pub async fn resolve(&self, id: &EntityId) -> Result<Resolution> {
        let started = Instant::now();
        let result = self.lookup(id).await;
        self.finish(id.as_str(), started, result)
    }

    /// Resolves by hierarchy path.
    pub async fn resolve_by_path(&self, path: &EntityPath) -> Result<Resolution> {
        let started = Instant::now();
        if let Some(answer) = self.local.get_by_path(path) {
            let id = answer.entity_id.clone();
            let result = self.lookup_from(&id, Some(answer)).await;
            return self.finish(path.as_str(), started, result);
        }
        let entity = match self.store.get_by_path(path).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                let err = ResolveError::not_found(path.as_str());
                return self.finish(path.as_str(), started, Err(err));
            }
            Err(err) => return self.finish(path.as_str(), started, Err(err.into())),
        };
        // the L1 miss was already counted by the path lookup
        let result = self.lookup_from(&entity.id, None).await;
        self.finish(path.as_str(), started, result)
    }

    /// Invalidation for writes made outside the engine.
    pub async fn invalidate(
        &self,
        id: &EntityId,
        affected_prefixes: &[EntityPath],
    ) -> InvalidationReport {
        self.coordinator.invalidate(id, affected_prefixes).await
    }

    pub fn tracker(&self) -> &Arc<PerformanceTracker> {
        &self.tracker
    }

    fn finish(
        &self,
        target: &str,
        started: Instant,
        result: Result<(Arc<MaterializedAnswer>, Tier, bool)>,
    ) -> Result<Resolution> {
        let elapsed = started.elapsed();
        match result {
            Ok((answer, tier, stale)) => {
                self.tracker.record(tier, elapsed);
                debug!(
                    target_id = %target,
                    tier = %tier,
                    stale,
                    elapsed_us = elapsed.as_micros() as u64,
                    "resolved"
                );
                Ok(Resolution::new(&answer, tier, stale))
            }
            Err(err) => {
                match &err {
                    ResolveError::SchemaInvariantViolation { join_column, .. } => error!(
                        target_id = %target,
                        join_column = %join_column,
                        error = %err,
                        "schema invariant violated, view tier is not reachable"
                    ),
                    ResolveError::NotFound { .. } => {
                        debug!(target_id = %target, "entity not found");
                    }
                    _ => warn!(target_id = %target, error = %err, "resolution failed"),
                }
                self.tracker.record_error(&err.category().to_string());
                Err(err)
            }
        }
    }

    async fn lookup(&self, id: &EntityId) -> Result<(Arc<MaterializedAnswer>, Tier, bool)> {
        let cached = self.local.get(id);
        self.lookup_from(id, cached).await
    }

    /// Continues resolution from an L1 result already looked up.
    async fn lookup_from(
        &self,
        id: &EntityId,
        cached: Option<Arc<MaterializedAnswer>>,
    ) -> Result<(Arc<MaterializedAnswer>, Tier, bool)> {
        // L1
        if let Some(answer) = cached {
            match self.freshness(&answer, Tier::L1) {
                Freshness::Fresh => return Ok((answer, Tier::L1, false)),
                Freshness::Stale => return Ok((answer, Tier::L1, true)),
                Freshness::Rejected => {
                    self.local.invalidate(id);
                }
            }
        }

        // L2
        if let Some(answer) = self.read_distributed(id).await {
            match self.freshness(&answer, Tier::L2) {
                Freshness::Fresh => {
                    self.local.put(answer.clone(), self.local_ttl);
                    return Ok((answer, Tier::L2, false));
                }
                Freshness::Stale => return Ok((answer, Tier::L2, true)),
                Freshness::Rejected => {
                    if let Some(distributed) = &self.distributed {
                        distributed.delete(id.as_str()).await;
                    }
                }
            }
        }

        // L3
        if let Some(answer) = self.store.get_ancestors_by_join(id).await? {
            let answer = Arc::new(answer);
            if self.is_stale(&answer) {
                debug!(entity_id = %id, "materialized row predates latest mutation");
            } else {
                self.write_through(&answer).await;
                return Ok((answer, Tier::L3, false));
            }
        }

        // L4; a failed view write still serves the computed answer
        let answer = Arc::new(self.materializer.compute(id).await?);
        if let Err(err) = self.materializer.persist(&answer).await {
            warn!(entity_id = %id, error = %err, "failed to persist rebuilt answer");
        }
        self.write_through(&answer).await;
        Ok((answer, Tier::L4, false))
    }

    fn is_stale(&self, answer: &MaterializedAnswer) -> bool {
        self.coordinator
            .latest_mutation(&answer.entity_id)
            .is_some_and(|revision| answer.source_hash.predates(revision))
    }

    fn freshness(&self, answer: &MaterializedAnswer, tier: Tier) -> Freshness {
        if !self.is_stale(answer) {
            return Freshness::Fresh;
        }
        self.tracker.record_stale(tier, self.reject_stale);
        if self.reject_stale {
            debug!(entity_id = %answer.entity_id, tier = %tier, "rejecting stale cached answer");
            Freshness::Rejected
        } else {
            Freshness::Stale
        }
    }

    async fn read_distributed(&self, id: &EntityId) -> Option<Arc<MaterializedAnswer>> {
        let distributed = self.distributed.as_ref()?;
        let bytes = distributed.get(id.as_str()).await?;
        match self.codec.decode(&bytes) {
            Ok(answer) if answer.entity_id == *id => Some(Arc::new(answer)),
            Ok(answer) => {
                warn!(
                    entity_id = %id,
                    stored_id = %answer.entity_id,
                    "distributed cache entry belongs to another entity"
                );
                None
            }
            Err(err) => {
                error!(entity_id = %id, error = %err, "undecodable distributed cache entry");
                distributed.delete(id.as_str()).await;
                None
            }
        }
    }

    /// Writes an answer to L2 then L1. Answers that a concurrent mutation
    /// has already superseded are not cached.
    async fn write_through(&self, answer: &Arc<MaterializedAnswer>) {
        if self.is_stale(answer) {
            return;
        }
        if let Some(distributed) = &self.distributed {
            match self.codec.encode(answer) {
                Ok(bytes) => {
                    distributed
                        .set(answer.entity_id.as_str(), &bytes, self.distributed_ttl)
                        .await;
                }
                Err(err) => error!(
                    entity_id = %answer.entity_id,
                    error = %err,
                    "failed to encode answer for distributed cache"
                ),
            }
        }
        // a mutation may have landed while the distributed write was pending
        if self.is_stale(answer) {
            if let Some(distributed) = &self.distributed {
                distributed.delete(answer.entity_id.as_str()).await;
            }
            return;
        }
        self.local.put(answer.clone(), self.local_ttl);
    }
}

impl std::fmt::Debug for ResolutionFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionFacade")
            .field("backend", &self.store.backend_name())
            .field("distributed", &self.distributed.as_ref().map(|d| d.backend_name()))
            .field("local_ttl", &self.local_ttl)
            .field("distributed_ttl", &self.distributed_ttl)
            .field("reject_stale", &self.reject_stale)
            .finish()
    }
}
