//! Engine wiring.
//!
//! Every component is constructed here from explicit configuration and
//! shared by `Arc`; nothing is reached through globals.

use std::sync::Arc;
use std::time::Duration;

use lineage_cache::{DEFAULT_LOCAL_CAPACITY, DistributedCache, LocalCache, RetryPolicy, RetryingCache};
use lineage_storage::{
    DynPathIndexStore, DynViewStore, EntityId, EntityPath, MutationOutcome, NewEntity,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::facade::{Resolution, ResolutionConfig, ResolutionFacade};
use crate::gate::{CapabilityGate, FeatureFlags};
use crate::invalidation::{InvalidationCoordinator, InvalidationReport};
use crate::materializer::ViewMaterializer;
use crate::notify::{NoopNotifier, RefreshNotifier};
use crate::scheduler::{RefreshScheduler, SchedulerConfig, SchedulerHandle, ViewRegistry};
use crate::stats::{PerformanceTracker, ResolutionStats};

/// Cache tier sizing and lifetimes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub local_capacity: usize,
    pub local_ttl_secs: u64,
    pub distributed_ttl_secs: u64,
    /// Interval of the expired-entry sweep; `0` disables it. Mutation
    /// marks are pruned on their own schedule either way.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_capacity: DEFAULT_LOCAL_CAPACITY,
            local_ttl_secs: 300,
            distributed_ttl_secs: 900,
            sweep_interval_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn local_ttl(&self) -> Duration {
        Duration::from_secs(self.local_ttl_secs)
    }

    pub fn distributed_ttl(&self) -> Duration {
        Duration::from_secs(self.distributed_ttl_secs)
    }

    /// Longest time any tier may hold an answer.
    pub fn max_ttl(&self) -> Duration {
        self.local_ttl().max(self.distributed_ttl())
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    /// How often mutation marks older than [`Self::max_ttl`] are dropped.
    pub fn prune_interval(&self) -> Duration {
        (self.max_ttl() / 4).max(Duration::from_secs(1))
    }
}

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
    pub resolution: ResolutionConfig,
    pub refresh: SchedulerConfig,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    store: DynPathIndexStore,
    views: DynViewStore,
    distributed: Option<Arc<dyn DistributedCache>>,
    gate: Arc<dyn CapabilityGate>,
    notifier: Arc<dyn RefreshNotifier>,
    config: EngineConfig,
}

impl EngineBuilder {
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables the L2 tier.
    #[must_use]
    pub fn with_distributed(mut self, cache: Arc<dyn DistributedCache>) -> Self {
        self.distributed = Some(cache);
        self
    }

    #[must_use]
    pub fn with_gate(mut self, gate: Arc<dyn CapabilityGate>) -> Self {
        self.gate = gate;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn RefreshNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let local = Arc::new(LocalCache::new(
            config.cache.local_capacity,
            config.cache.local_ttl(),
        ));
        let distributed = self
            .distributed
            .map(|cache| Arc::new(RetryingCache::new(cache, config.retry.clone())));
        let registry = Arc::new(ViewRegistry::new(config.refresh.views.clone()));
        let materializer = Arc::new(
            ViewMaterializer::new(self.store.clone(), self.views)
                .with_concurrency(config.refresh.rebuild_concurrency),
        );
        let coordinator = Arc::new(InvalidationCoordinator::new(
            local.clone(),
            distributed.clone(),
            self.store.clone(),
            registry.clone(),
            config.cache.max_ttl(),
        ));
        let tracker = Arc::new(PerformanceTracker::new(
            config.resolution.latency_target(),
            config.resolution.latency_window,
        ));
        let facade = Arc::new(ResolutionFacade::new(
            local.clone(),
            distributed.clone(),
            self.store.clone(),
            materializer.clone(),
            coordinator.clone(),
            tracker,
            config.cache.local_ttl(),
            config.cache.distributed_ttl(),
            config.resolution.reject_stale_hits,
        ));
        let scheduler = Arc::new(RefreshScheduler::new(
            registry.clone(),
            materializer.clone(),
            self.gate,
            self.notifier,
            config.refresh.clone(),
        ));

        info!(
            backend = self.store.backend_name(),
            distributed = distributed.as_ref().map(|d| d.backend_name()),
            local_capacity = config.cache.local_capacity,
            views = registry.len(),
            "Resolution engine initialized"
        );

        Engine {
            store: self.store,
            local,
            distributed,
            materializer,
            coordinator,
            facade,
            scheduler,
            registry,
            config,
        }
    }
}

/// The assembled resolution engine.
pub struct Engine {
    store: DynPathIndexStore,
    local: Arc<LocalCache>,
    distributed: Option<Arc<RetryingCache>>,
    materializer: Arc<ViewMaterializer>,
    coordinator: Arc<InvalidationCoordinator>,
    facade: Arc<ResolutionFacade>,
    scheduler: Arc<RefreshScheduler>,
    registry: Arc<ViewRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn builder(store: DynPathIndexStore, views: DynViewStore) -> EngineBuilder {
        EngineBuilder {
            store,
            views,
            distributed: None,
            gate: Arc::new(FeatureFlags::default()),
            notifier: Arc::new(NoopNotifier),
            config: EngineConfig::default(),
        }
    }

    // ==================== Reads ====================

    pub async fn resolve(&self, id: &EntityId) -> Result<Resolution> {
        self.facade.resolve(id).await
    }

    pub async fn resolve_by_path(&self, path: &EntityPath) -> Result<Resolution> {
        self.facade.resolve_by_path(path).await
    }

    pub async fn invalidate(
        &self,
        id: &EntityId,
        affected_prefixes: &[EntityPath],
    ) -> InvalidationReport {
        self.facade.invalidate(id, affected_prefixes).await
    }

    // ==================== Writes ====================

    pub async fn create_entity(&self, entity: NewEntity) -> Result<MutationOutcome> {
        let outcome = self.store.create_entity(entity).await?;
        self.after_write(&outcome).await;
        Ok(outcome)
    }

    pub async fn rename_entity(&self, id: &EntityId, name: &str) -> Result<MutationOutcome> {
        let outcome = self.store.rename_entity(id, name).await?;
        self.after_write(&outcome).await;
        Ok(outcome)
    }

    pub async fn move_entity(
        &self,
        id: &EntityId,
        new_parent: &EntityPath,
    ) -> Result<MutationOutcome> {
        let outcome = self.store.move_entity(id, new_parent).await?;
        self.after_write(&outcome).await;
        Ok(outcome)
    }

    pub async fn deactivate_entity(&self, id: &EntityId) -> Result<MutationOutcome> {
        let outcome = self.store.deactivate_entity(id).await?;
        if let Err(err) = self.materializer.remove(id).await {
            warn!(entity_id = %id, error = %err, "failed to delete materialized answer");
        }
        self.after_write(&outcome).await;
        Ok(outcome)
    }

    pub async fn set_confidence(
        &self,
        id: &EntityId,
        confidence: Option<f64>,
    ) -> Result<MutationOutcome> {
        let outcome = self.store.set_confidence(id, confidence).await?;
        self.after_write(&outcome).await;
        Ok(outcome)
    }

    async fn after_write(&self, outcome: &MutationOutcome) {
        let report = self.coordinator.on_mutation(outcome).await;
        info!(
            entity_id = %outcome.entity.id,
            kind = %outcome.kind,
            revision = outcome.revision,
            local_evicted = report.local_evicted,
            views_touched = report.views_touched,
            "Entity mutated"
        );
    }

    // ==================== Introspection ====================

    pub fn stats(&self) -> ResolutionStats {
        ResolutionStats {
            resolution: self.facade.tracker().snapshot(),
            local_cache: self.local.stats(),
            distributed: self.distributed.as_ref().map(|d| d.stats()),
            views: self.registry.statuses(),
            refresh_compliance_rate: self.registry.compliance_rate(),
        }
    }

    pub fn facade(&self) -> &Arc<ResolutionFacade> {
        &self.facade
    }

    pub fn scheduler(&self) -> &Arc<RefreshScheduler> {
        &self.scheduler
    }

    pub fn coordinator(&self) -> &Arc<InvalidationCoordinator> {
        &self.coordinator
    }

    pub fn materializer(&self) -> &Arc<ViewMaterializer> {
        &self.materializer
    }

    pub fn local_cache(&self) -> &Arc<LocalCache> {
        &self.local
    }

    pub fn store(&self) -> &DynPathIndexStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ==================== Background tasks ====================

    /// Starts the refresh scheduler and the cache maintenance loop.
    pub fn start(&self) -> EngineHandle {
        let scheduler = self.scheduler.clone().start();
        let maintenance = spawn_maintenance(
            self.local.clone(),
            self.coordinator.clone(),
            self.distributed.clone(),
            self.config.cache.sweep_interval(),
            self.config.cache.prune_interval(),
        );
        EngineHandle {
            scheduler,
            maintenance,
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("facade", &self.facade)
            .field("views", &self.registry.len())
            .finish()
    }
}

fn spawn_maintenance(
    local: Arc<LocalCache>,
    coordinator: Arc<InvalidationCoordinator>,
    distributed: Option<Arc<RetryingCache>>,
    sweep_every: Option<Duration>,
    prune_every: Duration,
) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(async move {
        let mut prune_ticker = interval(prune_every);
        prune_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_ticker = sweep_every.map(|every| {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        loop {
            tokio::select! {
                _ = prune_ticker.tick() => {
                    let pruned = coordinator.prune();
                    if let Some(distributed) = &distributed {
                        let stats = distributed.stats();
                        crate::metrics::set_l2_retry_totals(stats.retries, stats.exhausted);
                    }
                    if pruned > 0 {
                        debug!(pruned, "pruned mutation marks");
                    }
                }
                _ = next_sweep(&mut sweep_ticker) => {
                    let expired = local.sweep_expired();
                    crate::metrics::set_local_cache_entries(local.len());
                    if expired > 0 {
                        debug!(expired, "swept expired local entries");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    (shutdown_tx, join)
}

async fn next_sweep(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Handles to the engine's background tasks.
pub struct EngineHandle {
    scheduler: SchedulerHandle,
    maintenance: (watch::Sender<bool>, JoinHandle<()>),
}

impl EngineHandle {
    /// Stops every background task. Returns `false` if the scheduler had to
    /// be aborted.
    pub async fn shutdown(self) -> bool {
        let (tx, join) = self.maintenance;
        let _ = tx.send(true);
        let _ = join.await;
        let stopped = self.scheduler.shutdown().await;
        info!(clean = stopped, "Engine background tasks stopped");
        stopped
    }
}
