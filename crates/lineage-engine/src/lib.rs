//! # lineage-engine
//!
//! Hierarchy resolution over four tiers:
//!
//! | Tier | Source |
//! |------|--------|
//! | L1 | [`lineage_cache::LocalCache`], in-process LRU |
//! | L2 | [`lineage_cache::DistributedCache`] behind retry/backoff |
//! | L3 | entity/answer join in the [`lineage_storage::PathIndexStore`] |
//! | L4 | on-demand rebuild by the [`ViewMaterializer`] |
//!
//! [`Engine`] wires the components together: the [`ResolutionFacade`] serves
//! reads, the [`InvalidationCoordinator`] cascades writes through the tiers
//! and the view change counters, and the [`RefreshScheduler`] rebuilds named
//! views in the background.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use lineage_db_memory::InMemoryStore;
//! use lineage_engine::Engine;
//! use lineage_storage::EntityId;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let engine = Engine::builder(store.clone(), store).build();
//! let answer = engine.resolve(&EntityId::new("division-a")).await?;
//! println!("{:?} via {}", answer.ancestors, answer.source);
//! ```

mod engine;
mod error;
mod facade;
mod gate;
mod invalidation;
mod materializer;
pub mod metrics;
mod notify;
mod scheduler;
mod stats;

pub use engine::{CacheConfig, Engine, EngineBuilder, EngineConfig, EngineHandle};
pub use error::{ResolveError, Result};
pub use facade::{Resolution, ResolutionConfig, ResolutionFacade};
pub use gate::{CapabilityGate, DEFAULT_ENABLED, DisabledGate, FeatureFlags, SMART_TRIGGER};
pub use invalidation::{InvalidationCoordinator, InvalidationReport};
pub use materializer::{DEFAULT_REBUILD_CONCURRENCY, RebuildReport, ViewMaterializer};
pub use notify::{BroadcastNotifier, NoopNotifier, RefreshEvent, RefreshNotifier};
pub use scheduler::{
    DEFAULT_CHANGE_THRESHOLD, DEFAULT_TIME_THRESHOLD_SECS, RefreshOutcome, RefreshScheduler,
    RefreshTrigger, SchedulerConfig, SchedulerHandle, ViewConfig, ViewPhase, ViewRegistry,
    ViewState, ViewStatus,
};
pub use stats::{
    DEFAULT_LATENCY_TARGET, DEFAULT_LATENCY_WINDOW, LatencySnapshot, PerformanceSnapshot,
    PerformanceTracker, ResolutionStats, Tier, TierStats,
};
