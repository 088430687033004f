use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use lineage_cache::{InvalidationListener, create_redis_cache};
use lineage_db_memory::InMemoryStore;
use lineage_db_postgres::{PoolMonitor, PostgresStore};
use lineage_engine::{BroadcastNotifier, Engine, EngineHandle, FeatureFlags};
use lineage_storage::{DynPathIndexStore, DynViewStore};
use tokio::sync::watch;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::config::{AppConfig, StorageBackend};
use crate::{handlers, middleware as app_middleware};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn build_app(state: AppState, cfg: &AppConfig) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        // Health and telemetry
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/stats", get(handlers::stats))
        // Resolution
        .route("/resolve", get(handlers::resolve_by_path))
        .route("/resolve/{id}", get(handlers::resolve_by_id))
        .route("/invalidate", post(handlers::invalidate))
        // Entity writes
        .route("/entities", post(handlers::create_entity))
        .route("/entities/{id}", delete(handlers::deactivate_entity))
        .route("/entities/{id}/rename", post(handlers::rename_entity))
        .route("/entities/{id}/move", post(handlers::move_entity))
        .route("/entities/{id}/confidence", post(handlers::set_confidence))
        // Views
        .route("/views", get(handlers::list_views))
        .route("/views/{name}/refresh", post(handlers::refresh_view))
        .route_layer(middleware::from_fn(app_middleware::track_metrics))
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                let req_id = req
                    .extensions()
                    .get::<axum::http::HeaderValue>()
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                tracing::info_span!(
                    "http.request",
                    http.method = %req.method(),
                    http.target = %req.uri(),
                    request_id = %req_id
                )
            }),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Everything started from configuration: the engine and the background
/// tasks that live beside it.
pub struct Runtime {
    pub engine: Arc<Engine>,
    pub notifier: Arc<BroadcastNotifier>,
    engine_handle: Option<EngineHandle>,
    stop_signals: Vec<watch::Sender<bool>>,
}

impl Runtime {
    /// Connects storage and caches and assembles the engine. Background
    /// tasks are not started.
    pub async fn build(cfg: &AppConfig) -> anyhow::Result<Self> {
        let mut stop_signals = Vec::new();

        let (store, views): (DynPathIndexStore, DynViewStore) = match cfg.storage.backend {
            StorageBackend::Memory => {
                tracing::info!("Using in-memory storage backend");
                let store = Arc::new(InMemoryStore::new());
                (store.clone() as DynPathIndexStore, store as DynViewStore)
            }
            StorageBackend::Postgres => {
                let pg = &cfg.storage.postgres;
                let store = Arc::new(
                    PostgresStore::new(pg.clone())
                        .await
                        .context("failed to initialize PostgreSQL storage")?,
                );
                let monitor = PoolMonitor::new(
                    store.pool().clone(),
                    pg.pool_high_water_pct,
                    Duration::from_secs(pg.pool_monitor_interval_secs),
                );
                stop_signals.push(monitor.start(|stats| {
                    lineage_engine::metrics::record_db_pool_stats(
                        stats.total,
                        stats.idle,
                        stats.active,
                        stats.utilization(),
                    );
                }));
                (store.clone() as DynPathIndexStore, store as DynViewStore)
            }
        };

        let flags = Arc::new(FeatureFlags::from_map(cfg.features.clone()));
        let notifier = BroadcastNotifier::new_shared();
        let mut builder = Engine::builder(store, views)
            .with_config(cfg.engine_config())
            .with_gate(flags)
            .with_notifier(notifier.clone());

        let redis = create_redis_cache(&cfg.redis).await;
        if let Some(cache) = redis.clone() {
            builder = builder.with_distributed(Arc::new(cache));
        }
        let engine = Arc::new(builder.build());

        if redis.is_some() {
            let listener = InvalidationListener {
                redis_url: cfg.redis.url.clone(),
                local_cache: engine.local_cache().clone(),
            };
            stop_signals.push(listener.start());
        }

        Ok(Self {
            engine,
            notifier,
            engine_handle: None,
            stop_signals,
        })
    }

    /// Starts the refresh scheduler, cache maintenance and the refresh
    /// event log.
    pub fn start(&mut self) {
        if self.engine_handle.is_some() {
            return;
        }
        self.engine_handle = Some(self.engine.start());
        spawn_refresh_log(&self.notifier);
    }

    pub fn state(&self) -> AppState {
        AppState {
            engine: self.engine.clone(),
        }
    }

    /// Stops background work. The in-flight refresh, if any, is abandoned.
    pub async fn shutdown(self) {
        for tx in &self.stop_signals {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.engine_handle {
            if !handle.shutdown().await {
                tracing::warn!("refresh scheduler did not stop in time and was aborted");
            }
        }
    }
}

fn spawn_refresh_log(notifier: &BroadcastNotifier) {
    let mut events = notifier.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::info!(
                    view = %event.view,
                    rebuilt = event.rebuilt,
                    refreshed_at = %event.refreshed_at,
                    "view refreshed"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "refresh event log lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

pub struct LineageServer {
    addr: SocketAddr,
    app: Router,
    runtime: Runtime,
}

pub struct ServerBuilder {
    config: AppConfig,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.config = cfg;
        self
    }

    pub async fn build(self) -> anyhow::Result<LineageServer> {
        let runtime = Runtime::build(&self.config).await?;
        let app = build_app(runtime.state(), &self.config);
        Ok(LineageServer {
            addr: self.config.addr(),
            app,
            runtime,
        })
    }
}

impl LineageServer {
    pub async fn run(mut self) -> anyhow::Result<()> {
        crate::metrics::init_metrics();
        self.runtime.start();

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        tracing::info!("listening on {}", self.addr);
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        self.runtime.shutdown().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
