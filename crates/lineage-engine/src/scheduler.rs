//! Background refresh of named materialized views.
//!
//! Each view moves through `Idle -> RefreshTriggered -> Refreshing -> Idle`.
//! A refresh is triggered when the view's time threshold has elapsed since
//! its last successful refresh, or (behind the [`SMART_TRIGGER`] capability)
//! when its change counter reaches the change threshold.
//!
//! Request-serving code only touches a view through [`ViewRegistry::record_mutation`],
//! which is a single atomic increment per view.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{StreamExt, stream};
use lineage_storage::EntityPath;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::gate::{CapabilityGate, SMART_TRIGGER};
use crate::materializer::{RebuildReport, ViewMaterializer};
use crate::notify::{RefreshEvent, RefreshNotifier};

pub const DEFAULT_TIME_THRESHOLD_SECS: u64 = 15 * 60;
pub const DEFAULT_CHANGE_THRESHOLD: u64 = 100;

fn default_time_threshold_secs() -> u64 {
    DEFAULT_TIME_THRESHOLD_SECS
}

fn default_change_threshold() -> u64 {
    DEFAULT_CHANGE_THRESHOLD
}

/// A named materialized view over a subtree of the hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewConfig {
    pub name: String,
    /// Subtree covered by the view; the whole hierarchy when absent.
    #[serde(default)]
    pub scope: Option<EntityPath>,
    #[serde(default = "default_time_threshold_secs")]
    pub time_threshold_secs: u64,
    #[serde(default = "default_change_threshold")]
    pub change_threshold: u64,
}

impl ViewConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: None,
            time_threshold_secs: DEFAULT_TIME_THRESHOLD_SECS,
            change_threshold: DEFAULT_CHANGE_THRESHOLD,
        }
    }

    #[must_use]
    pub fn with_scope(mut self, scope: EntityPath) -> Self {
        self.scope = Some(scope);
        self
    }

    #[must_use]
    pub fn with_time_threshold(mut self, threshold: Duration) -> Self {
        self.time_threshold_secs = threshold.as_secs();
        self
    }

    #[must_use]
    pub fn with_change_threshold(mut self, threshold: u64) -> Self {
        self.change_threshold = threshold;
        self
    }

    pub fn time_threshold(&self) -> Duration {
        Duration::from_secs(self.time_threshold_secs)
    }

    /// `true` when a mutation under any of `prefixes` changes answers in
    /// this view.
    pub fn covers(&self, prefixes: &[EntityPath]) -> bool {
        match &self.scope {
            None => true,
            Some(scope) => prefixes.iter().any(|p| scope.intersects(p)),
        }
    }
}

/// Configuration for the refresh scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often every view's triggers are evaluated.
    pub check_interval_secs: u64,
    /// Upper bound on waiting for the loop to stop.
    pub shutdown_timeout_secs: u64,
    /// Views refreshed concurrently within one tick.
    pub max_parallel: usize,
    /// Entities rebuilt concurrently within one view refresh.
    pub rebuild_concurrency: usize,
    pub views: Vec<ViewConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            shutdown_timeout_secs: 10,
            max_parallel: 2,
            rebuild_concurrency: crate::materializer::DEFAULT_REBUILD_CONCURRENCY,
            views: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Refresh lifecycle of one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewPhase {
    Idle,
    RefreshTriggered,
    Refreshing,
}

impl ViewPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::RefreshTriggered,
            2 => Self::Refreshing,
            _ => Self::Idle,
        }
    }
}

/// Why a refresh started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshTrigger {
    Elapsed,
    Changes,
    Manual,
}

/// Runtime state of one registered view.
pub struct ViewState {
    config: ViewConfig,
    changes: AtomicU64,
    phase: AtomicU8,
    in_flight: AtomicBool,
    last_refresh: Mutex<Instant>,
    last_refreshed_at: Mutex<Option<OffsetDateTime>>,
    last_error: Mutex<Option<String>>,
    refreshes: AtomicU64,
    failures: AtomicU64,
}

impl ViewState {
    fn new(config: ViewConfig) -> Self {
        Self {
            config,
            changes: AtomicU64::new(0),
            phase: AtomicU8::new(ViewPhase::Idle as u8),
            in_flight: AtomicBool::new(false),
            last_refresh: Mutex::new(Instant::now()),
            last_refreshed_at: Mutex::new(None),
            last_error: Mutex::new(None),
            refreshes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ViewConfig {
        &self.config
    }

    /// Mutations recorded since the last successful refresh started.
    pub fn pending_changes(&self) -> u64 {
        self.changes.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> ViewPhase {
        ViewPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: ViewPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn since_refresh(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_refresh.lock())
    }

    /// Claims the view for one refresh. `None` while another is in flight.
    fn try_begin(&self) -> Option<InFlight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.set_phase(ViewPhase::RefreshTriggered);
        Some(InFlight { view: self })
    }

    /// Subtracts the changes seen when the refresh started; mutations that
    /// arrived during the refresh stay counted.
    fn complete(&self, snapshot: u64) {
        let _ = self
            .changes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(snapshot))
            });
        *self.last_refresh.lock() = Instant::now();
        *self.last_refreshed_at.lock() = Some(OffsetDateTime::now_utc());
        *self.last_error.lock() = None;
        self.refreshes.fetch_add(1, Ordering::Relaxed);
    }

    fn fail(&self, message: String) {
        *self.last_error.lock() = Some(message);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn status(&self) -> ViewStatus {
        ViewStatus {
            name: self.config.name.clone(),
            scope: self.config.scope.as_ref().map(ToString::to_string),
            phase: self.phase(),
            pending_changes: self.pending_changes(),
            change_threshold: self.config.change_threshold,
            time_threshold_secs: self.config.time_threshold_secs,
            last_refreshed_at: *self.last_refreshed_at.lock(),
            seconds_since_refresh: self.since_refresh(Instant::now()).as_secs_f64(),
            last_error: self.last_error.lock().clone(),
            refresh_count: self.refreshes.load(Ordering::Relaxed),
            failure_count: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ViewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewState")
            .field("name", &self.config.name)
            .field("phase", &self.phase())
            .field("pending_changes", &self.pending_changes())
            .finish()
    }
}

/// Releases the in-flight flag when a refresh finishes or is dropped.
struct InFlight<'a> {
    view: &'a ViewState,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.view.set_phase(ViewPhase::Idle);
        self.view.in_flight.store(false, Ordering::SeqCst);
    }
}

/// Reported refresh state of a view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewStatus {
    pub name: String,
    pub scope: Option<String>,
    pub phase: ViewPhase,
    pub pending_changes: u64,
    pub change_threshold: u64,
    pub time_threshold_secs: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_refreshed_at: Option<OffsetDateTime>,
    pub seconds_since_refresh: f64,
    pub last_error: Option<String>,
    pub refresh_count: u64,
    pub failure_count: u64,
}

/// The set of registered views. Fixed at construction.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    views: Vec<Arc<ViewState>>,
}

impl ViewRegistry {
    pub fn new(configs: impl IntoIterator<Item = ViewConfig>) -> Self {
        Self {
            views: configs
                .into_iter()
                .map(|config| Arc::new(ViewState::new(config)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ViewState>> {
        self.views.iter().find(|v| v.name() == name)
    }

    pub fn views(&self) -> &[Arc<ViewState>] {
        &self.views
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Counts one mutation against every view covering `prefixes`.
    /// Returns the number of views touched.
    pub fn record_mutation(&self, prefixes: &[EntityPath]) -> usize {
        let mut touched = 0;
        for view in &self.views {
            if view.config.covers(prefixes) {
                let pending = view.changes.fetch_add(1, Ordering::SeqCst) + 1;
                crate::metrics::set_pending_changes(view.name(), pending);
                touched += 1;
            }
        }
        touched
    }

    pub fn statuses(&self) -> Vec<ViewStatus> {
        self.views.iter().map(|v| v.status()).collect()
    }

    /// Share of views whose last refresh is within their time threshold.
    pub fn compliance_rate(&self) -> f64 {
        if self.views.is_empty() {
            return 1.0;
        }
        let now = Instant::now();
        let compliant = self
            .views
            .iter()
            .filter(|v| v.since_refresh(now) <= v.config.time_threshold())
            .count();
        compliant as f64 / self.views.len() as f64
    }
}

/// Result of one refresh attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Refreshed {
        view: String,
        trigger: RefreshTrigger,
        report: RebuildReport,
        duration: Duration,
    },
    Failed {
        view: String,
        trigger: RefreshTrigger,
        error: String,
    },
    /// Another refresh of the view was already running.
    AlreadyRunning { view: String },
}

impl RefreshOutcome {
    pub fn view(&self) -> &str {
        match self {
            Self::Refreshed { view, .. }
            | Self::Failed { view, .. }
            | Self::AlreadyRunning { view } => view,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Refreshed { .. })
    }
}

/// Periodically refreshes registered views.
pub struct RefreshScheduler {
    registry: Arc<ViewRegistry>,
    materializer: Arc<ViewMaterializer>,
    gate: Arc<dyn CapabilityGate>,
    notifier: Arc<dyn RefreshNotifier>,
    config: SchedulerConfig,
}

impl RefreshScheduler {
    pub fn new(
        registry: Arc<ViewRegistry>,
        materializer: Arc<ViewMaterializer>,
        gate: Arc<dyn CapabilityGate>,
        notifier: Arc<dyn RefreshNotifier>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            materializer,
            gate,
            notifier,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ViewRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Which trigger, if any, fires for `view` at `now`.
    pub fn due_trigger(&self, view: &ViewState, now: Instant) -> Option<RefreshTrigger> {
        if view.since_refresh(now) >= view.config.time_threshold() {
            return Some(RefreshTrigger::Elapsed);
        }
        if view.pending_changes() >= view.config.change_threshold
            && self.gate.is_enabled(SMART_TRIGGER)
        {
            return Some(RefreshTrigger::Changes);
        }
        None
    }

    /// Evaluates every view once and refreshes the due ones.
    ///
    /// Views already refreshing are skipped. Returns one outcome per refresh
    /// started by this call.
    pub async fn tick(&self) -> Vec<RefreshOutcome> {
        let now = Instant::now();
        let due: Vec<(InFlight<'_>, RefreshTrigger)> = self
            .registry
            .views()
            .iter()
            .filter_map(|view| {
                let trigger = self.due_trigger(view, now)?;
                match view.try_begin() {
                    Some(guard) => Some((guard, trigger)),
                    None => {
                        debug!(view = %view.name(), "refresh already in flight, skipping");
                        None
                    }
                }
            })
            .collect();

        if due.is_empty() {
            return Vec::new();
        }

        // Futures are built eagerly (but stay lazy until polled) so the stream
        // type does not capture a closure; this sidesteps a rustc
        // higher-ranked lifetime inference bug when `start` spawns `tick`.
        let runs: Vec<_> = due
            .into_iter()
            .map(|(guard, trigger)| self.run(guard, trigger))
            .collect();
        stream::iter(runs)
            .buffer_unordered(self.config.max_parallel.max(1))
            .collect()
            .await
    }

    /// Refreshes one view immediately, regardless of its triggers.
    ///
    /// Returns `None` for an unknown view.
    pub async fn refresh_now(&self, name: &str) -> Option<RefreshOutcome> {
        let view = self.registry.get(name)?;
        Some(match view.try_begin() {
            Some(guard) => self.run(guard, RefreshTrigger::Manual).await,
            None => RefreshOutcome::AlreadyRunning {
                view: name.to_string(),
            },
        })
    }

    async fn run(&self, guard: InFlight<'_>, trigger: RefreshTrigger) -> RefreshOutcome {
        let view = guard.view;
        view.set_phase(ViewPhase::Refreshing);
        let snapshot = view.pending_changes();
        let started = Instant::now();

        let outcome = match self
            .materializer
            .rebuild_all(view.config.scope.as_ref())
            .await
        {
            Ok(report) => {
                let duration = started.elapsed();
                view.complete(snapshot);
                crate::metrics::record_refresh(view.name(), duration);
                crate::metrics::set_pending_changes(view.name(), view.pending_changes());
                info!(
                    view = %view.name(),
                    trigger = ?trigger,
                    rebuilt = report.rebuilt,
                    skipped = report.skipped,
                    duration_ms = duration.as_millis() as u64,
                    "View refreshed"
                );
                self.notifier.publish(RefreshEvent {
                    view: view.name().to_string(),
                    refreshed_at: OffsetDateTime::now_utc(),
                    rebuilt: report.rebuilt,
                });
                RefreshOutcome::Refreshed {
                    view: view.name().to_string(),
                    trigger,
                    report,
                    duration,
                }
            }
            Err(err) => {
                error!(
                    view = %view.name(),
                    trigger = ?trigger,
                    pending_changes = view.pending_changes(),
                    error = %err,
                    "View refresh failed"
                );
                crate::metrics::record_refresh_failure(view.name());
                view.fail(err.to_string());
                RefreshOutcome::Failed {
                    view: view.name().to_string(),
                    trigger,
                    error: err.to_string(),
                }
            }
        };
        drop(guard);
        outcome
    }

    /// Start the scheduler in a background task.
    ///
    /// A stop signal abandons an in-progress refresh; its change counter is
    /// left as is, so the next start retries it.
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let timeout = self.config.shutdown_timeout();

        let join = tokio::spawn(async move {
            info!(
                check_interval_secs = self.config.check_interval_secs,
                views = self.registry.len(),
                max_parallel = self.config.max_parallel,
                "Refresh scheduler started"
            );

            let mut ticker = interval(self.config.check_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tokio::select! {
                            outcomes = self.tick() => {
                                if !outcomes.is_empty() {
                                    debug!(refreshes = outcomes.len(), "scheduler tick finished");
                                }
                            }
                            _ = shutdown_rx.changed() => {
                                warn!("Refresh scheduler stopping, abandoning in-progress refresh");
                                break;
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Refresh scheduler stopped");
        });

        SchedulerHandle {
            shutdown_tx,
            join,
            timeout,
        }
    }
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    timeout: Duration,
}

impl SchedulerHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signals the loop to stop and waits for it, at most the configured
    /// shutdown timeout. Returns `false` if the loop had to be aborted.
    pub async fn shutdown(mut self) -> bool {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(self.timeout, &mut self.join).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Refresh scheduler did not stop in time, aborting"
                );
                self.join.abort();
                false
            }
        }
    }
}
