//! Performance accounting for resolution calls.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lineage_cache::{LocalCacheStats, RetryStats};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::scheduler::ViewStatus;

pub const DEFAULT_LATENCY_TARGET: Duration = Duration::from_millis(10);
pub const DEFAULT_LATENCY_WINDOW: usize = 10_000;

/// Tier that produced an answer, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    L1,
    L2,
    L3,
    L4,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::L1, Tier::L2, Tier::L3, Tier::L4];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
            Self::L4 => "L4",
        }
    }

    /// `true` for the two cache tiers.
    pub fn is_cache(self) -> bool {
        matches!(self, Self::L1 | Self::L2)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hits on one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
    pub tier: Tier,
    pub hits: u64,
    /// Share of successful resolutions served by this tier.
    pub hit_rate: f64,
}

/// Latency percentiles over the recent sample window, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySnapshot {
    pub samples: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// Point-in-time resolution statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub total: u64,
    pub errors: u64,
    pub tiers: Vec<TierStats>,
    /// Share of successful resolutions served by L1 or L2.
    pub cache_hit_rate: f64,
    pub latency: LatencySnapshot,
    pub latency_target_ms: f64,
    /// Share of successful resolutions finishing within the target.
    pub compliance_rate: f64,
    pub stale_served: u64,
    pub stale_rejected: u64,
}

impl PerformanceSnapshot {
    pub fn tier_hits(&self, tier: Tier) -> u64 {
        self.tiers
            .iter()
            .find(|t| t.tier == tier)
            .map_or(0, |t| t.hits)
    }
}

/// Everything the statistics endpoint reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionStats {
    pub resolution: PerformanceSnapshot,
    pub local_cache: LocalCacheStats,
    /// `None` when no distributed tier is configured.
    pub distributed: Option<RetryStats>,
    pub views: Vec<ViewStatus>,
    /// Share of views refreshed within their time threshold.
    pub refresh_compliance_rate: f64,
}

/// Per-tier hit counters plus a sliding window of recent latencies.
///
/// Counters are atomics; the window is a short mutex-guarded ring buffer
/// touched once per call.
pub struct PerformanceTracker {
    target: Duration,
    window_size: usize,
    window: Mutex<VecDeque<Duration>>,
    hits: [AtomicU64; 4],
    errors: AtomicU64,
    within_target: AtomicU64,
    stale_served: AtomicU64,
    stale_rejected: AtomicU64,
}

impl PerformanceTracker {
    pub fn new(target: Duration, window_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            target,
            window_size,
            window: Mutex::new(VecDeque::with_capacity(window_size)),
            hits: Default::default(),
            errors: AtomicU64::new(0),
            within_target: AtomicU64::new(0),
            stale_served: AtomicU64::new(0),
            stale_rejected: AtomicU64::new(0),
        }
    }

    pub fn target(&self) -> Duration {
        self.target
    }

    /// Records a successful resolution and pushes its metrics.
    pub fn record(&self, tier: Tier, elapsed: Duration) {
        self.hits[tier.index()].fetch_add(1, Ordering::Relaxed);
        let within = elapsed <= self.target;
        if within {
            self.within_target.fetch_add(1, Ordering::Relaxed);
        }
        {
            let mut window = self.window.lock();
            if window.len() == self.window_size {
                window.pop_front();
            }
            window.push_back(elapsed);
        }

        if tier.is_cache() {
            crate::metrics::record_cache_hit(tier.as_str());
        } else {
            crate::metrics::record_cache_miss();
        }
        crate::metrics::record_resolution(tier.as_str(), elapsed, within);
    }

    pub fn record_error(&self, category: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_resolve_error(category);
    }

    /// Records a cached answer older than the latest mutation of its entity.
    pub fn record_stale(&self, tier: Tier, rejected: bool) {
        if rejected {
            self.stale_rejected.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stale_served.fetch_add(1, Ordering::Relaxed);
        }
        crate::metrics::record_stale_answer(tier.as_str(), rejected);
    }

    pub fn latency(&self) -> LatencySnapshot {
        let mut samples: Vec<Duration> = self.window.lock().iter().copied().collect();
        if samples.is_empty() {
            return LatencySnapshot::default();
        }
        samples.sort_unstable();
        LatencySnapshot {
            samples: samples.len(),
            p50_ms: millis(percentile(&samples, 0.50)),
            p95_ms: millis(percentile(&samples, 0.95)),
            p99_ms: millis(percentile(&samples, 0.99)),
            max_ms: millis(samples[samples.len() - 1]),
        }
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        let hits: Vec<u64> = self
            .hits
            .iter()
            .map(|h| h.load(Ordering::Relaxed))
            .collect();
        let succeeded: u64 = hits.iter().sum();
        let tiers = Tier::ALL
            .iter()
            .map(|&tier| TierStats {
                tier,
                hits: hits[tier.index()],
                hit_rate: ratio(hits[tier.index()], succeeded),
            })
            .collect();
        let errors = self.errors.load(Ordering::Relaxed);

        PerformanceSnapshot {
            total: succeeded + errors,
            errors,
            tiers,
            cache_hit_rate: ratio(hits[Tier::L1.index()] + hits[Tier::L2.index()], succeeded),
            latency: self.latency(),
            latency_target_ms: millis(self.target),
            compliance_rate: ratio(self.within_target.load(Ordering::Relaxed), succeeded),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            stale_rejected: self.stale_rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_TARGET, DEFAULT_LATENCY_WINDOW)
    }
}

impl fmt::Debug for PerformanceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerformanceTracker")
            .field("target", &self.target)
            .field("window_size", &self.window_size)
            .finish()
    }
}

/// Nearest-rank percentile of a sorted, non-empty slice.
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}
