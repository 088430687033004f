//! Metric emission for the resolution engine.
//!
//! Everything goes through the `metrics` facade; the process decides which
//! recorder (if any) is installed. Without a recorder these calls are no-ops.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    // Resolution metrics
    pub const CACHE_HITS_TOTAL: &str = "lineage_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "lineage_cache_misses_total";
    pub const RESOLVE_DURATION_SECONDS: &str = "lineage_resolve_duration_seconds";
    pub const RESOLVE_WITHIN_TARGET_TOTAL: &str = "lineage_resolve_within_target_total";
    pub const RESOLVE_ERRORS_TOTAL: &str = "lineage_resolve_errors_total";
    pub const STALE_ANSWERS_TOTAL: &str = "lineage_stale_answers_total";
    pub const LOCAL_CACHE_ENTRIES: &str = "lineage_local_cache_entries";

    // Distributed tier
    pub const L2_RETRIES_TOTAL: &str = "lineage_l2_retries_total";
    pub const L2_EXHAUSTED_TOTAL: &str = "lineage_l2_exhausted_total";

    // Refresh metrics
    pub const REFRESH_DURATION_SECONDS: &str = "lineage_refresh_duration_seconds";
    pub const REFRESH_FAILURES_TOTAL: &str = "lineage_refresh_failures_total";
    pub const REFRESH_PENDING_CHANGES: &str = "lineage_refresh_pending_changes";

    // Database pool metrics
    pub const DB_POOL_CONNECTIONS_TOTAL: &str = "lineage_db_pool_connections_total";
    pub const DB_POOL_CONNECTIONS_IDLE: &str = "lineage_db_pool_connections_idle";
    pub const DB_POOL_CONNECTIONS_ACTIVE: &str = "lineage_db_pool_connections_active";
    pub const DB_POOL_UTILIZATION: &str = "lineage_db_pool_utilization";
}

// =============================================================================
// Resolution Metrics
// =============================================================================

/// Record a hit on a cache tier (`L1` or `L2`).
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a resolution that missed both cache tiers.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Record the duration of a successful resolution.
pub fn record_resolution(tier: &'static str, duration: Duration, within_target: bool) {
    histogram!(names::RESOLVE_DURATION_SECONDS, "tier" => tier).record(duration.as_secs_f64());
    if within_target {
        counter!(names::RESOLVE_WITHIN_TARGET_TOTAL).increment(1);
    }
}

/// Record a resolution surfaced to the caller as an error.
pub fn record_resolve_error(category: &str) {
    counter!(names::RESOLVE_ERRORS_TOTAL, "category" => category.to_string()).increment(1);
}

/// Record a cached answer older than the latest known mutation.
pub fn record_stale_answer(tier: &'static str, rejected: bool) {
    let action = if rejected { "rejected" } else { "served" };
    counter!(names::STALE_ANSWERS_TOTAL, "tier" => tier, "action" => action).increment(1);
}

pub fn set_local_cache_entries(count: usize) {
    gauge!(names::LOCAL_CACHE_ENTRIES).set(count as f64);
}

/// Publish the cumulative retry counters of the distributed tier.
pub fn set_l2_retry_totals(retries: u64, exhausted: u64) {
    counter!(names::L2_RETRIES_TOTAL).absolute(retries);
    counter!(names::L2_EXHAUSTED_TOTAL).absolute(exhausted);
}

// =============================================================================
// Refresh Metrics
// =============================================================================

pub fn record_refresh(view: &str, duration: Duration) {
    histogram!(names::REFRESH_DURATION_SECONDS, "view" => view.to_string())
        .record(duration.as_secs_f64());
}

pub fn record_refresh_failure(view: &str) {
    counter!(names::REFRESH_FAILURES_TOTAL, "view" => view.to_string()).increment(1);
}

pub fn set_pending_changes(view: &str, pending: u64) {
    gauge!(names::REFRESH_PENDING_CHANGES, "view" => view.to_string()).set(pending as f64);
}

// =============================================================================
// Database Pool Metrics
// =============================================================================

/// Record database pool statistics.
pub fn record_db_pool_stats(total: u32, idle: u32, active: u32, utilization: f64) {
    gauge!(names::DB_POOL_CONNECTIONS_TOTAL).set(f64::from(total));
    gauge!(names::DB_POOL_CONNECTIONS_IDLE).set(f64::from(idle));
    gauge!(names::DB_POOL_CONNECTIONS_ACTIVE).set(f64::from(active));
    gauge!(names::DB_POOL_UTILIZATION).set(utilization);
}
