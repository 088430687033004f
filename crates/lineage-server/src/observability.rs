//! Log filtering for the lineage server.
//!
//! The filter starts from `RUST_LOG` when set, else from the configured
//! level. Connection-pool and driver crates are held at `warn` so a `debug`
//! level shows tier decisions rather than pool chatter.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

/// Directives appended to every configured level.
pub const QUIET_DEPENDENCIES: &[&str] = &[
    "sqlx=warn",
    "deadpool_redis=warn",
    "redis=warn",
    "hyper=warn",
];

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

/// Builds the filter for a level such as `info` or `lineage_engine=debug`.
/// An unparsable level falls back to `info`.
pub fn level_filter(level: &str) -> EnvFilter {
    let base = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|d| d.parse().ok())
        .fold(base, EnvFilter::add_directive)
}

/// Installs the global subscriber at `info` until configuration is loaded.
pub fn init_tracing() {
    let filter = match std::env::var_os("RUST_LOG") {
        Some(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter("info")),
        None => level_filter("info"),
    };
    let (layer, handle) = reload::Layer::new(filter);
    if FILTER.set(handle).is_err() {
        return;
    }
    let _ = tracing_subscriber::registry()
        .with(layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Switches to the configured level. No-op when `RUST_LOG` is set or
/// tracing was never initialized.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let Some(handle) = FILTER.get() else {
        return;
    };
    match handle.reload(level_filter(level)) {
        Ok(()) => tracing::debug!(level, "log level applied"),
        Err(err) => tracing::warn!(level, error = %err, "failed to apply log level"),
    }
}
