use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use lineage_cache::{RedisConfig, RetryPolicy};
use lineage_db_postgres::PostgresConfig;
use lineage_engine::{CacheConfig, EngineConfig, ResolutionConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// Distributed cache tier (L2)
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Backoff for distributed cache calls
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub refresh: SchedulerConfig,
    #[serde(default)]
    pub resolution: ResolutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named capability flags, e.g. `refresh.smart_trigger = true`
    #[serde(default)]
    pub features: HashMap<String, bool>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        // Cache validations
        if self.cache.local_capacity == 0 {
            return Err("cache.local_capacity must be > 0".into());
        }
        if self.cache.local_ttl_secs == 0 || self.cache.distributed_ttl_secs == 0 {
            return Err("cache ttls must be > 0".into());
        }
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err("retry.jitter must be within [0, 1]".into());
        }
        if self.retry.op_timeout_ms == 0 {
            return Err("retry.op_timeout_ms must be > 0".into());
        }
        // Refresh validations
        if self.refresh.check_interval_secs == 0 {
            return Err("refresh.check_interval_secs must be > 0".into());
        }
        if self.refresh.max_parallel == 0 || self.refresh.rebuild_concurrency == 0 {
            return Err("refresh.max_parallel and refresh.rebuild_concurrency must be > 0".into());
        }
        let mut seen = HashSet::new();
        for view in &self.refresh.views {
            if view.name.trim().is_empty() {
                return Err("refresh.views[].name must not be empty".into());
            }
            if !seen.insert(view.name.as_str()) {
                return Err(format!("duplicate refresh view name '{}'", view.name));
            }
            if view.time_threshold_secs == 0 || view.change_threshold == 0 {
                return Err(format!(
                    "refresh view '{}' thresholds must be > 0",
                    view.name
                ));
            }
        }
        // Resolution validations
        if self.resolution.latency_target_ms == 0 {
            return Err("resolution.latency_target_ms must be > 0".into());
        }
        if self.resolution.latency_window == 0 {
            return Err("resolution.latency_window must be > 0".into());
        }
        // Storage validations
        let pg = &self.storage.postgres;
        if pg.pool_size == 0 {
            return Err("storage.postgres.pool_size must be > 0".into());
        }
        if !(1..=100).contains(&pg.pool_high_water_pct) {
            return Err("storage.postgres.pool_high_water_pct must be within 1..=100".into());
        }
        if pg.pool_monitor_interval_secs == 0 {
            return Err("storage.postgres.pool_monitor_interval_secs must be > 0".into());
        }
        if self.storage.backend == StorageBackend::Postgres && pg.url.trim().is_empty() {
            return Err("storage.backend=postgres requires storage.postgres.url".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let ip: std::net::IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0]));
        SocketAddr::from((ip, self.server.port))
    }

    /// The subset consumed by the resolution engine.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cache: self.cache.clone(),
            retry: self.retry.clone(),
            resolution: self.resolution.clone(),
            refresh: self.refresh.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_body_limit_bytes() -> usize {
    64 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit_bytes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File, FileFormat};
    use std::path::{Path, PathBuf};

    pub const DEFAULT_CONFIG_PATH: &str = "lineage.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf).format(FileFormat::Toml));
        } else if path.is_some() {
            tracing::warn!(path = %pathbuf.display(), "config file not found, using defaults");
        }
        // Environment variable overrides, e.g., LINEAGE__CACHE__LOCAL_CAPACITY=5000
        builder = builder.add_source(
            Environment::with_prefix("LINEAGE")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<AppConfig, String> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_engine::ViewConfig;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.cache.local_capacity, 10_000);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.resolution.latency_target_ms, 10);
        assert!(cfg.resolution.reject_stale_hits);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut cfg = AppConfig::default();
        cfg.cache.local_capacity = 0;
        assert!(cfg.validate().unwrap_err().contains("local_capacity"));
    }

    #[test]
    fn test_rejects_zero_op_timeout() {
        let mut cfg = AppConfig::default();
        cfg.retry.op_timeout_ms = 0;
        assert!(cfg.validate().unwrap_err().contains("op_timeout_ms"));
    }

    #[test]
    fn test_rejects_duplicate_views() {
        let mut cfg = AppConfig::default();
        cfg.refresh.views = vec![ViewConfig::new("acme"), ViewConfig::new("acme")];
        assert!(cfg.validate().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_rejects_zero_view_threshold() {
        let mut cfg = AppConfig::default();
        cfg.refresh.views = vec![ViewConfig::new("acme").with_change_threshold(0)];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_high_water_out_of_range() {
        let mut cfg = AppConfig::default();
        cfg.storage.postgres.pool_high_water_pct = 0;
        assert!(cfg.validate().is_err());
        cfg.storage.postgres.pool_high_water_pct = 101;
        assert!(cfg.validate().is_err());
        cfg.storage.postgres.pool_high_water_pct = 100;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let mut cfg = AppConfig::default();
        cfg.logging.level = "verbose".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_engine_config_carries_sections() {
        let mut cfg = AppConfig::default();
        cfg.cache.local_capacity = 42;
        cfg.refresh.views = vec![ViewConfig::new("acme")];
        let engine = cfg.engine_config();
        assert_eq!(engine.cache.local_capacity, 42);
        assert_eq!(engine.refresh.views.len(), 1);
    }

    #[test]
    fn test_addr_falls_back_to_unspecified() {
        let mut cfg = AppConfig::default();
        cfg.server.host = "not-an-ip".into();
        cfg.server.port = 9000;
        assert_eq!(cfg.addr().to_string(), "0.0.0.0:9000");
    }
}
