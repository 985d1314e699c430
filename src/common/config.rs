//! Configuration for geodispatch components

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment prefix for overrides, e.g. `GEODISPATCH__DISPATCH__MAX_RADIUS_KM=60`
pub const ENV_PREFIX: &str = "GEODISPATCH";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub state: StateStoreConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub geo: GeoConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            state: StateStoreConfig::default(),
            history: HistoryConfig::default(),
            geo: GeoConfig::default(),
            dispatch: DispatchConfig::default(),
            reconcile: ReconcileConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply
    /// `GEODISPATCH__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if !(d.initial_radius_km > 0.0) {
            return Err(Error::InvalidConfig(
                "dispatch.initial_radius_km must be positive".into(),
            ));
        }
        if d.max_radius_km < d.initial_radius_km {
            return Err(Error::InvalidConfig(
                "dispatch.max_radius_km must be >= initial_radius_km".into(),
            ));
        }
        if !(d.growth_factor > 1.0) {
            return Err(Error::InvalidConfig(
                "dispatch.growth_factor must be > 1".into(),
            ));
        }
        if d.max_candidates == 0 {
            return Err(Error::InvalidConfig(
                "dispatch.max_candidates must be at least 1".into(),
            ));
        }
        if d.store_retries == 0 {
            return Err(Error::InvalidConfig(
                "dispatch.store_retries must be at least 1".into(),
            ));
        }
        if h3o::Resolution::try_from(self.geo.resolution).is_err() {
            return Err(Error::InvalidConfig(format!(
                "geo.resolution {} is not a valid H3 resolution",
                self.geo.resolution
            )));
        }
        if self.state.backend == StateBackend::RocksDb && self.state.path.is_none() {
            return Err(Error::InvalidConfig(
                "state.path is required for the rocksdb backend".into(),
            ));
        }
        if self.history.backend == HistoryBackend::File && self.history.path.is_none() {
            return Err(Error::InvalidConfig(
                "history.path is required for the file backend".into(),
            ));
        }
        if self.history.sync_policy == SyncPolicy::Interval && self.history.sync_interval_ms == 0
        {
            return Err(Error::InvalidConfig(
                "history.sync_interval_ms must be positive for the interval policy".into(),
            ));
        }
        if self.reconcile.enabled && self.reconcile.interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "reconcile.interval_secs must be positive when reconciliation is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Maximum accepted request body
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_body_limit() -> usize {
    64 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Memory,
    #[serde(alias = "rocks")]
    RocksDb,
}

/// State-of-record store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateStoreConfig {
    #[serde(default)]
    pub backend: StateBackend,

    /// RocksDB directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    #[default]
    Memory,
    File,
}

/// When the history log flushes appended records to disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    /// fsync after every append
    #[default]
    Always,
    /// flush the write buffer after every append, fsync every
    /// `history.sync_interval_ms`
    Interval,
    /// leave it to the OS
    Never,
}

/// History log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub backend: HistoryBackend,

    /// Log file path
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub sync_policy: SyncPolicy,

    /// Background fsync period for the `interval` policy
    #[serde(default = "default_sync_interval")]
    pub sync_interval_ms: u64,
}

fn default_sync_interval() -> u64 {
    1000
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::default(),
            path: None,
            sync_policy: SyncPolicy::default(),
            sync_interval_ms: default_sync_interval(),
        }
    }
}

/// Geo index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    /// H3 resolution used to bucket entries (7 is ~1.2 km edges)
    #[serde(default = "default_resolution")]
    pub resolution: u8,
}

fn default_resolution() -> u8 {
    7
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
        }
    }
}

/// Dispatch coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Radius of the first nearest-driver query
    #[serde(default = "default_initial_radius")]
    pub initial_radius_km: f64,

    /// Upper bound of the radius ladder
    #[serde(default = "default_max_radius")]
    pub max_radius_km: f64,

    /// Multiplier applied between ladder rungs
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Candidates returned per ride request
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Timeout applied to every store call
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Attempts for durable-path store calls (state store, history log)
    #[serde(default = "default_store_retries")]
    pub store_retries: usize,

    /// Initial backoff between attempts, doubled each retry
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Default history window when the caller gives no start time
    #[serde(default = "default_history_window")]
    pub history_window_mins: i64,
}

fn default_initial_radius() -> f64 {
    5.0
}
fn default_max_radius() -> f64 {
    40.0
}
fn default_growth_factor() -> f64 {
    2.0
}
fn default_max_candidates() -> usize {
    5
}
fn default_store_timeout() -> u64 {
    500
}
fn default_store_retries() -> usize {
    3
}
fn default_retry_backoff() -> u64 {
    20
}
fn default_history_window() -> i64 {
    30
}

impl DispatchConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            initial_radius_km: default_initial_radius(),
            max_radius_km: default_max_radius(),
            growth_factor: default_growth_factor(),
            max_candidates: default_max_candidates(),
            store_timeout_ms: default_store_timeout(),
            store_retries: default_store_retries(),
            retry_backoff_ms: default_retry_backoff(),
            history_window_mins: default_history_window(),
        }
    }
}

/// Background reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_enabled")]
    pub enabled: bool,

    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
}

fn default_reconcile_enabled() -> bool {
    true
}
fn default_reconcile_interval() -> u64 {
    60
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconcile_enabled(),
            interval_secs: default_reconcile_interval(),
        }
    }
}
