//! # Engine Configuration
//!
//! Manages engine configuration including lock limits, reservation expiry,
//! alert delivery, order defaults and storage.
//!
//! ## Configuration Priority
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Sources                                │
//! │                                                                         │
//! │  Priority (highest to lowest):                                         │
//! │                                                                         │
//! │  1. Environment Variables                                              │
//! │     KEEL_DATABASE_PATH, KEEL_APPROVAL_THRESHOLD, KEEL_PORT, etc.       │
//! │                                                                         │
//! │  2. Config File (keel.toml)                                            │
//! │     Location: ~/.config/keel/erp/keel.toml (Linux)                     │
//! │               ~/Library/Application Support/com.keel.erp/ (macOS)      │
//! │               %APPDATA%\keel\erp\config\ (Windows)                     │
//! │                                                                         │
//! │  3. Default Values                                                     │
//! │     Hardcoded sensible defaults                                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "./keel.db"
//! max_connections = 8
//!
//! [ledger]
//! approval_threshold = 500
//! lock_soft_limit_ms = 5000
//! lock_hard_limit_ms = 30000
//!
//! [reservations]
//! quote_ttl_secs = 86400
//! sweep_interval_secs = 300
//! sweep_batch_size = 500
//!
//! [alerts]
//! default_cooldown_secs = 3600
//! queue_capacity = 1024
//! workers = 2
//! broadcast_capacity = 256
//!
//! [orders]
//! allow_over_credit_limit = false
//! number_prefix = "SO"
//! default_currency = "USD"
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff_ms = 50
//! max_backoff_ms = 2000
//!
//! [storage]
//! provider = "local"
//! root = "./data/objects"
//!
//! [sinks]
//! error_sample_rate = 1.0
//!
//! [server]
//! bind_addr = "0.0.0.0"
//! port = 8080
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use keel_db::pool::IN_MEMORY;
use keel_db::DbConfig;

use crate::error::{EngineError, EngineResult};

// =============================================================================
// Database Settings
// =============================================================================

/// Where the SQLite database lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Database file path. `:memory:` opens a throwaway database.
    #[serde(default = "default_database_path")]
    pub path: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    "./keel.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseSettings {
    /// Pool configuration for [`keel_db::Database::new`].
    pub fn db_config(&self) -> DbConfig {
        if self.path == IN_MEMORY {
            DbConfig::in_memory()
        } else {
            DbConfig::new(&self.path).max_connections(self.max_connections)
        }
    }
}

// =============================================================================
// Ledger Settings
// =============================================================================

/// Stock ledger behaviour.
///
/// ## Lock Limits
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │  0s ──────────── 5s (soft) ─────────────────────── 30s (hard)           │
/// │  │ lock held      │ warn! logged on release          │ unit of work     │
/// │  │                │                                  │ aborted with     │
/// │  │                │                                  │ TIMEOUT          │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// Negative adjustments of at least this many units are journaled as
    /// pending and wait for approval. 0 disables approval.
    #[serde(default)]
    pub approval_threshold: i64,

    #[serde(default = "default_lock_soft_limit")]
    pub lock_soft_limit_ms: u64,

    #[serde(default = "default_lock_hard_limit")]
    pub lock_hard_limit_ms: u64,
}

fn default_lock_soft_limit() -> u64 {
    5_000
}

fn default_lock_hard_limit() -> u64 {
    30_000
}

impl Default for LedgerSettings {
    fn default() -> Self {
        LedgerSettings {
            approval_threshold: 0,
            lock_soft_limit_ms: default_lock_soft_limit(),
            lock_hard_limit_ms: default_lock_hard_limit(),
        }
    }
}

impl LedgerSettings {
    pub fn soft_limit(&self) -> Duration {
        Duration::from_millis(self.lock_soft_limit_ms)
    }

    pub fn hard_limit(&self) -> Duration {
        Duration::from_millis(self.lock_hard_limit_ms)
    }

    /// True when a delta of `delta` units must wait for approval.
    pub fn requires_approval(&self, delta: i64) -> bool {
        self.approval_threshold > 0 && delta < 0 && -delta >= self.approval_threshold
    }
}

// =============================================================================
// Reservation Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationSettings {
    /// Age after which quote reservations are expired by the sweep.
    #[serde(default = "default_quote_ttl")]
    pub quote_ttl_secs: u64,

    /// Interval between expiry sweeps. 0 disables the background sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Upper bound on reservations expired per sweep.
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch_size: u32,
}

fn default_quote_ttl() -> u64 {
    86_400
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_sweep_batch() -> u32 {
    500
}

impl Default for ReservationSettings {
    fn default() -> Self {
        ReservationSettings {
            quote_ttl_secs: default_quote_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch(),
        }
    }
}

// =============================================================================
// Alert Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    /// Cooldown applied to alerts created without one.
    #[serde(default = "default_cooldown")]
    pub default_cooldown_secs: i64,

    /// Capacity of the post-commit notification queue. Notifications
    /// arriving while it is full are dropped and logged.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_alert_workers")]
    pub workers: usize,

    /// Capacity of the fired-alert broadcast channel.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_cooldown() -> i64 {
    keel_core::alert::DEFAULT_COOLDOWN_SECS
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_alert_workers() -> usize {
    2
}

fn default_broadcast_capacity() -> usize {
    256
}

impl Default for AlertSettings {
    fn default() -> Self {
        AlertSettings {
            default_cooldown_secs: default_cooldown(),
            queue_capacity: default_queue_capacity(),
            workers: default_alert_workers(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

// =============================================================================
// Order Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSettings {
    /// Skip the credit check at submit and confirm.
    #[serde(default)]
    pub allow_over_credit_limit: bool,

    #[serde(default = "default_number_prefix")]
    pub number_prefix: String,

    #[serde(default = "default_currency")]
    pub default_currency: String,
}

fn default_number_prefix() -> String {
    "SO".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Default for OrderSettings {
    fn default() -> Self {
        OrderSettings {
            allow_over_credit_limit: false,
            number_prefix: default_number_prefix(),
            default_currency: default_currency(),
        }
    }
}

// =============================================================================
// Retry Settings
// =============================================================================

/// Bounded exponential backoff for retryable storage failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Total attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    50
}

fn default_max_backoff() -> u64 {
    2_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

// =============================================================================
// Storage Settings
// =============================================================================

/// Object storage back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    Local,
    S3,
    Minio,
}

impl std::fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageProvider::Local => write!(f, "local"),
            StorageProvider::S3 => write!(f, "s3"),
            StorageProvider::Minio => write!(f, "minio"),
        }
    }
}

impl std::str::FromStr for StorageProvider {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(StorageProvider::Local),
            "s3" => Ok(StorageProvider::S3),
            "minio" => Ok(StorageProvider::Minio),
            _ => Err(EngineError::InvalidConfig(format!(
                "Unknown storage provider: {}. Use 'local', 's3', or 'minio'",
                s
            ))),
        }
    }
}

/// Object storage configuration for product images and order files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,

    #[serde(default)]
    pub bucket: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint (MinIO or S3-compatible).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Root directory of the local provider.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/objects")
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            provider: StorageProvider::default(),
            bucket: None,
            region: None,
            endpoint: None,
            root: default_storage_root(),
        }
    }
}

// =============================================================================
// Sink Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkSettings {
    /// Fraction of error events forwarded to the reporter (0.0 - 1.0).
    #[serde(default = "default_sample_rate")]
    pub error_sample_rate: f64,
}

fn default_sample_rate() -> f64 {
    1.0
}

impl Default for SinkSettings {
    fn default() -> Self {
        SinkSettings {
            error_sample_rate: default_sample_rate(),
        }
    }
}

// =============================================================================
// Server Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            bind_addr: default_bind_addr(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub ledger: LedgerSettings,

    #[serde(default)]
    pub reservations: ReservationSettings,

    #[serde(default)]
    pub alerts: AlertSettings,

    #[serde(default)]
    pub orders: OrderSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sinks: SinkSettings,

    #[serde(default)]
    pub server: ServerSettings,
}

impl EngineConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (keel.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> EngineResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| EngineError::ConfigLoad(format!("{}: {}", path.display(), e)))?;
                config = Self::from_toml(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parses a TOML document. Missing sections take their defaults.
    pub fn from_toml(contents: &str) -> EngineResult<Self> {
        toml::from_str(contents).map_err(|e| EngineError::ConfigLoad(e.to_string()))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> EngineResult<()> {
        if self.database.path.trim().is_empty() {
            return Err(EngineError::InvalidConfig("database.path must not be empty".into()));
        }
        if self.database.max_connections == 0 {
            return Err(EngineError::InvalidConfig(
                "database.max_connections must be greater than 0".into(),
            ));
        }
        if self.ledger.approval_threshold < 0 {
            return Err(EngineError::InvalidConfig(
                "ledger.approval_threshold must not be negative".into(),
            ));
        }
        if self.ledger.lock_hard_limit_ms == 0
            || self.ledger.lock_soft_limit_ms > self.ledger.lock_hard_limit_ms
        {
            return Err(EngineError::InvalidConfig(format!(
                "lock limits must satisfy 0 < soft ({}) <= hard ({})",
                self.ledger.lock_soft_limit_ms, self.ledger.lock_hard_limit_ms
            )));
        }
        if self.reservations.sweep_batch_size == 0 {
            return Err(EngineError::InvalidConfig(
                "reservations.sweep_batch_size must be greater than 0".into(),
            ));
        }
        if self.alerts.queue_capacity == 0 || self.alerts.workers == 0 {
            return Err(EngineError::InvalidConfig(
                "alerts.queue_capacity and alerts.workers must be greater than 0".into(),
            ));
        }
        if self.alerts.broadcast_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "alerts.broadcast_capacity must be greater than 0".into(),
            ));
        }
        if self.alerts.default_cooldown_secs < 0 {
            return Err(EngineError::InvalidConfig(
                "alerts.default_cooldown_secs must not be negative".into(),
            ));
        }
        keel_core::validation::validate_currency(&self.orders.default_currency)
            .map_err(|e| EngineError::InvalidConfig(format!("orders.{}", e)))?;
        if self.orders.number_prefix.trim().is_empty() {
            return Err(EngineError::InvalidConfig(
                "orders.number_prefix must not be empty".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(EngineError::InvalidConfig(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.sinks.error_sample_rate) {
            return Err(EngineError::InvalidConfig(
                "sinks.error_sample_rate must be between 0.0 and 1.0".into(),
            ));
        }
        if self.storage.provider != StorageProvider::Local && self.storage.bucket.is_none() {
            return Err(EngineError::InvalidConfig(format!(
                "storage.bucket is required for the {} provider",
                self.storage.provider
            )));
        }
        Ok(())
    }

    /// Applies `KEEL_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from any variable source.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("KEEL_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = path;
        }
        parse_into(&var, "KEEL_DB_MAX_CONNECTIONS", &mut self.database.max_connections);
        parse_into(&var, "KEEL_APPROVAL_THRESHOLD", &mut self.ledger.approval_threshold);
        parse_into(&var, "KEEL_LOCK_SOFT_LIMIT_MS", &mut self.ledger.lock_soft_limit_ms);
        parse_into(&var, "KEEL_LOCK_HARD_LIMIT_MS", &mut self.ledger.lock_hard_limit_ms);
        parse_into(&var, "KEEL_QUOTE_TTL_SECS", &mut self.reservations.quote_ttl_secs);
        parse_into(&var, "KEEL_SWEEP_INTERVAL_SECS", &mut self.reservations.sweep_interval_secs);
        parse_into(&var, "KEEL_ALERT_WORKERS", &mut self.alerts.workers);
        parse_into(&var, "KEEL_ALERT_QUEUE_CAPACITY", &mut self.alerts.queue_capacity);
        parse_into(&var, "KEEL_ALLOW_OVER_CREDIT_LIMIT", &mut self.orders.allow_over_credit_limit);
        if let Some(prefix) = var("KEEL_ORDER_PREFIX") {
            self.orders.number_prefix = prefix;
        }
        parse_into(&var, "KEEL_RETRY_MAX_ATTEMPTS", &mut self.retry.max_attempts);
        if let Some(provider) = var("KEEL_STORAGE_PROVIDER") {
            match provider.parse() {
                Ok(p) => self.storage.provider = p,
                Err(_) => warn!(provider = %provider, "Unknown storage provider in environment"),
            }
        }
        if let Some(bucket) = var("KEEL_STORAGE_BUCKET") {
            self.storage.bucket = Some(bucket);
        }
        if let Some(root) = var("KEEL_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        parse_into(&var, "KEEL_ERROR_SAMPLE_RATE", &mut self.sinks.error_sample_rate);
        if let Some(addr) = var("KEEL_BIND_ADDR") {
            self.server.bind_addr = addr;
        }
        parse_into(&var, "KEEL_PORT", &mut self.server.port);
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "keel", "erp")
            .map(|dirs| dirs.config_dir().join("keel.toml"))
    }
}

/// Overwrites `slot` when the variable is set and parses.
fn parse_into<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) {
    if let Some(raw) = var(name) {
        match raw.parse() {
            Ok(value) => {
                debug!(variable = name, "Overriding config from environment");
                *slot = value;
            }
            Err(_) => warn!(variable = name, value = %raw, "Ignoring unparsable environment override"),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
