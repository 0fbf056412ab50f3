//! Service configuration management

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use energy_monitor::MonitorConfig;
use fact_replication::ReplicationConfig;
use replica_balancer::BalancerConfig;

/// Main service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// ReplicaBalancer configuration
    pub balancer: BalancerConfig,

    /// EnergyMonitor configuration
    pub monitor: MonitorConfig,

    /// Fact replication configuration
    pub replication: ReplicationConfig,

    /// Event bus transport
    pub bus: BusConfig,

    /// Storage backend configuration
    pub storage: StorageConfig,

    /// Service-level configuration
    pub service: ServiceSettings,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// In-process bus; every role must run in this one process
    Memory,
    /// Redis lists shared by every process of the fleet
    Redis,
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub backend: BusBackend,

    /// Used when `backend` is `redis`
    pub redis_url: String,

    /// Namespace for every Redis key the bus writes
    pub key_prefix: String,
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// Required when `backend` is `postgres`
    pub database_url: Option<String>,

    pub max_connections: u32,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,

    /// How often idle real-time topics are dropped, in milliseconds
    pub housekeeping_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Periodically log component counters
    pub enabled: bool,

    /// Reporting interval in milliseconds
    pub interval_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: fleet_bus::redis_bus::DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { backend: StorageBackend::Memory, database_url: None, max_connections: 5 }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self { shutdown_timeout_secs: 10, housekeeping_interval_ms: 60_000 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true, interval_ms: 30_000 }
    }
}

/// Load configuration: defaults, then the TOML file, then `FLEET_*` variables,
/// then the plain deployment variables.
pub fn load_config(path: Option<&Path>) -> Result<ServiceConfig> {
    if let Ok(env_file) = dotenv::dotenv() {
        tracing::debug!("Loaded environment from {:?}", env_file);
    }

    let defaults = Config::try_from(&ServiceConfig::default())
        .context("Failed to serialize default configuration")?;
    let mut builder = Config::builder().add_source(defaults);

    if let Some(path) = path {
        tracing::debug!("Loading configuration from file: {:?}", path);
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }

    // FLEET_MONITOR__THRESHOLD=120 -> monitor.threshold
    builder = builder.add_source(
        Environment::with_prefix("FLEET")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let mut config: ServiceConfig = builder
        .build()
        .context("Failed to build configuration")?
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    apply_legacy_env(&mut config, |key| std::env::var(key).ok())?;
    validate_config(&config)?;

    Ok(config)
}

/// Apply the plain variables used by existing deployments
pub fn apply_legacy_env<F>(config: &mut ServiceConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(replica_id) = lookup("REPLICA_ID") {
        config.monitor.replica_id = replica_id
            .trim()
            .parse()
            .with_context(|| format!("Invalid REPLICA_ID: {}", replica_id))?;
    }

    if let Some(threshold) = lookup("ENERGY_CONSUMPTION_THRESHOLD") {
        config.monitor.threshold = threshold
            .trim()
            .parse()
            .with_context(|| format!("Invalid ENERGY_CONSUMPTION_THRESHOLD: {}", threshold))?;
    }

    if let Some(url) = lookup("DATABASE_URL") {
        config.storage.database_url = Some(url);
    }

    if let Some(url) = lookup("REDIS_URL") {
        config.bus.redis_url = url;
    }

    if let Some(url) = lookup("DEVICE_SERVICE_BASE_URL") {
        config.replication.propagation.base_url = Some(url);
    }

    Ok(())
}

/// Validate configuration
pub fn validate_config(config: &ServiceConfig) -> Result<()> {
    // Validate log level
    match config.logging.level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow::anyhow!("Invalid log level: {}", config.logging.level)),
    }

    // Validate log format
    match config.logging.format.as_str() {
        "json" | "pretty" | "compact" => {}
        _ => return Err(anyhow::anyhow!("Invalid log format: {}", config.logging.format)),
    }

    config.balancer.validate().context("Invalid [balancer] section")?;
    config.monitor.validate().context("Invalid [monitor] section")?;
    config.replication.validate().context("Invalid [replication] section")?;

    if config.bus.backend == BusBackend::Redis && config.bus.redis_url.trim().is_empty() {
        return Err(anyhow::anyhow!("Redis bus requires a redis url"));
    }

    if config.storage.backend == StorageBackend::Postgres && config.storage.database_url.is_none() {
        return Err(anyhow::anyhow!("Postgres storage requires a database url"));
    }

    if config.service.housekeeping_interval_ms == 0 {
        return Err(anyhow::anyhow!("Housekeeping interval must be positive"));
    }

    if config.metrics.enabled && config.metrics.interval_ms == 0 {
        return Err(anyhow::anyhow!("Metrics interval must be positive"));
    }

    Ok(())
}

/// Save configuration to a TOML file
pub fn save_config(config: &ServiceConfig, path: &Path) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("Failed to serialize configuration")?;
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write configuration to {:?}", path))?;
    Ok(())
}
