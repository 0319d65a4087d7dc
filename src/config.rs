//! Configuration management for Quotagate.
//!
//! Settings come from an optional YAML file with `QUOTAGATE__` prefixed
//! environment variables layered on top, e.g.
//! `QUOTAGATE__STORE__BACKEND=postgres` or `QUOTAGATE__SERVER__GRPC_ADDR=0.0.0.0:8081`.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{QuotaError, Result};
use crate::ratelimit::{
    AddressHasher, IdentityResolver, PolicyRegistry, RateLimitPolicy, DEFAULT_BATCH_SIZE,
    DEFAULT_RETENTION_HOURS, MAX_DURATION_SECONDS,
};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration for the Quotagate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Quota store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Expired entry cleanup
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Policies merged over the built-in table
    #[serde(default)]
    pub policies: HashMap<String, RateLimitPolicy>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 8081))
}

/// Which store keeps the quota entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local, for single instance deployments and tests
    #[default]
    Memory,
    /// Shared PostgreSQL table
    Postgres,
}

impl StoreBackend {
    /// Whether counters are shared by every instance using the same settings.
    pub fn is_shared(&self) -> bool {
        matches!(self, StoreBackend::Postgres)
    }
}

/// Quota store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection string, required for the postgres backend
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Upper bound on one check-and-consume transaction
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,

    /// Attempts made when a transaction conflicts
    #[serde(default = "default_max_transaction_attempts")]
    pub max_transaction_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            database_url: None,
            max_connections: default_max_connections(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            max_transaction_attempts: default_max_transaction_attempts(),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_transaction_timeout_ms() -> u64 {
    2000
}

fn default_max_transaction_attempts() -> u32 {
    5
}

/// Expired entry cleanup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Seconds between cleanup runs, `0` disables the background task
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Inactivity after which an entry may be removed
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,

    /// Entries removed per run
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            retention_hours: default_retention_hours(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_retention_hours() -> i64 {
    DEFAULT_RETENTION_HOURS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Secret for keyed address hashing; plain hashing when unset
    #[serde(default)]
    pub address_hash_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl QuotaConfig {
    /// Load configuration from an optional file plus environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        }

        let config: QuotaConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document, without environment overrides.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: QuotaConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.store.backend == StoreBackend::Postgres && self.store.database_url.is_none() {
            return Err(QuotaError::Config(
                "store.database_url is required for the postgres backend".to_string(),
            ));
        }
        if self.store.transaction_timeout_ms == 0 {
            return Err(QuotaError::Config(
                "store.transaction_timeout_ms must be positive".to_string(),
            ));
        }
        if self.maintenance.retention_hours < 0 {
            return Err(QuotaError::Config(
                "maintenance.retention_hours must not be negative".to_string(),
            ));
        }
        if self.maintenance.retention_hours as u64 > MAX_DURATION_SECONDS / 3600 {
            return Err(QuotaError::Config(
                "maintenance.retention_hours exceeds ten years".to_string(),
            ));
        }
        self.policy_registry().map(|_| ())
    }

    /// Built-in policies with the configured ones merged over them.
    pub fn policy_registry(&self) -> Result<PolicyRegistry> {
        let mut registry = PolicyRegistry::builtin();
        registry.extend(self.policies.iter().map(|(k, v)| (k.clone(), *v)))?;
        Ok(registry)
    }

    pub fn identity_resolver(&self) -> IdentityResolver {
        let hasher = match self.identity.address_hash_key.as_deref() {
            Some(key) if !key.is_empty() => AddressHasher::keyed(key),
            _ => AddressHasher::Plain,
        };
        IdentityResolver::new(hasher)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.store.transaction_timeout_ms)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.maintenance.retention_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Interval of the background cleanup, `None` when disabled.
    pub fn maintenance_interval(&self) -> Option<Duration> {
        match self.maintenance.interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}
