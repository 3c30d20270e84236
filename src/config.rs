//! Layered configuration
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. TOML file (`--config`, `TEMPO_CONFIG_PATH`, or `./tempo.toml` if present)
//! 3. `TEMPO__SECTION__KEY` environment variables (plus `TEMPO_DATABASE_URL`)
//! 4. Explicit builder overrides
//!
//! `.env` files are loaded into the environment first.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_CONFIG_FILE: &str = "tempo.toml";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local stores; state is lost on exit
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend: StoreBackend,
    pub database: DatabaseConfig,
    pub node: NodeConfig,
    pub locks: LockConfig,
    pub engine: EngineConfig,
    pub interlink: InterlinkConfig,
    pub polling: PollingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Stable identity used in lock holder tokens; generated when unset
    pub node_id: Option<String>,
    /// Partition served by this node; unset means every partition
    pub partition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_secs: u64,
    pub store_timeout_ms: u64,
    /// Heartbeat extension interval for long critical sections; 0 disables
    pub heartbeat_ms: u64,
    /// Longest a heartbeat keeps a lock alive; 0 means no limit
    pub max_duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub recovery_interval_secs: u64,
    pub lock_max_retries: u32,
    pub lock_backoff_ms: u64,
    pub lock_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterlinkConfig {
    pub enabled: bool,
    pub suppression_window_secs: u64,
    pub fingerprint_bucket_secs: u64,
    pub flagger_capacity: usize,
    pub flagger_threshold: u32,
    pub poll_interval_ms: u64,
    pub max_apply_attempts: u32,
    pub retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub cluster_lock_enabled: bool,
    pub housekeeping_interval_secs: u64,
    pub housekeeping_lock_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            database: DatabaseConfig::default(),
            node: NodeConfig::default(),
            locks: LockConfig::default(),
            engine: EngineConfig::default(),
            interlink: InterlinkConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            min_connections: 2,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            store_timeout_ms: 2_000,
            heartbeat_ms: 0,
            max_duration_secs: 600,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 32,
            recovery_interval_secs: 30,
            lock_max_retries: 5,
            lock_backoff_ms: 50,
            lock_backoff_max_ms: 1_000,
        }
    }
}

impl Default for InterlinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suppression_window_secs: 60,
            fingerprint_bucket_secs: 10,
            flagger_capacity: 10_000,
            flagger_threshold: 1,
            poll_interval_ms: 1_000,
            max_apply_attempts: 3,
            retention_secs: 86_400,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            cluster_lock_enabled: true,
            housekeeping_interval_secs: 60,
            housekeeping_lock_secs: 60,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_ms > 0).then(|| Duration::from_millis(self.heartbeat_ms))
    }

    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }
}

impl InterlinkConfig {
    pub fn suppression_window(&self) -> Duration {
        Duration::from_secs(self.suppression_window_secs)
    }

    pub fn fingerprint_bucket(&self) -> Duration {
        Duration::from_secs(self.fingerprint_bucket_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Load with no explicit overrides
    pub fn load() -> Result<Self> {
        Self::builder().build()
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend == StoreBackend::Postgres && self.database.url.is_none() {
            return Err(Error::Config(
                "database.url is required for the postgres backend \
                 (set TEMPO_DATABASE_URL or pass --database-url)"
                    .to_string(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(Error::Config(format!(
                "database.min_connections ({}) exceeds database.max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }
        if self.engine.max_concurrency == 0 {
            return Err(Error::Config(
                "engine.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.locks.ttl_secs == 0 {
            return Err(Error::Config("locks.ttl_secs must be at least 1".to_string()));
        }
        let intervals = [
            ("engine.recovery_interval_secs", self.engine.recovery_interval_secs),
            ("polling.housekeeping_interval_secs", self.polling.housekeeping_interval_secs),
            ("interlink.poll_interval_ms", self.interlink.poll_interval_ms),
        ];
        if let Some((key, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{} must be at least 1", key)));
        }
        if self.interlink.flagger_threshold == 0 {
            return Err(Error::Config(
                "interlink.flagger_threshold must be at least 1".to_string(),
            ));
        }
        if self.interlink.fingerprint_bucket_secs == 0 {
            return Err(Error::Config(
                "interlink.fingerprint_bucket_secs must be at least 1".to_string(),
            ));
        }
        if self.interlink.max_apply_attempts == 0 {
            return Err(Error::Config(
                "interlink.max_apply_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    database_url: Option<String>,
    config_path: Option<PathBuf>,
    backend: Option<StoreBackend>,
    partition: Option<String>,
    node_id: Option<String>,
}

impl ConfigBuilder {
    pub fn database_url(mut self, url: Option<String>) -> Self {
        self.database_url = url;
        self
    }

    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn backend(mut self, backend: Option<StoreBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn partition(mut self, partition: Option<String>) -> Self {
        self.partition = partition;
        self
    }

    pub fn node_id(mut self, node_id: Option<String>) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn build(self) -> Result<Config> {
        let _ = dotenvy::dotenv();

        let defaults = config::Config::try_from(&Config::default()).map_err(config_error)?;
        let mut builder = config::Config::builder().add_source(defaults);

        match self.resolve_path() {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                builder = builder.add_source(config::File::from(path));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(config::File::with_name(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TEMPO")
                .separator("__")
                .try_parsing(true),
        );

        let database_url = self
            .database_url
            .or_else(|| std::env::var("TEMPO_DATABASE_URL").ok());

        builder = builder
            .set_override_option("database.url", database_url)
            .map_err(config_error)?
            .set_override_option("node.partition", self.partition)
            .map_err(config_error)?
            .set_override_option("node.node_id", self.node_id)
            .map_err(config_error)?;
        if let Some(backend) = self.backend {
            let backend = match backend {
                StoreBackend::Memory => "memory",
                StoreBackend::Postgres => "postgres",
            };
            builder = builder
                .set_override("backend", backend)
                .map_err(config_error)?;
        }

        let config: Config = builder
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }

    fn resolve_path(&self) -> Option<PathBuf> {
        self.config_path
            .clone()
            .or_else(|| std::env::var("TEMPO_CONFIG_PATH").ok().map(PathBuf::from))
    }
}

fn config_error(err: config::ConfigError) -> Error {
    Error::Config(err.to_string())
}
