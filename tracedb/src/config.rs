//! The YAML configuration document and its loading rules.
//!
//! Every section has complete defaults so an empty file (or none at all)
//! yields a runnable all-in-one instance. `${VAR}` references are
//! expanded from the environment when `--config.expand-env` is set.

use data_types::limits::{duration_serde, Limits};
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf, time::Duration};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config file is not valid yaml: {0}")]
    Invalid(#[from] serde_yaml::Error),

    #[error("config references undefined environment variable {0:?}")]
    MissingEnvVar(String),
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub ring: RingConfig,
    pub distributor: DistributorSection,
    pub ingester: IngesterSection,
    pub storage: StorageConfig,
    pub compactor: CompactorSection,
    pub overrides: OverridesSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address of the readiness HTTP listener.
    pub http_listen_addr: String,
    /// Instance id advertised in rings; defaults to the hostname-ish
    /// fallback "tracedb-0".
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen_addr: "127.0.0.1:3200".to_string(),
            instance_id: "tracedb-0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RingConfig {
    pub replication_factor: usize,
    #[serde(with = "duration_serde")]
    pub heartbeat_period: Duration,
    #[serde(with = "duration_serde")]
    pub heartbeat_timeout: Duration,
    pub num_tokens: usize,
    /// Ring document key for ingesters.
    pub ingester_ring_key: String,
    /// Where ring tokens persist across restarts.
    pub tokens_file_path: Option<PathBuf>,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            heartbeat_period: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(60),
            num_tokens: 128,
            ingester_ring_key: "collectors/ring".to_string(),
            tokens_file_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributorSection {
    pub extend_writes: bool,
    pub log_received_traces: bool,
    #[serde(with = "duration_serde")]
    pub remote_timeout: Duration,
    /// Ring document key distributors use to count peers for the global
    /// rate strategy.
    pub override_ring_key: String,
}

impl Default for DistributorSection {
    fn default() -> Self {
        Self {
            extend_writes: true,
            log_received_traces: false,
            remote_timeout: Duration::from_secs(5),
            override_ring_key: "distributors/ring".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngesterSection {
    pub max_block_bytes: u64,
    #[serde(with = "duration_serde")]
    pub max_block_duration: Duration,
    #[serde(with = "duration_serde")]
    pub trace_idle_period: Duration,
    #[serde(with = "duration_serde")]
    pub max_trace_idle: Duration,
    #[serde(with = "duration_serde")]
    pub flush_check_period: Duration,
    #[serde(with = "duration_serde")]
    pub complete_block_timeout: Duration,
    pub concurrent_flushes: usize,
    pub flush_queue_depth: usize,
    pub local_blocks_path: PathBuf,
}

impl Default for IngesterSection {
    fn default() -> Self {
        let defaults = ingester::IngesterConfig::default();
        Self {
            max_block_bytes: defaults.max_block_bytes,
            max_block_duration: defaults.max_block_duration,
            trace_idle_period: defaults.trace_idle_period,
            max_trace_idle: defaults.max_trace_idle,
            flush_check_period: defaults.flush_check_period,
            complete_block_timeout: defaults.complete_block_timeout,
            concurrent_flushes: defaults.concurrent_flushes,
            flush_queue_depth: defaults.flush_queue_depth,
            local_blocks_path: defaults.local_blocks_path,
        }
    }
}

/// Which object store holds blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process memory, for tests and demos.
    Memory,
    /// A local directory.
    Local,
    S3,
    Gcs,
    Azure,
}

/// Which cache fronts bloom/index reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    None,
    /// In-process memory cache.
    Memory,
    Memcached,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Root directory for the `local` backend.
    pub local_path: PathBuf,
    pub wal_path: PathBuf,
    #[serde(with = "duration_serde")]
    pub blocklist_poll: Duration,
    pub cache: CacheKind,
    pub cache_max_entries: usize,
    pub pool: PoolConfig,
    /// Hedge backend reads after this long; omit to disable hedging.
    #[serde(default, with = "opt_duration_serde")]
    pub hedge_requests_at: Option<Duration>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            local_path: PathBuf::from("/var/tracedb/traces"),
            wal_path: PathBuf::from("/var/tracedb/wal"),
            blocklist_poll: Duration::from_secs(300),
            cache: CacheKind::Memory,
            cache_max_entries: 10_000,
            pool: PoolConfig::default(),
            hedge_requests_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 50,
            queue_depth: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompactorSection {
    #[serde(with = "duration_serde")]
    pub compaction_interval: Duration,
    pub target_block_size: u64,
    pub max_compaction_inputs: usize,
    #[serde(with = "duration_serde")]
    pub max_compaction_range: Duration,
    pub max_objects_per_block: u64,
    #[serde(with = "duration_serde")]
    pub compacted_block_retention: Duration,
}

impl Default for CompactorSection {
    fn default() -> Self {
        let defaults = compactor::CompactorConfig::default();
        Self {
            compaction_interval: defaults.compaction_interval,
            target_block_size: defaults.target_block_size,
            max_compaction_inputs: defaults.max_compaction_inputs,
            max_compaction_range: defaults.max_compaction_range,
            max_objects_per_block: defaults.max_objects_per_block,
            compacted_block_retention: defaults.compacted_block_retention,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverridesSection {
    pub defaults: Limits,
    pub tenants: HashMap<String, Limits>,
}

mod opt_duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

impl Config {
    /// Load from `path`, or defaults when no file is given.
    pub fn load(path: Option<&std::path::Path>, expand_env: bool) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let mut raw =
            std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
                path: path.to_path_buf(),
                source,
            })?;
        if expand_env {
            raw = expand_env_vars(&raw)?;
        }
        Ok(serde_yaml::from_str(&raw)?)
    }
}

/// Replace `${VAR}` references with environment values. An undefined
/// variable is an error rather than an empty substitution.
fn expand_env_vars(raw: &str) -> Result<String, ConfigError> {
    let pattern = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern");

    let mut missing = None;
    let expanded = pattern.replace_all(raw, |captures: &regex::Captures<'_>| {
        let name = &captures[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(expanded.into_owned()),
    }
}
