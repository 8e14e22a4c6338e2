//! Runtime configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Receive strategy of the communication platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecvStrategyKind {
    Probe,
    PrePost,
}

impl Default for RecvStrategyKind {
    fn default() -> Self {
        RecvStrategyKind::Probe
    }
}

fn default_pd_count() -> u32 {
    1
}

fn default_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

fn default_buckets() -> usize {
    10_000
}

fn default_max_msg_size() -> usize {
    1 << 20
}

/// Cluster-wide runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of policy domains.
    #[serde(default = "default_pd_count")]
    pub pd_count: u32,

    /// Computation workers per policy domain (the communication worker
    /// is separate).
    #[serde(default = "default_workers")]
    pub workers_per_pd: usize,

    /// Bucket count of the GUID map.
    #[serde(default = "default_buckets")]
    pub guid_buckets: usize,

    /// Strict affinity enforcement in the scheduler heuristic.
    #[serde(default)]
    pub enforce_affinity: bool,

    /// Hard bound on a single marshalled message.
    #[serde(default = "default_max_msg_size")]
    pub max_msg_size: usize,

    #[serde(default)]
    pub recv_strategy: RecvStrategyKind,

    /// `tracing` filter directive applied at bring-up.
    #[serde(default)]
    pub log_filter: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            pd_count: default_pd_count(),
            workers_per_pd: default_workers(),
            guid_buckets: default_buckets(),
            enforce_affinity: false,
            max_msg_size: default_max_msg_size(),
            recv_strategy: RecvStrategyKind::default(),
            log_filter: None,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pd_count == 0 {
            return Err(ConfigError::Invalid("pd_count must be at least 1"));
        }
        if self.pd_count > 256 {
            return Err(ConfigError::Invalid("pd_count exceeds the GUID home field"));
        }
        if self.workers_per_pd == 0 {
            return Err(ConfigError::Invalid("workers_per_pd must be at least 1"));
        }
        if self.workers_per_pd > 16 {
            return Err(ConfigError::Invalid(
                "workers_per_pd exceeds the GUID worker field",
            ));
        }
        if self.max_msg_size < 256 {
            return Err(ConfigError::Invalid("max_msg_size is unusably small"));
        }
        Ok(())
    }
}

/// Load a configuration file and apply environment overrides.
pub fn load_config(path: impl AsRef<Path>) -> Result<RuntimeConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    let mut cfg: RuntimeConfig = toml::from_str(&text)?;
    crate::env::apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}
