//! Configuration management
//!
//! TOML-based configuration with environment variable overrides.

pub mod config;
pub mod env;

pub use config::{load_config, ConfigError, RecvStrategyKind, RuntimeConfig};
pub use env::apply_env_overrides;
