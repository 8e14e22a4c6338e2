//! Environment variable overrides
//!
//! Every setting can be overridden with a `TASKGRID_*` variable, which
//! wins over the configuration file.

use crate::config::{RecvStrategyKind, RuntimeConfig};

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Apply `TASKGRID_*` overrides onto `cfg`.
pub fn apply_env_overrides(cfg: &mut RuntimeConfig) {
    if let Some(v) = parse_env::<u32>("TASKGRID_PD_COUNT") {
        cfg.pd_count = v;
    }
    if let Some(v) = parse_env::<usize>("TASKGRID_WORKERS_PER_PD") {
        cfg.workers_per_pd = v;
    }
    if let Some(v) = parse_env::<usize>("TASKGRID_GUID_BUCKETS") {
        cfg.guid_buckets = v;
    }
    if let Some(v) = parse_env::<bool>("TASKGRID_ENFORCE_AFFINITY") {
        cfg.enforce_affinity = v;
    }
    if let Some(v) = parse_env::<usize>("TASKGRID_MAX_MSG_SIZE") {
        cfg.max_msg_size = v;
    }
    if let Ok(v) = std::env::var("TASKGRID_RECV_STRATEGY") {
        match v.as_str() {
            "probe" => cfg.recv_strategy = RecvStrategyKind::Probe,
            "pre-post" => cfg.recv_strategy = RecvStrategyKind::PrePost,
            _ => {}
        }
    }
    if let Ok(v) = std::env::var("TASKGRID_LOG") {
        cfg.log_filter = Some(v);
    }
}
