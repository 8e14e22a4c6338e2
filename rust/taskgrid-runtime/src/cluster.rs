//! In-process cluster harness
//!
//! Brings a set of policy domains through the runlevels in lockstep over
//! the channel fabric, spawns their workers, and joins everything at
//! shutdown. Single-machine deployments and the end-to-end suites run on
//! this; a networked fabric slots in behind the same calls.

use crate::api::PdApi;
use crate::domain::PolicyDomain;
use crate::error::Result;
use crate::worker;
use std::sync::Arc;
use std::thread::JoinHandle;
use taskgrid_comm::{ChannelFabric, CommPlatform, Fabric, RecvStrategy};
use taskgrid_config::{RecvStrategyKind, RuntimeConfig};
use taskgrid_guid::Location;
use taskgrid_policy::{EdtFn, FuncRegistry};
use taskgrid_proto::{RlProps, Runlevel};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// A running set of policy domains.
pub struct Cluster {
    pds: Vec<Arc<PolicyDomain>>,
    threads: Vec<JoinHandle<()>>,
    funcs: Arc<FuncRegistry>,
}

impl Cluster {
    /// Bring the whole cluster up through RL_USER_OK.
    pub fn launch(cfg: RuntimeConfig) -> Result<Cluster> {
        cfg.validate()?;
        init_tracing(&cfg);

        let locations: Vec<Location> = (0..cfg.pd_count).map(Location).collect();
        let fabric: Arc<dyn Fabric> = Arc::new(ChannelFabric::new(locations.iter().copied()));
        // One registry: every domain runs the same program binary.
        let funcs = Arc::new(FuncRegistry::new());

        let pds: Vec<Arc<PolicyDomain>> = locations
            .iter()
            .map(|loc| {
                PolicyDomain::new(
                    *loc,
                    &locations,
                    &cfg,
                    Arc::clone(&fabric),
                    Arc::clone(&funcs),
                )
            })
            .collect();

        // Lockstep bring-up: no PD enters runlevel R+1 before every PD
        // finished R.
        let mut threads = Vec::new();
        for rl in Runlevel::ALL {
            for pd in &pds {
                pd.switch_runlevel(rl, RlProps::REQUEST | RlProps::BRING_UP)?;
            }
            if rl == Runlevel::ComputeOk {
                for pd in &pds {
                    threads.extend(spawn_workers(pd, &cfg, Arc::clone(&fabric)));
                }
            }
        }
        info!(pds = pds.len(), "cluster is up");
        Ok(Cluster { pds, threads, funcs })
    }

    pub fn pd_count(&self) -> usize {
        self.pds.len()
    }

    pub fn api(&self, idx: usize) -> PdApi {
        PdApi::new(&self.pds[idx])
    }

    /// Register a task body cluster-wide.
    pub fn register_func(&self, func_id: u64, f: EdtFn) {
        self.funcs.register(func_id, f);
    }

    pub fn pd(&self, idx: usize) -> &Arc<PolicyDomain> {
        &self.pds[idx]
    }

    /// Join every worker and return the shutdown code.
    pub fn wait_exit(self) -> u64 {
        for t in self.threads {
            let _ = t.join();
        }
        let code = self.pds[0].exit_code();
        info!(code, "cluster is down");
        code
    }
}

fn spawn_workers(
    pd: &Arc<PolicyDomain>,
    cfg: &RuntimeConfig,
    fabric: Arc<dyn Fabric>,
) -> Vec<JoinHandle<()>> {
    let mut threads = Vec::with_capacity(cfg.workers_per_pd + 1);
    let strategy = match cfg.recv_strategy {
        RecvStrategyKind::Probe => RecvStrategy::Probe,
        RecvStrategyKind::PrePost => RecvStrategy::PrePost,
    };
    let platform = CommPlatform::new(fabric, pd.location(), strategy, cfg.max_msg_size);
    let rx = pd
        .comm_rx
        .lock()
        .take()
        .expect("communication worker spawned once");
    {
        let core = Arc::clone(&pd.core);
        let dispatcher = Arc::clone(&pd.dispatcher);
        threads.push(
            std::thread::Builder::new()
                .name(format!("tg-comm-{}", pd.location().0))
                .spawn(move || worker::comm_loop(core, dispatcher, platform, rx))
                .expect("spawn communication worker"),
        );
    }
    for wid in 0..cfg.workers_per_pd {
        let core = Arc::clone(&pd.core);
        let dispatcher = Arc::clone(&pd.dispatcher);
        threads.push(
            std::thread::Builder::new()
                .name(format!("tg-worker-{}-{}", pd.location().0, wid))
                .spawn(move || worker::compute_loop(core, dispatcher, wid))
                .expect("spawn computation worker"),
        );
    }
    threads
}

fn init_tracing(cfg: &RuntimeConfig) {
    let filter = cfg
        .log_filter
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::from_default_env());
    // Later clusters in the same process keep the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
