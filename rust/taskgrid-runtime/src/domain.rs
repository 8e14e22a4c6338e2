//! Policy-domain assembly
//!
//! One `PolicyDomain` per location: the GUID provider, the scheduler
//! heuristic, the dispatcher and the communication channels, plus the
//! distributed shutdown coordinator. The concrete trait impls wiring the
//! dispatcher to the scheduler, the transport and the lifecycle all live
//! here.

use crate::runlevel::RlSwitch;
use crate::worker;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use taskgrid_comm::Fabric;
use taskgrid_config::RuntimeConfig;
use taskgrid_guid::{
    FetchOutcome, Guid, GuidProvider, LabeledGuidProvider, Location, ResolveMode,
};
use taskgrid_policy::{
    AffinityRecord, AsyncExecutor, DbRecord, Dispatcher, EdtRecord, GetWorkReply, LifecycleHooks,
    MsgTransport, ObjectRegistry, PdEvent, PolicyError, SchedulerHooks,
};
use taskgrid_policy::FuncRegistry;
use taskgrid_proto::{
    EdtHint, MgtRlNotifyBody, MsgBody, MsgDir, PolicyMsg, ReturnCode, RlProps, Runlevel,
    SchedWorkBody, SendProps,
};
use taskgrid_sched::{
    GetWorkOutcome, PlacementOracle, SchedulerHeuristic, SendFailure, UpdateProp, WorkMsgSender,
};
use tracing::{debug, info, trace, warn};

/// Command stream handled by the communication worker.
pub(crate) enum CommCmd {
    Out {
        msg: PolicyMsg,
        props: SendProps,
        reply: Option<Arc<PdEvent>>,
    },
    Incoming(PolicyMsg),
}

/// Distributed shutdown barrier state.
pub(crate) struct ShutdownCoordinator {
    neighbor_count: u32,
    acks: AtomicU32,
    code: AtomicU64,
    initiated: AtomicBool,
    complete: AtomicBool,
}

impl ShutdownCoordinator {
    fn new(neighbor_count: u32) -> ShutdownCoordinator {
        ShutdownCoordinator {
            neighbor_count,
            acks: AtomicU32::new(0),
            code: AtomicU64::new(0),
            initiated: AtomicBool::new(false),
            complete: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub(crate) fn exit_code(&self) -> u64 {
        self.code.load(Ordering::Acquire)
    }

    pub(crate) fn acks_seen(&self) -> u32 {
        self.acks.load(Ordering::Acquire)
    }
}

/// Shared state of one policy domain.
pub(crate) struct DomainCore {
    pub loc: Location,
    pub neighbors: Vec<Location>,
    pub provider: Arc<LabeledGuidProvider>,
    pub heuristic: Arc<SchedulerHeuristic>,
    pub funcs: Arc<FuncRegistry>,
    pub fabric: Arc<dyn Fabric>,
    pub comm_tx: Sender<CommCmd>,
    pub shutdown: ShutdownCoordinator,
    /// Accepting user work.
    pub running: AtomicBool,
    pub rl: Mutex<RlSwitch>,
}

impl DomainCore {
    fn send_cmd(&self, cmd: CommCmd) -> Result<(), PolicyError> {
        self.comm_tx
            .send(cmd)
            .map_err(|_| PolicyError::Transport("communication worker is gone".into()))
    }

    /// Local half of the distributed shutdown: the three USER_OK
    /// tear-down phases, ending in the barrier notification.
    pub(crate) fn initiate_local_shutdown(self: &Arc<Self>, code: u64) {
        if self.shutdown.initiated.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(pd = %self.loc, code, "initiating local shutdown");
        self.shutdown.code.store(code, Ordering::Release);
        self.rl.lock().begin_teardown();

        // Phase 0: stop accepting user work.
        self.running.store(false, Ordering::Release);
        self.rl.lock().advance();

        // Phase 1: drain the scheduler; parked workers wake empty-handed.
        self.heuristic
            .update(UpdateProp::Shutdown, &WorkSender(Arc::clone(self)));
        self.rl.lock().advance();

        // Phase 2: notify every neighbor, then acknowledge ourselves.
        // The runlevel machine holds here until the last ack arrives.
        for n in &self.neighbors {
            let msg = PolicyMsg::request(
                MsgBody::MgtRlNotify(MgtRlNotifyBody {
                    runlevel: Runlevel::ComputeOk,
                    properties: (RlProps::REQUEST | RlProps::BARRIER | RlProps::TEAR_DOWN).bits(),
                    error_code: code,
                    return_detail: ReturnCode::Ok,
                }),
                self.loc,
                *n,
            );
            debug!(pd = %self.loc, neighbor = %n, "sending shutdown notification");
            if let Err(e) = self.send_cmd(CommCmd::Out {
                msg,
                props: SendProps::empty(),
                reply: None,
            }) {
                warn!(pd = %self.loc, neighbor = %n, error = %e, "shutdown notify failed");
            }
        }
        self.ack_shutdown();
    }

    /// Count one acknowledgement toward `neighborCount + 1`.
    fn ack_shutdown(self: &Arc<Self>) {
        let old = self.shutdown.acks.fetch_add(1, Ordering::AcqRel);
        debug!(pd = %self.loc, acks = old + 1, "shutdown ack");
        if old == self.shutdown.neighbor_count {
            self.finish_shutdown();
        }
    }

    /// Incoming MGT_RL_NOTIFY from another policy domain.
    pub(crate) fn on_remote_rl_notify(self: &Arc<Self>, code: u64) {
        let old = self.shutdown.acks.fetch_add(1, Ordering::AcqRel);
        debug!(pd = %self.loc, acks = old + 1, "remote shutdown ack");
        // First notice with no local shutdown under way: behave as if
        // shutdown had been called here.
        if old == 0 && !self.shutdown.initiated.load(Ordering::Acquire) {
            self.initiate_local_shutdown(code);
        }
        if old == self.shutdown.neighbor_count {
            self.finish_shutdown();
        }
    }

    /// Last acknowledgement observed: resume the runlevel machine and
    /// descend below USER_OK.
    fn finish_shutdown(self: &Arc<Self>) {
        info!(pd = %self.loc, "distributed shutdown barrier cleared");
        let mut rl = self.rl.lock();
        debug_assert!(rl.is_tearing_down());
        // Finish USER_OK and fall through the lower runlevels; their
        // tear-down work happens on the communication worker's way out.
        while rl.advance().is_some() {}
        drop(rl);
        self.shutdown.complete.store(true, Ordering::Release);
    }
}

/// Scheduler-facing message sender.
pub(crate) struct WorkSender(pub(crate) Arc<DomainCore>);

impl WorkMsgSender for WorkSender {
    fn send_work_request(
        &self,
        target: Location,
        discard_affinity: bool,
    ) -> std::result::Result<(), SendFailure> {
        let core = &self.0;
        if core.fabric.is_dead(target) {
            return Err(SendFailure::Dead);
        }
        let msg = PolicyMsg::request_with_response(
            MsgBody::SchedGetWork(SchedWorkBody {
                edt: Guid::NULL,
                discard_affinity,
                ..Default::default()
            }),
            core.loc,
            target,
        );
        core.send_cmd(CommCmd::Out {
            msg,
            // Asynchronous two-way: the response comes back unsolicited.
            props: SendProps::ASYNC_MSG,
            reply: None,
        })
        .map_err(|_| SendFailure::Other)
    }

    fn respond_work(&self, target: Location, msg_id: u64, edt: Option<Guid>) {
        let core = &self.0;
        let mut msg = PolicyMsg {
            buffer_size: 0,
            useful_size: 0,
            msg_id,
            src: core.loc,
            dest: target,
            dir: MsgDir::RESPONSE | MsgDir::REQ_RESPONSE,
            body: MsgBody::SchedGetWork(SchedWorkBody {
                edt: edt.unwrap_or(Guid::NULL),
                ..Default::default()
            }),
        };
        msg.body.set_return_detail(ReturnCode::Ok);
        // Asynchronous response: the requester matches it by kind, not
        // by correlation id.
        if let Err(e) = core.send_cmd(CommCmd::Out {
            msg,
            props: SendProps::PERSIST_MSG | SendProps::ASYNC_MSG,
            reply: None,
        }) {
            warn!(pd = %core.loc, %target, error = %e, "work response lost");
        }
    }
}

/// Dispatcher-facing transport: delegates every send to the
/// communication worker.
pub(crate) struct DomainTransport(pub(crate) Arc<DomainCore>);

impl MsgTransport for DomainTransport {
    fn post(&self, msg: PolicyMsg, props: SendProps) -> Result<(), PolicyError> {
        debug_assert!(msg.dest != self.0.loc, "remote delegation to self");
        self.0.send_cmd(CommCmd::Out {
            msg,
            props,
            reply: None,
        })
    }

    fn round_trip(&self, msg: PolicyMsg, props: SendProps) -> Result<PolicyMsg, PolicyError> {
        debug_assert!(
            !worker::is_comm_worker(),
            "the communication worker must not block on a round trip"
        );
        let reply = PdEvent::new();
        self.0.send_cmd(CommCmd::Out {
            msg,
            props,
            reply: Some(Arc::clone(&reply)),
        })?;
        reply
            .wait()
            .ok_or_else(|| PolicyError::Transport("no response; peer unreachable".into()))
    }
}

/// Hint and affinity resolution for the scheduler.
pub(crate) struct DomainOracle {
    pub(crate) provider: Arc<LabeledGuidProvider>,
}

impl PlacementOracle for DomainOracle {
    fn edt_hint(&self, edt: Guid) -> Option<EdtHint> {
        match self.provider.resolve(edt, ResolveMode::Local) {
            FetchOutcome::Ready(obj) => obj
                .as_any()
                .downcast_ref::<EdtRecord>()
                .and_then(|r| r.hint),
            _ => None,
        }
    }

    fn affinity_location(&self, affinity: Guid) -> Option<Location> {
        match self.provider.resolve(affinity, ResolveMode::Local) {
            FetchOutcome::Ready(obj) => obj
                .as_any()
                .downcast_ref::<AffinityRecord>()
                .map(|a| a.location),
            // Affinity GUIDs encode their location as their home.
            _ => Some(affinity.home()),
        }
    }

    fn slot_db_affinity(&self, edt: Guid, slot: u64) -> Option<Location> {
        let record = match self.provider.resolve(edt, ResolveMode::Local) {
            FetchOutcome::Ready(obj) => obj,
            _ => return None,
        };
        let db = record
            .as_any()
            .downcast_ref::<EdtRecord>()?
            .resolved_deps()
            .get(slot as usize)
            .copied()
            .flatten()?;
        match self.provider.resolve(db, ResolveMode::Local) {
            FetchOutcome::Ready(obj) => obj
                .as_any()
                .downcast_ref::<DbRecord>()
                .and_then(|d| d.hint.affinity),
            _ => None,
        }
    }
}

/// Scheduler hooks bridging the dispatcher and the heuristic.
pub(crate) struct DomainSched {
    pub(crate) core: Arc<DomainCore>,
    pub(crate) oracle: DomainOracle,
}

impl DomainSched {
    fn local_ctx(&self) -> usize {
        worker::current_wid()
            .filter(|w| *w < self.core.heuristic.worker_count())
            .unwrap_or(0)
    }

    fn ctx_for(&self, loc: Location) -> Option<usize> {
        if loc == self.core.loc {
            Some(self.local_ctx())
        } else {
            self.core.heuristic.context_for_location(loc).ok()
        }
    }
}

impl SchedulerHooks for DomainSched {
    fn pre_process(&self, msg: &mut PolicyMsg) {
        // Placement: an explicitly affinitized creation ships to the
        // hinted location. Unhinted creations stay where they are made;
        // stealing redistributes them.
        if let MsgBody::WorkCreate(b) = &msg.body {
            if let Some(hint) = &b.hint {
                if let Some(aff) = hint.affinity {
                    if let Some(loc) = self.oracle.affinity_location(aff) {
                        if loc != msg.dest {
                            trace!(edt_template = %b.template, %loc, "placement override");
                            msg.dest = loc;
                        }
                    }
                }
            }
        }
    }

    fn post_process(&self, msg: &PolicyMsg) {
        trace!(kind = ?msg.kind(), "post-process");
    }

    fn edt_ready(&self, _from: Location, edt: Guid) {
        let ctx = self.local_ctx();
        self.core
            .heuristic
            .notify_edt_ready(ctx, Some(edt), &self.oracle);
    }

    fn get_work(&self, from: Location, msg_id: u64, discard_affinity: bool) -> GetWorkReply {
        let Some(ctx) = self.ctx_for(from) else {
            warn!(%from, "work request from an unknown location");
            return GetWorkReply::Empty;
        };
        match self
            .core
            .heuristic
            .get_work(ctx, discard_affinity, Some(msg_id))
        {
            GetWorkOutcome::Found(guid) => GetWorkReply::Found(guid),
            GetWorkOutcome::Parked => GetWorkReply::Parked,
            GetWorkOutcome::Empty => GetWorkReply::Empty,
        }
    }

    fn work_response(&self, from: Location, edt: Option<Guid>) {
        let Some(ctx) = self.ctx_for(from) else {
            warn!(%from, "work response from an unknown location");
            return;
        };
        self.core.heuristic.notify_edt_ready(ctx, edt, &self.oracle);
    }

    fn try_get_work(&self, from: Location, discard_affinity: bool) -> Option<Guid> {
        let ctx = self.ctx_for(from)?;
        self.core.heuristic.try_get_work(ctx, discard_affinity)
    }
}

/// Lifecycle hooks: distributed tear-down notifications.
pub(crate) struct DomainLifecycle(pub(crate) Arc<DomainCore>);

impl LifecycleHooks for DomainLifecycle {
    fn rl_notify(&self, runlevel: Runlevel, properties: u32, error_code: u64) {
        let props = RlProps::from_bits_truncate(properties);
        debug_assert_eq!(runlevel, Runlevel::ComputeOk);
        debug_assert!(props.contains(RlProps::TEAR_DOWN) && props.contains(RlProps::BARRIER));
        self.0.on_remote_rl_notify(error_code);
    }
}

/// Deferred-message executor: re-queues onto the communication worker.
pub(crate) struct DomainExecutor(pub(crate) Arc<DomainCore>);

impl AsyncExecutor for DomainExecutor {
    fn submit(&self, msg: PolicyMsg) {
        if self.0.send_cmd(CommCmd::Incoming(msg)).is_err() {
            warn!(pd = %self.0.loc, "deferred message dropped at shutdown");
        }
    }
}

/// A policy domain: per-node runtime instance owning workers, a GUID
/// namespace, a scheduler and a link to its peers.
pub struct PolicyDomain {
    pub(crate) core: Arc<DomainCore>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) comm_rx: Mutex<Option<Receiver<CommCmd>>>,
}

impl PolicyDomain {
    pub fn new(
        loc: Location,
        all_locations: &[Location],
        cfg: &RuntimeConfig,
        fabric: Arc<dyn Fabric>,
        funcs: Arc<FuncRegistry>,
    ) -> Arc<PolicyDomain> {
        let neighbors: Vec<Location> =
            all_locations.iter().copied().filter(|l| *l != loc).collect();
        let provider = Arc::new(LabeledGuidProvider::new(
            loc,
            cfg.guid_buckets,
            cfg.workers_per_pd,
        ));
        let heuristic = Arc::new(SchedulerHeuristic::new(
            loc,
            cfg.workers_per_pd,
            &neighbors,
            cfg.enforce_affinity,
        ));
        let (comm_tx, comm_rx) = crossbeam_channel::unbounded();
        let core = Arc::new(DomainCore {
            loc,
            neighbors: neighbors.clone(),
            provider: Arc::clone(&provider),
            heuristic,
            funcs,
            fabric,
            comm_tx,
            shutdown: ShutdownCoordinator::new(neighbors.len() as u32),
            running: AtomicBool::new(false),
            rl: Mutex::new(RlSwitch::at_boot()),
        });
        let dispatcher = Arc::new(Dispatcher::new(
            loc,
            provider as Arc<dyn GuidProvider>,
            ObjectRegistry::with_defaults(),
            Arc::new(DomainTransport(Arc::clone(&core))),
            Arc::new(DomainSched {
                core: Arc::clone(&core),
                oracle: DomainOracle {
                    provider: Arc::clone(&core.provider),
                },
            }),
            Arc::new(DomainLifecycle(Arc::clone(&core))),
            Arc::new(DomainExecutor(Arc::clone(&core))),
        ));
        Arc::new(PolicyDomain {
            core,
            dispatcher,
            comm_rx: Mutex::new(Some(comm_rx)),
        })
    }

    pub fn location(&self) -> Location {
        self.core.loc
    }

    /// Walk one runlevel in the given direction; phases are sequential.
    pub fn switch_runlevel(&self, rl: Runlevel, props: RlProps) -> crate::Result<()> {
        let phases = if props.contains(RlProps::TEAR_DOWN) {
            crate::runlevel::phases_down(rl)
        } else {
            crate::runlevel::phases_up(rl)
        };
        for phase in 0..phases {
            self.runlevel_phase(rl, phase, props)?;
        }
        Ok(())
    }

    fn runlevel_phase(&self, rl: Runlevel, phase: u32, props: RlProps) -> crate::Result<()> {
        trace!(pd = %self.core.loc, ?rl, phase, ?props, "runlevel phase");
        if props.contains(RlProps::BRING_UP) {
            match rl {
                Runlevel::UserOk => {
                    self.core.running.store(true, Ordering::Release);
                    info!(pd = %self.core.loc, "policy domain is up");
                }
                _ => {
                    // The provider map, the comm endpoint and the
                    // scheduler contexts are built at construction; the
                    // intermediate levels are checkpoints only.
                }
            }
            let mut sw = self.core.rl.lock();
            sw.advance();
        }
        // Tear-down phases are driven by the shutdown coordinator, which
        // owns their ordering across the cluster.
        Ok(())
    }

    /// The distributed shutdown entry point.
    pub fn shutdown(&self, code: u64) {
        self.core.initiate_local_shutdown(code);
    }

    pub fn is_complete(&self) -> bool {
        self.core.shutdown.is_complete()
    }

    pub fn exit_code(&self) -> u64 {
        self.core.shutdown.exit_code()
    }

    /// Acks observed by the shutdown barrier (neighbors + self).
    pub fn shutdown_acks(&self) -> u32 {
        self.core.shutdown.acks_seen()
    }
}
