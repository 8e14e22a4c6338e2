//! Policy-domain dispatcher
//!
//! Classifies each message, decides local versus remote handling, keeps
//! finish-scope latches balanced across domains, drives the metadata
//! clone protocol and packages responses for requests that arrived from
//! other policy domains. Scheduler notifications bracket the processing
//! of eligible messages.

use crate::error::{PolicyError, Result};
use crate::objects::{
    DbRecord, EdtRecord, EdtState, EventRecord, TemplateRecord, Waiter, EDT_PROP_FINISH,
    LATCH_INCR_SLOT,
};
use crate::registry::ObjectRegistry;
use crate::strand::PdEvent;
use std::sync::Arc;
use taskgrid_guid::{
    FetchOutcome, Guid, GuidKind, GuidObject, GuidProps, GuidProvider, Location, MdProxy,
    ResolveMode,
};
use taskgrid_proto::{
    DepSatisfyBody, GuidMetadataCloneBody, MdCloneType, MsgBody, MsgDir, MsgKind, PolicyMsg,
    ReturnCode, Runlevel, SchedNotifyKind, SendProps, WorkDestroyBody, EDT_PARAM_DEF,
};
use tracing::{debug, trace, warn};

/// Outbound messaging surface of the policy domain.
pub trait MsgTransport: Send + Sync {
    /// One-way or asynchronous send.
    fn post(&self, msg: PolicyMsg, props: SendProps) -> Result<()>;

    /// Two-way send; blocks the calling worker until the response.
    fn round_trip(&self, msg: PolicyMsg, props: SendProps) -> Result<PolicyMsg>;
}

/// Reply of a work request processed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetWorkReply {
    Found(Guid),
    /// Parked; the reply goes out from a later scheduler update.
    Parked,
    /// Empty reply right away.
    Empty,
}

/// Scheduler surface the dispatcher invokes.
pub trait SchedulerHooks: Send + Sync {
    /// PRE_PROCESS_MSG: may overwrite the destination for placement.
    fn pre_process(&self, msg: &mut PolicyMsg);

    /// POST_PROCESS_MSG: invoked once after processing.
    fn post_process(&self, msg: &PolicyMsg);

    /// An EDT became executable.
    fn edt_ready(&self, from: Location, edt: Guid);

    /// GET_WORK invocation arriving from `from`.
    fn get_work(&self, from: Location, msg_id: u64, discard_affinity: bool) -> GetWorkReply;

    /// A response to one of our work requests came back.
    fn work_response(&self, from: Location, edt: Option<Guid>);

    /// Non-parking probe used by bulk take operations.
    fn try_get_work(&self, from: Location, discard_affinity: bool) -> Option<Guid>;
}

/// Lifecycle surface for distributed tear-down notifications.
pub trait LifecycleHooks: Send + Sync {
    fn rl_notify(&self, runlevel: Runlevel, properties: u32, error_code: u64);
}

/// Re-submission of deferred messages as asynchronous work.
pub trait AsyncExecutor: Send + Sync {
    fn submit(&self, msg: PolicyMsg);
}

enum MetaFetch {
    Ready(Arc<dyn GuidObject>),
    Pending(Arc<MdProxy>),
}

enum Routed {
    Continue,
    Done,
}

/// Per-PD message dispatcher.
pub struct Dispatcher {
    my_location: Location,
    provider: Arc<dyn GuidProvider>,
    registry: ObjectRegistry,
    transport: Arc<dyn MsgTransport>,
    sched: Arc<dyn SchedulerHooks>,
    lifecycle: Arc<dyn LifecycleHooks>,
    executor: Arc<dyn AsyncExecutor>,
}

impl Dispatcher {
    pub fn new(
        my_location: Location,
        provider: Arc<dyn GuidProvider>,
        registry: ObjectRegistry,
        transport: Arc<dyn MsgTransport>,
        sched: Arc<dyn SchedulerHooks>,
        lifecycle: Arc<dyn LifecycleHooks>,
        executor: Arc<dyn AsyncExecutor>,
    ) -> Dispatcher {
        Dispatcher {
            my_location,
            provider,
            registry,
            transport,
            sched,
            lifecycle,
            executor,
        }
    }

    pub fn my_location(&self) -> Location {
        self.my_location
    }

    pub fn provider(&self) -> &Arc<dyn GuidProvider> {
        &self.provider
    }

    /// Entry point for unsolicited incoming messages (requests and the
    /// asynchronously processed responses).
    pub fn process_incoming(&self, mut msg: PolicyMsg, wid: usize) -> Result<()> {
        debug_assert!(
            msg.is_request()
                || matches!(
                    msg.kind(),
                    MsgKind::DbAcquire
                        | MsgKind::GuidMetadataClone
                        | MsgKind::SchedGetWork
                        | MsgKind::MetadataComm
                ),
            "only async two-way responses may arrive unsolicited"
        );
        // Labeled creations pushed with BLOCK become asynchronous checks:
        // blocking here would wedge the communication worker.
        if msg.kind() == MsgKind::EvtCreate && msg.is_request() {
            if let MsgBody::EvtCreate(body) = &mut msg.body {
                let props = GuidProps::from_bits_truncate(body.properties);
                if props.contains(GuidProps::BLOCK) {
                    body.properties |= GuidProps::CHECK.bits();
                }
            }
        }
        let blocking = msg.kind() != MsgKind::DbAcquire;
        match self.process_message(&mut msg, blocking, wid) {
            Err(PolicyError::Pending) => Ok(()),
            other => other,
        }
    }

    /// Process one message to completion or suspension.
    ///
    /// With `is_blocking` false the processing is fully asynchronous: a
    /// `Pending` return means the message was queued and the caller must
    /// tolerate completion arriving later on another thread.
    pub fn process_message(
        &self,
        msg: &mut PolicyMsg,
        mut is_blocking: bool,
        wid: usize,
    ) -> Result<()> {
        debug_assert!(msg.dir_is_valid());
        let cur = self.my_location;

        if msg.is_request() && matches!(msg.kind(), MsgKind::WorkCreate | MsgKind::DbCreate) {
            self.sched.pre_process(msg);
        }

        match self.route(msg, &mut is_blocking, wid)? {
            Routed::Done => return Ok(()),
            Routed::Continue => {}
        }

        if msg.dest != cur {
            return self.delegate_remote(msg, is_blocking);
        }

        // Local processing. The message may have come from ourselves or
        // from a remote requester. Only requests get answered; incoming
        // asynchronous responses merely echo the two-way flag.
        let from_remote = msg.src != cur;
        let expects_response = msg.is_request() && msg.expects_response();
        let result = self.process_local(msg, wid);
        match &result {
            Err(PolicyError::Pending) => return Err(PolicyError::Pending),
            Err(e) => msg.body.set_return_detail(e.return_code()),
            Ok(()) => {
                if msg.body.return_detail() == ReturnCode::Pending {
                    // A parked reply; someone else answers later.
                    return Err(PolicyError::Pending);
                }
            }
        }

        if from_remote && expects_response {
            // Package and send the response as a one-way persistent
            // message back to the requester.
            let mut response = msg.clone().into_response();
            let mut props = SendProps::PERSIST_MSG;
            // Responses to asynchronous two-way exchanges carry the
            // SEND_ANY_ID tag; their requester holds no handle.
            if matches!(
                response.kind(),
                MsgKind::GuidMetadataClone | MsgKind::MetadataComm | MsgKind::SchedGetWork
            ) {
                props |= SendProps::ASYNC_MSG;
            }
            debug!(dest = %response.dest, kind = ?response.kind(), "sending response");
            self.transport.post(response.clone(), props)?;
            *msg = response;
        }

        self.sched.post_process(msg);
        // User-level errors also travel in return_detail; returning them
        // here lets a local caller avoid re-reading the message.
        result
    }

    /// Ship a message whose destination is another policy domain.
    fn delegate_remote(&self, msg: &mut PolicyMsg, is_blocking: bool) -> Result<()> {
        if msg.is_request() && msg.expects_response() && is_blocking {
            trace!(dest = %msg.dest, kind = ?msg.kind(), "blocking two-way to remote");
            let response = self.transport.round_trip(
                msg.clone(),
                SendProps::PERSIST_MSG | SendProps::TWOWAY_MSG,
            )?;
            *msg = response;
            return Ok(());
        }
        // One-way request or asynchronous two-way.
        let mut props = SendProps::empty();
        if msg.is_response() {
            // Outgoing asynchronous response for a two-way exchange.
            props |= SendProps::ASYNC_MSG | SendProps::PERSIST_MSG;
        } else if msg.expects_response() {
            props |= SendProps::ASYNC_MSG;
        }
        trace!(dest = %msg.dest, kind = ?msg.kind(), "one-way or async send to remote");
        self.transport.post(msg.clone(), props)?;
        if msg.is_request() && msg.expects_response() {
            return Err(PolicyError::Pending);
        }
        Ok(())
    }

    /// Decide the destination and massage the message for shipping.
    fn route(&self, msg: &mut PolicyMsg, is_blocking: &mut bool, wid: usize) -> Result<Routed> {
        let cur = self.my_location;
        match msg.kind() {
            MsgKind::WorkCreate if msg.is_request() => {
                let (template, props, parent_latch) = match &msg.body {
                    MsgBody::WorkCreate(b) => (b.template, b.properties, b.parent_latch),
                    _ => unreachable!(),
                };
                let src_is_local = msg.src == cur;
                let tpl = match self.resolve_remote_metadata(template, src_is_local && *is_blocking)? {
                    MetaFetch::Ready(obj) => obj,
                    MetaFetch::Pending(proxy) => {
                        // Defer: the whole message is replayed once the
                        // template lands.
                        debug_assert!(!src_is_local, "local creation cannot suspend here");
                        let replay = msg.clone();
                        let executor = Arc::clone(&self.executor);
                        if let Err(run_now) =
                            proxy.enqueue(Box::new(move || executor.submit(replay)))
                        {
                            run_now();
                        }
                        return Err(PolicyError::Pending);
                    }
                };
                let tpl = tpl
                    .as_any()
                    .downcast_ref::<TemplateRecord>()
                    .ok_or(PolicyError::Invalid("template guid names a non-template"))?;
                if let MsgBody::WorkCreate(b) = &mut msg.body {
                    if b.paramc == EDT_PARAM_DEF {
                        b.paramc = tpl.paramc;
                    }
                    if b.depc == EDT_PARAM_DEF {
                        b.depc = tpl.depc;
                    }
                    if b.paramc as usize != b.paramv.len() {
                        warn!("paramc disagrees with the parameters provided");
                        return Err(PolicyError::Invalid("paramc/paramv mismatch"));
                    }
                }
                // Labeled creations run at the label's home.
                if GuidProps::from_bits_truncate(props).contains(GuidProps::IS_LABELED) {
                    if let MsgBody::WorkCreate(b) = &msg.body {
                        msg.dest = b.guid.home();
                    }
                }
                if msg.dest != cur {
                    // Non-persistent dependences force the create to be
                    // synchronous so failure is observable.
                    if !msg.expects_response() {
                        if let MsgBody::WorkCreate(b) = &msg.body {
                            if let Some(depv) = &b.depv {
                                if depv
                                    .iter()
                                    .any(|d| !d.is_null() && d.kind().is_non_persistent_event())
                                {
                                    msg.dir |= MsgDir::REQ_RESPONSE;
                                    debug!("EDT creation made synchronous: once/latch dependence");
                                }
                            }
                        }
                    }
                    // Check into the parent finish scope before the task
                    // can possibly run elsewhere.
                    if !parent_latch.is_null() {
                        debug_assert_eq!(parent_latch.home(), cur, "parent latch is always local");
                        self.satisfy_latch(parent_latch, LATCH_INCR_SLOT, wid)?;
                    }
                }
                Ok(Routed::Continue)
            }
            MsgKind::DbCreate if msg.is_request() => {
                let labeled = match &msg.body {
                    MsgBody::DbCreate(b) => {
                        GuidProps::from_bits_truncate(b.properties).contains(GuidProps::IS_LABELED)
                    }
                    _ => unreachable!(),
                };
                if labeled {
                    return Err(PolicyError::NotSupported("labeled datablock creation"));
                }
                // The creator acquires the block; keep it local.
                msg.dest = cur;
                Ok(Routed::Continue)
            }
            MsgKind::EvtCreate if msg.is_request() => {
                if let MsgBody::EvtCreate(b) = &msg.body {
                    if GuidProps::from_bits_truncate(b.properties).contains(GuidProps::IS_LABELED) {
                        msg.dest = b.guid.home();
                    } else {
                        msg.dest = cur;
                    }
                }
                Ok(Routed::Continue)
            }
            MsgKind::WorkDestroy | MsgKind::EvtDestroy | MsgKind::DbDestroy | MsgKind::DbFree
            | MsgKind::EdtTempDestroy
                if msg.is_request() =>
            {
                let guid = match &msg.body {
                    MsgBody::WorkDestroy(b) => b.guid,
                    MsgBody::EvtDestroy(b) => b.guid,
                    MsgBody::DbDestroy(b) => b.guid,
                    MsgBody::DbFree(b) => b.guid,
                    MsgBody::EdtTempDestroy(b) => b.guid,
                    _ => unreachable!(),
                };
                // Destroy where a representent lives; otherwise forward
                // to the home.
                if !matches!(self.provider.resolve(guid, ResolveMode::Local), FetchOutcome::Ready(_)) {
                    msg.dest = guid.home();
                }
                Ok(Routed::Continue)
            }
            MsgKind::DepSatisfy if msg.is_request() => {
                let guid = match &msg.body {
                    MsgBody::DepSatisfy(b) => b.guid,
                    _ => unreachable!(),
                };
                msg.dest = guid.home();
                if msg.dest != cur && guid.kind() == GuidKind::EventChannel {
                    // Channel satisfaction keeps FIFO order across PDs by
                    // travelling as a blocking two-way call.
                    msg.dir |= MsgDir::REQ_RESPONSE;
                    *is_blocking = true;
                }
                Ok(Routed::Continue)
            }
            MsgKind::DepAdd if msg.is_request() => {
                let (source, dest) = match &msg.body {
                    MsgBody::DepAdd(b) => (b.source, b.dest),
                    _ => unreachable!(),
                };
                // Waiters register at the event's home; pre-satisfied
                // sources resolve at the destination's home.
                msg.dest = if source.kind().is_event() {
                    source.home()
                } else {
                    dest.home()
                };
                Ok(Routed::Continue)
            }
            MsgKind::DbAcquire | MsgKind::DbRelease if msg.is_request() => {
                msg.dest = cur;
                Ok(Routed::Continue)
            }
            MsgKind::GuidMetadataClone => {
                if msg.is_request() {
                    let guid = match &msg.body {
                        MsgBody::GuidMetadataClone(b) => b.guid,
                        _ => unreachable!(),
                    };
                    msg.dest = self.provider.location_of(guid);
                    Ok(Routed::Continue)
                } else if msg.dest == cur && msg.src != cur {
                    // Incoming response to a clone request posted earlier.
                    let body = match &msg.body {
                        MsgBody::GuidMetadataClone(b) => b.clone(),
                        _ => unreachable!(),
                    };
                    self.register_clone(&body)?;
                    Ok(Routed::Done)
                } else {
                    Ok(Routed::Continue)
                }
            }
            MsgKind::MetadataComm => {
                // Low-level metadata traffic: src and dest are set by the
                // originating protocol and a PD never asks itself.
                debug_assert!(msg.src != msg.dest);
                Ok(Routed::Continue)
            }
            MsgKind::MgtRlNotify => {
                if msg.src != cur && msg.dest == cur {
                    if let MsgBody::MgtRlNotify(b) = &msg.body {
                        debug_assert_eq!(b.runlevel, Runlevel::ComputeOk);
                        self.lifecycle.rl_notify(b.runlevel, b.properties, b.error_code);
                    }
                    return Ok(Routed::Done);
                }
                Ok(Routed::Continue)
            }
            _ => Ok(Routed::Continue),
        }
    }

    /// Local handling once the destination is this policy domain.
    fn process_local(&self, msg: &mut PolicyMsg, wid: usize) -> Result<()> {
        let src = msg.src;
        let msg_id = msg.msg_id;
        let is_request = msg.is_request();
        match &mut msg.body {
            MsgBody::WorkCreate(body) if is_request => {
                self.work_create_local(body, src, wid)
            }
            MsgBody::EdtTempCreate(body) => {
                let tpl = Arc::new(TemplateRecord::new(
                    body.func_id,
                    body.func_name.clone(),
                    body.paramc,
                    body.depc,
                ));
                let guid = self.provider.mint(
                    Some(Arc::clone(&tpl) as Arc<dyn GuidObject>),
                    GuidKind::EdtTemplate,
                    self.my_location,
                    GuidProps::TO_RECORD,
                    wid,
                )?;
                tpl.ready_word().publish(guid);
                body.guid = guid;
                debug!(%guid, func = body.func_id, "template created");
                Ok(())
            }
            MsgBody::EdtTempDestroy(body) => Ok(self.provider.release(body.guid)?),
            MsgBody::EvtCreate(body) => {
                let props = GuidProps::from_bits_truncate(body.properties);
                let initial = body.params.map(|p| p.nb_deps as i64).unwrap_or(0);
                let event = Arc::new(EventRecord::new(body.event_kind, initial)?);
                if props.contains(GuidProps::IS_LABELED) {
                    let mut fguid = taskgrid_guid::FatGuid::from_guid(body.guid);
                    match self.provider.create(
                        &mut fguid,
                        Arc::clone(&event) as Arc<dyn GuidObject>,
                        body.event_kind,
                        self.my_location,
                        props | GuidProps::IS_LABELED,
                        wid,
                    ) {
                        Ok(()) => {
                            event.ready_word().publish(body.guid);
                            Ok(())
                        }
                        Err(taskgrid_guid::GuidError::GuidExists(g)) => {
                            if props.contains(GuidProps::BLOCK) && src != self.my_location {
                                // Pushed-in blocked creation: replay until
                                // the competing object goes away.
                                let mut replay = PolicyMsg::request_with_response(
                                    MsgBody::EvtCreate(body.clone()),
                                    src,
                                    self.my_location,
                                );
                                replay.msg_id = msg_id;
                                self.executor.submit(replay);
                                Err(PolicyError::Pending)
                            } else {
                                Err(PolicyError::GuidExists(g))
                            }
                        }
                        Err(e) => Err(e.into()),
                    }
                } else {
                    let guid = self.provider.mint(
                        Some(Arc::clone(&event) as Arc<dyn GuidObject>),
                        body.event_kind,
                        self.my_location,
                        GuidProps::TO_RECORD,
                        wid,
                    )?;
                    event.ready_word().publish(guid);
                    body.guid = guid;
                    Ok(())
                }
            }
            MsgBody::EvtDestroy(body) => Ok(self.provider.release(body.guid)?),
            MsgBody::DbCreate(body) => {
                let db = Arc::new(DbRecord::new(body.size, body.hint.unwrap_or_default()));
                let guid = self.provider.mint(
                    Some(Arc::clone(&db) as Arc<dyn GuidObject>),
                    GuidKind::Db,
                    self.my_location,
                    GuidProps::TO_RECORD,
                    wid,
                )?;
                db.ready_word().publish(guid);
                if !body.edt.is_null() {
                    db.acquire(body.edt);
                }
                body.guid = guid;
                Ok(())
            }
            MsgBody::DbDestroy(body) => Ok(self.provider.release(body.guid)?),
            MsgBody::DbFree(body) => Ok(self.provider.release(body.guid)?),
            MsgBody::WorkDestroy(body) => Ok(self.provider.release(body.guid)?),
            MsgBody::DbAcquire(body) if is_request => {
                let record = match self.provider.resolve(body.guid, ResolveMode::Fetch) {
                    FetchOutcome::Ready(obj) => obj,
                    FetchOutcome::Missing => {
                        return Err(PolicyError::Invalid("acquire of an unknown datablock"))
                    }
                    FetchOutcome::IssueClone(proxy) | FetchOutcome::Pending(proxy) => {
                        // Datablock metadata has no clone codec; park the
                        // acquire on the proxy. The requester was told no
                        // direct response is coming, so the replay drops
                        // the response requirement.
                        let mut replay = PolicyMsg {
                            dir: msg.dir,
                            ..PolicyMsg::request(
                                MsgBody::DbAcquire(body.clone()),
                                src,
                                self.my_location,
                            )
                        };
                        replay.msg_id = msg_id;
                        replay.dir.remove(MsgDir::REQ_RESPONSE);
                        let executor = Arc::clone(&self.executor);
                        if let Err(run_now) =
                            proxy.enqueue(Box::new(move || executor.submit(replay)))
                        {
                            run_now();
                        }
                        return Err(PolicyError::Pending);
                    }
                };
                let db = record
                    .as_any()
                    .downcast_ref::<DbRecord>()
                    .ok_or(PolicyError::Invalid("acquire of a non-datablock"))?;
                db.acquire(body.edt);
                body.size = db.size;
                body.db_payload = Some(db.snapshot());
                // Track acquires outside the declared dependence list.
                if let FetchOutcome::Ready(obj) =
                    self.provider.resolve(body.edt, ResolveMode::Local)
                {
                    if let Some(edt) = obj.as_any().downcast_ref::<EdtRecord>() {
                        if !edt.resolved_deps().iter().flatten().any(|g| *g == body.guid) {
                            edt.note_unknown_db(body.guid);
                        }
                    }
                }
                Ok(())
            }
            MsgBody::DbRelease(body) => {
                let record = match self.provider.resolve(body.guid, ResolveMode::Local) {
                    FetchOutcome::Ready(obj) => obj,
                    _ => return Err(PolicyError::Invalid("release of an unknown datablock")),
                };
                let db = record
                    .as_any()
                    .downcast_ref::<DbRecord>()
                    .ok_or(PolicyError::Invalid("release of a non-datablock"))?;
                if let Some(bytes) = &body.db_payload {
                    db.write_back(bytes);
                }
                if !db.release(body.edt) {
                    return Err(PolicyError::NotPermitted("release without acquire"));
                }
                if let FetchOutcome::Ready(obj) =
                    self.provider.resolve(body.edt, ResolveMode::Local)
                {
                    if let Some(edt) = obj.as_any().downcast_ref::<EdtRecord>() {
                        edt.forget_unknown_db(body.guid);
                    }
                }
                Ok(())
            }
            MsgBody::DepAdd(body) => {
                let source = body.source;
                let dest = body.dest;
                let slot = body.slot;
                self.add_dependence_local(source, dest, slot, src, wid)
            }
            MsgBody::DepSatisfy(body) => {
                let guid = body.guid;
                let payload = body.payload;
                let slot = body.slot;
                self.satisfy_target(guid, slot, payload, src, wid)
            }
            MsgBody::DepUnregSignaler(_) | MsgBody::DepUnregWaiter(_) => {
                Err(PolicyError::NotSupported("dependence unregistration"))
            }
            MsgBody::GuidMetadataClone(body) if is_request => {
                // We are the home: serialize our record for the requester.
                debug_assert_eq!(body.clone_type, MdCloneType::Clone);
                let obj = match self.provider.resolve(body.guid, ResolveMode::Local) {
                    FetchOutcome::Ready(obj) => obj,
                    _ => return Err(PolicyError::Invalid("clone of an unknown guid")),
                };
                let blob = self.registry.codec(body.guid.kind())?.serialize(obj.as_ref())?;
                body.size = blob.len() as u64;
                body.blob = Some(blob);
                debug!(guid = %body.guid, size = body.size, "metadata serialized for clone");
                Ok(())
            }
            MsgBody::GuidMetadataClone(_) => Ok(()),
            MsgBody::MetadataComm(_) => Ok(()),
            MsgBody::SchedGetWork(body) => {
                if is_request {
                    match self.sched.get_work(src, msg_id, body.discard_affinity) {
                        GetWorkReply::Found(guid) => {
                            body.edt = guid;
                            Ok(())
                        }
                        GetWorkReply::Empty => {
                            body.edt = Guid::NULL;
                            Ok(())
                        }
                        GetWorkReply::Parked => Err(PolicyError::Pending),
                    }
                } else {
                    // Response to a work request we made earlier.
                    let edt = (!body.edt.is_null()).then_some(body.edt);
                    self.sched.work_response(src, edt);
                    Ok(())
                }
            }
            MsgBody::SchedNotify(body) => match body.notify_kind {
                SchedNotifyKind::EdtReady => {
                    self.sched.edt_ready(self.my_location, body.guid);
                    Ok(())
                }
                SchedNotifyKind::EdtDone => {
                    let mut destroy = PolicyMsg::request(
                        MsgBody::WorkDestroy(WorkDestroyBody {
                            guid: body.guid,
                            current_edt: body.guid,
                            properties: 0,
                            return_detail: ReturnCode::Ok,
                        }),
                        self.my_location,
                        self.my_location,
                    );
                    self.process_message(&mut destroy, false, wid)
                }
                SchedNotifyKind::EdtSatisfied | SchedNotifyKind::DbCreate => Ok(()),
            },
            MsgBody::CommTake(body) => {
                // Hand over up to max_count ready tasks without parking.
                let mut taken = Vec::new();
                for _ in 0..body.max_count.max(1) {
                    match self.sched.try_get_work(src, true) {
                        Some(g) => taken.push(g),
                        None => break,
                    }
                }
                body.guids = taken;
                Ok(())
            }
            MsgBody::CommGive(body) => {
                for guid in &body.guids {
                    self.sched.edt_ready(self.my_location, *guid);
                }
                Ok(())
            }
            MsgBody::MgtRlNotify(body) => {
                self.lifecycle.rl_notify(body.runlevel, body.properties, body.error_code);
                Ok(())
            }
            _ => Err(PolicyError::Invalid("unexpected direction")),
        }
    }

    fn work_create_local(
        &self,
        body: &mut taskgrid_proto::WorkCreateBody,
        src: Location,
        wid: usize,
    ) -> Result<()> {
        let tpl_obj = match self.provider.resolve(body.template, ResolveMode::Local) {
            FetchOutcome::Ready(obj) => obj,
            _ => return Err(PolicyError::Invalid("template not resolved locally")),
        };
        let tpl = tpl_obj
            .as_any()
            .downcast_ref::<TemplateRecord>()
            .ok_or(PolicyError::Invalid("template guid names a non-template"))?;
        debug_assert!(body.paramc != EDT_PARAM_DEF && body.depc != EDT_PARAM_DEF);

        let props = GuidProps::from_bits_truncate(body.properties);
        let is_finish = body.properties & EDT_PROP_FINISH != 0;

        // Output event: a latch for finish scopes (armed with the task's
        // own completion), otherwise a once event.
        let (out_kind, out_count) = if is_finish {
            (GuidKind::EventLatch, 1)
        } else {
            (GuidKind::EventOnce, 0)
        };
        let out_event = Arc::new(EventRecord::new(out_kind, out_count)?);
        let out_guid = self.provider.mint(
            Some(Arc::clone(&out_event) as Arc<dyn GuidObject>),
            out_kind,
            self.my_location,
            GuidProps::TO_RECORD,
            wid,
        )?;
        out_event.ready_word().publish(out_guid);

        let hint = body.hint.or(tpl.hint);
        let edt = Arc::new(EdtRecord::new(
            body.template,
            body.paramc,
            body.paramv.clone(),
            body.depc,
            hint,
            out_guid,
            body.parent_latch,
            body.properties,
        ));

        let mut fguid = taskgrid_guid::FatGuid::from_guid(body.guid);
        if props.contains(GuidProps::IS_LABELED) {
            match self.provider.create(
                &mut fguid,
                Arc::clone(&edt) as Arc<dyn GuidObject>,
                GuidKind::Edt,
                self.my_location,
                props,
                wid,
            ) {
                Ok(()) => edt.ready_word().publish(body.guid),
                Err(taskgrid_guid::GuidError::GuidExists(g)) => {
                    // The response carries the existing task's output
                    // event, harvested from the collided metadata.
                    self.provider.release(out_guid)?;
                    if let Some(existing) = fguid
                        .metadata
                        .as_ref()
                        .and_then(|m| m.as_any().downcast_ref::<EdtRecord>())
                    {
                        body.output_event = existing.output_event;
                    }
                    body.guid = g;
                    return Err(PolicyError::GuidExists(g));
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            body.guid = self.provider.mint(
                Some(Arc::clone(&edt) as Arc<dyn GuidObject>),
                GuidKind::Edt,
                self.my_location,
                GuidProps::TO_RECORD,
                wid,
            )?;
            edt.ready_word().publish(body.guid);
        }
        body.output_event = out_guid;
        debug!(guid = %body.guid, depc = body.depc, finish = is_finish, "EDT created");

        // Local creations check into the parent scope here; remote ones
        // already did on the sending side.
        if src == self.my_location && !body.parent_latch.is_null() {
            self.satisfy_latch(body.parent_latch, LATCH_INCR_SLOT, wid)?;
        }

        // Wire the declared dependences. The ready notification fires on
        // the satisfaction that completes the frontier, wherever that
        // happens, so the task lands in exactly one deque.
        let mut became_ready = body.depc == 0;
        if let Some(depv) = body.depv.clone() {
            for (slot, dep) in depv.iter().enumerate() {
                if dep.is_null() {
                    if edt.satisfy_slot(slot as u32, Guid::NULL)? {
                        became_ready = true;
                    }
                } else {
                    // Pre-satisfied sources notify through satisfy_target.
                    self.add_dependence_routed(*dep, body.guid, slot as u32, wid)?;
                }
            }
        }
        if became_ready {
            edt.set_state(EdtState::Ready);
            self.sched.edt_ready(self.my_location, body.guid);
        }
        Ok(())
    }

    /// DEP_ADD processed at the correct home.
    fn add_dependence_local(
        &self,
        source: Guid,
        dest: Guid,
        slot: u32,
        from: Location,
        wid: usize,
    ) -> Result<()> {
        if source.is_null() {
            return self.satisfy_target(dest, slot, Guid::NULL, from, wid);
        }
        match source.kind() {
            GuidKind::Db => self.satisfy_target(dest, slot, source, from, wid),
            kind if kind.is_event() => {
                let obj = match self.provider.resolve(source, ResolveMode::Local) {
                    FetchOutcome::Ready(obj) => obj,
                    _ => return Err(PolicyError::Invalid("dependence on an unknown event")),
                };
                let event = obj
                    .as_any()
                    .downcast_ref::<EventRecord>()
                    .ok_or(PolicyError::Invalid("event guid names a non-event"))?;
                let deliveries = event.register_waiter(Waiter { dest, slot })?;
                for (w, payload) in deliveries {
                    self.deliver(w, payload, from, wid)?;
                }
                Ok(())
            }
            _ => Err(PolicyError::Invalid("dependence source kind")),
        }
    }

    /// Issue a DEP_ADD through the normal routing (source may be remote).
    fn add_dependence_routed(&self, source: Guid, dest: Guid, slot: u32, wid: usize) -> Result<()> {
        let mut msg = PolicyMsg::request(
            MsgBody::DepAdd(taskgrid_proto::DepAddBody {
                source,
                dest,
                slot,
                mode: 0,
                properties: 0,
                return_detail: ReturnCode::Ok,
            }),
            self.my_location,
            self.my_location,
        );
        match self.process_message(&mut msg, false, wid) {
            Ok(()) | Err(PolicyError::Pending) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Satisfy `dest[slot]`, which lives at this policy domain.
    fn satisfy_target(
        &self,
        dest: Guid,
        slot: u32,
        payload: Guid,
        from: Location,
        wid: usize,
    ) -> Result<()> {
        let obj = match self.provider.resolve(dest, ResolveMode::Local) {
            FetchOutcome::Ready(obj) => obj,
            _ => return Err(PolicyError::Invalid("satisfaction of an unknown guid")),
        };
        if let Some(event) = obj.as_any().downcast_ref::<EventRecord>() {
            let deliveries = event.satisfy(slot, payload)?;
            let spent = event.is_spent();
            for (w, p) in deliveries {
                self.deliver(w, p, from, wid)?;
            }
            if spent {
                // Once events disappear after firing.
                self.provider.release(dest)?;
            }
            return Ok(());
        }
        if let Some(edt) = obj.as_any().downcast_ref::<EdtRecord>() {
            if edt.satisfy_slot(slot, payload)? {
                trace!(%dest, "EDT became executable");
                self.sched.edt_ready(self.my_location, dest);
            }
            return Ok(());
        }
        Err(PolicyError::Invalid("satisfaction target kind"))
    }

    /// Route one delivery, locally or across the cluster.
    fn deliver(&self, waiter: Waiter, payload: Guid, from: Location, wid: usize) -> Result<()> {
        if waiter.dest.home() == self.my_location {
            return self.satisfy_target(waiter.dest, waiter.slot, payload, from, wid);
        }
        let mut msg = PolicyMsg::request(
            MsgBody::DepSatisfy(DepSatisfyBody {
                guid: waiter.dest,
                payload,
                slot: waiter.slot,
                satisfier: Guid::NULL,
                current_edt: Guid::NULL,
                properties: 0,
                return_detail: ReturnCode::Ok,
            }),
            self.my_location,
            waiter.dest.home(),
        );
        match self.process_message(&mut msg, false, wid) {
            Ok(()) | Err(PolicyError::Pending) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Blocking latch update used by finish scopes.
    fn satisfy_latch(&self, latch: Guid, slot: u32, wid: usize) -> Result<()> {
        let mut msg = PolicyMsg::request_with_response(
            MsgBody::DepSatisfy(DepSatisfyBody {
                guid: latch,
                payload: Guid::NULL,
                slot,
                satisfier: Guid::NULL,
                current_edt: Guid::NULL,
                properties: 0,
                return_detail: ReturnCode::Ok,
            }),
            self.my_location,
            latch.home(),
        );
        self.process_message(&mut msg, true, wid)
    }

    /// Resolve metadata, pulling it from the GUID's home if necessary.
    /// Blocks the calling worker on the clone round trip; not for use on
    /// the communication worker.
    pub fn fetch_metadata(&self, guid: Guid) -> Result<Arc<dyn GuidObject>> {
        match self.resolve_remote_metadata(guid, true)? {
            MetaFetch::Ready(obj) => Ok(obj),
            MetaFetch::Pending(_) => Err(PolicyError::Pending),
        }
    }

    /// Resolve (possibly remote) metadata, driving the clone protocol.
    fn resolve_remote_metadata(&self, guid: Guid, blocking: bool) -> Result<MetaFetch> {
        match self.provider.resolve(guid, ResolveMode::Fetch) {
            FetchOutcome::Ready(obj) => Ok(MetaFetch::Ready(obj)),
            FetchOutcome::Missing => Err(PolicyError::Invalid("unknown local guid")),
            FetchOutcome::IssueClone(proxy) => {
                let clone_msg = PolicyMsg::request_with_response(
                    MsgBody::GuidMetadataClone(GuidMetadataCloneBody {
                        guid,
                        clone_type: MdCloneType::Clone,
                        dst_location: self.my_location.0 as u64,
                        size: 0,
                        blob: None,
                        return_detail: ReturnCode::Ok,
                    }),
                    self.my_location,
                    self.provider.location_of(guid),
                );
                debug!(%guid, "issuing metadata clone request");
                if blocking {
                    // The clone response is asynchronous (SEND_ANY_ID);
                    // the classic blocking wait is a strand event parked
                    // on the proxy, resolved when the clone registers.
                    let event = PdEvent::new();
                    let signal = Arc::clone(&event);
                    let parked = proxy.enqueue(Box::new(move || signal.resolve(None)));
                    self.transport.post(clone_msg, SendProps::ASYNC_MSG)?;
                    match parked {
                        Ok(()) => {
                            event.wait();
                        }
                        Err(run_now) => run_now(),
                    }
                    match self.provider.resolve(guid, ResolveMode::Local) {
                        FetchOutcome::Ready(obj) => Ok(MetaFetch::Ready(obj)),
                        _ => Err(PolicyError::Invalid("proxy drained without metadata")),
                    }
                } else {
                    self.transport.post(clone_msg, SendProps::ASYNC_MSG)?;
                    Ok(MetaFetch::Pending(proxy))
                }
            }
            FetchOutcome::Pending(proxy) => {
                if blocking {
                    // Derive the classic blocking wait from a strand
                    // event parked on the proxy.
                    let event = PdEvent::new();
                    let signal = Arc::clone(&event);
                    match proxy.enqueue(Box::new(move || signal.resolve(None))) {
                        Ok(()) => {
                            event.wait();
                        }
                        Err(run_now) => run_now(),
                    }
                    match self.provider.resolve(guid, ResolveMode::Local) {
                        FetchOutcome::Ready(obj) => Ok(MetaFetch::Ready(obj)),
                        _ => Err(PolicyError::Invalid("proxy drained without metadata")),
                    }
                } else {
                    Ok(MetaFetch::Pending(proxy))
                }
            }
        }
    }

    /// Install cloned metadata and replay the captured waiters.
    fn register_clone(&self, body: &GuidMetadataCloneBody) -> Result<Arc<dyn GuidObject>> {
        let blob = body
            .blob
            .as_ref()
            .ok_or(PolicyError::Invalid("clone response without a blob"))?;
        let codec = self.registry.codec(body.guid.kind())?;
        let obj = codec.deserialize(body.guid, blob)?;
        let waiters = self.provider.register(body.guid, Arc::clone(&obj))?;
        debug!(guid = %body.guid, waiters = waiters.len(), "metadata clone registered");
        for w in waiters {
            w();
        }
        Ok(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use taskgrid_guid::LabeledGuidProvider;
    use taskgrid_proto::{
        EdtTempCreateBody, EvtCreateBody, WorkCreateBody,
    };

    /// Synchronous in-process "network" of dispatchers for unit tests.
    /// A round-trip arms a capture slot for the requester; the victim's
    /// response send lands there instead of being re-dispatched.
    #[derive(Default)]
    struct LoopbackNet {
        pds: Mutex<HashMap<Location, Arc<Dispatcher>>>,
        armed: Mutex<HashMap<Location, Option<PolicyMsg>>>,
    }

    impl LoopbackNet {
        fn register(&self, loc: Location, pd: Arc<Dispatcher>) {
            self.pds.lock().insert(loc, pd);
        }

        fn pd(&self, loc: Location) -> Arc<Dispatcher> {
            Arc::clone(self.pds.lock().get(&loc).expect("registered pd"))
        }
    }

    struct LoopbackTransport {
        me: Location,
        net: Arc<LoopbackNet>,
    }

    impl MsgTransport for LoopbackTransport {
        fn post(&self, msg: PolicyMsg, _props: SendProps) -> Result<()> {
            if msg.is_response() {
                let mut armed = self.net.armed.lock();
                if let Some(slot) = armed.get_mut(&msg.dest) {
                    *slot = Some(msg);
                    return Ok(());
                }
            }
            let target = self.net.pd(msg.dest);
            target.process_incoming(msg, 0)
        }

        fn round_trip(&self, msg: PolicyMsg, _props: SendProps) -> Result<PolicyMsg> {
            let mut msg = msg;
            msg.msg_id = 0xfeed;
            self.net.armed.lock().insert(self.me, None);
            let target = self.net.pd(msg.dest);
            // The target posts its response back to us synchronously.
            target.process_incoming(msg, 0)?;
            self.net
                .armed
                .lock()
                .remove(&self.me)
                .flatten()
                .ok_or(PolicyError::Transport("no response captured".into()))
        }
    }

    #[derive(Default)]
    struct RecordingSched {
        ready: Mutex<Vec<Guid>>,
        takeable: Mutex<Vec<Guid>>,
    }

    impl SchedulerHooks for RecordingSched {
        fn pre_process(&self, _msg: &mut PolicyMsg) {}
        fn post_process(&self, _msg: &PolicyMsg) {}
        fn edt_ready(&self, _from: Location, edt: Guid) {
            self.ready.lock().push(edt);
        }
        fn get_work(&self, _from: Location, _msg_id: u64, _discard: bool) -> GetWorkReply {
            match self.takeable.lock().pop() {
                Some(g) => GetWorkReply::Found(g),
                None => GetWorkReply::Empty,
            }
        }
        fn work_response(&self, _from: Location, _edt: Option<Guid>) {}
        fn try_get_work(&self, _from: Location, _discard: bool) -> Option<Guid> {
            self.takeable.lock().pop()
        }
    }

    struct NullLifecycle;
    impl LifecycleHooks for NullLifecycle {
        fn rl_notify(&self, _rl: Runlevel, _props: u32, _code: u64) {}
    }

    /// Executes re-submissions inline against the owning dispatcher.
    struct InlineExecutor {
        me: Location,
        net: Arc<LoopbackNet>,
    }

    impl AsyncExecutor for InlineExecutor {
        fn submit(&self, msg: PolicyMsg) {
            let pd = self.net.pd(self.me);
            let _ = pd.process_incoming(msg, 0);
        }
    }

    struct TestPd {
        pd: Arc<Dispatcher>,
        sched: Arc<RecordingSched>,
    }

    fn make_pd(net: &Arc<LoopbackNet>, loc: Location) -> TestPd {
        let provider = Arc::new(LabeledGuidProvider::new(loc, 64, 2));
        let sched = Arc::new(RecordingSched::default());
        let pd = Arc::new(Dispatcher::new(
            loc,
            provider,
            ObjectRegistry::with_defaults(),
            Arc::new(LoopbackTransport {
                me: loc,
                net: Arc::clone(net),
            }),
            Arc::clone(&sched) as Arc<dyn SchedulerHooks>,
            Arc::new(NullLifecycle),
            Arc::new(InlineExecutor {
                me: loc,
                net: Arc::clone(net),
            }),
        ));
        net.register(loc, Arc::clone(&pd));
        TestPd { pd, sched }
    }

    fn two_pds() -> (Arc<LoopbackNet>, TestPd, TestPd) {
        let net = Arc::new(LoopbackNet::default());
        let pd0 = make_pd(&net, Location(0));
        let pd1 = make_pd(&net, Location(1));
        (net, pd0, pd1)
    }

    fn create_template(pd: &TestPd, func_id: u64) -> Guid {
        let mut msg = PolicyMsg::request_with_response(
            MsgBody::EdtTempCreate(EdtTempCreateBody {
                func_id,
                paramc: 0,
                depc: 0,
                func_name: Some("noop_body".into()),
                ..Default::default()
            }),
            pd.pd.my_location(),
            pd.pd.my_location(),
        );
        pd.pd.process_message(&mut msg, true, 0).unwrap();
        match msg.body {
            MsgBody::EdtTempCreate(b) => b.guid,
            _ => unreachable!(),
        }
    }

    fn create_event(pd: &TestPd, kind: GuidKind) -> Guid {
        let mut msg = PolicyMsg::request_with_response(
            MsgBody::EvtCreate(EvtCreateBody {
                event_kind: kind,
                ..Default::default()
            }),
            pd.pd.my_location(),
            pd.pd.my_location(),
        );
        pd.pd.process_message(&mut msg, true, 0).unwrap();
        match msg.body {
            MsgBody::EvtCreate(b) => b.guid,
            _ => unreachable!(),
        }
    }

    fn create_edt(pd: &TestPd, template: Guid, depv: Option<Vec<Guid>>) -> (Guid, ReturnCode) {
        let depc = depv.as_ref().map(|d| d.len() as u32).unwrap_or(0);
        let mut msg = PolicyMsg::request_with_response(
            MsgBody::WorkCreate(WorkCreateBody {
                template,
                paramc: 0,
                depc,
                depv,
                ..Default::default()
            }),
            pd.pd.my_location(),
            pd.pd.my_location(),
        );
        let _ = pd.pd.process_message(&mut msg, true, 0);
        match msg.body {
            MsgBody::WorkCreate(b) => (b.guid, b.return_detail),
            _ => unreachable!(),
        }
    }

    #[test]
    fn zero_dep_edt_is_scheduled_immediately() {
        let (_net, pd0, _pd1) = two_pds();
        let tpl = create_template(&pd0, 1);
        let (edt, rc) = create_edt(&pd0, tpl, None);
        assert_eq!(rc, ReturnCode::Ok);
        assert_eq!(pd0.sched.ready.lock().as_slice(), &[edt]);
    }

    #[test]
    fn template_fetch_installs_a_local_clone() {
        let (_net, pd0, pd1) = two_pds();
        let tpl = create_template(&pd0, 7);
        assert_eq!(tpl.home(), Location(0));

        // First creation on PD1 pulls the template across.
        let (edt, rc) = create_edt(&pd1, tpl, None);
        assert_eq!(rc, ReturnCode::Ok);
        assert!(!edt.is_null());
        assert_eq!(edt.home(), Location(1));

        // The clone is now local: no more fetch traffic needed.
        match pd1.pd.provider().resolve(tpl, ResolveMode::Local) {
            FetchOutcome::Ready(obj) => {
                let t = obj.as_any().downcast_ref::<TemplateRecord>().unwrap();
                assert_eq!(t.func_id, 7);
            }
            other => {
                let dbg = match other {
                    FetchOutcome::Missing => "missing",
                    FetchOutcome::Pending(_) => "pending",
                    _ => "other",
                };
                panic!("template not resolved locally: {dbg}");
            }
        }
        let (_, rc2) = create_edt(&pd1, tpl, None);
        assert_eq!(rc2, ReturnCode::Ok);
    }

    #[test]
    fn remote_satisfy_of_sticky_event_wakes_local_waiters() {
        let (_net, pd0, pd1) = two_pds();
        let tpl = create_template(&pd0, 2);
        let evt = create_event(&pd0, GuidKind::EventSticky);
        let (edt, rc) = create_edt(&pd0, tpl, Some(vec![evt]));
        assert_eq!(rc, ReturnCode::Ok);
        assert!(pd0.sched.ready.lock().is_empty());

        // PD1 satisfies the event homed at PD0.
        let mut satisfy = PolicyMsg::request(
            MsgBody::DepSatisfy(DepSatisfyBody {
                guid: evt,
                payload: Guid::NULL,
                ..Default::default()
            }),
            Location(1),
            Location(1),
        );
        pd1.pd.process_message(&mut satisfy, false, 0).unwrap();
        assert_eq!(pd0.sched.ready.lock().as_slice(), &[edt]);
    }

    #[test]
    fn labeled_event_collision_reports_guid_exists() {
        let (_net, pd0, _pd1) = two_pds();
        let provider = Arc::clone(pd0.pd.provider());
        let (start, _skip) = provider
            .reserve(1, GuidKind::EventSticky, true, 0)
            .unwrap();

        let mut create = |src: Location| {
            let mut msg = PolicyMsg::request_with_response(
                MsgBody::EvtCreate(EvtCreateBody {
                    guid: start,
                    event_kind: GuidKind::EventSticky,
                    properties: (GuidProps::IS_LABELED | GuidProps::CHECK).bits(),
                    ..Default::default()
                }),
                src,
                Location(0),
            );
            let res = pd0.pd.process_message(&mut msg, true, 0);
            (res, msg)
        };

        let (first, _) = create(Location(0));
        assert!(first.is_ok());
        let (second, msg) = create(Location(0));
        assert!(matches!(second, Err(PolicyError::GuidExists(_))));
        assert_eq!(msg.body.return_detail(), ReturnCode::GuidExists);
    }

    #[test]
    fn unregistration_is_not_supported() {
        let (_net, pd0, _pd1) = two_pds();
        let mut msg = PolicyMsg::request(
            MsgBody::DepUnregWaiter(taskgrid_proto::DepUnregBody::default()),
            Location(0),
            Location(0),
        );
        assert!(matches!(
            pd0.pd.process_message(&mut msg, true, 0),
            Err(PolicyError::NotSupported(_))
        ));
    }

    #[test]
    fn satisfaction_cascades_through_chained_events() {
        let (_net, pd0, _pd1) = two_pds();
        let tpl = create_template(&pd0, 11);
        let sticky = create_event(&pd0, GuidKind::EventSticky);
        let once = create_event(&pd0, GuidKind::EventOnce);

        // sticky -> once -> edt
        let mut chain = PolicyMsg::request(
            MsgBody::DepAdd(taskgrid_proto::DepAddBody {
                source: sticky,
                dest: once,
                slot: 0,
                ..Default::default()
            }),
            Location(0),
            Location(0),
        );
        pd0.pd.process_message(&mut chain, true, 0).unwrap();
        let (edt, rc) = create_edt(&pd0, tpl, Some(vec![once]));
        assert_eq!(rc, ReturnCode::Ok);
        assert!(pd0.sched.ready.lock().is_empty());

        let mut satisfy = PolicyMsg::request(
            MsgBody::DepSatisfy(DepSatisfyBody {
                guid: sticky,
                payload: Guid::from_raw(0xdb),
                ..Default::default()
            }),
            Location(0),
            Location(0),
        );
        pd0.pd.process_message(&mut satisfy, true, 0).unwrap();
        assert_eq!(pd0.sched.ready.lock().as_slice(), &[edt]);

        // The once event fired and disappeared.
        assert!(!matches!(
            pd0.pd.provider().resolve(once, ResolveMode::Local),
            FetchOutcome::Ready(_)
        ));
    }

    #[test]
    fn comm_take_hands_over_ready_work_without_parking() {
        let (_net, pd0, _pd1) = two_pds();
        pd0.sched
            .takeable
            .lock()
            .extend([Guid::from_raw(0xa), Guid::from_raw(0xb), Guid::from_raw(0xc)]);
        let mut msg = PolicyMsg::request_with_response(
            MsgBody::CommTake(taskgrid_proto::CommTakeBody {
                max_count: 2,
                ..Default::default()
            }),
            Location(0),
            Location(0),
        );
        pd0.pd.process_message(&mut msg, true, 0).unwrap();
        match msg.body {
            MsgBody::CommTake(b) => {
                assert_eq!(b.guids.len(), 2);
            }
            _ => unreachable!(),
        }
        // One left behind for the next taker.
        assert_eq!(pd0.sched.takeable.lock().len(), 1);
    }

    #[test]
    fn comm_give_enqueues_every_task() {
        let (_net, pd0, _pd1) = two_pds();
        let mut msg = PolicyMsg::request(
            MsgBody::CommGive(taskgrid_proto::CommGiveBody {
                guids: vec![Guid::from_raw(0x1), Guid::from_raw(0x2)],
                ..Default::default()
            }),
            Location(1),
            Location(0),
        );
        pd0.pd.process_message(&mut msg, true, 0).unwrap();
        assert_eq!(
            pd0.sched.ready.lock().as_slice(),
            &[Guid::from_raw(0x1), Guid::from_raw(0x2)]
        );
    }

    #[test]
    fn metadata_comm_is_passed_through_opaquely() {
        let (_net, pd0, _pd1) = two_pds();
        let mut msg = PolicyMsg::request_with_response(
            MsgBody::MetadataComm(taskgrid_proto::MetadataCommBody {
                guid: Guid::from_raw(0x5),
                mode: 3,
                payload: vec![1, 2, 3],
                ..Default::default()
            }),
            Location(1),
            Location(0),
        );
        pd0.pd.process_message(&mut msg, true, 0).unwrap();
        assert_eq!(msg.body.return_detail(), ReturnCode::Ok);
    }

    #[test]
    fn datablock_acquire_release_round() {
        let (_net, pd0, _pd1) = two_pds();
        let tpl = create_template(&pd0, 9);
        let (edt, _) = create_edt(&pd0, tpl, None);

        let mut create = PolicyMsg::request_with_response(
            MsgBody::DbCreate(taskgrid_proto::DbCreateBody {
                size: 16,
                ..Default::default()
            }),
            Location(0),
            Location(0),
        );
        pd0.pd.process_message(&mut create, true, 0).unwrap();
        let db = match create.body {
            MsgBody::DbCreate(b) => b.guid,
            _ => unreachable!(),
        };

        let mut acquire = PolicyMsg::request_with_response(
            MsgBody::DbAcquire(taskgrid_proto::DbAcquireBody {
                guid: db,
                edt,
                ..Default::default()
            }),
            Location(0),
            Location(0),
        );
        pd0.pd.process_message(&mut acquire, true, 0).unwrap();
        match &acquire.body {
            MsgBody::DbAcquire(b) => {
                assert_eq!(b.size, 16);
                assert_eq!(b.db_payload.as_ref().map(|p| p.len()), Some(16));
            }
            _ => unreachable!(),
        }

        // Write back through the release and read again.
        let mut release = PolicyMsg::request(
            MsgBody::DbRelease(taskgrid_proto::DbReleaseBody {
                guid: db,
                edt,
                size: 16,
                db_payload: Some(vec![7u8; 16]),
                ..Default::default()
            }),
            Location(0),
            Location(0),
        );
        pd0.pd.process_message(&mut release, true, 0).unwrap();

        // Double release is refused.
        let mut again = PolicyMsg::request(
            MsgBody::DbRelease(taskgrid_proto::DbReleaseBody {
                guid: db,
                edt,
                ..Default::default()
            }),
            Location(0),
            Location(0),
        );
        assert!(matches!(
            pd0.pd.process_message(&mut again, true, 0),
            Err(PolicyError::NotPermitted(_))
        ));
    }
}
