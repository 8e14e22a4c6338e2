//! Workers
//!
//! Each policy domain runs one communication worker and a pool of
//! computation workers. The communication worker is the sole caller of
//! the communication platform; computation workers execute EDTs to
//! completion and park on their scheduler context when starved.

use crate::domain::{CommCmd, DomainCore, WorkSender};
use crossbeam_channel::Receiver;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use taskgrid_comm::{CommError, CommPlatform, Fabric, Polled};
use taskgrid_guid::{FetchOutcome, Guid, GuidProvider, ResolveMode};
use taskgrid_policy::{
    Action, Dispatcher, EdtDep, EdtRecord, EdtState, NpKind, PdEvent, PolicyError, Strand,
    StrandTable, TemplateRecord, LATCH_DECR_SLOT,
};
use taskgrid_proto::{DepSatisfyBody, MsgBody, PolicyMsg, SchedNotifyBody, SchedNotifyKind};
use taskgrid_sched::{LocalWork, UpdateProp};
use tracing::{debug, info, trace, warn};

thread_local! {
    static CURRENT_WID: Cell<Option<usize>> = const { Cell::new(None) };
    static IS_COMM_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Worker id of the calling thread, if it is a computation worker.
pub fn current_wid() -> Option<usize> {
    CURRENT_WID.with(|w| w.get())
}

pub(crate) fn set_current_wid(wid: usize) {
    CURRENT_WID.with(|w| w.set(Some(wid)));
}

/// Is the calling thread the communication worker of its domain?
pub fn is_comm_worker() -> bool {
    IS_COMM_WORKER.with(|c| c.get())
}

fn mark_comm_worker() {
    IS_COMM_WORKER.with(|c| c.set(true));
}

/// Communication worker loop: drains the command stream, polls the
/// platform, runs the scheduler's idle update and performs the final
/// tear-down on the way out.
pub(crate) fn comm_loop(
    core: Arc<DomainCore>,
    dispatcher: Arc<Dispatcher>,
    mut platform: CommPlatform,
    rx: Receiver<CommCmd>,
) {
    mark_comm_worker();
    let sender = WorkSender(Arc::clone(&core));
    let mut pending_replies: HashMap<u64, Arc<PdEvent>> = HashMap::new();
    // Deferred messages become strand actions, replayed here.
    let strands = StrandTable::new();
    info!(pd = %core.loc, "communication worker up");

    loop {
        let mut progressed = false;

        // Drain commands from the computation workers and the executor.
        while let Ok(cmd) = rx.try_recv() {
            progressed = true;
            handle_cmd(
                &core,
                &dispatcher,
                &mut platform,
                &mut pending_replies,
                &strands,
                cmd,
            );
        }

        // Replay deferred messages whose strands are ready.
        progressed |= strands.process(NpKind::Comm) > 0;

        // Poll the platform for completions and arrivals.
        match platform.poll() {
            Ok(Polled::Response(msg)) => {
                progressed = true;
                match pending_replies.remove(&msg.msg_id) {
                    Some(event) => event.resolve(Some(msg)),
                    None => warn!(pd = %core.loc, msg_id = msg.msg_id, "orphan response"),
                }
            }
            Ok(Polled::Unsolicited(msg)) => {
                progressed = true;
                trace!(pd = %core.loc, kind = ?msg.kind(), "incoming message");
                if let Err(e) = dispatcher.process_incoming(msg, 0) {
                    handle_process_error(&core, e);
                }
            }
            Ok(Polled::None { .. }) => {}
            Err(e) => warn!(pd = %core.loc, error = %e, "poll failure"),
        }

        // Let the heuristic serve parked requesters and beg for work.
        core.heuristic.update(UpdateProp::Idle, &sender);

        if core.shutdown.is_complete()
            && !platform.has_pending()
            && rx.is_empty()
            && strands.is_empty()
        {
            break;
        }
        if !progressed {
            core.fabric.wait(core.loc, Duration::from_millis(1));
        }
    }

    // Descent below COMPUTE_OK: fail any still-blocked round trips, then
    // the GUID_OK tear-down leak sweep.
    for (_, event) in pending_replies.drain() {
        event.resolve(None);
    }
    let leaks = core.provider.leak_census();
    if !leaks.is_empty() {
        debug!(pd = %core.loc, kinds = leaks.len(), "guid census at tear-down");
    }
    info!(pd = %core.loc, code = core.shutdown.exit_code(), "communication worker down");
}

fn handle_cmd(
    core: &Arc<DomainCore>,
    dispatcher: &Arc<Dispatcher>,
    platform: &mut CommPlatform,
    pending_replies: &mut HashMap<u64, Arc<PdEvent>>,
    strands: &StrandTable,
    cmd: CommCmd,
) {
    match cmd {
        CommCmd::Out {
            mut msg,
            props,
            reply,
        } => {
            let dest = msg.dest;
            match platform.send_message(dest, &mut msg, props) {
                Ok(id) => {
                    if let Some(event) = reply {
                        pending_replies.insert(id, event);
                    }
                }
                Err(e) => {
                    warn!(pd = %core.loc, %dest, error = %e, "send failed");
                    if matches!(e, CommError::PeerDead(_)) {
                        platform.mark_dead(dest);
                    }
                    if let Some(event) = reply {
                        // Unblock the caller empty-handed.
                        event.resolve(None);
                    }
                }
            }
        }
        CommCmd::Incoming(msg) => {
            // Package the deferred message as a strand: a ready event
            // carrying the message plus one processing action.
            let event = PdEvent::with_msg(msg);
            event.resolve(None);
            let strand = Strand::new(Arc::clone(&event));
            let dispatcher = Arc::clone(dispatcher);
            let core = Arc::clone(core);
            strand.enqueue(Action::new(NpKind::Comm, move |m| {
                if let Some(msg) = m {
                    if let Err(e) = dispatcher.process_incoming(msg, 0) {
                        handle_process_error(&core, e);
                    }
                }
                None
            }));
            strands.adopt(strand);
        }
    }
}

fn handle_process_error(core: &Arc<DomainCore>, e: PolicyError) {
    match e {
        // Carried in return_detail; already answered.
        PolicyError::GuidExists(_)
        | PolicyError::NotPermitted(_)
        | PolicyError::NotSupported(_)
        | PolicyError::Invalid(_) => {
            debug!(pd = %core.loc, error = %e, "request failed");
        }
        other => warn!(pd = %core.loc, error = %other, "incoming processing failure"),
    }
}

/// Computation worker loop: run EDTs, steal, park, exit on shutdown.
pub(crate) fn compute_loop(core: Arc<DomainCore>, dispatcher: Arc<Dispatcher>, wid: usize) {
    set_current_wid(wid);
    debug!(pd = %core.loc, wid, "computation worker up");
    loop {
        match core.heuristic.local_get_work(wid) {
            LocalWork::Edt(guid) => execute_edt(&core, &dispatcher, guid, wid),
            LocalWork::Park(slot) => match slot.wait() {
                Some(guid) => execute_edt(&core, &dispatcher, guid, wid),
                None => break,
            },
            LocalWork::Shutdown => break,
        }
    }
    debug!(pd = %core.loc, wid, "computation worker down");
}

/// Run one EDT to completion: non-preemptive, then output-event and
/// finish-scope bookkeeping, then destruction.
fn execute_edt(core: &Arc<DomainCore>, dispatcher: &Arc<Dispatcher>, guid: Guid, wid: usize) {
    // A stolen task's metadata may still live at its home; pull it over
    // before running (blocking is fine on a computation worker).
    let record = match core.provider.resolve(guid, ResolveMode::Local) {
        FetchOutcome::Ready(obj) => obj,
        _ => match dispatcher.fetch_metadata(guid) {
            Ok(obj) => obj,
            Err(e) => {
                warn!(pd = %core.loc, %guid, error = %e, "scheduled EDT has no record");
                return;
            }
        },
    };
    let Some(edt) = record.as_any().downcast_ref::<EdtRecord>() else {
        warn!(pd = %core.loc, %guid, "scheduled guid is not an EDT");
        return;
    };
    debug_assert!(edt.is_ready(), "EDT scheduled before its slots were satisfied");
    edt.set_state(EdtState::Running);

    let template = edt.template;
    let func_id = match core.provider.resolve(template, ResolveMode::Local) {
        FetchOutcome::Ready(tpl) => tpl
            .as_any()
            .downcast_ref::<TemplateRecord>()
            .map(|t| t.func_id),
        _ => dispatcher
            .fetch_metadata(template)
            .ok()
            .and_then(|tpl| {
                tpl.as_any()
                    .downcast_ref::<TemplateRecord>()
                    .map(|t| t.func_id)
            }),
    };
    let output = match func_id.and_then(|id| core.funcs.get(id)) {
        Some(f) => {
            let deps: Vec<EdtDep> = edt
                .resolved_deps()
                .into_iter()
                .map(|g| EdtDep {
                    guid: g.unwrap_or(Guid::NULL),
                })
                .collect();
            trace!(pd = %core.loc, %guid, "running EDT");
            f(&edt.paramv, &deps)
        }
        None => {
            warn!(pd = %core.loc, %guid, "no function registered for template");
            None
        }
    };
    edt.set_state(EdtState::Done);

    // Satisfy the output: finish scopes count their own completion out of
    // the latch, plain tasks fire their once event.
    let (out_slot, out_payload) = if edt.is_finish() {
        (LATCH_DECR_SLOT, Guid::NULL)
    } else {
        (0, output.unwrap_or(Guid::NULL))
    };
    satisfy(core, dispatcher, edt.output_event, out_slot, out_payload, wid);

    // Check out of the parent finish scope.
    if !edt.parent_latch.is_null() {
        satisfy(core, dispatcher, edt.parent_latch, LATCH_DECR_SLOT, Guid::NULL, wid);
    }

    // EDT_DONE: the notification destroys the task.
    let mut done = PolicyMsg::request(
        MsgBody::SchedNotify(SchedNotifyBody {
            notify_kind: SchedNotifyKind::EdtDone,
            guid,
            ..Default::default()
        }),
        core.loc,
        core.loc,
    );
    if let Err(e) = dispatcher.process_message(&mut done, false, wid) {
        debug!(pd = %core.loc, %guid, error = %e, "EDT destruction deferred");
    }
}

fn satisfy(
    core: &Arc<DomainCore>,
    dispatcher: &Arc<Dispatcher>,
    target: Guid,
    slot: u32,
    payload: Guid,
    wid: usize,
) {
    let mut msg = PolicyMsg::request(
        MsgBody::DepSatisfy(DepSatisfyBody {
            guid: target,
            payload,
            slot,
            ..Default::default()
        }),
        core.loc,
        core.loc,
    );
    match dispatcher.process_message(&mut msg, false, wid) {
        Ok(()) | Err(PolicyError::Pending) => {}
        Err(e) => warn!(pd = %core.loc, %target, error = %e, "satisfaction failed"),
    }
}
