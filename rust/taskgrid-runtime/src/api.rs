//! User API
//!
//! The surface a program drives the kernel through: templates, tasks,
//! events, datablocks, dependences, hints and shutdown. Every call builds
//! a policy message and hands it to the dispatcher, exactly like a remote
//! peer would.

use crate::domain::{DomainCore, PolicyDomain};
use crate::error::{Result, RuntimeError};
use crate::worker;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use taskgrid_guid::{
    FetchOutcome, Guid, GuidKind, GuidObject, GuidProps, GuidProvider, Location, ResolveMode,
};
use taskgrid_policy::{
    AffinityRecord, DbRecord, Dispatcher, EdtFn, EventRecord, PolicyError, EDT_PROP_FINISH,
};
use taskgrid_proto::{
    DbCreateBody, DbHint, DepAddBody, DepSatisfyBody, EdtHint, EdtTempCreateBody, EvtCreateBody,
    EventParams, MsgBody, PolicyMsg, ReturnCode, WorkCreateBody,
};

/// Specification of a task to create.
#[derive(Clone, Default)]
pub struct EdtSpec {
    pub template: Guid,
    pub paramv: Vec<u64>,
    /// One entry per dependence slot; null GUIDs are pre-satisfied.
    pub depv: Option<Vec<Guid>>,
    pub hint: Option<EdtHint>,
    /// Finish scope of the creating task, if any.
    pub parent_latch: Guid,
    /// Open a finish scope around this task.
    pub finish: bool,
    /// Labeled creation with this reserved GUID.
    pub labeled: Option<Guid>,
}

/// Result of a task creation.
#[derive(Debug, Clone, Copy)]
pub struct EdtHandle {
    pub guid: Guid,
    pub output_event: Guid,
}

/// Per-domain API handle. Cheap to clone.
#[derive(Clone)]
pub struct PdApi {
    core: Arc<DomainCore>,
    dispatcher: Arc<Dispatcher>,
}

impl PdApi {
    pub(crate) fn new(pd: &PolicyDomain) -> PdApi {
        PdApi {
            core: Arc::clone(&pd.core),
            dispatcher: Arc::clone(&pd.dispatcher),
        }
    }

    pub fn location(&self) -> Location {
        self.core.loc
    }

    fn wid(&self) -> usize {
        worker::current_wid().unwrap_or(0)
    }

    fn check_running(&self) -> Result<()> {
        if self.core.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RuntimeError::ShutDown)
        }
    }

    /// Register a task body under `func_id`. The registry is shared by
    /// the whole cluster, mirroring a single program binary.
    pub fn register_func(&self, func_id: u64, f: EdtFn) {
        self.core.funcs.register(func_id, f);
    }

    pub fn template_create(
        &self,
        func_id: u64,
        func_name: &str,
        paramc: u32,
        depc: u32,
    ) -> Result<Guid> {
        self.check_running()?;
        let mut msg = PolicyMsg::request_with_response(
            MsgBody::EdtTempCreate(EdtTempCreateBody {
                func_id,
                paramc,
                depc,
                func_name: Some(func_name.to_string()),
                ..Default::default()
            }),
            self.core.loc,
            self.core.loc,
        );
        self.dispatcher.process_message(&mut msg, true, self.wid())?;
        match msg.body {
            MsgBody::EdtTempCreate(b) => Ok(b.guid),
            _ => unreachable!(),
        }
    }

    pub fn template_destroy(&self, template: Guid) -> Result<()> {
        let mut msg = PolicyMsg::request(
            MsgBody::EdtTempDestroy(taskgrid_proto::EdtTempDestroyBody {
                guid: template,
                ..Default::default()
            }),
            self.core.loc,
            self.core.loc,
        );
        self.dispatcher.process_message(&mut msg, true, self.wid())?;
        Ok(())
    }

    /// Create a task. Fails with `GuidExists` on a labeled collision, in
    /// which case the handle carries the existing task's output event.
    pub fn edt_create(&self, spec: EdtSpec) -> Result<EdtHandle> {
        self.check_running()?;
        let mut properties = 0u32;
        if spec.finish {
            properties |= EDT_PROP_FINISH;
        }
        let mut guid = Guid::NULL;
        if let Some(labeled) = spec.labeled {
            properties |= (GuidProps::IS_LABELED | GuidProps::CHECK).bits();
            guid = labeled;
        }
        let depc = spec.depv.as_ref().map(|d| d.len() as u32).unwrap_or(0);
        let mut msg = PolicyMsg::request_with_response(
            MsgBody::WorkCreate(WorkCreateBody {
                guid,
                template: spec.template,
                paramc: spec.paramv.len() as u32,
                paramv: spec.paramv,
                depc,
                depv: spec.depv,
                hint: spec.hint,
                parent_latch: spec.parent_latch,
                properties,
                ..Default::default()
            }),
            self.core.loc,
            self.core.loc,
        );
        let result = self.dispatcher.process_message(&mut msg, true, self.wid());
        let (guid, output_event, detail) = match msg.body {
            MsgBody::WorkCreate(b) => (b.guid, b.output_event, b.return_detail),
            _ => unreachable!(),
        };
        match result {
            Ok(()) => match detail {
                ReturnCode::Ok => Ok(EdtHandle { guid, output_event }),
                // Collision: the error names the surviving task and its
                // output event, harvested from the response.
                ReturnCode::GuidExists => Err(RuntimeError::EdtExists { guid, output_event }),
                _ => Err(PolicyError::Invalid("task creation failed remotely").into()),
            },
            Err(PolicyError::GuidExists(_)) => {
                Err(RuntimeError::EdtExists { guid, output_event })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reserve a labeled GUID range.
    pub fn reserve_guids(&self, count: u64, kind: GuidKind) -> Result<(Guid, u64)> {
        Ok(self.core.provider.reserve(count, kind, true, self.wid())?)
    }

    pub fn event_create(&self, kind: GuidKind) -> Result<Guid> {
        self.event_create_inner(kind, None, None)
    }

    /// Latch event with an initial count.
    pub fn latch_create(&self, initial: u32) -> Result<Guid> {
        self.event_create_inner(
            GuidKind::EventLatch,
            None,
            Some(EventParams {
                nb_deps: initial,
                ..Default::default()
            }),
        )
    }

    /// Labeled event creation; collisions return `GuidExists` only after
    /// the winner's record is published.
    pub fn event_create_labeled(&self, labeled: Guid, kind: GuidKind) -> Result<Guid> {
        self.event_create_inner(kind, Some(labeled), None)
    }

    fn event_create_inner(
        &self,
        kind: GuidKind,
        labeled: Option<Guid>,
        params: Option<EventParams>,
    ) -> Result<Guid> {
        self.check_running()?;
        let mut properties = 0u32;
        let mut guid = Guid::NULL;
        if let Some(l) = labeled {
            properties |= (GuidProps::IS_LABELED | GuidProps::CHECK).bits();
            guid = l;
        }
        let mut msg = PolicyMsg::request_with_response(
            MsgBody::EvtCreate(EvtCreateBody {
                guid,
                event_kind: kind,
                params,
                properties,
                ..Default::default()
            }),
            self.core.loc,
            self.core.loc,
        );
        let result = self.dispatcher.process_message(&mut msg, true, self.wid());
        let (guid, detail) = match msg.body {
            MsgBody::EvtCreate(b) => (b.guid, b.return_detail),
            _ => unreachable!(),
        };
        match result {
            Ok(()) => match detail {
                ReturnCode::Ok => Ok(guid),
                ReturnCode::GuidExists => Err(PolicyError::GuidExists(guid).into()),
                _ => Err(PolicyError::Invalid("event creation failed remotely").into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    pub fn event_destroy(&self, event: Guid) -> Result<()> {
        let mut msg = PolicyMsg::request(
            MsgBody::EvtDestroy(taskgrid_proto::EvtDestroyBody {
                guid: event,
                ..Default::default()
            }),
            self.core.loc,
            self.core.loc,
        );
        self.dispatcher.process_message(&mut msg, true, self.wid())?;
        Ok(())
    }

    /// Satisfy an event (or a task slot) with an optional datablock.
    pub fn event_satisfy(&self, event: Guid, payload: Guid) -> Result<()> {
        self.event_satisfy_slot(event, 0, payload)
    }

    pub fn event_satisfy_slot(&self, event: Guid, slot: u32, payload: Guid) -> Result<()> {
        self.check_running()?;
        let mut msg = PolicyMsg::request(
            MsgBody::DepSatisfy(DepSatisfyBody {
                guid: event,
                payload,
                slot,
                ..Default::default()
            }),
            self.core.loc,
            self.core.loc,
        );
        match self.dispatcher.process_message(&mut msg, false, self.wid()) {
            Ok(()) | Err(PolicyError::Pending) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// `source -> dest[slot]` dependence.
    pub fn add_dependence(&self, source: Guid, dest: Guid, slot: u32) -> Result<()> {
        self.check_running()?;
        let mut msg = PolicyMsg::request(
            MsgBody::DepAdd(DepAddBody {
                source,
                dest,
                slot,
                ..Default::default()
            }),
            self.core.loc,
            self.core.loc,
        );
        match self.dispatcher.process_message(&mut msg, false, self.wid()) {
            Ok(()) | Err(PolicyError::Pending) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn db_create(&self, size: u64, hint: Option<DbHint>) -> Result<Guid> {
        self.check_running()?;
        let mut msg = PolicyMsg::request_with_response(
            MsgBody::DbCreate(DbCreateBody {
                size,
                hint,
                ..Default::default()
            }),
            self.core.loc,
            self.core.loc,
        );
        self.dispatcher.process_message(&mut msg, true, self.wid())?;
        match msg.body {
            MsgBody::DbCreate(b) => Ok(b.guid),
            _ => unreachable!(),
        }
    }

    /// Mint an affinity object pinned to `loc`.
    pub fn affinity_to(&self, loc: Location) -> Result<Guid> {
        let record = Arc::new(AffinityRecord::new(loc));
        let guid = self.core.provider.mint(
            Some(Arc::clone(&record) as Arc<dyn GuidObject>),
            GuidKind::Affinity,
            loc,
            GuidProps::TO_RECORD,
            self.wid(),
        )?;
        record.ready_word().publish(guid);
        Ok(guid)
    }

    /// (increments, decrements) seen by a latch event; test/diagnostic.
    pub fn latch_totals(&self, latch: Guid) -> Option<(u64, u64)> {
        match self.core.provider.resolve(latch, ResolveMode::Local) {
            FetchOutcome::Ready(obj) => obj
                .as_any()
                .downcast_ref::<EventRecord>()
                .and_then(|e| e.latch_totals()),
            _ => None,
        }
    }

    /// Current contents of a local datablock; test/diagnostic.
    pub fn db_snapshot(&self, db: Guid) -> Option<Vec<u8>> {
        match self.core.provider.resolve(db, ResolveMode::Local) {
            FetchOutcome::Ready(obj) => obj
                .as_any()
                .downcast_ref::<DbRecord>()
                .map(|d| d.snapshot()),
            _ => None,
        }
    }

    /// Trigger the distributed tear-down with an exit code.
    pub fn shutdown(&self, code: u64) {
        self.core.initiate_local_shutdown(code);
    }
}
