//! Message taxonomy
//!
//! A policy message is a fixed header plus a per-kind body of request (I),
//! response (O) and in/out (IO) fields. REQUEST and RESPONSE are mutually
//! exclusive and exactly one is set; REQ_RESPONSE marks a request that
//! expects a response.

use crate::hint::{DbHint, EdtHint};
use crate::ret::ReturnCode;
use crate::runlevel::Runlevel;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use taskgrid_guid::{Guid, GuidKind, Location};

/// Tag used for asynchronous responses that match no outstanding request.
pub const SEND_ANY_ID: u64 = u64::MAX;
/// Tag used to probe for any incoming message.
pub const RECV_ANY_ID: u64 = u64::MAX - 1;

/// Sentinel: take `paramc`/`depc` from the template.
pub const EDT_PARAM_DEF: u32 = u32::MAX;

bitflags::bitflags! {
    /// Direction flags of a message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgDir: u8 {
        const REQUEST = 1 << 0;
        const RESPONSE = 1 << 1;
        /// The request expects a response.
        const REQ_RESPONSE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Properties governing a send.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendProps: u32 {
        /// The buffer outlives the call.
        const PERSIST_MSG = 1 << 0;
        /// Two-way communication; the caller waits for the response.
        const TWOWAY_MSG = 1 << 1;
        /// Fire-and-forget response.
        const ASYNC_MSG = 1 << 2;
        const COMM_ONE_WAY = 1 << 3;
        const COMM_STACK_MSG = 1 << 4;
    }
}

/// Message kind discriminant (wire value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MsgKind {
    WorkCreate = 0x01,
    WorkDestroy = 0x02,
    EdtTempCreate = 0x03,
    EdtTempDestroy = 0x04,
    DbCreate = 0x05,
    DbDestroy = 0x06,
    DbFree = 0x07,
    DbAcquire = 0x08,
    DbRelease = 0x09,
    EvtCreate = 0x0a,
    EvtDestroy = 0x0b,
    DepAdd = 0x0c,
    DepSatisfy = 0x0d,
    DepUnregSignaler = 0x0e,
    DepUnregWaiter = 0x0f,
    GuidMetadataClone = 0x10,
    MetadataComm = 0x11,
    SchedGetWork = 0x12,
    SchedNotify = 0x13,
    CommTake = 0x14,
    CommGive = 0x15,
    MgtRlNotify = 0x16,
}

impl MsgKind {
    pub fn from_bits(bits: u8) -> Option<MsgKind> {
        Some(match bits {
            0x01 => MsgKind::WorkCreate,
            0x02 => MsgKind::WorkDestroy,
            0x03 => MsgKind::EdtTempCreate,
            0x04 => MsgKind::EdtTempDestroy,
            0x05 => MsgKind::DbCreate,
            0x06 => MsgKind::DbDestroy,
            0x07 => MsgKind::DbFree,
            0x08 => MsgKind::DbAcquire,
            0x09 => MsgKind::DbRelease,
            0x0a => MsgKind::EvtCreate,
            0x0b => MsgKind::EvtDestroy,
            0x0c => MsgKind::DepAdd,
            0x0d => MsgKind::DepSatisfy,
            0x0e => MsgKind::DepUnregSignaler,
            0x0f => MsgKind::DepUnregWaiter,
            0x10 => MsgKind::GuidMetadataClone,
            0x11 => MsgKind::MetadataComm,
            0x12 => MsgKind::SchedGetWork,
            0x13 => MsgKind::SchedNotify,
            0x14 => MsgKind::CommTake,
            0x15 => MsgKind::CommGive,
            0x16 => MsgKind::MgtRlNotify,
            _ => return None,
        })
    }
}

/// Channel-event sizing parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventParams {
    pub nb_sat: u32,
    pub nb_deps: u32,
    pub max_gen: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkCreateBody {
    // IO
    pub guid: Guid,
    pub paramc: u32,
    pub depc: u32,
    pub output_event: Guid,
    // I
    pub template: Guid,
    pub paramv: Vec<u64>,
    pub depv: Option<Vec<Guid>>,
    pub hint: Option<EdtHint>,
    pub parent_latch: Guid,
    pub current_edt: Guid,
    pub properties: u32,
    // O
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkDestroyBody {
    pub guid: Guid,
    pub current_edt: Guid,
    pub properties: u32,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdtTempCreateBody {
    // IO
    pub guid: Guid,
    // I
    pub func_id: u64,
    pub paramc: u32,
    pub depc: u32,
    pub func_name: Option<String>,
    // O
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdtTempDestroyBody {
    pub guid: Guid,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbCreateBody {
    // IO
    pub guid: Guid,
    pub properties: u32,
    // I
    pub size: u64,
    pub edt: Guid,
    pub hint: Option<DbHint>,
    // O
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbDestroyBody {
    pub guid: Guid,
    pub edt: Guid,
    pub properties: u32,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbFreeBody {
    pub guid: Guid,
    pub edt: Guid,
    pub properties: u32,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbAcquireBody {
    // IO
    pub guid: Guid,
    pub edt: Guid,
    pub edt_slot: u32,
    pub properties: u32,
    // O
    pub size: u64,
    /// Block contents, marshalled under the DBPTR flag.
    pub db_payload: Option<Vec<u8>>,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbReleaseBody {
    // I
    pub guid: Guid,
    pub edt: Guid,
    pub size: u64,
    /// Written-back contents, marshalled under the DBPTR flag.
    pub db_payload: Option<Vec<u8>>,
    pub properties: u32,
    // O
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvtCreateBody {
    // IO
    pub guid: Guid,
    // I
    pub event_kind: GuidKind,
    pub params: Option<EventParams>,
    pub properties: u32,
    // O
    pub return_detail: ReturnCode,
}

impl Default for EvtCreateBody {
    fn default() -> Self {
        EvtCreateBody {
            guid: Guid::NULL,
            event_kind: GuidKind::EventOnce,
            params: None,
            properties: 0,
            return_detail: ReturnCode::Ok,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvtDestroyBody {
    pub guid: Guid,
    pub properties: u32,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepAddBody {
    pub source: Guid,
    pub dest: Guid,
    pub slot: u32,
    pub mode: u32,
    pub properties: u32,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepSatisfyBody {
    pub guid: Guid,
    pub payload: Guid,
    pub slot: u32,
    pub satisfier: Guid,
    pub current_edt: Guid,
    pub properties: u32,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepUnregBody {
    pub guid: Guid,
    pub slot: u32,
    pub return_detail: ReturnCode,
}

/// Sub-operation of a metadata clone request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MdCloneType {
    Clone = 0,
    Move = 1,
}

impl Default for MdCloneType {
    fn default() -> Self {
        MdCloneType::Clone
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuidMetadataCloneBody {
    // IO
    pub guid: Guid,
    // I
    pub clone_type: MdCloneType,
    pub dst_location: u64,
    // O
    pub size: u64,
    /// Serialized metadata snapshot, marshalled as a section.
    pub blob: Option<Vec<u8>>,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataCommBody {
    pub guid: Guid,
    pub mode: u64,
    /// Opaque payload of the user-object metadata protocol.
    pub payload: Vec<u8>,
    pub return_detail: ReturnCode,
}

/// Work-request sub-kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedWorkKind {
    EdtUser = 0,
    Comm = 1,
}

impl Default for SchedWorkKind {
    fn default() -> Self {
        SchedWorkKind::EdtUser
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedWorkBody {
    pub work_kind: SchedWorkKind,
    // IO
    pub edt: Guid,
    pub discard_affinity: bool,
    /// Specific GUIDs wanted/handed over (Comm sub-kind).
    pub guids: Vec<Guid>,
    // O
    pub return_detail: ReturnCode,
}

/// Scheduler notification sub-kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedNotifyKind {
    EdtReady = 0,
    EdtDone = 1,
    EdtSatisfied = 2,
    DbCreate = 3,
}

impl Default for SchedNotifyKind {
    fn default() -> Self {
        SchedNotifyKind::EdtReady
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedNotifyBody {
    pub notify_kind: SchedNotifyKind,
    pub guid: Guid,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommTakeBody {
    pub guids: Vec<Guid>,
    pub max_count: u32,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommGiveBody {
    pub guids: Vec<Guid>,
    pub return_detail: ReturnCode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MgtRlNotifyBody {
    pub runlevel: Runlevel,
    /// `RlProps` bits.
    pub properties: u32,
    pub error_code: u64,
    pub return_detail: ReturnCode,
}

impl Default for MgtRlNotifyBody {
    fn default() -> Self {
        MgtRlNotifyBody {
            runlevel: Runlevel::UserOk,
            properties: 0,
            error_code: 0,
            return_detail: ReturnCode::Ok,
        }
    }
}

/// Per-kind body union.
#[derive(Debug, Clone, PartialEq)]
pub enum MsgBody {
    WorkCreate(WorkCreateBody),
    WorkDestroy(WorkDestroyBody),
    EdtTempCreate(EdtTempCreateBody),
    EdtTempDestroy(EdtTempDestroyBody),
    DbCreate(DbCreateBody),
    DbDestroy(DbDestroyBody),
    DbFree(DbFreeBody),
    DbAcquire(DbAcquireBody),
    DbRelease(DbReleaseBody),
    EvtCreate(EvtCreateBody),
    EvtDestroy(EvtDestroyBody),
    DepAdd(DepAddBody),
    DepSatisfy(DepSatisfyBody),
    DepUnregSignaler(DepUnregBody),
    DepUnregWaiter(DepUnregBody),
    GuidMetadataClone(GuidMetadataCloneBody),
    MetadataComm(MetadataCommBody),
    SchedGetWork(SchedWorkBody),
    SchedNotify(SchedNotifyBody),
    CommTake(CommTakeBody),
    CommGive(CommGiveBody),
    MgtRlNotify(MgtRlNotifyBody),
}

impl MsgBody {
    pub fn kind(&self) -> MsgKind {
        match self {
            MsgBody::WorkCreate(_) => MsgKind::WorkCreate,
            MsgBody::WorkDestroy(_) => MsgKind::WorkDestroy,
            MsgBody::EdtTempCreate(_) => MsgKind::EdtTempCreate,
            MsgBody::EdtTempDestroy(_) => MsgKind::EdtTempDestroy,
            MsgBody::DbCreate(_) => MsgKind::DbCreate,
            MsgBody::DbDestroy(_) => MsgKind::DbDestroy,
            MsgBody::DbFree(_) => MsgKind::DbFree,
            MsgBody::DbAcquire(_) => MsgKind::DbAcquire,
            MsgBody::DbRelease(_) => MsgKind::DbRelease,
            MsgBody::EvtCreate(_) => MsgKind::EvtCreate,
            MsgBody::EvtDestroy(_) => MsgKind::EvtDestroy,
            MsgBody::DepAdd(_) => MsgKind::DepAdd,
            MsgBody::DepSatisfy(_) => MsgKind::DepSatisfy,
            MsgBody::DepUnregSignaler(_) => MsgKind::DepUnregSignaler,
            MsgBody::DepUnregWaiter(_) => MsgKind::DepUnregWaiter,
            MsgBody::GuidMetadataClone(_) => MsgKind::GuidMetadataClone,
            MsgBody::MetadataComm(_) => MsgKind::MetadataComm,
            MsgBody::SchedGetWork(_) => MsgKind::SchedGetWork,
            MsgBody::SchedNotify(_) => MsgKind::SchedNotify,
            MsgBody::CommTake(_) => MsgKind::CommTake,
            MsgBody::CommGive(_) => MsgKind::CommGive,
            MsgBody::MgtRlNotify(_) => MsgKind::MgtRlNotify,
        }
    }

    pub fn return_detail(&self) -> ReturnCode {
        match self {
            MsgBody::WorkCreate(b) => b.return_detail,
            MsgBody::WorkDestroy(b) => b.return_detail,
            MsgBody::EdtTempCreate(b) => b.return_detail,
            MsgBody::EdtTempDestroy(b) => b.return_detail,
            MsgBody::DbCreate(b) => b.return_detail,
            MsgBody::DbDestroy(b) => b.return_detail,
            MsgBody::DbFree(b) => b.return_detail,
            MsgBody::DbAcquire(b) => b.return_detail,
            MsgBody::DbRelease(b) => b.return_detail,
            MsgBody::EvtCreate(b) => b.return_detail,
            MsgBody::EvtDestroy(b) => b.return_detail,
            MsgBody::DepAdd(b) => b.return_detail,
            MsgBody::DepSatisfy(b) => b.return_detail,
            MsgBody::DepUnregSignaler(b) => b.return_detail,
            MsgBody::DepUnregWaiter(b) => b.return_detail,
            MsgBody::GuidMetadataClone(b) => b.return_detail,
            MsgBody::MetadataComm(b) => b.return_detail,
            MsgBody::SchedGetWork(b) => b.return_detail,
            MsgBody::SchedNotify(b) => b.return_detail,
            MsgBody::CommTake(b) => b.return_detail,
            MsgBody::CommGive(b) => b.return_detail,
            MsgBody::MgtRlNotify(b) => b.return_detail,
        }
    }

    pub fn set_return_detail(&mut self, code: ReturnCode) {
        match self {
            MsgBody::WorkCreate(b) => b.return_detail = code,
            MsgBody::WorkDestroy(b) => b.return_detail = code,
            MsgBody::EdtTempCreate(b) => b.return_detail = code,
            MsgBody::EdtTempDestroy(b) => b.return_detail = code,
            MsgBody::DbCreate(b) => b.return_detail = code,
            MsgBody::DbDestroy(b) => b.return_detail = code,
            MsgBody::DbFree(b) => b.return_detail = code,
            MsgBody::DbAcquire(b) => b.return_detail = code,
            MsgBody::DbRelease(b) => b.return_detail = code,
            MsgBody::EvtCreate(b) => b.return_detail = code,
            MsgBody::EvtDestroy(b) => b.return_detail = code,
            MsgBody::DepAdd(b) => b.return_detail = code,
            MsgBody::DepSatisfy(b) => b.return_detail = code,
            MsgBody::DepUnregSignaler(b) => b.return_detail = code,
            MsgBody::DepUnregWaiter(b) => b.return_detail = code,
            MsgBody::GuidMetadataClone(b) => b.return_detail = code,
            MsgBody::MetadataComm(b) => b.return_detail = code,
            MsgBody::SchedGetWork(b) => b.return_detail = code,
            MsgBody::SchedNotify(b) => b.return_detail = code,
            MsgBody::CommTake(b) => b.return_detail = code,
            MsgBody::CommGive(b) => b.return_detail = code,
            MsgBody::MgtRlNotify(b) => b.return_detail = code,
        }
    }
}

/// A policy message: header plus typed body.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyMsg {
    /// Physical capacity of the backing buffer.
    pub buffer_size: u32,
    /// Logical byte count after marshalling.
    pub useful_size: u32,
    pub msg_id: u64,
    pub src: Location,
    pub dest: Location,
    pub dir: MsgDir,
    pub body: MsgBody,
}

impl PolicyMsg {
    pub fn request(body: MsgBody, src: Location, dest: Location) -> PolicyMsg {
        PolicyMsg {
            buffer_size: 0,
            useful_size: 0,
            msg_id: 0,
            src,
            dest,
            dir: MsgDir::REQUEST,
            body,
        }
    }

    pub fn request_with_response(body: MsgBody, src: Location, dest: Location) -> PolicyMsg {
        let mut msg = PolicyMsg::request(body, src, dest);
        msg.dir |= MsgDir::REQ_RESPONSE;
        msg
    }

    pub fn kind(&self) -> MsgKind {
        self.body.kind()
    }

    pub fn is_request(&self) -> bool {
        self.dir.contains(MsgDir::REQUEST)
    }

    pub fn is_response(&self) -> bool {
        self.dir.contains(MsgDir::RESPONSE)
    }

    pub fn expects_response(&self) -> bool {
        self.dir.contains(MsgDir::REQ_RESPONSE)
    }

    /// REQUEST and RESPONSE are mutually exclusive and one must be set.
    pub fn dir_is_valid(&self) -> bool {
        self.is_request() != self.is_response()
    }

    /// Flip this message into the response travelling back to the sender.
    pub fn into_response(mut self) -> PolicyMsg {
        debug_assert!(self.is_request());
        std::mem::swap(&mut self.src, &mut self.dest);
        self.dir.remove(MsgDir::REQUEST);
        self.dir |= MsgDir::RESPONSE;
        self
    }
}

/// Monotonic correlation-id source, one per policy domain.
#[derive(Debug, Default)]
pub struct MsgIdAllocator {
    next: AtomicU64,
}

impl MsgIdAllocator {
    pub fn new() -> MsgIdAllocator {
        MsgIdAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn fresh(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_response_are_exclusive() {
        let msg = PolicyMsg::request(
            MsgBody::DepSatisfy(DepSatisfyBody::default()),
            Location(0),
            Location(1),
        );
        assert!(msg.dir_is_valid());
        let resp = msg.into_response();
        assert!(resp.dir_is_valid());
        assert!(resp.is_response() && !resp.is_request());
        assert_eq!(resp.src, Location(1));
        assert_eq!(resp.dest, Location(0));
    }

    #[test]
    fn msg_ids_are_monotonic() {
        let alloc = MsgIdAllocator::new();
        let a = alloc.fresh();
        let b = alloc.fresh();
        assert!(b > a);
    }

    #[test]
    fn return_detail_round_trips_through_the_accessor() {
        let mut body = MsgBody::WorkCreate(WorkCreateBody::default());
        body.set_return_detail(ReturnCode::GuidExists);
        assert_eq!(body.return_detail(), ReturnCode::GuidExists);
    }
}
