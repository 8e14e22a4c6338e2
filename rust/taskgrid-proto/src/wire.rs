//! Wire marshalling
//!
//! Layout of a marshalled message: a 32-byte header, a per-kind base area
//! of scalar fields and section tokens, then the payload sections, each
//! padded to 8-byte alignment. A section token encodes
//! `(byte_offset_from_buffer_start << 1) | in_additional_buffer`, zero
//! meaning "section absent". Offsets in the main buffer are measured from
//! the start of the header; offsets in the additional buffer from its own
//! start. This encoding is the interop contract and must not change.

use crate::error::{ProtoError, Result};
use crate::hint::{DbHint, EdtHint, RuntimeHints};
use crate::msg::*;
use crate::ret::ReturnCode;
use crate::runlevel::Runlevel;
use byteorder::{ByteOrder, LittleEndian};
use taskgrid_guid::{Guid, GuidKind, Location};
use tracing::trace;

/// Maximum alignment of base and payload areas.
pub const MAX_ALIGN: usize = 8;
/// Fixed header size.
pub const HEADER_SIZE: usize = 32;

/// Marshalling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshallMode {
    /// Payload placed after the base in the same buffer.
    Append,
    /// Base and payload copied into a fresh buffer.
    FullCopy,
    /// Payload placed in a second buffer chunk referenced via tokens.
    Addl,
    /// Local handoff copy; byte layout identical to FullCopy, typed
    /// duplication goes through `PolicyMsg::clone`.
    Duplicate,
}

bitflags::bitflags! {
    /// Orthogonal marshalling flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MarshallFlags: u8 {
        /// Marshall the datablock payload on ACQUIRE/RELEASE.
        const DBPTR = 1 << 0;
        /// Nullify/rebind foreign metadata references on receive.
        const NSADDR = 1 << 1;
    }
}

/// A marshalled message: main buffer and optional additional chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgBuffer {
    pub main: Vec<u8>,
    pub addl: Option<Vec<u8>>,
}

impl MsgBuffer {
    pub fn useful_size(&self) -> usize {
        self.main.len() + self.addl.as_ref().map_or(0, |a| a.len())
    }
}

fn align_up(n: usize) -> usize {
    (n + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)
}

/// Base-area writer collecting scalar bytes and deferred sections.
struct BaseBuf {
    buf: Vec<u8>,
    /// (token slot position within the base, section bytes)
    sections: Vec<(usize, Option<Vec<u8>>)>,
}

impl BaseBuf {
    fn new() -> BaseBuf {
        BaseBuf {
            buf: Vec::with_capacity(64),
            sections: Vec::new(),
        }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_guid(&mut self, g: Guid) {
        self.put_u64(g.raw());
    }

    /// Reserve a token slot for a section; the token is patched in at
    /// assembly time once the base size is known.
    fn put_section(&mut self, bytes: Option<Vec<u8>>) {
        let slot = self.buf.len();
        self.put_u64(0);
        self.sections.push((slot, bytes));
    }

    fn base_size(&self) -> usize {
        align_up(self.buf.len())
    }

    fn payload_size(&self) -> usize {
        self.sections
            .iter()
            .map(|(_, s)| s.as_ref().map_or(0, |b| align_up(b.len())))
            .sum()
    }
}

/// Base-area reader walking scalars sequentially.
struct BaseReader<'a> {
    main: &'a [u8],
    addl: Option<&'a [u8]>,
    pos: usize,
}

impl<'a> BaseReader<'a> {
    fn new(main: &'a [u8], addl: Option<&'a [u8]>) -> BaseReader<'a> {
        BaseReader {
            main,
            addl,
            pos: HEADER_SIZE,
        }
    }

    fn get_u8(&mut self) -> Result<u8> {
        let v = *self
            .main
            .get(self.pos)
            .ok_or(ProtoError::Malformed("truncated base area"))?;
        self.pos += 1;
        Ok(v)
    }

    fn get_u32(&mut self) -> Result<u32> {
        let end = self.pos + 4;
        let bytes = self
            .main
            .get(self.pos..end)
            .ok_or(ProtoError::Malformed("truncated base area"))?;
        self.pos = end;
        Ok(LittleEndian::read_u32(bytes))
    }

    fn get_u64(&mut self) -> Result<u64> {
        let end = self.pos + 8;
        let bytes = self
            .main
            .get(self.pos..end)
            .ok_or(ProtoError::Malformed("truncated base area"))?;
        self.pos = end;
        Ok(LittleEndian::read_u64(bytes))
    }

    fn get_guid(&mut self) -> Result<Guid> {
        Ok(Guid::from_raw(self.get_u64()?))
    }

    /// Resolve a section token read from the base.
    fn get_section(&mut self, len: usize) -> Result<Option<&'a [u8]>> {
        let token = self.get_u64()?;
        if token == 0 {
            return Ok(None);
        }
        let in_addl = token & 1 == 1;
        let offset = (token >> 1) as usize;
        let buf = if in_addl {
            self.addl
                .ok_or(ProtoError::Malformed("token references a missing addl buffer"))?
        } else {
            self.main
        };
        buf.get(offset..offset + len)
            .map(Some)
            .ok_or(ProtoError::Malformed("section token out of bounds"))
    }
}

fn guids_to_bytes(guids: &[Guid]) -> Vec<u8> {
    let mut out = Vec::with_capacity(guids.len() * 8);
    for g in guids {
        out.extend_from_slice(&g.raw().to_le_bytes());
    }
    out
}

fn guids_from_bytes(bytes: &[u8]) -> Vec<Guid> {
    bytes
        .chunks_exact(8)
        .map(|c| Guid::from_raw(LittleEndian::read_u64(c)))
        .collect()
}

fn u64s_to_bytes(vals: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vals.len() * 8);
    for v in vals {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn u64s_from_bytes(bytes: &[u8]) -> Vec<u64> {
    bytes.chunks_exact(8).map(LittleEndian::read_u64).collect()
}

fn hints_to_bytes(w: &RuntimeHints) -> Vec<u8> {
    let mut out = Vec::with_capacity(RuntimeHints::WIRE_SIZE);
    out.extend_from_slice(&w.mask.to_le_bytes());
    out.extend_from_slice(&w.edt_affinity.to_le_bytes());
    out.extend_from_slice(&w.slot_max_access.to_le_bytes());
    out.extend_from_slice(&w.db_affinity.to_le_bytes());
    out
}

fn hints_from_bytes(bytes: &[u8]) -> Result<RuntimeHints> {
    if bytes.len() < RuntimeHints::WIRE_SIZE {
        return Err(ProtoError::Malformed("short hint section"));
    }
    Ok(RuntimeHints {
        mask: LittleEndian::read_u64(&bytes[0..8]),
        edt_affinity: LittleEndian::read_u64(&bytes[8..16]),
        slot_max_access: LittleEndian::read_u64(&bytes[16..24]),
        db_affinity: LittleEndian::read_u64(&bytes[24..32]),
    })
}

fn params_to_bytes(p: &EventParams) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    out.extend_from_slice(&p.nb_sat.to_le_bytes());
    out.extend_from_slice(&p.nb_deps.to_le_bytes());
    out.extend_from_slice(&p.max_gen.to_le_bytes());
    out
}

fn params_from_bytes(bytes: &[u8]) -> Result<EventParams> {
    if bytes.len() < 12 {
        return Err(ProtoError::Malformed("short event-params section"));
    }
    Ok(EventParams {
        nb_sat: LittleEndian::read_u32(&bytes[0..4]),
        nb_deps: LittleEndian::read_u32(&bytes[4..8]),
        max_gen: LittleEndian::read_u32(&bytes[8..12]),
    })
}

/// Write the base area (scalars + section tokens) of `body`.
///
/// IO fields go out in both directions, I fields only on requests,
/// O fields only on responses. The layout is fixed per (kind, direction).
fn write_base(body: &MsgBody, is_in: bool, flags: MarshallFlags, w: &mut BaseBuf) {
    match body {
        MsgBody::WorkCreate(b) => {
            w.put_guid(b.guid);
            w.put_u32(b.paramc);
            w.put_u32(b.depc);
            w.put_guid(b.output_event);
            if is_in {
                w.put_guid(b.template);
                w.put_guid(b.parent_latch);
                w.put_guid(b.current_edt);
                w.put_u32(b.properties);
                w.put_u32(b.paramv.len() as u32);
                w.put_u32(b.depv.as_ref().map_or(0, |d| d.len() as u32));
                w.put_u8(b.depv.is_some() as u8);
                w.put_section((!b.paramv.is_empty()).then(|| u64s_to_bytes(&b.paramv)));
                w.put_section(
                    b.depv
                        .as_ref()
                        .filter(|d| !d.is_empty())
                        .map(|d| guids_to_bytes(d)),
                );
                w.put_section(
                    b.hint
                        .filter(|h| !h.is_empty())
                        .map(|h| hints_to_bytes(&h.to_wire())),
                );
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::WorkDestroy(b) => {
            if is_in {
                w.put_guid(b.guid);
                w.put_guid(b.current_edt);
                w.put_u32(b.properties);
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::EdtTempCreate(b) => {
            w.put_guid(b.guid);
            if is_in {
                w.put_u64(b.func_id);
                w.put_u32(b.paramc);
                w.put_u32(b.depc);
                w.put_u32(b.func_name.as_ref().map_or(0, |n| n.len() as u32));
                w.put_section(
                    b.func_name
                        .as_ref()
                        .filter(|n| !n.is_empty())
                        .map(|n| n.as_bytes().to_vec()),
                );
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::EdtTempDestroy(b) => {
            if is_in {
                w.put_guid(b.guid);
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::DbCreate(b) => {
            w.put_guid(b.guid);
            w.put_u32(b.properties);
            if is_in {
                w.put_u64(b.size);
                w.put_guid(b.edt);
                w.put_section(
                    b.hint
                        .filter(|h| !h.is_empty())
                        .map(|h| hints_to_bytes(&h.to_wire())),
                );
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::DbDestroy(b) => {
            if is_in {
                w.put_guid(b.guid);
                w.put_guid(b.edt);
                w.put_u32(b.properties);
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::DbFree(b) => {
            if is_in {
                w.put_guid(b.guid);
                w.put_guid(b.edt);
                w.put_u32(b.properties);
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::DbAcquire(b) => {
            w.put_guid(b.guid);
            w.put_guid(b.edt);
            w.put_u32(b.edt_slot);
            w.put_u32(b.properties);
            if !is_in {
                w.put_u64(b.size);
                let payload = if flags.contains(MarshallFlags::DBPTR) {
                    b.db_payload.clone()
                } else {
                    None
                };
                w.put_section(payload);
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::DbRelease(b) => {
            w.put_guid(b.guid);
            w.put_guid(b.edt);
            if is_in {
                w.put_u64(b.size);
                w.put_u32(b.properties);
                let payload = if flags.contains(MarshallFlags::DBPTR) {
                    b.db_payload.clone()
                } else {
                    None
                };
                w.put_section(payload);
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::EvtCreate(b) => {
            w.put_guid(b.guid);
            if is_in {
                w.put_u8(b.event_kind as u8);
                w.put_u32(b.properties);
                w.put_section(b.params.as_ref().map(params_to_bytes));
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::EvtDestroy(b) => {
            if is_in {
                w.put_guid(b.guid);
                w.put_u32(b.properties);
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::DepAdd(b) => {
            if is_in {
                w.put_guid(b.source);
                w.put_guid(b.dest);
                w.put_u32(b.slot);
                w.put_u32(b.mode);
                w.put_u32(b.properties);
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::DepSatisfy(b) => {
            if is_in {
                w.put_guid(b.guid);
                w.put_guid(b.payload);
                w.put_u32(b.slot);
                w.put_guid(b.satisfier);
                w.put_guid(b.current_edt);
                w.put_u32(b.properties);
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::DepUnregSignaler(b) | MsgBody::DepUnregWaiter(b) => {
            if is_in {
                w.put_guid(b.guid);
                w.put_u32(b.slot);
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::GuidMetadataClone(b) => {
            w.put_guid(b.guid);
            if is_in {
                w.put_u8(b.clone_type as u8);
                w.put_u64(b.dst_location);
            } else {
                w.put_u64(b.size);
                w.put_section(b.blob.clone());
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::MetadataComm(b) => {
            w.put_guid(b.guid);
            w.put_u64(b.mode);
            w.put_u32(b.payload.len() as u32);
            w.put_section((!b.payload.is_empty()).then(|| b.payload.clone()));
            if !is_in {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::SchedGetWork(b) => {
            w.put_u8(b.work_kind as u8);
            w.put_guid(b.edt);
            w.put_u8(b.discard_affinity as u8);
            w.put_u32(b.guids.len() as u32);
            w.put_section((!b.guids.is_empty()).then(|| guids_to_bytes(&b.guids)));
            if !is_in {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::SchedNotify(b) => {
            if is_in {
                w.put_u8(b.notify_kind as u8);
                w.put_guid(b.guid);
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::CommTake(b) => {
            w.put_u32(b.max_count);
            w.put_u32(b.guids.len() as u32);
            w.put_section((!b.guids.is_empty()).then(|| guids_to_bytes(&b.guids)));
            if !is_in {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::CommGive(b) => {
            w.put_u32(b.guids.len() as u32);
            w.put_section((!b.guids.is_empty()).then(|| guids_to_bytes(&b.guids)));
            if !is_in {
                w.put_u8(b.return_detail as u8);
            }
        }
        MsgBody::MgtRlNotify(b) => {
            if is_in {
                w.put_u8(b.runlevel as u8);
                w.put_u32(b.properties);
                w.put_u64(b.error_code);
            } else {
                w.put_u8(b.return_detail as u8);
            }
        }
    }
}

/// Read the base area back into a typed body.
fn read_base(
    kind: MsgKind,
    is_in: bool,
    flags: MarshallFlags,
    r: &mut BaseReader<'_>,
) -> Result<MsgBody> {
    Ok(match kind {
        MsgKind::WorkCreate => {
            let mut b = WorkCreateBody {
                guid: r.get_guid()?,
                paramc: r.get_u32()?,
                depc: r.get_u32()?,
                output_event: r.get_guid()?,
                ..Default::default()
            };
            if is_in {
                b.template = r.get_guid()?;
                b.parent_latch = r.get_guid()?;
                b.current_edt = r.get_guid()?;
                b.properties = r.get_u32()?;
                let paramv_len = r.get_u32()? as usize;
                let depv_len = r.get_u32()? as usize;
                let has_depv = r.get_u8()? != 0;
                b.paramv = r
                    .get_section(paramv_len * 8)?
                    .map(u64s_from_bytes)
                    .unwrap_or_default();
                let depv = r.get_section(depv_len * 8)?.map(guids_from_bytes);
                b.depv = if has_depv {
                    Some(depv.unwrap_or_default())
                } else {
                    None
                };
                b.hint = r
                    .get_section(RuntimeHints::WIRE_SIZE)?
                    .map(hints_from_bytes)
                    .transpose()?
                    .map(|w| EdtHint::from_wire(&w));
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::WorkCreate(b)
        }
        MsgKind::WorkDestroy => {
            let mut b = WorkDestroyBody::default();
            if is_in {
                b.guid = r.get_guid()?;
                b.current_edt = r.get_guid()?;
                b.properties = r.get_u32()?;
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::WorkDestroy(b)
        }
        MsgKind::EdtTempCreate => {
            let mut b = EdtTempCreateBody {
                guid: r.get_guid()?,
                ..Default::default()
            };
            if is_in {
                b.func_id = r.get_u64()?;
                b.paramc = r.get_u32()?;
                b.depc = r.get_u32()?;
                let name_len = r.get_u32()? as usize;
                b.func_name = r
                    .get_section(name_len)?
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::EdtTempCreate(b)
        }
        MsgKind::EdtTempDestroy => {
            let mut b = EdtTempDestroyBody::default();
            if is_in {
                b.guid = r.get_guid()?;
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::EdtTempDestroy(b)
        }
        MsgKind::DbCreate => {
            let mut b = DbCreateBody {
                guid: r.get_guid()?,
                properties: r.get_u32()?,
                ..Default::default()
            };
            if is_in {
                b.size = r.get_u64()?;
                b.edt = r.get_guid()?;
                b.hint = r
                    .get_section(RuntimeHints::WIRE_SIZE)?
                    .map(hints_from_bytes)
                    .transpose()?
                    .map(|w| DbHint::from_wire(&w));
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::DbCreate(b)
        }
        MsgKind::DbDestroy => {
            let mut b = DbDestroyBody::default();
            if is_in {
                b.guid = r.get_guid()?;
                b.edt = r.get_guid()?;
                b.properties = r.get_u32()?;
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::DbDestroy(b)
        }
        MsgKind::DbFree => {
            let mut b = DbFreeBody::default();
            if is_in {
                b.guid = r.get_guid()?;
                b.edt = r.get_guid()?;
                b.properties = r.get_u32()?;
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::DbFree(b)
        }
        MsgKind::DbAcquire => {
            let mut b = DbAcquireBody {
                guid: r.get_guid()?,
                edt: r.get_guid()?,
                edt_slot: r.get_u32()?,
                properties: r.get_u32()?,
                ..Default::default()
            };
            if !is_in {
                b.size = r.get_u64()?;
                let payload_len = if flags.contains(MarshallFlags::DBPTR) {
                    b.size as usize
                } else {
                    0
                };
                b.db_payload = r.get_section(payload_len)?.map(|s| s.to_vec());
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::DbAcquire(b)
        }
        MsgKind::DbRelease => {
            let mut b = DbReleaseBody {
                guid: r.get_guid()?,
                edt: r.get_guid()?,
                ..Default::default()
            };
            if is_in {
                b.size = r.get_u64()?;
                b.properties = r.get_u32()?;
                let payload_len = if flags.contains(MarshallFlags::DBPTR) {
                    b.size as usize
                } else {
                    0
                };
                b.db_payload = r.get_section(payload_len)?.map(|s| s.to_vec());
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::DbRelease(b)
        }
        MsgKind::EvtCreate => {
            let mut b = EvtCreateBody {
                guid: r.get_guid()?,
                ..Default::default()
            };
            if is_in {
                b.event_kind = GuidKind::from_bits(r.get_u8()?);
                b.properties = r.get_u32()?;
                b.params = r.get_section(12)?.map(params_from_bytes).transpose()?;
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::EvtCreate(b)
        }
        MsgKind::EvtDestroy => {
            let mut b = EvtDestroyBody::default();
            if is_in {
                b.guid = r.get_guid()?;
                b.properties = r.get_u32()?;
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::EvtDestroy(b)
        }
        MsgKind::DepAdd => {
            let mut b = DepAddBody::default();
            if is_in {
                b.source = r.get_guid()?;
                b.dest = r.get_guid()?;
                b.slot = r.get_u32()?;
                b.mode = r.get_u32()?;
                b.properties = r.get_u32()?;
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::DepAdd(b)
        }
        MsgKind::DepSatisfy => {
            let mut b = DepSatisfyBody::default();
            if is_in {
                b.guid = r.get_guid()?;
                b.payload = r.get_guid()?;
                b.slot = r.get_u32()?;
                b.satisfier = r.get_guid()?;
                b.current_edt = r.get_guid()?;
                b.properties = r.get_u32()?;
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::DepSatisfy(b)
        }
        MsgKind::DepUnregSignaler | MsgKind::DepUnregWaiter => {
            let mut b = DepUnregBody::default();
            if is_in {
                b.guid = r.get_guid()?;
                b.slot = r.get_u32()?;
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            if kind == MsgKind::DepUnregSignaler {
                MsgBody::DepUnregSignaler(b)
            } else {
                MsgBody::DepUnregWaiter(b)
            }
        }
        MsgKind::GuidMetadataClone => {
            let mut b = GuidMetadataCloneBody {
                guid: r.get_guid()?,
                ..Default::default()
            };
            if is_in {
                b.clone_type = if r.get_u8()? == 1 {
                    MdCloneType::Move
                } else {
                    MdCloneType::Clone
                };
                b.dst_location = r.get_u64()?;
            } else {
                b.size = r.get_u64()?;
                b.blob = r.get_section(b.size as usize)?.map(|s| s.to_vec());
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::GuidMetadataClone(b)
        }
        MsgKind::MetadataComm => {
            let mut b = MetadataCommBody {
                guid: r.get_guid()?,
                mode: r.get_u64()?,
                ..Default::default()
            };
            let payload_len = r.get_u32()? as usize;
            b.payload = r
                .get_section(payload_len)?
                .map(|s| s.to_vec())
                .unwrap_or_default();
            if !is_in {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::MetadataComm(b)
        }
        MsgKind::SchedGetWork => {
            let mut b = SchedWorkBody {
                work_kind: if r.get_u8()? == 1 {
                    SchedWorkKind::Comm
                } else {
                    SchedWorkKind::EdtUser
                },
                edt: r.get_guid()?,
                discard_affinity: false,
                ..Default::default()
            };
            b.discard_affinity = {
                let v = r.get_u8()?;
                v != 0
            };
            let count = r.get_u32()? as usize;
            b.guids = r
                .get_section(count * 8)?
                .map(guids_from_bytes)
                .unwrap_or_default();
            if !is_in {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::SchedGetWork(b)
        }
        MsgKind::SchedNotify => {
            let mut b = SchedNotifyBody::default();
            if is_in {
                b.notify_kind = match r.get_u8()? {
                    1 => SchedNotifyKind::EdtDone,
                    2 => SchedNotifyKind::EdtSatisfied,
                    3 => SchedNotifyKind::DbCreate,
                    _ => SchedNotifyKind::EdtReady,
                };
                b.guid = r.get_guid()?;
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::SchedNotify(b)
        }
        MsgKind::CommTake => {
            let mut b = CommTakeBody {
                max_count: r.get_u32()?,
                ..Default::default()
            };
            let count = r.get_u32()? as usize;
            b.guids = r
                .get_section(count * 8)?
                .map(guids_from_bytes)
                .unwrap_or_default();
            if !is_in {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::CommTake(b)
        }
        MsgKind::CommGive => {
            let mut b = CommGiveBody::default();
            let count = r.get_u32()? as usize;
            b.guids = r
                .get_section(count * 8)?
                .map(guids_from_bytes)
                .unwrap_or_default();
            if !is_in {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::CommGive(b)
        }
        MsgKind::MgtRlNotify => {
            let mut b = MgtRlNotifyBody::default();
            if is_in {
                b.runlevel = Runlevel::from_bits(r.get_u8()?);
                b.properties = r.get_u32()?;
                b.error_code = r.get_u64()?;
            } else {
                b.return_detail = ReturnCode::from_bits(r.get_u8()?);
            }
            MsgBody::MgtRlNotify(b)
        }
    })
}

/// Base size of a message kind in the given direction, aligned.
pub fn msg_base_size(kind: MsgKind, is_in: bool) -> usize {
    let body = default_body(kind);
    let mut w = BaseBuf::new();
    write_base(&body, is_in, MarshallFlags::empty(), &mut w);
    w.base_size()
}

fn default_body(kind: MsgKind) -> MsgBody {
    match kind {
        MsgKind::WorkCreate => MsgBody::WorkCreate(Default::default()),
        MsgKind::WorkDestroy => MsgBody::WorkDestroy(Default::default()),
        MsgKind::EdtTempCreate => MsgBody::EdtTempCreate(Default::default()),
        MsgKind::EdtTempDestroy => MsgBody::EdtTempDestroy(Default::default()),
        MsgKind::DbCreate => MsgBody::DbCreate(Default::default()),
        MsgKind::DbDestroy => MsgBody::DbDestroy(Default::default()),
        MsgKind::DbFree => MsgBody::DbFree(Default::default()),
        MsgKind::DbAcquire => MsgBody::DbAcquire(Default::default()),
        MsgKind::DbRelease => MsgBody::DbRelease(Default::default()),
        MsgKind::EvtCreate => MsgBody::EvtCreate(Default::default()),
        MsgKind::EvtDestroy => MsgBody::EvtDestroy(Default::default()),
        MsgKind::DepAdd => MsgBody::DepAdd(Default::default()),
        MsgKind::DepSatisfy => MsgBody::DepSatisfy(Default::default()),
        MsgKind::DepUnregSignaler => MsgBody::DepUnregSignaler(Default::default()),
        MsgKind::DepUnregWaiter => MsgBody::DepUnregWaiter(Default::default()),
        MsgKind::GuidMetadataClone => MsgBody::GuidMetadataClone(Default::default()),
        MsgKind::MetadataComm => MsgBody::MetadataComm(Default::default()),
        MsgKind::SchedGetWork => MsgBody::SchedGetWork(Default::default()),
        MsgKind::SchedNotify => MsgBody::SchedNotify(Default::default()),
        MsgKind::CommTake => MsgBody::CommTake(Default::default()),
        MsgKind::CommGive => MsgBody::CommGive(Default::default()),
        MsgKind::MgtRlNotify => MsgBody::MgtRlNotify(Default::default()),
    }
}

/// Compute (base, payload) sizes of `msg` under `flags`, both aligned.
pub fn msg_sizes(msg: &PolicyMsg, flags: MarshallFlags) -> (usize, usize) {
    let mut w = BaseBuf::new();
    write_base(&msg.body, msg.is_request(), flags, &mut w);
    (w.base_size(), w.payload_size())
}

/// Marshall `msg` into buffers per `mode` and `flags`.
pub fn marshall(msg: &PolicyMsg, mode: MarshallMode, flags: MarshallFlags) -> Result<MsgBuffer> {
    debug_assert!(msg.dir_is_valid(), "REQUEST and RESPONSE must be exclusive");
    let is_in = msg.is_request();
    let mut w = BaseBuf::new();
    write_base(&msg.body, is_in, flags, &mut w);

    let base_size = w.base_size();
    let payload_size = w.payload_size();
    let total = HEADER_SIZE + base_size + payload_size;
    if total > u32::MAX as usize {
        return Err(ProtoError::TooLarge(total as u64));
    }
    trace!(kind = ?msg.kind(), ?mode, base_size, payload_size, "marshalling message");

    let to_addl = mode == MarshallMode::Addl;
    let mut main = vec![0u8; HEADER_SIZE + base_size];
    main[HEADER_SIZE..HEADER_SIZE + w.buf.len()].copy_from_slice(&w.buf);
    let mut addl = Vec::new();

    // Append the sections and patch their tokens into the base.
    for (slot, bytes) in &w.sections {
        let token = match bytes {
            None => 0u64,
            Some(section) => {
                let target = if to_addl { &mut addl } else { &mut main };
                while target.len() % MAX_ALIGN != 0 {
                    target.push(0);
                }
                let offset = target.len() as u64;
                target.extend_from_slice(section);
                (offset << 1) | (to_addl as u64)
            }
        };
        let pos = HEADER_SIZE + slot;
        LittleEndian::write_u64(&mut main[pos..pos + 8], token);
    }
    // Keep the buffer end aligned.
    while main.len() % MAX_ALIGN != 0 {
        main.push(0);
    }

    let useful = main.len() + addl.len();
    let buffer_size = (msg.buffer_size as usize).max(useful) as u32;

    // Header: sizes, correlation id, locations, kind and direction.
    LittleEndian::write_u32(&mut main[0..4], buffer_size);
    LittleEndian::write_u32(&mut main[4..8], useful as u32);
    LittleEndian::write_u64(&mut main[8..16], msg.msg_id);
    LittleEndian::write_u32(&mut main[16..20], msg.src.0);
    LittleEndian::write_u32(&mut main[20..24], msg.dest.0);
    main[24] = msg.kind() as u8;
    main[25] = msg.dir.bits();

    Ok(MsgBuffer {
        main,
        addl: to_addl.then_some(addl),
    })
}

/// Reverse of [`marshall`].
pub fn unmarshall(main: &[u8], addl: Option<&[u8]>, flags: MarshallFlags) -> Result<PolicyMsg> {
    if main.len() < HEADER_SIZE {
        return Err(ProtoError::Malformed("buffer shorter than the header"));
    }
    let buffer_size = LittleEndian::read_u32(&main[0..4]);
    let useful_size = LittleEndian::read_u32(&main[4..8]);
    let msg_id = LittleEndian::read_u64(&main[8..16]);
    let src = Location(LittleEndian::read_u32(&main[16..20]));
    let dest = Location(LittleEndian::read_u32(&main[20..24]));
    let kind = MsgKind::from_bits(main[24]).ok_or(ProtoError::UnknownKind(main[24]))?;
    let dir = MsgDir::from_bits_truncate(main[25]);

    if useful_size > buffer_size {
        return Err(ProtoError::Malformed("usefulSize exceeds bufferSize"));
    }
    let is_in = dir.contains(MsgDir::REQUEST);
    if is_in == dir.contains(MsgDir::RESPONSE) {
        return Err(ProtoError::Malformed(
            "exactly one of REQUEST/RESPONSE must be set",
        ));
    }

    let mut reader = BaseReader::new(main, addl);
    let body = read_base(kind, is_in, flags, &mut reader)?;

    Ok(PolicyMsg {
        buffer_size,
        useful_size,
        msg_id,
        src,
        dest,
        dir,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn sample_work_create() -> PolicyMsg {
        let mut msg = PolicyMsg::request_with_response(
            MsgBody::WorkCreate(WorkCreateBody {
                guid: Guid::from_raw(0x100),
                paramc: 3,
                depc: 2,
                output_event: Guid::from_raw(0x200),
                template: Guid::from_raw(0x300),
                paramv: vec![1, 2, 3],
                depv: Some(vec![Guid::from_raw(0x400), Guid::from_raw(0x500)]),
                hint: Some(EdtHint {
                    affinity: Some(Guid::from_raw(0x600)),
                    slot_max_access: None,
                }),
                parent_latch: Guid::from_raw(0x700),
                current_edt: Guid::from_raw(0x800),
                properties: 7,
                return_detail: ReturnCode::Ok,
            }),
            Location(0),
            Location(1),
        );
        msg.msg_id = 42;
        msg
    }

    #[test_case(MarshallMode::Append)]
    #[test_case(MarshallMode::FullCopy)]
    #[test_case(MarshallMode::Addl)]
    fn work_create_round_trips(mode: MarshallMode) {
        let msg = sample_work_create();
        let buf = marshall(&msg, mode, MarshallFlags::empty()).unwrap();
        let back = unmarshall(&buf.main, buf.addl.as_deref(), MarshallFlags::empty()).unwrap();
        assert_eq!(back.body, msg.body);
        assert_eq!(back.msg_id, 42);
        assert_eq!(back.src, Location(0));
        assert_eq!(back.dest, Location(1));
        assert_eq!(back.useful_size as usize, buf.useful_size());
    }

    #[test]
    fn addl_sections_set_the_low_bit() {
        let msg = sample_work_create();
        let buf = marshall(&msg, MarshallMode::Addl, MarshallFlags::empty()).unwrap();
        let addl = buf.addl.as_ref().expect("addl buffer");
        assert!(!addl.is_empty());
        // The paramv token is the first section slot; find a token with
        // the in-addl bit by scanning the base area.
        let base = &buf.main[HEADER_SIZE..];
        let found = base
            .chunks_exact(8)
            .map(LittleEndian::read_u64)
            .any(|w| w != 0 && w & 1 == 1 && ((w >> 1) as usize) < addl.len());
        assert!(found, "no addl token found in base area");
    }

    #[test]
    fn append_sections_land_past_the_base() {
        let msg = sample_work_create();
        let buf = marshall(&msg, MarshallMode::Append, MarshallFlags::empty()).unwrap();
        assert!(buf.addl.is_none());
        let base = msg_base_size(MsgKind::WorkCreate, true);
        let tokens: Vec<u64> = buf.main[HEADER_SIZE..HEADER_SIZE + base]
            .chunks_exact(8)
            .map(LittleEndian::read_u64)
            .filter(|w| *w != 0 && w & 1 == 0 && (w >> 1) as usize >= HEADER_SIZE + base)
            .collect();
        assert!(!tokens.is_empty());
    }

    #[test]
    fn response_direction_marshalls_out_fields() {
        let mut msg = sample_work_create().into_response();
        if let MsgBody::WorkCreate(b) = &mut msg.body {
            b.return_detail = ReturnCode::GuidExists;
        }
        let buf = marshall(&msg, MarshallMode::Append, MarshallFlags::empty()).unwrap();
        let back = unmarshall(&buf.main, None, MarshallFlags::empty()).unwrap();
        match back.body {
            MsgBody::WorkCreate(b) => {
                assert_eq!(b.return_detail, ReturnCode::GuidExists);
                assert_eq!(b.guid, Guid::from_raw(0x100));
                assert_eq!(b.output_event, Guid::from_raw(0x200));
                // Request-only fields do not travel on responses.
                assert!(b.paramv.is_empty());
            }
            other => panic!("wrong body {other:?}"),
        }
    }

    #[test]
    fn db_payload_travels_only_under_dbptr() {
        let body = MsgBody::DbAcquire(DbAcquireBody {
            guid: Guid::from_raw(0x42),
            edt: Guid::from_raw(0x43),
            edt_slot: 1,
            properties: 0,
            size: 5,
            db_payload: Some(vec![1, 2, 3, 4, 5]),
            return_detail: ReturnCode::Ok,
        });
        let mut msg = PolicyMsg::request(body, Location(1), Location(0)).into_response();
        msg.dir |= MsgDir::REQ_RESPONSE;

        let plain = marshall(&msg, MarshallMode::Append, MarshallFlags::empty()).unwrap();
        let back = unmarshall(&plain.main, None, MarshallFlags::empty()).unwrap();
        match back.body {
            MsgBody::DbAcquire(b) => assert!(b.db_payload.is_none()),
            _ => unreachable!(),
        }

        let with = marshall(&msg, MarshallMode::Append, MarshallFlags::DBPTR).unwrap();
        let back = unmarshall(&with.main, None, MarshallFlags::DBPTR).unwrap();
        match back.body {
            MsgBody::DbAcquire(b) => assert_eq!(b.db_payload.unwrap(), vec![1, 2, 3, 4, 5]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn metadata_clone_response_carries_the_blob() {
        let blob = vec![9u8; 48];
        let msg = PolicyMsg {
            buffer_size: 0,
            useful_size: 0,
            msg_id: 7,
            src: Location(0),
            dest: Location(1),
            dir: MsgDir::RESPONSE | MsgDir::REQ_RESPONSE,
            body: MsgBody::GuidMetadataClone(GuidMetadataCloneBody {
                guid: Guid::from_raw(0x1000),
                clone_type: MdCloneType::Clone,
                dst_location: 1,
                size: blob.len() as u64,
                blob: Some(blob.clone()),
                return_detail: ReturnCode::Ok,
            }),
        };
        let buf = marshall(&msg, MarshallMode::Append, MarshallFlags::empty()).unwrap();
        let back = unmarshall(&buf.main, None, MarshallFlags::empty()).unwrap();
        match back.body {
            MsgBody::GuidMetadataClone(b) => assert_eq!(b.blob.unwrap(), blob),
            _ => unreachable!(),
        }
    }

    #[test]
    fn base_sizes_are_aligned_and_direction_dependent() {
        for kind in [
            MsgKind::WorkCreate,
            MsgKind::DbAcquire,
            MsgKind::GuidMetadataClone,
            MsgKind::SchedGetWork,
            MsgKind::MgtRlNotify,
        ] {
            for is_in in [true, false] {
                let size = msg_base_size(kind, is_in);
                assert_eq!(size % MAX_ALIGN, 0, "{kind:?} base not aligned");
                assert!(size > 0);
            }
        }
        assert_ne!(
            msg_base_size(MsgKind::WorkCreate, true),
            msg_base_size(MsgKind::WorkCreate, false)
        );
    }

    proptest! {
        #[test]
        fn size_preservation_law(
            paramv in proptest::collection::vec(any::<u64>(), 0..16),
            depv in proptest::collection::vec(any::<u64>(), 0..8),
            props in any::<u32>(),
        ) {
            let msg = PolicyMsg::request_with_response(
                MsgBody::WorkCreate(WorkCreateBody {
                    guid: Guid::from_raw(1),
                    paramc: paramv.len() as u32,
                    depc: depv.len() as u32,
                    template: Guid::from_raw(2),
                    paramv: paramv.clone(),
                    depv: Some(depv.iter().copied().map(Guid::from_raw).collect()),
                    properties: props,
                    ..Default::default()
                }),
                Location(0),
                Location(1),
            );
            for mode in [MarshallMode::Append, MarshallMode::Addl] {
                let buf = marshall(&msg, mode, MarshallFlags::empty()).unwrap();
                let back = unmarshall(&buf.main, buf.addl.as_deref(), MarshallFlags::empty()).unwrap();
                prop_assert_eq!(&back.body, &msg.body);
            }
        }
    }
}
