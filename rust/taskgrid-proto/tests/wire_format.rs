//! Wire-format conformance
//!
//! The byte layout is the interop contract between heterogeneous
//! installations; these tests pin the header layout, the section token
//! encoding and the per-kind round trips.

use byteorder::{ByteOrder, LittleEndian};
use taskgrid_guid::{Guid, Location};
use taskgrid_proto::*;

fn default_request(kind: MsgKind) -> PolicyMsg {
    let body = match kind {
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
    };
    PolicyMsg::request(body, Location(3), Location(9))
}

const ALL_KINDS: [MsgKind; 22] = [
    MsgKind::WorkCreate,
    MsgKind::WorkDestroy,
    MsgKind::EdtTempCreate,
    MsgKind::EdtTempDestroy,
    MsgKind::DbCreate,
    MsgKind::DbDestroy,
    MsgKind::DbFree,
    MsgKind::DbAcquire,
    MsgKind::DbRelease,
    MsgKind::EvtCreate,
    MsgKind::EvtDestroy,
    MsgKind::DepAdd,
    MsgKind::DepSatisfy,
    MsgKind::DepUnregSignaler,
    MsgKind::DepUnregWaiter,
    MsgKind::GuidMetadataClone,
    MsgKind::MetadataComm,
    MsgKind::SchedGetWork,
    MsgKind::SchedNotify,
    MsgKind::CommTake,
    MsgKind::CommGive,
    MsgKind::MgtRlNotify,
];

#[test]
fn header_layout_is_fixed() {
    let mut msg = default_request(MsgKind::DepSatisfy);
    msg.msg_id = 0x1122_3344_5566_7788;
    let buf = marshall(&msg, MarshallMode::Append, MarshallFlags::empty()).unwrap();
    let main = &buf.main;

    assert_eq!(LittleEndian::read_u32(&main[0..4]) as usize, main.len());
    assert_eq!(LittleEndian::read_u32(&main[4..8]) as usize, main.len());
    assert_eq!(LittleEndian::read_u64(&main[8..16]), 0x1122_3344_5566_7788);
    assert_eq!(LittleEndian::read_u32(&main[16..20]), 3);
    assert_eq!(LittleEndian::read_u32(&main[20..24]), 9);
    assert_eq!(main[24], MsgKind::DepSatisfy as u8);
    assert_eq!(main[25], MsgDir::REQUEST.bits());
}

#[test]
fn every_kind_round_trips_in_both_directions() {
    for kind in ALL_KINDS {
        for response in [false, true] {
            let mut msg = default_request(kind);
            if response {
                msg.dir |= MsgDir::REQ_RESPONSE;
                msg = msg.into_response();
            }
            let buf = marshall(&msg, MarshallMode::Append, MarshallFlags::empty())
                .unwrap_or_else(|e| panic!("{kind:?} marshall failed: {e}"));
            let back = unmarshall(&buf.main, None, MarshallFlags::empty())
                .unwrap_or_else(|e| panic!("{kind:?} unmarshall failed: {e}"));
            assert_eq!(back.kind(), kind);
            assert_eq!(back.dir, msg.dir, "{kind:?} direction");
            assert_eq!(back.body, msg.body, "{kind:?} body");
        }
    }
}

#[test]
fn section_tokens_encode_offset_and_buffer_flag() {
    let paramv = vec![0x0101u64, 0x0202, 0x0303];
    let msg = PolicyMsg::request(
        MsgBody::WorkCreate(WorkCreateBody {
            paramc: 3,
            paramv: paramv.clone(),
            template: Guid::from_raw(1),
            ..Default::default()
        }),
        Location(0),
        Location(1),
    );
    let buf = marshall(&msg, MarshallMode::Append, MarshallFlags::empty()).unwrap();
    let base = msg_base_size(MsgKind::WorkCreate, true);

    // Exactly one non-zero token (paramv); decode and check the bytes
    // it references.
    let mut found = false;
    for chunk in buf.main[HEADER_SIZE..HEADER_SIZE + base].chunks_exact(8) {
        let token = LittleEndian::read_u64(chunk);
        if token == 0 {
            continue;
        }
        assert_eq!(token & 1, 0, "append mode stays in the main buffer");
        let offset = (token >> 1) as usize;
        assert_eq!(offset % MAX_ALIGN, 0, "sections are aligned");
        assert!(offset >= HEADER_SIZE + base);
        let words: Vec<u64> = buf.main[offset..offset + 24]
            .chunks_exact(8)
            .map(LittleEndian::read_u64)
            .collect();
        if words == paramv {
            found = true;
        }
    }
    assert!(found, "paramv section not found through its token");
}

#[test]
fn useful_size_counts_both_buffers() {
    let msg = PolicyMsg::request(
        MsgBody::CommGive(CommGiveBody {
            guids: (1..=4).map(Guid::from_raw).collect(),
            ..Default::default()
        }),
        Location(0),
        Location(1),
    );
    let buf = marshall(&msg, MarshallMode::Addl, MarshallFlags::empty()).unwrap();
    let addl = buf.addl.as_ref().unwrap();
    assert!(!addl.is_empty());
    let back = unmarshall(&buf.main, Some(addl), MarshallFlags::empty()).unwrap();
    assert_eq!(back.useful_size as usize, buf.main.len() + addl.len());
    match back.body {
        MsgBody::CommGive(b) => assert_eq!(b.guids.len(), 4),
        _ => unreachable!(),
    }
}

#[test]
fn malformed_buffers_are_rejected() {
    // Too short for a header.
    assert!(unmarshall(&[0u8; 16], None, MarshallFlags::empty()).is_err());

    // Unknown kind byte.
    let msg = default_request(MsgKind::DepAdd);
    let mut buf = marshall(&msg, MarshallMode::Append, MarshallFlags::empty()).unwrap();
    buf.main[24] = 0xee;
    assert!(matches!(
        unmarshall(&buf.main, None, MarshallFlags::empty()),
        Err(ProtoError::UnknownKind(0xee))
    ));

    // Both direction bits set.
    let mut buf = marshall(&msg, MarshallMode::Append, MarshallFlags::empty()).unwrap();
    buf.main[25] = (MsgDir::REQUEST | MsgDir::RESPONSE).bits();
    assert!(unmarshall(&buf.main, None, MarshallFlags::empty()).is_err());

    // usefulSize above bufferSize.
    let mut buf = marshall(&msg, MarshallMode::Append, MarshallFlags::empty()).unwrap();
    LittleEndian::write_u32(&mut buf.main[4..8], u32::MAX);
    assert!(unmarshall(&buf.main, None, MarshallFlags::empty()).is_err());

    // A token pointing outside the buffer.
    let with_deps = PolicyMsg::request(
        MsgBody::CommTake(CommTakeBody {
            max_count: 1,
            guids: vec![Guid::from_raw(5)],
            ..Default::default()
        }),
        Location(0),
        Location(1),
    );
    let mut buf = marshall(&with_deps, MarshallMode::Append, MarshallFlags::empty()).unwrap();
    // CommTake base: max_count u32, count u32, then the token slot.
    let slot = HEADER_SIZE + 8;
    LittleEndian::write_u64(&mut buf.main[slot..slot + 8], (1 << 20) << 1);
    assert!(unmarshall(&buf.main, None, MarshallFlags::empty()).is_err());
}
