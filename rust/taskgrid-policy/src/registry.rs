//! Capability registries
//!
//! Two registries back dynamic dispatch by object kind: the function
//! registry maps template function ids to executable task bodies (the
//! same binary runs on every policy domain), and the object registry
//! holds the per-kind metadata codecs driving the clone protocol.

use crate::error::{PolicyError, Result};
use crate::objects::{AffinityRecord, EdtRecord, EventRecord, MdState, TemplateRecord};
use taskgrid_proto::{EdtHint, RuntimeHints};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use taskgrid_guid::{Guid, GuidKind, GuidObject, Location};

/// A dependence handed to an executing task.
#[derive(Debug, Clone, Copy)]
pub struct EdtDep {
    pub guid: Guid,
}

/// Executable body of a task. Returns the datablock to satisfy the
/// output event with, if any.
pub type EdtFn = Arc<dyn Fn(&[u64], &[EdtDep]) -> Option<Guid> + Send + Sync>;

/// fn-id -> task body. Identical contents on every policy domain.
#[derive(Default)]
pub struct FuncRegistry {
    funcs: DashMap<u64, EdtFn>,
}

impl FuncRegistry {
    pub fn new() -> FuncRegistry {
        FuncRegistry {
            funcs: DashMap::new(),
        }
    }

    pub fn register(&self, func_id: u64, f: EdtFn) {
        self.funcs.insert(func_id, f);
    }

    pub fn get(&self, func_id: u64) -> Option<EdtFn> {
        self.funcs.get(&func_id).map(|f| Arc::clone(&f))
    }
}

/// Serialize/deserialize one kind of metadata for the clone protocol.
pub trait ObjectCodec: Send + Sync {
    fn serialize(&self, obj: &dyn GuidObject) -> Result<Vec<u8>>;
    fn deserialize(&self, guid: Guid, bytes: &[u8]) -> Result<Arc<dyn GuidObject>>;
}

#[derive(Serialize, Deserialize)]
struct TemplateSnapshot {
    func_id: u64,
    func_name: Option<String>,
    paramc: u32,
    depc: u32,
}

struct TemplateCodec;

impl ObjectCodec for TemplateCodec {
    fn serialize(&self, obj: &dyn GuidObject) -> Result<Vec<u8>> {
        let tpl = obj
            .as_any()
            .downcast_ref::<TemplateRecord>()
            .ok_or(PolicyError::Invalid("not a template record"))?;
        Ok(bincode::serialize(&TemplateSnapshot {
            func_id: tpl.func_id,
            func_name: tpl.func_name.clone(),
            paramc: tpl.paramc,
            depc: tpl.depc,
        })?)
    }

    fn deserialize(&self, guid: Guid, bytes: &[u8]) -> Result<Arc<dyn GuidObject>> {
        let snap: TemplateSnapshot = bincode::deserialize(bytes)?;
        let tpl = Arc::new(TemplateRecord::new(
            snap.func_id,
            snap.func_name,
            snap.paramc,
            snap.depc,
        ));
        tpl.ready_word().publish(guid);
        Ok(tpl)
    }
}

#[derive(Serialize, Deserialize)]
struct AffinitySnapshot {
    location: u32,
}

struct AffinityCodec;

impl ObjectCodec for AffinityCodec {
    fn serialize(&self, obj: &dyn GuidObject) -> Result<Vec<u8>> {
        let aff = obj
            .as_any()
            .downcast_ref::<AffinityRecord>()
            .ok_or(PolicyError::Invalid("not an affinity record"))?;
        Ok(bincode::serialize(&AffinitySnapshot {
            location: aff.location.0,
        })?)
    }

    fn deserialize(&self, guid: Guid, bytes: &[u8]) -> Result<Arc<dyn GuidObject>> {
        let snap: AffinitySnapshot = bincode::deserialize(bytes)?;
        let aff = Arc::new(AffinityRecord::new(Location(snap.location)));
        aff.ready_word().publish(guid);
        Ok(aff)
    }
}

#[derive(Serialize, Deserialize)]
struct StickySnapshot {
    payload: Option<u64>,
}

struct StickyEventCodec;

impl ObjectCodec for StickyEventCodec {
    fn serialize(&self, obj: &dyn GuidObject) -> Result<Vec<u8>> {
        let evt = obj
            .as_any()
            .downcast_ref::<EventRecord>()
            .ok_or(PolicyError::Invalid("not an event record"))?;
        Ok(bincode::serialize(&StickySnapshot {
            payload: evt.sticky_payload().map(|g| g.raw()),
        })?)
    }

    fn deserialize(&self, guid: Guid, bytes: &[u8]) -> Result<Arc<dyn GuidObject>> {
        let snap: StickySnapshot = bincode::deserialize(bytes)?;
        let evt = Arc::new(EventRecord::new(GuidKind::EventSticky, 0)?);
        if let Some(raw) = snap.payload {
            evt.satisfy(0, Guid::from_raw(raw))?;
        }
        evt.ready_word().publish(guid);
        Ok(evt)
    }
}

#[derive(Serialize, Deserialize)]
struct EdtSnapshot {
    template: u64,
    paramc: u32,
    paramv: Vec<u64>,
    depc: u32,
    hint: Option<RuntimeHints>,
    output_event: u64,
    parent_latch: u64,
    properties: u32,
    resolved_deps: Vec<Option<u64>>,
}

/// Migrates ready tasks to a stealing policy domain. The copy lands as a
/// ghost; the master record stays at the home until destruction.
struct EdtCodec;

impl ObjectCodec for EdtCodec {
    fn serialize(&self, obj: &dyn GuidObject) -> Result<Vec<u8>> {
        let edt = obj
            .as_any()
            .downcast_ref::<EdtRecord>()
            .ok_or(PolicyError::Invalid("not an EDT record"))?;
        Ok(bincode::serialize(&EdtSnapshot {
            template: edt.template.raw(),
            paramc: edt.paramc,
            paramv: edt.paramv.clone(),
            depc: edt.depc,
            hint: edt.hint.map(|h| h.to_wire()),
            output_event: edt.output_event.raw(),
            parent_latch: edt.parent_latch.raw(),
            properties: edt.properties,
            resolved_deps: edt
                .resolved_deps()
                .into_iter()
                .map(|g| g.map(|g| g.raw()))
                .collect(),
        })?)
    }

    fn deserialize(&self, guid: Guid, bytes: &[u8]) -> Result<Arc<dyn GuidObject>> {
        let snap: EdtSnapshot = bincode::deserialize(bytes)?;
        let mut edt = EdtRecord::new(
            Guid::from_raw(snap.template),
            snap.paramc,
            snap.paramv,
            snap.depc,
            snap.hint.as_ref().map(EdtHint::from_wire),
            Guid::from_raw(snap.output_event),
            Guid::from_raw(snap.parent_latch),
            snap.properties,
        );
        edt.md_state = MdState::Ghost;
        let edt = Arc::new(edt);
        for (slot, dep) in snap.resolved_deps.iter().enumerate() {
            if let Some(raw) = dep {
                edt.satisfy_slot(slot as u32, Guid::from_raw(*raw))?;
            }
        }
        edt.ready_word().publish(guid);
        Ok(edt)
    }
}

/// Per-kind codec registry held by the policy domain.
pub struct ObjectRegistry {
    codecs: HashMap<GuidKind, Arc<dyn ObjectCodec>>,
}

impl ObjectRegistry {
    /// Registry with the kinds the clone protocol supports.
    pub fn with_defaults() -> ObjectRegistry {
        let mut codecs: HashMap<GuidKind, Arc<dyn ObjectCodec>> = HashMap::new();
        codecs.insert(GuidKind::EdtTemplate, Arc::new(TemplateCodec));
        codecs.insert(GuidKind::Affinity, Arc::new(AffinityCodec));
        codecs.insert(GuidKind::EventSticky, Arc::new(StickyEventCodec));
        codecs.insert(GuidKind::Edt, Arc::new(EdtCodec));
        ObjectRegistry { codecs }
    }

    pub fn codec(&self, kind: GuidKind) -> Result<&Arc<dyn ObjectCodec>> {
        self.codecs
            .get(&kind)
            .ok_or(PolicyError::NotSupported("no metadata codec for this kind"))
    }

    pub fn supports(&self, kind: GuidKind) -> bool {
        self.codecs.contains_key(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskgrid_guid::Location;

    #[test]
    fn template_clone_round_trips() {
        let reg = ObjectRegistry::with_defaults();
        let tpl = TemplateRecord::new(77, Some("stencil_step".into()), 2, 3);
        let bytes = reg
            .codec(GuidKind::EdtTemplate)
            .unwrap()
            .serialize(&tpl)
            .unwrap();
        let guid = Guid::pack(false, Location(0), 0, GuidKind::EdtTemplate, 5);
        let back = reg
            .codec(GuidKind::EdtTemplate)
            .unwrap()
            .deserialize(guid, &bytes)
            .unwrap();
        let back = back.as_any().downcast_ref::<TemplateRecord>().unwrap();
        assert_eq!(back.func_id, 77);
        assert_eq!(back.func_name.as_deref(), Some("stencil_step"));
        assert_eq!((back.paramc, back.depc), (2, 3));
        assert!(back.ready_word().is_ready(guid));
    }

    #[test]
    fn satisfied_sticky_clone_carries_its_payload() {
        let reg = ObjectRegistry::with_defaults();
        let evt = EventRecord::new(GuidKind::EventSticky, 0).unwrap();
        evt.satisfy(0, Guid::from_raw(0xdb)).unwrap();
        let bytes = reg
            .codec(GuidKind::EventSticky)
            .unwrap()
            .serialize(&evt)
            .unwrap();
        let guid = Guid::pack(false, Location(1), 0, GuidKind::EventSticky, 9);
        let back = reg
            .codec(GuidKind::EventSticky)
            .unwrap()
            .deserialize(guid, &bytes)
            .unwrap();
        let back = back.as_any().downcast_ref::<EventRecord>().unwrap();
        assert_eq!(back.sticky_payload(), Some(Guid::from_raw(0xdb)));
    }

    #[test]
    fn unsupported_kinds_have_no_codec() {
        let reg = ObjectRegistry::with_defaults();
        assert!(!reg.supports(GuidKind::Db));
        assert!(reg.codec(GuidKind::Db).is_err());
    }

    #[test]
    fn ready_edt_clone_lands_as_a_ghost() {
        let reg = ObjectRegistry::with_defaults();
        let edt = EdtRecord::new(
            Guid::from_raw(0x10),
            1,
            vec![42],
            1,
            None,
            Guid::from_raw(0x20),
            Guid::from_raw(0x30),
            0,
        );
        edt.satisfy_slot(0, Guid::from_raw(0x40)).unwrap();
        let bytes = reg.codec(GuidKind::Edt).unwrap().serialize(&edt).unwrap();
        let guid = Guid::pack(false, Location(0), 0, GuidKind::Edt, 3);
        let back = reg
            .codec(GuidKind::Edt)
            .unwrap()
            .deserialize(guid, &bytes)
            .unwrap();
        let ghost = back.as_any().downcast_ref::<EdtRecord>().unwrap();
        assert_eq!(ghost.md_state, MdState::Ghost);
        assert!(ghost.is_ready());
        assert_eq!(ghost.paramv, vec![42]);
        assert_eq!(ghost.output_event, Guid::from_raw(0x20));
    }
}
