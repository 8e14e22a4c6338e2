//! GUID -> metadata map
//!
//! Sharded bucket-locked concurrent map from GUID to either the local
//! metadata record or a proxy for a remote one. `try_put` is the race
//! resolver for labeled creation. An entry must be removed from the map
//! before its record storage is dropped.

use crate::bitmap::{Guid, GuidKind};
use crate::proxy::MdProxy;
use crate::record::GuidObject;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What a map slot can hold.
#[derive(Clone)]
pub enum GuidEntry {
    /// Home-local metadata.
    Metadata(Arc<dyn GuidObject>),
    /// Stand-in for metadata homed elsewhere.
    Proxy(Arc<MdProxy>),
}

impl GuidEntry {
    /// The record, if present either directly or through a resolved proxy.
    pub fn resolved(&self) -> Option<Arc<dyn GuidObject>> {
        match self {
            GuidEntry::Metadata(m) => Some(Arc::clone(m)),
            GuidEntry::Proxy(p) => p.value(),
        }
    }

    pub fn as_proxy(&self) -> Option<Arc<MdProxy>> {
        match self {
            GuidEntry::Proxy(p) => Some(Arc::clone(p)),
            GuidEntry::Metadata(_) => None,
        }
    }
}

impl std::fmt::Debug for GuidEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuidEntry::Metadata(_) => write!(f, "GuidEntry::Metadata"),
            GuidEntry::Proxy(p) => write!(f, "GuidEntry::Proxy(resolved={})", p.is_resolved()),
        }
    }
}

/// Concurrent GUID map.
pub struct GuidMap {
    inner: DashMap<u64, GuidEntry>,
}

impl GuidMap {
    pub fn new() -> GuidMap {
        GuidMap {
            inner: DashMap::new(),
        }
    }

    pub fn with_capacity(buckets: usize) -> GuidMap {
        GuidMap {
            inner: DashMap::with_capacity(buckets),
        }
    }

    /// Insert or overwrite.
    pub fn put(&self, guid: Guid, entry: GuidEntry) {
        self.inner.insert(guid.raw(), entry);
    }

    /// Insert only if absent; on collision the existing entry is returned.
    pub fn try_put(&self, guid: Guid, entry: GuidEntry) -> std::result::Result<(), GuidEntry> {
        match self.inner.entry(guid.raw()) {
            Entry::Occupied(cur) => Err(cur.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub fn get(&self, guid: Guid) -> Option<GuidEntry> {
        self.inner.get(&guid.raw()).map(|e| e.clone())
    }

    /// Remove and return the entry. Removal precedes record deallocation:
    /// the caller drops the returned entry only after the map no longer
    /// references it.
    pub fn remove(&self, guid: Guid) -> Option<GuidEntry> {
        self.inner.remove(&guid.raw()).map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Per-kind census of surviving entries, for the tear-down leak sweep.
    pub fn census(&self) -> BTreeMap<GuidKind, usize> {
        let mut counts = BTreeMap::new();
        for item in self.inner.iter() {
            let kind = Guid::from_raw(*item.key()).kind();
            *counts.entry(kind).or_insert(0) += 1;
        }
        counts
    }
}

impl Default for GuidMap {
    fn default() -> Self {
        GuidMap::new()
    }
}
