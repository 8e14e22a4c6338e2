//! GUID providers
//!
//! Two flavors: the counted-map provider mints GUIDs from striped
//! per-worker counters, and the labeled provider adds user-minted GUID
//! ranges with collision detection. Both share the same map backend and
//! the same remote-metadata pull protocol: a miss installs a proxy via
//! `try_put`, the winner is told to issue the metadata-clone request and
//! everybody else queues on the proxy.

use crate::bitmap::{Guid, GuidKind, Location, MAX_COUNTER};
use crate::error::{GuidError, Result};
use crate::map::{GuidEntry, GuidMap};
use crate::proxy::{DeferredAction, MdProxy};
use crate::record::{FatGuid, GuidObject};
use bitflags::bitflags;
use crossbeam_utils::CachePadded;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

bitflags! {
    /// Properties steering GUID creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GuidProps: u32 {
        /// Record the (GUID, value) binding in the map.
        const TO_RECORD = 1 << 0;
        /// The GUID comes from a labeled (reserved) range.
        const IS_LABELED = 1 << 1;
        /// Labeled creation: detect collisions, lose gracefully.
        const CHECK = 1 << 2;
        /// Labeled creation: force the insertion (retry loop). Combined
        /// with CHECK it means "check, but do not wait on the winner".
        const BLOCK = 1 << 3;
        /// The GUID value is already decided by the caller.
        const IS_VALID = 1 << 4;
    }
}

/// Resolution mode for [`GuidProvider::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Return what is locally known, possibly nothing.
    Local,
    /// Install a proxy and trigger the remote fetch on a miss.
    Fetch,
    /// Install a proxy if needed but leave the fetch to the caller.
    Proxy,
}

/// Outcome of a resolution.
pub enum FetchOutcome {
    /// Metadata available locally.
    Ready(Arc<dyn GuidObject>),
    /// Nothing known locally (LOCAL mode only).
    Missing,
    /// This caller won the proxy installation and must issue the
    /// metadata-clone request to the GUID's home.
    IssueClone(Arc<MdProxy>),
    /// A fetch is already in flight; queue on the proxy.
    Pending(Arc<MdProxy>),
}

impl std::fmt::Debug for FetchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchOutcome::Ready(_) => write!(f, "Ready"),
            FetchOutcome::Missing => write!(f, "Missing"),
            FetchOutcome::IssueClone(_) => write!(f, "IssueClone"),
            FetchOutcome::Pending(_) => write!(f, "Pending"),
        }
    }
}

/// Cache-line padded per-worker counter cells.
struct CounterStripes {
    cells: Vec<CachePadded<AtomicU64>>,
}

impl CounterStripes {
    fn new(workers: usize) -> CounterStripes {
        assert!(workers >= 1);
        // Seed each stripe at a distinct point of the counter space so the
        // map shards stay balanced under a modulo-style hash.
        let incr = MAX_COUNTER / workers as u64;
        let cells = (0..workers)
            .map(|i| CachePadded::new(AtomicU64::new(incr * i as u64)))
            .collect();
        CounterStripes { cells }
    }

    fn next(&self, wid: usize, card: u64) -> Result<u64> {
        let cell = &self.cells[wid % self.cells.len()];
        let counter = cell.fetch_add(card, Ordering::Relaxed);
        if counter.saturating_add(card) >= MAX_COUNTER {
            return Err(GuidError::CounterExhausted { worker: wid });
        }
        Ok(counter)
    }

    fn issued(&self, wid: usize) -> u64 {
        self.cells[wid % self.cells.len()].load(Ordering::Relaxed)
    }
}

/// Provider interface shared by the counted and labeled flavors.
pub trait GuidProvider: Send + Sync {
    /// The policy domain this provider belongs to.
    fn my_location(&self) -> Location;

    /// Pre-allocate `count` contiguous GUIDs of `kind`. Labeled and
    /// normal counters are distinct; only the labeled provider supports
    /// labeled reservation. Returns the first GUID and the counter skip
    /// between consecutive reserved GUIDs.
    fn reserve(&self, count: u64, kind: GuidKind, labeled: bool, wid: usize)
        -> Result<(Guid, u64)>;

    /// Return a reserved range. Labeled provider only.
    fn unreserve(&self, start: Guid, skip: u64, count: u64) -> Result<()>;

    /// Mint a fresh GUID encoding `kind` and `target` as home. With
    /// `TO_RECORD`, binds `value` in the map; a foreign home wraps the
    /// value in an already-resolved proxy.
    fn mint(
        &self,
        value: Option<Arc<dyn GuidObject>>,
        kind: GuidKind,
        target: Location,
        props: GuidProps,
        wid: usize,
    ) -> Result<Guid>;

    /// Bind `object` as the metadata of `fguid`, minting the GUID unless
    /// the caller provided a valid one. Labeled sub-modes: CHECK
    /// (try-put, lose with `GuidExists` after the winner published),
    /// BLOCK (forced put with retry), otherwise trust-me put.
    fn create(
        &self,
        fguid: &mut FatGuid,
        object: Arc<dyn GuidObject>,
        kind: GuidKind,
        target: Location,
        props: GuidProps,
        wid: usize,
    ) -> Result<()>;

    /// Bind incoming metadata for a GUID: direct insertion when the GUID
    /// is home-local, otherwise close the proxy queue and hand back the
    /// captured waiters for asynchronous re-submission.
    fn register(&self, guid: Guid, object: Arc<dyn GuidObject>) -> Result<Vec<DeferredAction>>;

    /// Resolve a GUID to its local metadata, driving the remote pull
    /// protocol according to `mode`.
    fn resolve(&self, guid: Guid, mode: ResolveMode) -> FetchOutcome;

    /// Pure bit extraction.
    fn kind_of(&self, guid: Guid) -> GuidKind {
        guid.kind()
    }

    /// Pure bit extraction.
    fn location_of(&self, guid: Guid) -> Location {
        guid.home()
    }

    /// Drop the map binding. The entry is removed before the record
    /// storage goes away; releasing an unknown GUID is NotPermitted.
    fn release(&self, guid: Guid) -> Result<()>;

    /// Per-kind census of entries still registered, for the tear-down
    /// leak sweep.
    fn leak_census(&self) -> BTreeMap<GuidKind, usize>;
}

/// State shared by both provider flavors.
struct ProviderCore {
    my_location: Location,
    map: GuidMap,
    counters: CounterStripes,
}

impl ProviderCore {
    fn new(my_location: Location, buckets: usize, worker_slots: usize) -> ProviderCore {
        ProviderCore {
            my_location,
            map: GuidMap::with_capacity(buckets),
            counters: CounterStripes::new(worker_slots),
        }
    }

    fn is_local(&self, guid: Guid) -> bool {
        guid.home() == self.my_location
    }

    fn generate(
        &self,
        counters: &CounterStripes,
        reserved: bool,
        kind: GuidKind,
        target: Location,
        wid: usize,
        card: u64,
    ) -> Result<Guid> {
        let counter = counters.next(wid, card)?;
        Ok(Guid::pack(reserved, target, wid as u16, kind, counter))
    }

    /// Map entry for a freshly created value: home-local values go in
    /// directly, foreign ones behind a resolved proxy.
    fn entry_for(&self, guid: Guid, value: Arc<dyn GuidObject>) -> GuidEntry {
        if self.is_local(guid) {
            GuidEntry::Metadata(value)
        } else {
            GuidEntry::Proxy(Arc::new(MdProxy::new_resolved(value)))
        }
    }

    fn mint(
        &self,
        value: Option<Arc<dyn GuidObject>>,
        kind: GuidKind,
        target: Location,
        props: GuidProps,
        wid: usize,
    ) -> Result<Guid> {
        let guid = self.generate(&self.counters, false, kind, target, wid, 1)?;
        if props.contains(GuidProps::TO_RECORD) {
            let value = value.ok_or(GuidError::Invalid("TO_RECORD without a value"))?;
            debug!(%guid, ?kind, "recording minted guid");
            self.map.put(guid, self.entry_for(guid, value));
        }
        Ok(guid)
    }

    fn create_unlabeled(
        &self,
        fguid: &mut FatGuid,
        object: Arc<dyn GuidObject>,
        kind: GuidKind,
        target: Location,
        props: GuidProps,
        wid: usize,
    ) -> Result<()> {
        if props.contains(GuidProps::IS_VALID) {
            // The GUID is already known; this is space for a clone.
            if props.contains(GuidProps::TO_RECORD) {
                debug!(guid = %fguid.guid, "recording pre-assigned guid");
                self.map
                    .put(fguid.guid, self.entry_for(fguid.guid, Arc::clone(&object)));
            }
        } else {
            fguid.guid = self.mint(
                Some(Arc::clone(&object)),
                kind,
                target,
                props | GuidProps::TO_RECORD,
                wid,
            )?;
        }
        debug_assert!(!fguid.guid.is_null());
        fguid.metadata = Some(object);
        Ok(())
    }

    fn register(&self, guid: Guid, object: Arc<dyn GuidObject>) -> Result<Vec<DeferredAction>> {
        if self.is_local(guid) {
            self.map.put(guid, GuidEntry::Metadata(object));
            return Ok(Vec::new());
        }
        // Datablocks are registered directly: their coherence protocol
        // keeps its own proxy state above this layer.
        if guid.kind() == GuidKind::Db {
            self.map
                .put(guid, GuidEntry::Proxy(Arc::new(MdProxy::new_resolved(object))));
            return Ok(Vec::new());
        }
        let entry = self
            .map
            .get(guid)
            .ok_or(GuidError::Invalid("registering a guid with no proxy installed"))?;
        let proxy = entry
            .as_proxy()
            .ok_or(GuidError::Invalid("registering over local metadata"))?;
        let waiters = proxy.register(object)?;
        debug!(%guid, waiters = waiters.len(), "registered remote metadata");
        Ok(waiters)
    }

    fn resolve(&self, guid: Guid, mode: ResolveMode) -> FetchOutcome {
        debug_assert!(!guid.is_null());
        if self.is_local(guid) {
            return match self.map.get(guid).and_then(|e| e.resolved()) {
                Some(v) => FetchOutcome::Ready(v),
                None => FetchOutcome::Missing,
            };
        }
        match self.map.get(guid) {
            Some(entry) => match entry.resolved() {
                Some(v) => FetchOutcome::Ready(v),
                None => {
                    let proxy = entry.as_proxy().expect("unresolved entry must be a proxy");
                    FetchOutcome::Pending(proxy)
                }
            },
            None => {
                if mode == ResolveMode::Local {
                    return FetchOutcome::Missing;
                }
                let proxy = Arc::new(MdProxy::new());
                match self.map.try_put(guid, GuidEntry::Proxy(Arc::clone(&proxy))) {
                    Ok(()) => {
                        // Winner: this caller drives the clone.
                        debug!(%guid, "installed metadata proxy, fetch required");
                        if mode == ResolveMode::Fetch {
                            FetchOutcome::IssueClone(proxy)
                        } else {
                            FetchOutcome::Pending(proxy)
                        }
                    }
                    Err(existing) => {
                        // Lost the race; our speculative proxy just drops.
                        match existing.resolved() {
                            Some(v) => FetchOutcome::Ready(v),
                            None => FetchOutcome::Pending(
                                existing.as_proxy().expect("unresolved entry must be a proxy"),
                            ),
                        }
                    }
                }
            }
        }
    }

    fn release(&self, guid: Guid) -> Result<()> {
        match self.map.remove(guid) {
            Some(entry) => {
                // Entry left the map before its storage is dropped here.
                drop(entry);
                Ok(())
            }
            None => Err(GuidError::NotPermitted("releasing an unknown guid")),
        }
    }

    fn leak_census(&self) -> BTreeMap<GuidKind, usize> {
        let census = self.map.census();
        for (kind, count) in &census {
            warn!(?kind, count, "guid still registered at tear-down");
        }
        census
    }
}

/// Counter-based provider without labeled support.
pub struct CountedMapProvider {
    core: ProviderCore,
}

impl CountedMapProvider {
    pub fn new(my_location: Location, buckets: usize, worker_slots: usize) -> CountedMapProvider {
        CountedMapProvider {
            core: ProviderCore::new(my_location, buckets, worker_slots),
        }
    }
}

impl GuidProvider for CountedMapProvider {
    fn my_location(&self) -> Location {
        self.core.my_location
    }

    fn reserve(
        &self,
        _count: u64,
        _kind: GuidKind,
        _labeled: bool,
        _wid: usize,
    ) -> Result<(Guid, u64)> {
        Err(GuidError::NotSupported(
            "labeled ranges require the labeled provider",
        ))
    }

    fn unreserve(&self, _start: Guid, _skip: u64, _count: u64) -> Result<()> {
        Err(GuidError::NotSupported(
            "labeled ranges require the labeled provider",
        ))
    }

    fn mint(
        &self,
        value: Option<Arc<dyn GuidObject>>,
        kind: GuidKind,
        target: Location,
        props: GuidProps,
        wid: usize,
    ) -> Result<Guid> {
        self.core.mint(value, kind, target, props, wid)
    }

    fn create(
        &self,
        fguid: &mut FatGuid,
        object: Arc<dyn GuidObject>,
        kind: GuidKind,
        target: Location,
        props: GuidProps,
        wid: usize,
    ) -> Result<()> {
        if props.contains(GuidProps::IS_LABELED) {
            return Err(GuidError::NotSupported(
                "labeled creation requires the labeled provider",
            ));
        }
        self.core
            .create_unlabeled(fguid, object, kind, target, props, wid)
    }

    fn register(&self, guid: Guid, object: Arc<dyn GuidObject>) -> Result<Vec<DeferredAction>> {
        self.core.register(guid, object)
    }

    fn resolve(&self, guid: Guid, mode: ResolveMode) -> FetchOutcome {
        self.core.resolve(guid, mode)
    }

    fn release(&self, guid: Guid) -> Result<()> {
        self.core.release(guid)
    }

    fn leak_census(&self) -> BTreeMap<GuidKind, usize> {
        self.core.leak_census()
    }
}

/// Provider with labeled (user-minted) GUID ranges.
pub struct LabeledGuidProvider {
    core: ProviderCore,
    reserved: CounterStripes,
}

impl LabeledGuidProvider {
    pub fn new(my_location: Location, buckets: usize, worker_slots: usize) -> LabeledGuidProvider {
        LabeledGuidProvider {
            core: ProviderCore::new(my_location, buckets, worker_slots),
            reserved: CounterStripes::new(worker_slots),
        }
    }

    fn create_labeled(
        &self,
        fguid: &mut FatGuid,
        object: Arc<dyn GuidObject>,
        kind: GuidKind,
        props: GuidProps,
    ) -> Result<()> {
        let guid = fguid.guid;
        if guid.is_null() || !guid.is_reserved() {
            return Err(GuidError::Invalid("labeled creation needs a reserved guid"));
        }
        if guid.home() != self.core.my_location {
            return Err(GuidError::NotPermitted(
                "labeled creation must run at the guid's home",
            ));
        }
        if guid.kind() != kind {
            return Err(GuidError::Invalid("kind does not match the labeled guid"));
        }
        debug_assert!(
            guid.counter() < self.reserved.issued(guid.worker() as usize),
            "labeled guid outside any reserved range"
        );

        // CHECK is tested before BLOCK so CHECK|BLOCK lands here.
        if props.contains(GuidProps::CHECK) {
            match self
                .core
                .map
                .try_put(guid, GuidEntry::Metadata(Arc::clone(&object)))
            {
                Ok(()) => {
                    fguid.metadata = Some(object);
                    Ok(())
                }
                Err(existing) => {
                    debug!(%guid, "labeled creation lost the race");
                    let winner = existing
                        .resolved()
                        .ok_or(GuidError::Invalid("labeled collision against a proxy"))?;
                    // Report the collision only once the winner's record is
                    // initialized; with BLOCK the caller retries
                    // asynchronously instead, since the winner's entry may
                    // be destroyed under us while we wait.
                    if !props.contains(GuidProps::BLOCK) {
                        winner.ready_word().wait_ready(guid);
                    }
                    fguid.metadata = Some(winner);
                    Err(GuidError::GuidExists(guid))
                }
            }
        } else if props.contains(GuidProps::BLOCK) {
            while self
                .core
                .map
                .try_put(guid, GuidEntry::Metadata(Arc::clone(&object)))
                .is_err()
            {
                std::hint::spin_loop();
            }
            fguid.metadata = Some(object);
            Ok(())
        } else {
            // Trust-me mode.
            self.core
                .map
                .put(guid, GuidEntry::Metadata(Arc::clone(&object)));
            fguid.metadata = Some(object);
            Ok(())
        }
    }
}

impl GuidProvider for LabeledGuidProvider {
    fn my_location(&self) -> Location {
        self.core.my_location
    }

    fn reserve(&self, count: u64, kind: GuidKind, labeled: bool, wid: usize)
        -> Result<(Guid, u64)> {
        if count == 0 {
            return Err(GuidError::Invalid("reserving an empty range"));
        }
        let counters = if labeled { &self.reserved } else { &self.core.counters };
        let start = counters.next(wid, count)?;
        let guid = Guid::pack(labeled, self.core.my_location, wid as u16, kind, start);
        debug!(start = %guid, count, labeled, "reserved guid range");
        // Consecutive GUIDs in a range differ by one counter tick.
        Ok((guid, 1))
    }

    fn unreserve(&self, start: Guid, _skip: u64, _count: u64) -> Result<()> {
        if !start.is_reserved() {
            return Err(GuidError::Invalid("unreserve of a non-labeled range"));
        }
        // Ranges are never recycled; the counter is monotonic for the
        // lifetime of the program.
        Ok(())
    }

    fn mint(
        &self,
        value: Option<Arc<dyn GuidObject>>,
        kind: GuidKind,
        target: Location,
        props: GuidProps,
        wid: usize,
    ) -> Result<Guid> {
        self.core.mint(value, kind, target, props, wid)
    }

    fn create(
        &self,
        fguid: &mut FatGuid,
        object: Arc<dyn GuidObject>,
        kind: GuidKind,
        target: Location,
        props: GuidProps,
        wid: usize,
    ) -> Result<()> {
        if props.contains(GuidProps::IS_LABELED) {
            self.create_labeled(fguid, object, kind, props)
        } else {
            self.core
                .create_unlabeled(fguid, object, kind, target, props, wid)
        }
    }

    fn register(&self, guid: Guid, object: Arc<dyn GuidObject>) -> Result<Vec<DeferredAction>> {
        self.core.register(guid, object)
    }

    fn resolve(&self, guid: Guid, mode: ResolveMode) -> FetchOutcome {
        self.core.resolve(guid, mode)
    }

    fn release(&self, guid: Guid) -> Result<()> {
        self.core.release(guid)
    }

    fn leak_census(&self) -> BTreeMap<GuidKind, usize> {
        self.core.leak_census()
    }
}
