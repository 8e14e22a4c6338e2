//! Concurrency behavior of the GUID provider
//!
//! Uniqueness across racing workers, home-location encoding, the
//! single-winner fetch protocol and the once-only proxy drain.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use taskgrid_guid::{
    FetchOutcome, Guid, GuidKind, GuidObject, GuidProps, GuidProvider, LabeledGuidProvider,
    Location, ReadyWord, ResolveMode,
};

struct Stub {
    ready: ReadyWord,
}

impl Stub {
    fn new() -> Arc<Stub> {
        Arc::new(Stub {
            ready: ReadyWord::new(),
        })
    }
}

impl GuidObject for Stub {
    fn ready_word(&self) -> &ReadyWord {
        &self.ready
    }
    fn kind(&self) -> GuidKind {
        GuidKind::EventSticky
    }
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[test]
fn guids_minted_by_racing_workers_are_unique() {
    const WORKERS: usize = 4;
    const PER_WORKER: usize = 2_000;
    let provider = Arc::new(LabeledGuidProvider::new(Location(2), 1024, WORKERS));

    let handles: Vec<_> = (0..WORKERS)
        .map(|wid| {
            let provider = Arc::clone(&provider);
            thread::spawn(move || {
                let mut minted = Vec::with_capacity(PER_WORKER);
                for _ in 0..PER_WORKER {
                    minted.push(
                        provider
                            .mint(None, GuidKind::Edt, Location(2), GuidProps::empty(), wid)
                            .unwrap(),
                    );
                }
                minted
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for h in handles {
        for guid in h.join().unwrap() {
            assert!(seen.insert(guid.raw()), "duplicate guid {guid}");
            // Home encoding survives every mint.
            assert_eq!(guid.home(), Location(2));
            assert_eq!(guid.kind(), GuidKind::Edt);
        }
    }
    assert_eq!(seen.len(), WORKERS * PER_WORKER);
}

#[test]
fn concurrent_fetch_has_exactly_one_clone_issuer() {
    const THREADS: usize = 8;
    let provider = Arc::new(LabeledGuidProvider::new(Location(1), 64, 1));
    let remote = Guid::pack(false, Location(0), 0, GuidKind::EdtTemplate, 77);

    let issuers = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let provider = Arc::clone(&provider);
            let issuers = Arc::clone(&issuers);
            thread::spawn(move || match provider.resolve(remote, ResolveMode::Fetch) {
                FetchOutcome::IssueClone(_) => {
                    issuers.fetch_add(1, Ordering::SeqCst);
                }
                FetchOutcome::Pending(_) => {}
                other => panic!("unexpected outcome {other:?}"),
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(issuers.load(Ordering::SeqCst), 1);
}

#[test]
fn waiters_enqueued_during_the_race_run_exactly_once() {
    const THREADS: usize = 6;
    let provider = Arc::new(LabeledGuidProvider::new(Location(1), 64, 1));
    let remote = Guid::pack(false, Location(0), 0, GuidKind::EventSticky, 5);

    // Install the proxy.
    let proxy = match provider.resolve(remote, ResolveMode::Fetch) {
        FetchOutcome::IssueClone(p) => p,
        other => panic!("unexpected outcome {other:?}"),
    };

    let ran = Arc::new(AtomicUsize::new(0));
    let enqueuers: Vec<_> = (0..THREADS)
        .map(|_| {
            let proxy = Arc::clone(&proxy);
            let ran = Arc::clone(&ran);
            thread::spawn(move || {
                let r = Arc::clone(&ran);
                match proxy.enqueue(Box::new(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                })) {
                    Ok(()) => {}
                    // Queue already closed: the action runs directly.
                    Err(run_now) => run_now(),
                }
            })
        })
        .collect();

    // Concurrent registration closes the queue exactly once.
    let registrar = {
        let provider = Arc::clone(&provider);
        thread::spawn(move || {
            let obj = Stub::new();
            obj.ready_word().publish(remote);
            provider.register(remote, obj).unwrap()
        })
    };
    for h in enqueuers {
        h.join().unwrap();
    }
    let drained = registrar.join().unwrap();
    for action in drained {
        action();
    }
    assert_eq!(ran.load(Ordering::SeqCst), THREADS);

    // The metadata is now visible locally.
    match provider.resolve(remote, ResolveMode::Local) {
        FetchOutcome::Ready(obj) => assert!(obj.ready_word().is_ready(remote)),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn labeled_ranges_do_not_collide_with_counted_guids() {
    let provider = LabeledGuidProvider::new(Location(0), 64, 1);
    let (start, skip) = provider.reserve(16, GuidKind::EventSticky, true, 0).unwrap();
    assert_eq!(skip, 1);
    let mut labeled = HashSet::new();
    for i in 0..16u64 {
        let g = Guid::pack(
            true,
            Location(0),
            start.worker(),
            GuidKind::EventSticky,
            start.counter() + i,
        );
        labeled.insert(g.raw());
    }
    for _ in 0..64 {
        let g = provider
            .mint(None, GuidKind::EventSticky, Location(0), GuidProps::empty(), 0)
            .unwrap();
        assert!(!labeled.contains(&g.raw()), "labeled range overlapped");
        assert!(!g.is_reserved());
    }
}

#[test]
fn block_mode_succeeds_once_the_holder_releases() {
    let provider = Arc::new(LabeledGuidProvider::new(Location(0), 64, 1));
    let (label, _) = provider.reserve(1, GuidKind::EventSticky, true, 0).unwrap();

    let first = Stub::new();
    let mut winner = taskgrid_guid::FatGuid::from_guid(label);
    provider
        .create(
            &mut winner,
            first as Arc<dyn GuidObject>,
            GuidKind::EventSticky,
            Location(0),
            GuidProps::IS_LABELED | GuidProps::CHECK,
            0,
        )
        .unwrap();

    // A BLOCK creation spins until the holder goes away.
    let blocker = {
        let provider = Arc::clone(&provider);
        thread::spawn(move || {
            let mut fguid = taskgrid_guid::FatGuid::from_guid(label);
            provider
                .create(
                    &mut fguid,
                    Stub::new() as Arc<dyn GuidObject>,
                    GuidKind::EventSticky,
                    Location(0),
                    GuidProps::IS_LABELED | GuidProps::BLOCK,
                    0,
                )
                .unwrap();
        })
    };
    thread::sleep(std::time::Duration::from_millis(10));
    provider.release(label).unwrap();
    blocker.join().unwrap();

    // The second creation owns the label now.
    assert!(matches!(
        provider.resolve(label, ResolveMode::Local),
        FetchOutcome::Ready(_)
    ));
}
