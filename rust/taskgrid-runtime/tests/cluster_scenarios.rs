//! End-to-end scenarios on the in-process cluster

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use taskgrid_config::RuntimeConfig;
use taskgrid_guid::{Guid, GuidKind, Location};
use taskgrid_runtime::{Cluster, EdtSpec, RuntimeError};
use taskgrid_proto::{DbHint, EdtHint};

fn config(pds: u32, workers: usize, enforce: bool) -> RuntimeConfig {
    RuntimeConfig {
        pd_count: pds,
        workers_per_pd: workers,
        enforce_affinity: enforce,
        ..Default::default()
    }
}

fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Policy domain executing the current task, parsed off the worker
/// thread name.
fn executing_pd() -> Option<u32> {
    std::thread::current()
        .name()
        .and_then(|n| n.strip_prefix("tg-worker-"))
        .and_then(|rest| rest.split('-').next())
        .and_then(|s| s.parse().ok())
}

#[test]
fn single_domain_runs_a_task_graph() {
    let cluster = Cluster::launch(config(1, 2, false)).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = Arc::clone(&hits);
        cluster.register_func(
            1,
            Arc::new(move |paramv, _deps| {
                hits.fetch_add(paramv[0] as usize, Ordering::SeqCst);
                None
            }),
        );
    }
    let api = cluster.api(0);
    let tpl = api.template_create(1, "accumulate", 1, 1).unwrap();
    let evt = api.event_create(GuidKind::EventSticky).unwrap();
    api.edt_create(EdtSpec {
        template: tpl,
        paramv: vec![5],
        depv: Some(vec![evt]),
        ..Default::default()
    })
    .unwrap();

    // Blocked until the event fires.
    assert!(!wait_for(Duration::from_millis(100), || {
        hits.load(Ordering::SeqCst) > 0
    }));
    api.event_satisfy(evt, Guid::NULL).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 5
    }));

    api.shutdown(0);
    assert_eq!(cluster.wait_exit(), 0);
}

#[test]
fn template_fetch_from_a_remote_home() {
    let cluster = Cluster::launch(config(2, 2, false)).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = Arc::clone(&hits);
        cluster.register_func(
            7,
            Arc::new(move |_p, _d| {
                hits.fetch_add(1, Ordering::SeqCst);
                None
            }),
        );
    }
    // The template lives at PD0; PD1 creates tasks against it.
    let tpl = cluster.api(0).template_create(7, "remote_body", 0, 0).unwrap();
    assert_eq!(tpl.home(), Location(0));

    let api1 = cluster.api(1);
    let first = api1
        .edt_create(EdtSpec {
            template: tpl,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(first.guid.home(), Location(1));
    // The clone is installed; a second create needs no further fetch.
    api1.edt_create(EdtSpec {
        template: tpl,
        ..Default::default()
    })
    .unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 2
    }));
    cluster.api(0).shutdown(0);
    assert_eq!(cluster.wait_exit(), 0);
}

#[test]
fn labeled_event_race_has_one_winner() {
    let cluster = Cluster::launch(config(2, 1, false)).unwrap();
    let api0 = cluster.api(0);
    let api1 = cluster.api(1);
    let (label, _skip) = api0.reserve_guids(1, GuidKind::EventSticky).unwrap();
    assert!(label.is_reserved());
    assert_eq!(label.home(), Location(0));

    let t0 = {
        let api0 = api0.clone();
        std::thread::spawn(move || api0.event_create_labeled(label, GuidKind::EventSticky))
    };
    let t1 = {
        let api1 = api1.clone();
        std::thread::spawn(move || api1.event_create_labeled(label, GuidKind::EventSticky))
    };
    let r0 = t0.join().unwrap();
    let r1 = t1.join().unwrap();

    let winners = [&r0, &r1].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one creation wins: {r0:?} / {r1:?}");
    // The loser saw a fully-published record behind the same GUID.
    for r in [r0, r1] {
        if let Ok(g) = r {
            assert_eq!(g, label);
        }
    }

    api0.shutdown(0);
    assert_eq!(cluster.wait_exit(), 0);
}

#[test]
fn remote_satisfy_of_a_sticky_event() {
    let cluster = Cluster::launch(config(2, 2, false)).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = Arc::clone(&hits);
        cluster.register_func(
            3,
            Arc::new(move |_p, deps| {
                assert!(!deps.is_empty());
                hits.fetch_add(1, Ordering::SeqCst);
                None
            }),
        );
    }
    let api0 = cluster.api(0);
    let tpl = api0.template_create(3, "waiter_body", 0, 1).unwrap();
    let evt = api0.event_create(GuidKind::EventSticky).unwrap();
    let db = api0.db_create(8, None).unwrap();
    api0.edt_create(EdtSpec {
        template: tpl,
        depv: Some(vec![evt]),
        ..Default::default()
    })
    .unwrap();

    // PD1 satisfies the event homed at PD0.
    cluster.api(1).event_satisfy(evt, db).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 1
    }));

    api0.shutdown(0);
    assert_eq!(cluster.wait_exit(), 0);
}

#[test]
fn affinitized_work_is_pulled_by_its_target_under_enforcement() {
    const TASKS: usize = 6;
    let cluster = Cluster::launch(config(2, 2, true)).unwrap();
    let per_pd: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let per_pd = Arc::clone(&per_pd);
        cluster.register_func(
            4,
            Arc::new(move |_p, _d| {
                per_pd.lock().push(executing_pd().expect("worker thread"));
                None
            }),
        );
    }
    let api0 = cluster.api(0);
    let tpl = api0.template_create(4, "pinned_body", 0, 1).unwrap();
    let db = api0
        .db_create(
            64,
            Some(DbHint {
                affinity: Some(Location(1)),
            }),
        )
        .unwrap();
    for _ in 0..TASKS {
        api0.edt_create(EdtSpec {
            template: tpl,
            depv: Some(vec![db]),
            hint: Some(EdtHint {
                affinity: None,
                slot_max_access: Some(0),
            }),
            ..Default::default()
        })
        .unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || {
        per_pd.lock().len() == TASKS
    }));
    let counts = per_pd.lock();
    assert!(
        counts.iter().all(|pd| *pd == 1),
        "all pinned tasks run on PD1, got {counts:?}"
    );
    drop(counts);

    api0.shutdown(0);
    assert_eq!(cluster.wait_exit(), 0);
}

#[test]
fn starved_domain_steals_after_affinitized_miss() {
    const TASKS: usize = 8;
    let cluster = Cluster::launch(config(2, 1, false)).unwrap();
    let per_pd: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let per_pd = Arc::clone(&per_pd);
        cluster.register_func(
            5,
            Arc::new(move |_p, _d| {
                std::thread::sleep(Duration::from_millis(50));
                per_pd.lock().push(executing_pd().expect("worker thread"));
                None
            }),
        );
    }
    // All the work starts at PD1; PD0 is starving.
    let api1 = cluster.api(1);
    let tpl = api1.template_create(5, "slow_body", 0, 0).unwrap();
    for _ in 0..TASKS {
        api1.edt_create(EdtSpec {
            template: tpl,
            ..Default::default()
        })
        .unwrap();
    }

    assert!(wait_for(Duration::from_secs(15), || {
        per_pd.lock().len() == TASKS
    }));
    let counts = per_pd.lock();
    let stolen = counts.iter().filter(|pd| **pd == 0).count();
    assert!(stolen > 0, "PD0 should have pulled work, got {counts:?}");
    drop(counts);

    api1.shutdown(0);
    assert_eq!(cluster.wait_exit(), 0);
}

#[test]
fn finish_scope_latch_balances_across_domains() {
    let cluster = Cluster::launch(config(2, 2, false)).unwrap();
    cluster.register_func(6, Arc::new(|_p, _d| None));
    let api0 = cluster.api(0);
    let tpl = api0.template_create(6, "child_body", 0, 0).unwrap();
    let latch = api0.latch_create(1).unwrap();

    // A local child and a remote (affinitized) child check in and out.
    api0.edt_create(EdtSpec {
        template: tpl,
        parent_latch: latch,
        ..Default::default()
    })
    .unwrap();
    let remote_aff = api0.affinity_to(Location(1)).unwrap();
    api0.edt_create(EdtSpec {
        template: tpl,
        parent_latch: latch,
        hint: Some(EdtHint {
            affinity: Some(remote_aff),
            slot_max_access: None,
        }),
        ..Default::default()
    })
    .unwrap();

    // Both completions observed: sum(incr) == sum(decr) + the base count.
    assert!(wait_for(Duration::from_secs(10), || {
        api0.latch_totals(latch) == Some((3, 2))
    }));
    // Release the base count: the latch reaches zero and fires.
    api0.event_satisfy_slot(latch, 0, Guid::NULL).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        api0.latch_totals(latch) == Some((3, 3))
    }));

    api0.shutdown(0);
    assert_eq!(cluster.wait_exit(), 0);
}

#[test]
fn shutdown_from_a_leaf_reaches_every_domain() {
    let cluster = Cluster::launch(config(4, 1, false)).unwrap();
    // Exit code chosen by the initiating (leaf) domain.
    cluster.api(3).shutdown(42);

    assert!(wait_for(Duration::from_secs(10), || {
        (0..4).all(|i| cluster.pd(i).is_complete())
    }));
    for i in 0..4 {
        // Every domain held for neighborCount + 1 acknowledgements.
        assert_eq!(cluster.pd(i).shutdown_acks(), 4);
        assert_eq!(cluster.pd(i).exit_code(), 42);
    }
    assert_eq!(cluster.wait_exit(), 42);
}

#[test]
fn user_calls_after_shutdown_are_refused() {
    let cluster = Cluster::launch(config(1, 1, false)).unwrap();
    let api = cluster.api(0);
    api.shutdown(0);
    assert!(wait_for(Duration::from_secs(5), || cluster.pd(0).is_complete()));
    match api.event_create(GuidKind::EventOnce) {
        Err(RuntimeError::ShutDown) => {}
        other => panic!("expected ShutDown, got {other:?}"),
    }
    assert_eq!(cluster.wait_exit(), 0);
}

#[test]
fn labeled_edt_collision_returns_the_surviving_output_event() {
    let cluster = Cluster::launch(config(1, 1, false)).unwrap();
    cluster.register_func(8, Arc::new(|_p, _d| None));
    let api = cluster.api(0);
    let tpl = api.template_create(8, "labeled_body", 0, 1).unwrap();
    let (label, _skip) = api.reserve_guids(1, GuidKind::Edt).unwrap();
    let evt = api.event_create(GuidKind::EventSticky).unwrap();

    let first = api
        .edt_create(EdtSpec {
            template: tpl,
            depv: Some(vec![evt]),
            labeled: Some(label),
            ..Default::default()
        })
        .unwrap();
    let second = api.edt_create(EdtSpec {
        template: tpl,
        depv: Some(vec![evt]),
        labeled: Some(label),
        ..Default::default()
    });
    match second {
        Err(RuntimeError::EdtExists { guid, output_event }) => {
            assert_eq!(guid, label);
            assert_eq!(output_event, first.output_event);
        }
        other => panic!("expected EdtExists, got {other:?}"),
    }

    api.shutdown(0);
    assert_eq!(cluster.wait_exit(), 0);
}
