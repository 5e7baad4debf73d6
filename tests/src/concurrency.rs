use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use megaflow::{Classifier, FieldId, FlowWildcards, Match};

use crate::util::{rule, tcp_flow};

/// One writer churning rules while readers hammer lookups. Every reader
/// result must be explainable by some sequential state: a returned rule
/// must actually match the flow, and a returned priority must belong to
/// the churned set.
#[test]
fn readers_race_one_writer() {
    let cls = Arc::new(Classifier::new());
    cls.set_prefix_fields(&[FieldId::NwSrc]).unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    // A stable background population so lookups always have something to
    // find.
    for i in 0..8u32 {
        cls.insert(rule(
            move |m| {
                m.set_nw_src_prefix(0x0a000000 | (i << 16), 16);
            },
            100 + i,
        ));
    }

    let mut readers = Vec::new();
    for t in 0..4 {
        let cls = cls.clone();
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let mut hits = 0u64;
            let mut i = 0u32;
            while !stop.load(Ordering::Relaxed) {
                let flow = tcp_flow(0x0a000001 | ((i % 12) << 16), (i % 1024) as u16);
                let mut wc = FlowWildcards::new();
                if let Some(r) = cls.lookup(&flow, Some(&mut wc)) {
                    // The matched rule must really match the flow.
                    let mm = r.minimatch().expand();
                    let ok = flow
                        .words()
                        .iter()
                        .zip(mm.flow.words().iter())
                        .zip(mm.mask.words().iter())
                        .all(|((f, v), m)| (f ^ v) & m == 0);
                    assert!(ok, "reader {} saw a non-matching rule", t);
                    hits += 1;
                }
                i = i.wrapping_add(1);
            }
            hits
        }));
    }

    // The writer churns an overlapping high-priority population.
    for round in 0..200u32 {
        let mut churn = Vec::new();
        for i in 0..8u32 {
            let r = rule(
                move |m| {
                    m.set_nw_src_prefix(0x0a000000 | (i << 16), 24)
                        .set_nw_proto(6);
                },
                1000 + round,
            );
            cls.insert(r.clone());
            churn.push(r);
        }
        for r in churn {
            assert!(cls.remove(&r).is_some());
        }
    }

    stop.store(true, Ordering::Relaxed);
    let mut total = 0;
    for h in readers {
        total += h.join().expect("reader panicked");
    }
    assert!(total > 0, "readers made no progress");
    assert_eq!(cls.len(), 8);
}

/// Safe-cursor removal with concurrent lookup traffic.
#[test]
fn safe_cursor_removal_under_reader_load() {
    let cls = Arc::new(Classifier::new());
    for i in 0..64u32 {
        cls.insert(rule(
            move |m| {
                m.set_nw_src_prefix(0x0a000000 | (i << 16), 16);
            },
            i,
        ));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();
    for _ in 0..3 {
        let cls = cls.clone();
        let stop = stop.clone();
        readers.push(thread::spawn(move || {
            let mut i = 0u32;
            while !stop.load(Ordering::Relaxed) {
                let flow = tcp_flow(0x0a000001 | ((i % 64) << 16), 80);
                let _ = cls.lookup(&flow, None);
                i = i.wrapping_add(1);
            }
        }));
    }

    for r in cls.cursor_safe() {
        assert!(cls.remove(&r).is_some());
    }
    assert!(cls.is_empty());

    stop.store(true, Ordering::Relaxed);
    for h in readers {
        h.join().expect("reader panicked");
    }
}

/// Writers on different classifiers do not interfere; rules move between
/// tables cleanly.
#[test]
fn rules_move_between_classifiers() {
    let a = Classifier::new();
    let b = Classifier::new();
    let shape = |m: &mut Match| {
        m.set_tp_dst(443);
    };
    let r = rule(shape, 7);

    a.insert(r.clone());
    let out = a.remove(&r).unwrap();
    b.insert(out);
    assert!(a.is_empty());
    assert_eq!(b.len(), 1);
    assert!(b.lookup(&tcp_flow(1, 443), None).is_some());
}
