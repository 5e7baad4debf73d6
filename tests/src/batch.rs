use std::sync::Arc;

use megaflow::{Classifier, Miniflow, MAX_BATCH};

use crate::util::{rule, tcp_flow};

#[test]
fn batch_agrees_with_single_lookups() {
    let cls = Classifier::new();
    for i in 0..16u32 {
        cls.insert(rule(
            move |m| {
                m.set_nw_src_prefix(0x0a000000 | (i << 16), 16);
                if i % 2 == 0 {
                    m.set_tp_dst(80);
                }
            },
            i + 1,
        ));
    }

    let flows: Vec<_> = (0..64u32)
        .map(|i| tcp_flow(0x0a000001 | ((i % 24) << 16), if i % 3 == 0 { 80 } else { 443 }))
        .collect();
    let minis: Vec<Miniflow> = flows.iter().map(Miniflow::from_flow).collect();

    let mut batched = vec![None; flows.len()];
    let all = cls.lookup_miniflow_batch(&minis, &mut batched);

    let mut all_single = true;
    for (flow, got) in flows.iter().zip(batched.iter()) {
        let single = cls.lookup(flow, None);
        match (&single, got) {
            (None, None) => all_single = false,
            (Some(a), Some(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("batch and single lookup disagree"),
        }
    }
    assert_eq!(all, all_single && !flows.is_empty());
}

#[test]
fn batch_reports_full_match() {
    let cls = Classifier::new();
    cls.insert(rule(|_| {}, 1));

    let minis: Vec<Miniflow> = (0..MAX_BATCH)
        .map(|i| Miniflow::from_flow(&tcp_flow(0x0a000000 + i as u32, 80)))
        .collect();
    let mut out = vec![None; MAX_BATCH];
    assert!(cls.lookup_miniflow_batch(&minis, &mut out));
    assert!(out.iter().all(|r| r.is_some()));
}

#[test]
fn batch_with_metadata_partitions() {
    let cls = Classifier::new();
    cls.insert(rule(|m| { m.set_metadata(1).set_tp_dst(80); }, 10));
    cls.insert(rule(|m| { m.set_metadata(2).set_tp_dst(53); }, 10));

    let mk = |metadata: u64, tp: u16| {
        let mut f = tcp_flow(0x0a000001, tp);
        f.metadata = metadata;
        Miniflow::from_flow(&f)
    };
    let minis = vec![mk(1, 80), mk(2, 53), mk(3, 80), mk(1, 53)];
    let mut out = vec![None; minis.len()];
    let all = cls.lookup_miniflow_batch(&minis, &mut out);
    assert!(!all);
    assert!(out[0].is_some());
    assert!(out[1].is_some());
    assert!(out[2].is_none(), "no partition for metadata 3");
    assert!(out[3].is_none(), "wrong port");
}
