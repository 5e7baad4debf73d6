use megaflow::{Classifier, FieldId, Flow, FlowWildcards};

use crate::util::{rule, tcp_flow};

/// The megaflow soundness check: any flow agreeing with `flow` on every
/// bit of `wc` must classify the same way.
fn assert_wildcards_sound(cls: &Classifier, flow: &Flow, samples: &[Flow]) {
    let mut wc = FlowWildcards::new();
    let base = cls.lookup(flow, Some(&mut wc));
    for sample in samples {
        let agrees = flow
            .words()
            .iter()
            .zip(sample.words().iter())
            .zip(wc.masks.words().iter())
            .all(|((a, b), m)| (a ^ b) & m == 0);
        if agrees {
            let got = cls.lookup(sample, None);
            match (&base, &got) {
                (None, None) => {}
                (Some(b), Some(g)) => assert_eq!(
                    b.priority(),
                    g.priority(),
                    "flow inside the megaflow changed priority class"
                ),
                _ => panic!("flow inside the megaflow changed match outcome"),
            }
        }
    }
}

#[test]
fn prefix_rule_unwildcards_only_the_prefix() {
    let cls = Classifier::new();
    cls.insert(rule(|m| { m.set_nw_src_prefix(0x0a000000, 8); }, 100));

    let mut wc = FlowWildcards::new();
    let hit = cls.lookup(&tcp_flow(0x0a010203, 80), Some(&mut wc));
    assert!(hit.is_some());

    // Exactly the top 8 bits of nw_src; nothing else was consulted.
    assert_eq!(wc.masks.nw_src, 0xff00_0000);
    assert_eq!(wc.masks.nw_dst, 0);
    assert_eq!(wc.masks.tp_dst, 0);
    assert_eq!(wc.masks.metadata, 0);
    assert_eq!(wc.masks.nw_proto, 0);
}

#[test]
fn early_stop_skips_lower_subtable_masks() {
    let cls = Classifier::new();
    cls.insert(rule(|m| { m.set_nw_src_prefix(0x0a000000, 8); }, 100));
    cls.insert(rule(
        |m| {
            m.set_nw_src_prefix(0x0a010000, 16).set_nw_proto(6);
        },
        200,
    ));

    // The high-priority subtable matches first; priority ordering stops
    // the walk before the /8 subtable is probed at all.
    let mut wc = FlowWildcards::new();
    let hit = cls.lookup(&tcp_flow(0x0a010203, 80), Some(&mut wc)).unwrap();
    assert_eq!(hit.priority(), 200);
    assert_eq!(wc.masks.nw_src, 0xffff_0000);
    assert_eq!(wc.masks.nw_proto, u8::MAX);
    assert_eq!(wc.masks.tp_dst, 0);
}

#[test]
fn metadata_partition_miss_unwildcards_only_metadata() {
    let cls = Classifier::new();
    cls.insert(rule(
        |m| {
            m.set_metadata(1).set_nw_proto(6).set_tp_dst(80);
        },
        100,
    ));
    cls.insert(rule(
        |m| {
            m.set_metadata(2).set_nw_proto(17).set_tp_dst(53);
        },
        100,
    ));

    let mut flow = tcp_flow(0x0a010203, 80);
    flow.metadata = 3;
    let mut wc = FlowWildcards::new();
    assert!(cls.lookup(&flow, Some(&mut wc)).is_none());

    // The partition probe consulted metadata and nothing else.
    assert_eq!(wc.masks.metadata, u64::MAX);
    assert_eq!(wc.masks.nw_proto, 0);
    assert_eq!(wc.masks.tp_dst, 0);
    assert_eq!(wc.masks.nw_src, 0);
}

#[test]
fn staged_miss_folds_only_examined_stages() {
    let cls = Classifier::new();
    cls.insert(rule(
        |m| {
            m.set_in_port(7).set_tp_dst(80);
        },
        10,
    ));

    // Port mismatch in the first stage: tp_dst must stay wildcarded.
    let mut flow = Flow::new();
    flow.in_port = 9;
    flow.tp_dst = 80;
    let mut wc = FlowWildcards::new();
    assert!(cls.lookup(&flow, Some(&mut wc)).is_none());
    assert_eq!(wc.masks.in_port, u32::MAX);
    assert_eq!(wc.masks.tp_dst, 0);
}

#[test]
fn trie_skip_limits_unwildcarding() {
    let cls = Classifier::new();
    cls.set_prefix_fields(&[FieldId::NwSrc]).unwrap();
    cls.insert(rule(|m| { m.set_nw_src_prefix(0x0a010000, 16); }, 100));
    cls.insert(rule(|m| { m.set_nw_src(0x0a010203); }, 200));

    // 10.2/16 shares only 15 leading bits with 10.1/16: neither subtable
    // can match, and the trie proves it within the first 16 bits.
    let mut wc = FlowWildcards::new();
    assert!(cls.lookup(&tcp_flow(0x0a020203, 80), Some(&mut wc)).is_none());
    let consulted = wc.masks.nw_src;
    assert_ne!(consulted, 0, "trie bits must be folded in");
    assert_eq!(consulted & !0xffff_0000, 0, "at most the first 16 bits examined");
    assert_eq!(wc.masks.tp_dst, 0);

    // With the trie it still finds the exact-match rule.
    let mut wc = FlowWildcards::new();
    let hit = cls.lookup(&tcp_flow(0x0a010203, 80), Some(&mut wc)).unwrap();
    assert_eq!(hit.priority(), 200);
}

#[test]
fn trie_reconfiguration_is_equivalent(){
    let cls = Classifier::new();
    cls.insert(rule(|m| { m.set_nw_src_prefix(0x0a000000, 8); }, 10));
    cls.insert(rule(|m| { m.set_nw_src_prefix(0x0a010000, 16); }, 20));
    cls.insert(rule(|m| { m.set_nw_dst_prefix(0xc0a80000, 16); }, 30));

    let flows = [
        tcp_flow(0x0a010203, 80),
        tcp_flow(0x0a020203, 80),
        tcp_flow(0x0b000001, 80),
    ];
    let baseline: Vec<_> = flows
        .iter()
        .map(|f| cls.lookup(f, None).map(|r| r.priority()))
        .collect();

    cls.set_prefix_fields(&[FieldId::NwSrc, FieldId::NwDst]).unwrap();
    for (f, want) in flows.iter().zip(baseline.iter()) {
        assert_eq!(cls.lookup(f, None).map(|r| r.priority()), *want);
    }

    cls.set_prefix_fields(&[]).unwrap();
    for (f, want) in flows.iter().zip(baseline.iter()) {
        assert_eq!(cls.lookup(f, None).map(|r| r.priority()), *want);
    }
}

#[test]
fn wildcard_soundness_sampled() {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

    let cls = Classifier::new();
    cls.set_prefix_fields(&[FieldId::NwSrc]).unwrap();
    for i in 0..64u32 {
        let plen = 8 + (i % 3) * 8;
        let addr = (0x0a000000u32).wrapping_add(i << 12);
        cls.insert(rule(
            move |m| {
                m.set_nw_src_prefix(addr, plen as u8);
                if i % 2 == 0 {
                    m.set_nw_proto(6);
                }
                if i % 5 == 0 {
                    m.set_tp_dst((i % 1024) as u16);
                }
            },
            i,
        ));
    }

    let mut samples = Vec::new();
    for _ in 0..256 {
        let mut f = Flow::new();
        f.nw_src = 0x0a000000 | rng.gen_range(0u32, 1 << 16);
        f.nw_proto = if rng.gen::<bool>() { 6 } else { 17 };
        f.tp_dst = rng.gen_range(0u16, 1024);
        samples.push(f);
    }
    for i in 0..32 {
        assert_wildcards_sound(&cls, &samples[i], &samples);
    }
}
