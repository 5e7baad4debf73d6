use std::sync::Arc;

use megaflow::{Classifier, ClsRule, Flow, FlowWildcards, Match};

use crate::util::{rule, tcp_flow};

#[test]
fn empty_classifier_matches_nothing() {
    let cls = Classifier::new();
    assert!(cls.is_empty());
    let mut wc = FlowWildcards::new();
    assert!(cls.lookup(&tcp_flow(0x0a010203, 80), Some(&mut wc)).is_none());
    assert!(wc.is_catchall(), "an empty classifier must not un-wildcard");
}

#[test]
fn single_rule_lookup() {
    let cls = Classifier::new();
    let r1 = rule(|m| { m.set_nw_src_prefix(0x0a000000, 8); }, 100);
    cls.insert(r1.clone());
    assert_eq!(cls.len(), 1);

    let hit = cls.lookup(&tcp_flow(0x0a010203, 80), None).expect("matches 10/8");
    assert!(Arc::ptr_eq(&hit, &r1));

    assert!(cls.lookup(&tcp_flow(0x0b010203, 80), None).is_none());
}

#[test]
fn priority_order_across_subtables() {
    let cls = Classifier::new();
    let broad = rule(|m| { m.set_nw_src_prefix(0x0a000000, 8); }, 100);
    let narrow = rule(
        |m| {
            m.set_nw_src_prefix(0x0a010000, 16).set_nw_proto(6);
        },
        200,
    );
    cls.insert(broad.clone());
    cls.insert(narrow.clone());

    let hit = cls.lookup(&tcp_flow(0x0a010203, 80), None).unwrap();
    assert!(Arc::ptr_eq(&hit, &narrow));

    let hit = cls.lookup(&tcp_flow(0x0a020203, 80), None).unwrap();
    assert!(Arc::ptr_eq(&hit, &broad));
}

#[test]
fn catchall_rule() {
    let cls = Classifier::new();
    let any = rule(|_| {}, 1);
    cls.insert(any.clone());
    assert!(any.is_catchall());
    let hit = cls.lookup(&Flow::new(), None).unwrap();
    assert!(Arc::ptr_eq(&hit, &any));
}

#[test]
fn replace_returns_displaced_identical_rule() {
    let cls = Classifier::new();
    let shape = |m: &mut Match| {
        m.set_nw_src_prefix(0x0a000000, 8);
    };
    let first = rule(shape, 100);
    let second = rule(shape, 100);

    assert!(cls.replace(first.clone()).is_none());
    let displaced = cls.replace(second.clone()).expect("identical rule displaced");
    assert!(Arc::ptr_eq(&displaced, &first));
    assert_eq!(cls.len(), 1);

    let hit = cls.lookup(&tcp_flow(0x0a010203, 80), None).unwrap();
    assert!(Arc::ptr_eq(&hit, &second));

    // Different priority does not displace; both stay installed.
    let third = rule(shape, 50);
    assert!(cls.replace(third).is_none());
    assert_eq!(cls.len(), 2);
}

#[test]
fn remove_round_trip() {
    let cls = Classifier::new();
    let r1 = rule(|m| { m.set_nw_src_prefix(0x0a000000, 8); }, 100);
    let r2 = rule(|m| { m.set_tp_dst(443); }, 50);

    cls.insert(r1.clone());
    cls.insert(r2.clone());
    assert_eq!(cls.len(), 2);

    let out = cls.remove(&r1).expect("installed");
    assert!(Arc::ptr_eq(&out, &r1));
    assert!(cls.remove(&r1).is_none(), "double remove is NotFound");

    assert!(cls.lookup(&tcp_flow(0x0a010203, 80), None).is_none());
    let hit = cls.lookup(&tcp_flow(0x0a010203, 443), None).unwrap();
    assert!(Arc::ptr_eq(&hit, &r2));

    cls.remove(&r2).unwrap();
    assert!(cls.is_empty());
    let mut wc = FlowWildcards::new();
    assert!(cls.lookup(&tcp_flow(0x0a010203, 443), Some(&mut wc)).is_none());
    assert!(wc.is_catchall());
}

#[test]
fn equal_priority_chain_most_recent_wins() {
    let cls = Classifier::new();
    let shape = |m: &mut Match| {
        m.set_nw_src_prefix(0x0a000000, 8);
    };
    let low = rule(shape, 10);
    let high = rule(shape, 30);
    let mid = rule(shape, 20);
    cls.insert(low.clone());
    cls.insert(high.clone());
    cls.insert(mid.clone());
    assert_eq!(cls.len(), 3);

    let hit = cls.lookup(&tcp_flow(0x0a010203, 80), None).unwrap();
    assert!(Arc::ptr_eq(&hit, &high));

    cls.remove(&high).unwrap();
    let hit = cls.lookup(&tcp_flow(0x0a010203, 80), None).unwrap();
    assert!(Arc::ptr_eq(&hit, &mid));

    cls.remove(&mid).unwrap();
    let hit = cls.lookup(&tcp_flow(0x0a010203, 80), None).unwrap();
    assert!(Arc::ptr_eq(&hit, &low));
}

#[test]
fn find_rule_exactly() {
    let cls = Classifier::new();
    let shape = |m: &mut Match| {
        m.set_nw_src_prefix(0x0a000000, 8);
    };
    let r = rule(shape, 100);
    cls.insert(r.clone());

    let probe = rule(shape, 100);
    let found = cls.find_rule_exactly(&probe).expect("identical rule installed");
    assert!(Arc::ptr_eq(&found, &r));

    assert!(cls.find_rule_exactly(&rule(shape, 99)).is_none());
    let other = rule(|m| { m.set_nw_src_prefix(0x0a000000, 9); }, 100);
    assert!(cls.find_rule_exactly(&other).is_none());

    let mut m = Match::new();
    m.set_nw_src_prefix(0x0a000000, 8);
    let found = cls.find_match_exactly(&m, 100).unwrap();
    assert!(Arc::ptr_eq(&found, &r));
}

#[test]
fn overlap_is_priority_sensitive() {
    let cls = Classifier::new();
    let r2 = rule(
        |m| {
            m.set_nw_src_prefix(0x0a010000, 16).set_nw_proto(6);
        },
        200,
    );
    cls.insert(r2);

    // Same priority, intersecting masks, agreeing values: overlap.
    let probe_same = rule(|m| { m.set_nw_src_prefix(0x0a000000, 8); }, 200);
    assert!(cls.rule_overlaps(&probe_same));

    // Different priority: no overlap by definition.
    let probe_other = rule(|m| { m.set_nw_src_prefix(0x0a000000, 8); }, 100);
    assert!(!cls.rule_overlaps(&probe_other));

    // Same priority but disjoint values: no overlap.
    let probe_disjoint = rule(|m| { m.set_nw_src_prefix(0x0b000000, 8); }, 200);
    assert!(!cls.rule_overlaps(&probe_disjoint));
}

#[test]
fn rule_display() {
    let r = rule(
        |m| {
            m.set_nw_src_prefix(0x0a000000, 8).set_nw_proto(6).set_tp_dst(80);
        },
        123,
    );
    let s = format!("{}", r);
    assert!(s.starts_with("priority=123"));
    assert!(s.contains("nw_src=10.0.0.0/8"));
    assert!(s.contains("nw_proto=0x6"));
    assert!(s.contains("tp_dst=0x50"));
}

#[test]
fn detached_clone_is_insertable() {
    let cls = Classifier::new();
    let r = rule(|m| { m.set_tp_src(53); }, 5);
    cls.insert(r.clone());

    let copy = Arc::new(ClsRule::clone(&r));
    assert!(copy.equals(&r));
    let displaced = cls.replace(copy).expect("identical");
    assert!(Arc::ptr_eq(&displaced, &r));
}
