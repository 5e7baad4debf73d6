use std::collections::HashSet;
use std::sync::Arc;

use megaflow::{Classifier, ClsRule};

use crate::util::{rule, tcp_flow};

fn eight_rules(cls: &Classifier) -> Vec<Arc<ClsRule>> {
    let mut rules = Vec::new();
    for i in 0..8u32 {
        let r = rule(
            move |m| {
                m.set_nw_src_prefix(0x0a000000 | (i << 16), 16);
                if i % 2 == 0 {
                    m.set_nw_proto(6);
                }
            },
            i,
        );
        cls.insert(r.clone());
        rules.push(r);
    }
    rules
}

#[test]
fn cursor_visits_every_rule_once() {
    let cls = Classifier::new();
    let rules = eight_rules(&cls);

    let seen: Vec<Arc<ClsRule>> = cls.cursor().collect();
    assert_eq!(seen.len(), rules.len());
    let seen_ptrs: HashSet<*const ClsRule> = seen.iter().map(|r| Arc::as_ptr(r)).collect();
    assert_eq!(seen_ptrs.len(), rules.len());
    for r in rules.iter() {
        assert!(seen_ptrs.contains(&Arc::as_ptr(r)));
    }
}

#[test]
fn cursor_with_target_filters_loosely() {
    let cls = Classifier::new();

    let narrow = rule(
        |m| {
            m.set_nw_src_prefix(0x0a010000, 16).set_nw_proto(6);
        },
        10,
    );
    let exact = rule(|m| { m.set_nw_src(0x0a010203); }, 20);
    let unrelated = rule(|m| { m.set_nw_src_prefix(0x0b000000, 8); }, 30);
    let catchall = rule(|_| {}, 1);
    cls.insert(narrow.clone());
    cls.insert(exact.clone());
    cls.insert(unrelated.clone());
    cls.insert(catchall.clone());

    // Target 10/8: yields installed rules at least as specific that agree
    // on the first octet.
    let target = rule(|m| { m.set_nw_src_prefix(0x0a000000, 8); }, 0);
    let seen: Vec<Arc<ClsRule>> = cls.cursor_with(Some(&target), false).collect();
    let ptrs: HashSet<*const ClsRule> = seen.iter().map(|r| Arc::as_ptr(r)).collect();
    assert!(ptrs.contains(&Arc::as_ptr(&narrow)));
    assert!(ptrs.contains(&Arc::as_ptr(&exact)));
    assert!(!ptrs.contains(&Arc::as_ptr(&unrelated)));
    assert!(!ptrs.contains(&Arc::as_ptr(&catchall)), "catch-all is less specific");
    assert_eq!(seen.len(), 2);

    // The catch-all target yields everything.
    let all: Vec<_> = cls.cursor_with(Some(&rule(|_| {}, 0)), false).collect();
    assert_eq!(all.len(), 4);
}

#[test]
fn safe_cursor_allows_removal_of_visited_rule() {
    let cls = Classifier::new();
    let rules = eight_rules(&cls);
    assert_eq!(cls.len(), rules.len());

    for r in cls.cursor_safe() {
        let removed = cls.remove(&r).expect("yielded rule is installed");
        assert!(Arc::ptr_eq(&removed, &r));
    }
    assert!(cls.is_empty());
    assert!(cls.lookup(&tcp_flow(0x0a010203, 80), None).is_none());
}

#[test]
fn locked_cursor_sees_stable_snapshot() {
    let cls = Classifier::new();
    eight_rules(&cls);

    let cursor = cls.cursor();
    let count = cursor.count();
    assert_eq!(count, 8);

    // After the cursor is dropped the writer lock is free again.
    cls.insert(rule(|m| { m.set_tp_dst(53); }, 99));
    assert_eq!(cls.len(), 9);
}
