use pagestore::{composite_key, number_segment, Direction, Transaction};

use crate::test_utils::{commit_rows, exchange, row_key, setup};

#[test]
fn test_full_scan_in_key_order() {
    let _db = setup();
    let mut ex = exchange("t1");

    let rows: Vec<(u64, &[u8])> = (0..50).map(|i| (i * 3, b"v".as_ref())).collect();
    commit_rows(&mut ex, &rows);

    ex.to_before();
    let mut seen = Vec::new();
    while ex.traverse(Direction::Gt, true).unwrap() {
        seen.push(ex.key().unwrap().to_vec());
    }
    assert_eq!(seen.len(), 50);
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted);
    assert!(ex.is_after());

    // and back down
    ex.to_after();
    let mut reverse = Vec::new();
    while ex.traverse(Direction::Lt, true).unwrap() {
        reverse.push(ex.key().unwrap().to_vec());
    }
    reverse.reverse();
    assert_eq!(reverse, seen);
    assert!(ex.is_before());
}

/// GTEQ and LTEQ must honor their equality half: positioned on a
/// stored key, they return that key.
#[test]
fn test_equality_inclusive_traverse() {
    let _db = setup();
    let mut ex = exchange("t1");

    let k_1_10 = composite_key(&[&number_segment(1), &number_segment(10)]);
    let k_1_20 = composite_key(&[&number_segment(1), &number_segment(20)]);
    let k_2_30 = composite_key(&[&number_segment(2), &number_segment(30)]);
    let tx = Transaction::new();
    ex.to(&k_1_10).store(&tx, b"a").unwrap();
    ex.to(&k_1_20).store(&tx, b"b").unwrap();
    ex.to(&k_2_30).store(&tx, b"c").unwrap();
    tx.commit().unwrap();

    // position at the prefix of segment 1: GTEQ lands on (1, 10)
    let prefix_1 = composite_key(&[&number_segment(1)]);
    ex.to(&prefix_1);
    assert!(ex.traverse(Direction::Gteq, false).unwrap());
    assert!(ex.key().unwrap().starts_with(&number_segment(1)));
    assert_eq!(ex.key().unwrap(), k_1_10.as_slice());

    // positioned exactly on a stored key, GTEQ returns it
    ex.to(&k_1_20);
    assert!(ex.traverse(Direction::Gteq, false).unwrap());
    assert_eq!(ex.key().unwrap(), k_1_20.as_slice());
    assert_eq!(ex.value(), Some(b"b".as_ref()));

    // and LTEQ returns the key itself too
    ex.to(&k_2_30);
    assert!(ex.traverse(Direction::Lteq, false).unwrap());
    assert_eq!(ex.key().unwrap(), k_2_30.as_slice());
    assert!(ex.key().unwrap().starts_with(&number_segment(2)));

    // past every (2, ...) key, LTEQ falls back to the last of them
    let prefix_3 = composite_key(&[&number_segment(3)]);
    ex.to(&prefix_3);
    assert!(ex.traverse(Direction::Lteq, false).unwrap());
    assert_eq!(ex.key().unwrap(), k_2_30.as_slice());
}

/// Traversing an emptied range finds nothing, repeatedly, and the
/// cursor comes to rest at the edge.
#[test]
fn test_empty_range_traversal() {
    let _db = setup();
    let mut ex = exchange("t1");

    let rows: Vec<(u64, &[u8])> = (1..=9).map(|i| (i, b"v".as_ref())).collect();
    commit_rows(&mut ex, &rows);

    let tx = Transaction::new();
    for i in 1..=9u64 {
        ex.to(&row_key(i)).remove(&tx).unwrap();
    }
    tx.commit().unwrap();

    ex.to(&row_key(0));
    for _ in 0..10 {
        assert!(!ex.traverse(Direction::Gteq, true).unwrap());
        assert!(ex.is_before(), "cursor must rest at BEFORE");
    }

    ex.to(&row_key(11));
    for _ in 0..10 {
        assert!(!ex.traverse(Direction::Lteq, true).unwrap());
        assert!(ex.is_after(), "cursor must rest at AFTER");
    }
}

#[test]
fn test_sentinel_boundaries() {
    let _db = setup();
    let mut ex = exchange("t1");
    commit_rows(&mut ex, &[(5, b"v")]);

    // reverse from BEFORE finds nothing and stays at BEFORE
    ex.to_before();
    assert!(!ex.traverse(Direction::Lt, true).unwrap());
    assert!(ex.is_before());
    assert!(!ex.traverse(Direction::Lteq, true).unwrap());
    assert!(ex.is_before());

    // forward from AFTER finds nothing and stays at AFTER
    ex.to_after();
    assert!(!ex.traverse(Direction::Gt, true).unwrap());
    assert!(ex.is_after());
    assert!(!ex.traverse(Direction::Gteq, true).unwrap());
    assert!(ex.is_after());

    // the single key is reachable from both edges
    ex.to_before();
    assert!(ex.traverse(Direction::Gt, true).unwrap());
    assert_eq!(ex.key().unwrap(), row_key(5).as_slice());
    ex.to_after();
    assert!(ex.traverse(Direction::Lt, true).unwrap());
    assert_eq!(ex.key().unwrap(), row_key(5).as_slice());
}

#[test]
fn test_gt_skips_current_key() {
    let _db = setup();
    let mut ex = exchange("t1");
    commit_rows(&mut ex, &[(1, b"a"), (2, b"b"), (3, b"c")]);

    ex.to(&row_key(2));
    assert!(ex.traverse(Direction::Gt, true).unwrap());
    assert_eq!(ex.key().unwrap(), row_key(3).as_slice());

    ex.to(&row_key(2));
    assert!(ex.traverse(Direction::Lt, true).unwrap());
    assert_eq!(ex.key().unwrap(), row_key(1).as_slice());
}

/// Without skip_deleted, a committed tombstone is surfaced as a key
/// with no value.
#[test]
fn test_deleted_keys_visible_without_skip() {
    let _db = setup();
    let mut ex = exchange("t1");
    commit_rows(&mut ex, &[(1, b"a"), (2, b"b")]);

    let tx = Transaction::new();
    ex.to(&row_key(1)).remove(&tx).unwrap();
    tx.commit().unwrap();

    ex.to_before();
    assert!(ex.traverse(Direction::Gt, false).unwrap());
    assert_eq!(ex.key().unwrap(), row_key(1).as_slice());
    assert_eq!(ex.value(), None);

    ex.to_before();
    assert!(ex.traverse(Direction::Gt, true).unwrap());
    assert_eq!(ex.key().unwrap(), row_key(2).as_slice());
    assert_eq!(ex.value(), Some(b"b".as_ref()));
}
