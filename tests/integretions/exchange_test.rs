use pagestore::{Database, ErrorKind, Exchange, Transaction};

use crate::test_utils::{commit_rows, exchange, row_key, search_row, setup};

#[test]
fn test_store_fetch_remove_round_trip() {
    let _db = setup();
    let mut ex = exchange("t1");

    // store(k, v); fetch(k) == v
    commit_rows(&mut ex, &[(1, b"one"), (2, b"two")]);
    assert_eq!(search_row(&mut ex, 1), Some(b"one".to_vec()));
    assert_eq!(search_row(&mut ex, 2), Some(b"two".to_vec()));
    assert_eq!(search_row(&mut ex, 3), None);

    // remove(k); fetch(k) == absent
    let tx = Transaction::new();
    ex.to(&row_key(1)).remove(&tx).unwrap();
    tx.commit().unwrap();
    assert_eq!(search_row(&mut ex, 1), None);
    assert_eq!(search_row(&mut ex, 2), Some(b"two".to_vec()));
}

#[test]
fn test_overwrite_keeps_latest() {
    let _db = setup();
    let mut ex = exchange("t1");

    commit_rows(&mut ex, &[(7, b"first")]);
    commit_rows(&mut ex, &[(7, b"second")]);
    commit_rows(&mut ex, &[(7, b"third")]);
    assert_eq!(search_row(&mut ex, 7), Some(b"third".to_vec()));
}

#[test]
fn test_direct_store_and_remove() {
    let _db = setup();
    let mut ex = exchange("t1");

    ex.to(b"alpha").store_direct(b"1").unwrap();
    assert_eq!(ex.to(b"alpha").fetch().unwrap(), Some(b"1".to_vec()));

    ex.to(b"alpha").remove_direct().unwrap();
    assert_eq!(ex.to(b"alpha").fetch().unwrap(), None);
}

#[test]
fn test_long_record_round_trip() {
    let _db = setup();
    let mut ex = exchange("t1");

    // far beyond the inline budget of a 1024-byte page, spanning
    // several overflow pages
    let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let tx = Transaction::new();
    ex.to(b"big").store(&tx, &big).unwrap();
    tx.commit().unwrap();

    assert_eq!(ex.to(b"big").fetch().unwrap(), Some(big.clone()));

    // shrink it back to an inline value
    let tx = Transaction::new();
    ex.to(b"big").store(&tx, b"small now").unwrap();
    tx.commit().unwrap();
    assert_eq!(ex.to(b"big").fetch().unwrap(), Some(b"small now".to_vec()));
}

#[test]
fn test_tree_lifecycle() {
    let _db = setup();

    let err = Exchange::new(0, "missing", false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TreeNotFound);

    let mut ex = exchange("books");
    commit_rows(&mut ex, &[(1, b"x")]);
    drop(ex);

    // a second exchange reaches the same tree
    let mut ex2 = Exchange::new(0, "books", false).unwrap();
    assert_eq!(search_row(&mut ex2, 1), Some(b"x".to_vec()));
    drop(ex2);

    pagestore::remove_tree(0, "books").unwrap();
    let err = Exchange::new(0, "books", false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TreeNotFound);
    assert!(Database::catalog().tree(0, "books").is_none());
}

#[test]
fn test_remove_all() {
    let _db = setup();
    let mut ex = exchange("t1");

    let rows: Vec<(u64, &[u8])> = (0..200).map(|i| (i, b"payload".as_ref())).collect();
    commit_rows(&mut ex, &rows);
    assert_eq!(search_row(&mut ex, 150), Some(b"payload".to_vec()));

    ex.remove_all().unwrap();
    assert_eq!(search_row(&mut ex, 150), None);
    ex.to_before();
    assert!(!ex.traverse(pagestore::Direction::Gt, true).unwrap());

    // the tree is still usable
    commit_rows(&mut ex, &[(1, b"back")]);
    assert_eq!(search_row(&mut ex, 1), Some(b"back".to_vec()));
}

#[test]
fn test_empty_value() {
    let _db = setup();
    let mut ex = exchange("t1");

    let tx = Transaction::new();
    ex.to(b"empty").store(&tx, b"").unwrap();
    tx.commit().unwrap();
    assert_eq!(ex.to(b"empty").fetch().unwrap(), Some(Vec::new()));
}
