use std::{sync::mpsc, thread, time::Duration};

use pagestore::{
    run_transaction, CommitPolicy, Database, Direction, ErrorKind, Transaction,
};
use pagestore::transaction::AccumKind;

use crate::test_utils::{commit_rows, exchange, insert_row, row_key, search_row, setup};

#[test]
fn test_uncommitted_writes_invisible_to_others() {
    let _db = setup();
    let mut ex = exchange("t1");

    let writer = Transaction::new();
    ex.to(&row_key(1)).store(&writer, b"draft").unwrap();

    // the writer reads its own version
    assert_eq!(
        ex.to(&row_key(1)).fetch_tx(&writer).unwrap(),
        Some(b"draft".to_vec())
    );
    // nobody else does
    assert_eq!(ex.to(&row_key(1)).fetch().unwrap(), None);

    writer.commit().unwrap();
    assert_eq!(ex.to(&row_key(1)).fetch().unwrap(), Some(b"draft".to_vec()));
}

#[test]
fn test_rollback_is_a_no_op() {
    let _db = setup();
    let mut ex = exchange("t1");
    commit_rows(&mut ex, &[(1, b"keep")]);

    let tx = Transaction::new();
    ex.to(&row_key(1)).store(&tx, b"discard").unwrap();
    ex.to(&row_key(2)).store(&tx, b"discard").unwrap();
    tx.rollback().unwrap();

    assert_eq!(search_row(&mut ex, 1), Some(b"keep".to_vec()));
    assert_eq!(search_row(&mut ex, 2), None);
}

#[test]
fn test_repeatable_read_snapshot() {
    let _db = setup();
    let mut ex = exchange("t1");
    commit_rows(&mut ex, &[(1, b"old")]);

    let reader = Transaction::new();
    assert_eq!(
        ex.to(&row_key(1)).fetch_tx(&reader).unwrap(),
        Some(b"old".to_vec())
    );

    // a later commit must not leak into the reader's snapshot
    let writer = Transaction::new();
    ex.to(&row_key(1)).store(&writer, b"new").unwrap();
    ex.to(&row_key(2)).store(&writer, b"new").unwrap();
    writer.commit().unwrap();

    assert_eq!(
        ex.to(&row_key(1)).fetch_tx(&reader).unwrap(),
        Some(b"old".to_vec())
    );
    assert_eq!(ex.to(&row_key(2)).fetch_tx(&reader).unwrap(), None);
    reader.commit().unwrap();

    // outside the snapshot the new state is live
    assert_eq!(search_row(&mut ex, 1), Some(b"new".to_vec()));
    assert_eq!(search_row(&mut ex, 2), Some(b"new".to_vec()));
}

#[test]
fn test_write_write_conflict_rolls_back() {
    let _db = setup();
    let mut ex = exchange("t1");

    let first = Transaction::new();
    ex.to(&row_key(9)).store(&first, b"first").unwrap();

    // the second writer waits out its retry budget, then rolls back
    let second = Transaction::new();
    let err = ex.to(&row_key(9)).store(&second, b"second").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Rollback);
    second.rollback().unwrap();

    first.commit().unwrap();
    assert_eq!(search_row(&mut ex, 9), Some(b"first".to_vec()));
}

#[test]
fn test_conflicting_writer_proceeds_after_commit() {
    let _db = setup();

    let first = Transaction::new();
    {
        let mut ex = exchange("t1");
        ex.to(&row_key(5)).store(&first, b"first").unwrap();
    }

    let (tx_done, rx_done) = mpsc::channel();
    let handle = thread::spawn(move || {
        // retries until the first writer resolves
        let result = run_transaction(|tx| {
            let mut ex = exchange("t1");
            ex.to(&row_key(5)).store(tx, b"second")
        });
        tx_done.send(()).unwrap();
        result
    });

    // let the second writer hit the conflict, then commit
    thread::sleep(Duration::from_millis(20));
    first.commit().unwrap();

    rx_done
        .recv_timeout(Duration::from_secs(10))
        .expect("second writer must finish");
    handle.join().unwrap().unwrap();

    let mut ex = exchange("t1");
    assert_eq!(search_row(&mut ex, 5), Some(b"second".to_vec()));
}

#[test]
fn test_commit_policies() {
    let _db = setup();
    let mut ex = exchange("t1");

    for (n, policy) in [
        (1u64, CommitPolicy::Soft),
        (2, CommitPolicy::Group),
        (3, CommitPolicy::Hard),
    ]
    .iter()
    {
        let tx = Transaction::new();
        insert_row(&mut ex, &tx, *n, b"v");
        tx.commit_with(*policy).unwrap();
    }

    // a HARD commit forced the journal
    assert!(Database::journal_manager().durable_addr() > 0);
    for n in 1..=3 {
        assert_eq!(search_row(&mut ex, n), Some(b"v".to_vec()));
    }
}

#[test]
fn test_double_completion_fails() {
    let _db = setup();
    let tx = Transaction::new();
    tx.commit().unwrap();
    assert_eq!(tx.commit().unwrap_err().kind(), ErrorKind::TransactionFailed);
    assert_eq!(tx.rollback().unwrap_err().kind(), ErrorKind::TransactionFailed);
}

#[test]
fn test_accumulators_merge_on_commit_only() {
    let _db = setup();
    let ex = exchange("t1");
    let tree = ex.tree().clone();
    drop(ex);

    let tx = Transaction::new();
    tx.update_accumulator(tree.id(), 0, AccumKind::Sum, 5);
    // nothing merged yet
    assert_eq!(tree.accumulators().value(0), None);
    tx.commit().unwrap();
    assert_eq!(tree.accumulators().value(0), Some(5));

    // an aborted delta is never merged
    let tx = Transaction::new();
    tx.update_accumulator(tree.id(), 0, AccumKind::Sum, 100);
    tx.rollback().unwrap();
    assert_eq!(tree.accumulators().value(0), Some(5));

    let tx = Transaction::new();
    tx.update_accumulator(tree.id(), 0, AccumKind::Sum, 2);
    tx.commit().unwrap();
    assert_eq!(tree.accumulators().value(0), Some(7));
}

#[test]
fn test_transaction_traverse_sees_own_writes() {
    let _db = setup();
    let mut ex = exchange("t1");
    commit_rows(&mut ex, &[(2, b"committed")]);

    let tx = Transaction::new();
    ex.to(&row_key(1)).store(&tx, b"mine").unwrap();

    ex.to_before();
    assert!(ex.traverse_tx(&tx, Direction::Gt, true).unwrap());
    assert_eq!(ex.key().unwrap(), row_key(1).as_slice());
    assert!(ex.traverse_tx(&tx, Direction::Gt, true).unwrap());
    assert_eq!(ex.key().unwrap(), row_key(2).as_slice());

    // a plain reader skips the uncommitted key
    ex.to_before();
    assert!(ex.traverse(Direction::Gt, true).unwrap());
    assert_eq!(ex.key().unwrap(), row_key(2).as_slice());
    tx.rollback().unwrap();
}
