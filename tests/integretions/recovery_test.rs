use pagestore::{
    CommitPolicy, Config, Database, Direction, ErrorKind, Transaction, VolumeSpec,
};
use pagestore::transaction::AccumKind;

use crate::test_utils::{
    commit_rows, crash, exchange, insert_row, reopen, row_key, search_row, setup, setup_with,
    TEST_JOURNAL_SIZE, TEST_PAGE_SIZE,
};

#[test]
fn test_hard_commit_survives_crash() {
    let db = setup();
    let mut ex = exchange("t1");

    let tx = Transaction::new();
    insert_row(&mut ex, &tx, 1, b"durable");
    insert_row(&mut ex, &tx, 2, b"durable");
    tx.commit_with(CommitPolicy::Hard).unwrap();
    drop(ex);

    crash(&db);

    let mut ex = exchange("t1");
    assert_eq!(search_row(&mut ex, 1), Some(b"durable".to_vec()));
    assert_eq!(search_row(&mut ex, 2), Some(b"durable".to_vec()));
}

#[test]
fn test_uncommitted_lost_after_crash() {
    let db = setup();
    let mut ex = exchange("t1");
    commit_rows(&mut ex, &[(1, b"base")]);
    Database::flush().unwrap();

    let tx = Transaction::new();
    insert_row(&mut ex, &tx, 8, b"draft");
    insert_row(&mut ex, &tx, 9, b"draft");
    // make sure the page images with the uncommitted versions are in
    // the journal, as a steal would do
    Database::flush().unwrap();
    drop(tx);
    drop(ex);

    crash(&db);

    let mut ex = exchange("t1");
    assert_eq!(search_row(&mut ex, 1), Some(b"base".to_vec()));
    assert_eq!(search_row(&mut ex, 8), None);
    assert_eq!(search_row(&mut ex, 9), None);
}

/// An aborted transaction's writes must stay gone across a clean
/// restart, even when a checkpoint ran between abort and shutdown.
#[test]
fn test_aborted_transaction_invisible_after_restart() {
    let db = setup();
    let mut ex = exchange("t1");

    let tx = Transaction::new();
    for i in 1..=10u64 {
        insert_row(&mut ex, &tx, i, b"the quick brown fox");
    }
    tx.rollback().unwrap();
    Database::checkpoint().unwrap();
    drop(ex);

    reopen(&db);

    let mut ex = exchange("t1");
    ex.to_before();
    assert!(
        !ex.traverse(Direction::Gt, true).unwrap(),
        "rolled-back rows reappeared after restart"
    );
}

#[test]
fn test_committed_and_aborted_interleaved_across_crash() {
    let db = setup();
    let mut ex = exchange("t1");

    commit_rows(&mut ex, &[(1, b"one"), (2, b"two")]);

    let loser = Transaction::new();
    insert_row(&mut ex, &loser, 3, b"loser");
    loser.rollback().unwrap();

    let tx = Transaction::new();
    insert_row(&mut ex, &tx, 4, b"four");
    tx.commit_with(CommitPolicy::Hard).unwrap();
    drop(ex);

    crash(&db);

    let mut ex = exchange("t1");
    assert_eq!(search_row(&mut ex, 1), Some(b"one".to_vec()));
    assert_eq!(search_row(&mut ex, 2), Some(b"two".to_vec()));
    assert_eq!(search_row(&mut ex, 3), None);
    assert_eq!(search_row(&mut ex, 4), Some(b"four".to_vec()));
}

#[test]
fn test_timestamps_do_not_collide_after_recovery() {
    let db = setup();
    let mut ex = exchange("t1");

    let tx = Transaction::new();
    insert_row(&mut ex, &tx, 1, b"v");
    tx.commit_with(CommitPolicy::Hard).unwrap();
    let pre_crash_start = tx.start_ts();
    drop(ex);

    crash(&db);

    let tx = Transaction::new();
    assert!(
        tx.start_ts() > pre_crash_start,
        "timestamp {} reissued after recovery (was {})",
        tx.start_ts(),
        pre_crash_start
    );
    tx.rollback().unwrap();
}

/// Restart churn only moves the journal base forward; obsolete blocks
/// get deleted.
#[test]
fn test_base_address_grows_across_restart_churn() {
    let db = setup();
    let mut ex = exchange("t1");
    let tx = Transaction::new();
    for i in 1..=10u64 {
        insert_row(&mut ex, &tx, i, b"churn");
    }
    tx.rollback().unwrap();
    drop(ex);

    let mut last_base = Database::journal_manager().base_address();
    for _ in 0..12 {
        crash(&db);
        let base = Database::journal_manager().base_address();
        assert!(base >= last_base, "base regressed: {} -> {}", last_base, base);
        last_base = base;
    }
    Database::copy_back_pages().unwrap();

    let base = Database::journal_manager().base_address();
    assert!(
        base > 10 * TEST_JOURNAL_SIZE,
        "after ten restarts the base address is only {}",
        base
    );
}

#[test]
fn test_base_advances_past_pre_crash_value() {
    let db = setup();
    let mut ex = exchange("t1");
    commit_rows(&mut ex, &[(1, b"v")]);
    Database::checkpoint().unwrap();
    let pre_crash = Database::journal_manager().base_address();
    drop(ex);

    crash(&db);
    Database::checkpoint().unwrap();
    Database::copy_back_pages().unwrap();

    let after = Database::journal_manager().base_address();
    assert!(
        after > pre_crash,
        "base address did not advance: {} -> {}",
        pre_crash,
        after
    );

    let mut ex = exchange("t1");
    assert_eq!(search_row(&mut ex, 1), Some(b"v".to_vec()));
}

#[test]
fn test_accumulators_recover_exactly() {
    let db = setup();
    let ex = exchange("t1");
    let tree = ex.tree().clone();
    let tree_id = tree.id();
    drop(ex);

    let tx = Transaction::new();
    tx.update_accumulator(tree_id, 0, AccumKind::Sum, 41);
    tx.commit().unwrap();

    // an aborted delta must never be retained across restarts
    let tx = Transaction::new();
    tx.update_accumulator(tree_id, 0, AccumKind::Sum, 1000);
    tx.rollback().unwrap();
    drop(tree);

    reopen(&db);

    let ex = exchange("t1");
    assert_eq!(ex.tree().accumulators().value(0), Some(41));
    drop(ex);

    // a committed delta after the last checkpoint replays from its
    // TX record
    let ex = exchange("t1");
    let tree_id = ex.tree().id();
    Database::checkpoint().unwrap();
    let tx = Transaction::new();
    tx.update_accumulator(tree_id, 0, AccumKind::Sum, 1);
    tx.commit_with(CommitPolicy::Hard).unwrap();
    drop(ex);

    crash(&db);

    let ex = exchange("t1");
    assert_eq!(ex.tree().accumulators().value(0), Some(42));
}

#[test]
fn test_recovery_missing_volume() {
    pagestore::utils::init_log();
    let db = setup_with(|config| {
        let extra_path = config.datapath.join("extra.v02");
        let mut spec = VolumeSpec::new(extra_path, TEST_PAGE_SIZE);
        spec.initial_size = 64 * 1024;
        config.volumes.push(spec);
    });

    // put data in the second volume so the journal references it
    let mut ex = pagestore::Exchange::new(1, "side", true).unwrap();
    let tx = Transaction::new();
    ex.to(b"k").store(&tx, b"v").unwrap();
    tx.commit_with(CommitPolicy::Hard).unwrap();
    drop(ex);
    Database::close().unwrap();

    // reopen without the second volume: recovery must refuse
    let mut short_config = Config::new(db.config.datapath.clone());
    short_config.volumes.push(db.config.volumes[0].clone());
    short_config.journal_size = db.config.journal_size;
    let err = Database::open(short_config.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RecoveryMissingVolumes);

    // the operator override drops those pages and proceeds
    short_config.ignore_missing_volumes = true;
    Database::open(short_config).unwrap();
    let mut ex = exchange("t1");
    assert_eq!(search_row(&mut ex, 12345), None);
}
