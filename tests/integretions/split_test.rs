use rand::prelude::*;

use pagestore::{
    composite_key, number_segment, Database, Direction, SplitPolicy, Transaction,
};
use pagestore::buffer::Session;

use crate::test_utils::{commit_rows, exchange, reopen, row_key, search_row, setup, setup_with};

fn stress_key(n: u64, k: u64) -> Vec<u8> {
    composite_key(&[b"stress10", &number_segment(n), &number_segment(k)])
}

/// Grow a tree far past one page under each split policy; every key
/// must remain reachable by point lookup and by a full ordered scan
/// (a broken sibling chain loses keys).
#[test]
fn test_splits_preserve_every_key_under_all_policies() {
    for policy in [
        SplitPolicy::LeftBias,
        SplitPolicy::RightBias,
        SplitPolicy::NiceBias,
        SplitPolicy::PackBias,
    ]
    .iter()
    {
        let _db = setup_with(|config| config.split_policy = *policy);
        let mut ex = exchange("t1");

        let rows: Vec<(u64, &[u8])> =
            (0..400).map(|i| (i * 7 % 400, b"split-payload-abcdefgh".as_ref())).collect();
        commit_rows(&mut ex, &rows);

        for i in 0..400u64 {
            assert_eq!(
                search_row(&mut ex, i),
                Some(b"split-payload-abcdefgh".to_vec()),
                "key {} lost under {:?}",
                i,
                policy
            );
        }

        ex.to_before();
        let mut count = 0;
        let mut prev: Option<Vec<u8>> = None;
        while ex.traverse(Direction::Gt, true).unwrap() {
            let key = ex.key().unwrap().to_vec();
            if let Some(p) = &prev {
                assert!(*p < key, "scan out of order under {:?}", policy);
            }
            prev = Some(key);
            count += 1;
        }
        assert_eq!(count, 400, "sibling chain dropped keys under {:?}", policy);
    }
}

/// Appending at the right edge is the historical PACK_BIAS failure:
/// the packed split must never corrupt the rightmost pages or the
/// sibling chain.
#[test]
fn test_pack_bias_right_edge_appends() {
    let _db = setup_with(|config| config.split_policy = SplitPolicy::PackBias);
    let mut ex = exchange("t1");

    // strictly ascending keys: every split happens at the right edge
    let rows: Vec<(u64, &[u8])> =
        (0..600).map(|i| (i, b"pack-bias-right-edge-payload".as_ref())).collect();
    for chunk in rows.chunks(50) {
        commit_rows(&mut ex, chunk);
    }

    for i in (0..600u64).rev() {
        assert_eq!(
            search_row(&mut ex, i),
            Some(b"pack-bias-right-edge-payload".to_vec()),
            "right-edge split lost key {}",
            i
        );
    }

    ex.to_before();
    let mut count = 0;
    while ex.traverse(Direction::Gt, true).unwrap() {
        count += 1;
    }
    assert_eq!(count, 600);
}

/// Small keys, then long (overflow) values, then a policy change and
/// one more store into the crowded right edge; the stored value must
/// read back intact.
#[test]
fn test_split_then_right_edge_store() {
    let db = setup_with(|config| config.split_policy = SplitPolicy::LeftBias);
    {
        let mut ex = exchange("t1");

        let small = vec![0x61u8; 100];
        let small_rows: Vec<(u64, &[u8])> = (0..8).map(|i| (i, small.as_slice())).collect();
        commit_rows(&mut ex, &small_rows);

        let long = vec![0x62u8; 900];
        let ns = [
            637545u64, 637567, 637593, 637618, 637701, 637715, 637734, 637741,
        ];
        let tx = Transaction::new();
        for (k, n) in ns.iter().enumerate() {
            ex.to(&stress_key(*n, k as u64)).store(&tx, &long).unwrap();
        }
        tx.commit().unwrap();
    }

    // switch the policy and store into the middle of the crowded
    // range
    Database::close().unwrap();
    let mut nice = db.config.clone();
    nice.split_policy = SplitPolicy::NiceBias;
    Database::open(nice).unwrap();

    let mut ex = exchange("t1");
    let value = vec![0x63u8; 416];
    let tx = Transaction::new();
    ex.to(&stress_key(637697, 0)).store(&tx, &value).unwrap();
    tx.commit().unwrap();

    let got = ex.to(&stress_key(637697, 0)).fetch().unwrap();
    assert_eq!(got.map(|v| v.len()), Some(416));
    // neighbors intact
    assert_eq!(
        ex.to(&stress_key(637545, 0)).fetch().unwrap().map(|v| v.len()),
        Some(900)
    );
    assert_eq!(
        ex.to(&stress_key(637741, 7)).fetch().unwrap().map(|v| v.len()),
        Some(900)
    );
}

/// Deleting most of a tree and pruning it must merge or rebalance the
/// underfilled pages without losing the survivors.
#[test]
fn test_prune_merges_underfilled_pages() {
    let _db = setup();
    let mut ex = exchange("t1");

    let rows: Vec<(u64, &[u8])> =
        (0..300).map(|i| (i, b"merge-payload-0123456789".as_ref())).collect();
    commit_rows(&mut ex, &rows);

    // delete everything but each 50th key
    let tx = Transaction::new();
    for i in 0..300u64 {
        if i % 50 != 0 {
            ex.to(&row_key(i)).remove(&tx).unwrap();
        }
    }
    tx.commit().unwrap();

    let session = Session::new(Database::claim_timeout());
    let volume = Database::catalog().volume(0).unwrap();
    let tree = ex.tree().clone();
    pagestore::btree::ops::prune_tree(&session, &volume, &tree).unwrap();

    // survivors intact, deletions physically gone
    let physical =
        pagestore::btree::ops::physical_key_count(&session, &volume, &tree).unwrap();
    assert_eq!(physical, 6, "tombstones were not pruned away");

    for i in (0..300u64).step_by(50) {
        assert_eq!(
            search_row(&mut ex, i),
            Some(b"merge-payload-0123456789".to_vec())
        );
    }
    ex.to_before();
    let mut count = 0;
    while ex.traverse(Direction::Gt, true).unwrap() {
        count += 1;
    }
    assert_eq!(count, 6);
}

/// Random keys, random value lengths, random arrival order: whatever
/// shape the tree takes, a point lookup must agree with what went in.
#[test]
fn test_random_workload_round_trips() {
    let _db = setup();
    let mut ex = exchange("t1");

    let mut rng = rand::thread_rng();
    let mut expected: Vec<(u64, Vec<u8>)> = Vec::new();
    for _ in 0..250 {
        let key = rng.gen_range(0, 100_000u64);
        let len = rng.gen_range(1, 100usize);
        let value = vec![rng.gen::<u8>(); len];
        expected.retain(|(k, _)| *k != key);
        expected.push((key, value));
    }

    // several transactions so the redo of any one stays modest
    for batch in expected.chunks(50) {
        let tx = Transaction::new();
        for (key, value) in batch {
            insert(&mut ex, &tx, *key, value);
        }
        tx.commit().unwrap();
    }

    for (key, value) in &expected {
        assert_eq!(
            search_row(&mut ex, *key).as_ref(),
            Some(value),
            "random key {} corrupted",
            key
        );
    }
}

fn insert(ex: &mut pagestore::Exchange, tx: &Transaction, key: u64, value: &[u8]) {
    ex.to(&row_key(key)).store(tx, value).unwrap();
}

/// Splits survive a restart: the propagated separators and the new
/// root are as durable as the data.
#[test]
fn test_split_state_survives_restart() {
    let db = setup();
    {
        let mut ex = exchange("t1");
        let rows: Vec<(u64, &[u8])> =
            (0..250).map(|i| (i, b"durable-split-payload".as_ref())).collect();
        commit_rows(&mut ex, &rows);
    }

    reopen(&db);

    let mut ex = exchange("t1");
    for i in 0..250u64 {
        assert_eq!(
            search_row(&mut ex, i),
            Some(b"durable-split-payload".to_vec()),
            "key {} lost across restart",
            i
        );
    }
}
