use std::sync::atomic::Ordering;

use pagestore::{Config, Database, ErrorKind, VolumeSpec};

use crate::test_utils::{
    commit_rows, exchange, lock_serial, search_row, setup, setup_with, TEST_PAGE_SIZE,
};

#[test]
fn test_open_missing_volume_fails() {
    pagestore::utils::init_log();
    let _serial = lock_serial();
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new(dir.path());
    let mut spec = VolumeSpec::new(dir.path().join("absent.v01"), TEST_PAGE_SIZE);
    spec.create = false;
    config.volumes.push(spec);

    let err = Database::open(config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VolumeNotFound);
}

#[test]
fn test_reopen_with_wrong_page_size_fails() {
    let db = setup();
    let mut ex = exchange("t1");
    commit_rows(&mut ex, &[(1, b"v")]);
    drop(ex);
    Database::close().unwrap();

    let mut config = db.config.clone();
    config.volumes[0].page_size = 4096;
    let err = Database::open(config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::VolumeAlreadyExists);

    // reopening correctly still works
    Database::open(db.config.clone()).unwrap();
    let mut ex = exchange("t1");
    assert_eq!(search_row(&mut ex, 1), Some(b"v".to_vec()));
}

/// A pool far smaller than the working set forces eviction; every
/// page must come back intact through the journal-first read path.
#[test]
fn test_eviction_under_tiny_pool() {
    let _db = setup_with(|config| {
        config.buffer_counts.insert(TEST_PAGE_SIZE, 8);
    });
    let mut ex = exchange("t1");

    let payload = vec![0x2Eu8; 120];
    let rows: Vec<(u64, &[u8])> = (0..300).map(|i| (i, payload.as_slice())).collect();
    for chunk in rows.chunks(25) {
        commit_rows(&mut ex, chunk);
    }

    for i in 0..300u64 {
        assert_eq!(search_row(&mut ex, i), Some(payload.clone()), "key {} lost", i);
    }

    let pool = Database::buffer_pool();
    let stats = pool.stats();
    assert!(
        stats.evictions.load(Ordering::Relaxed) > 0,
        "the tiny pool never evicted"
    );
}

#[test]
fn test_inventory_snapshot_written_at_close() {
    let db = setup();
    let mut ex = exchange("t1");
    commit_rows(&mut ex, &[(1, b"warm"), (2, b"warm")]);
    drop(ex);

    let inventory = db.config.datapath.join("pagestore.inventory");
    Database::close().unwrap();
    assert!(inventory.exists(), "no inventory snapshot at close");

    // reopening preloads it and the data is immediately reachable
    Database::open(db.config.clone()).unwrap();
    let mut ex = exchange("t1");
    assert_eq!(search_row(&mut ex, 1), Some(b"warm".to_vec()));
}

#[test]
fn test_two_volumes_are_independent() {
    let _db = setup_with(|config| {
        let mut spec = VolumeSpec::new(config.datapath.join("second.v02"), TEST_PAGE_SIZE);
        spec.initial_size = 64 * 1024;
        config.volumes.push(spec);
    });

    let mut first = pagestore::Exchange::new(0, "shared-name", true).unwrap();
    let mut second = pagestore::Exchange::new(1, "shared-name", true).unwrap();

    let tx = pagestore::Transaction::new();
    first.to(b"k").store(&tx, b"in-volume-0").unwrap();
    second.to(b"k").store(&tx, b"in-volume-1").unwrap();
    tx.commit().unwrap();

    assert_eq!(first.to(b"k").fetch().unwrap(), Some(b"in-volume-0".to_vec()));
    assert_eq!(second.to(b"k").fetch().unwrap(), Some(b"in-volume-1".to_vec()));
}

#[test]
fn test_volume_grows_with_data() {
    let db = setup();
    let mut ex = exchange("t1");

    let payload = vec![0x4Bu8; 150];
    let rows: Vec<(u64, &[u8])> = (0..500).map(|i| (i, payload.as_slice())).collect();
    for chunk in rows.chunks(50) {
        commit_rows(&mut ex, chunk);
    }
    Database::checkpoint().unwrap();
    Database::copy_back_pages().unwrap();

    let volume_path = &db.config.volumes[0].path;
    let len = std::fs::metadata(volume_path).unwrap().len();
    assert!(
        len > 64 * 1024,
        "volume never extended past its initial size: {}",
        len
    );
    assert_eq!(search_row(&mut ex, 499), Some(payload.clone()));
}
