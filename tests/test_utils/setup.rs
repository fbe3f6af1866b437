use std::{
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use once_cell::sync::Lazy;
use pagestore::{
    number_segment, Config, Database, Exchange, SplitPolicy, Transaction, VolumeSpec,
};
use tempfile::TempDir;

/// The engine is a process-wide singleton, so tests run one at a
/// time.
static TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub const TEST_PAGE_SIZE: usize = 1024;

/// Serialize a test that manages the engine by hand (no `setup()`).
pub fn lock_serial() -> MutexGuard<'static, ()> {
    TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Journal blocks stay small so rollover and pruning are exercised.
pub const TEST_JOURNAL_SIZE: u64 = 64 * 1024;

/// An open engine on a scratch directory. Dropping it closes the
/// engine and removes the directory.
pub struct TestDb {
    pub config: Config,
    _dir: TempDir,
    _guard: MutexGuard<'static, ()>,
}

impl Drop for TestDb {
    fn drop(&mut self) {
        if Database::is_open() {
            let _ = Database::close();
        }
    }
}

/// # Conduct the initialization
///
/// - Setting up log configurations.
/// - Creating a scratch data directory.
/// - Opening the engine on it.
pub fn setup() -> TestDb {
    setup_with(|_| {})
}

pub fn setup_with<F>(tweak: F) -> TestDb
where
    F: FnOnce(&mut Config),
{
    pagestore::utils::init_log();
    let guard = TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let dir = TempDir::new().unwrap();
    let mut config = base_config(&dir);
    tweak(&mut config);

    Database::open(config.clone()).unwrap();
    TestDb {
        config,
        _dir: dir,
        _guard: guard,
    }
}

fn base_config(dir: &TempDir) -> Config {
    let mut config = Config::new(dir.path());
    let mut spec = VolumeSpec::new(dir.path().join("main.v01"), TEST_PAGE_SIZE);
    spec.initial_size = 64 * 1024;
    spec.extension_size = 64 * 1024;
    spec.maximum_size = 256 * 1024 * 1024;
    config.volumes.push(spec);
    config.buffer_counts.insert(TEST_PAGE_SIZE, 64);
    config.journal_size = TEST_JOURNAL_SIZE;
    config.split_policy = SplitPolicy::NiceBias;
    config.timeout = Duration::from_secs(5);
    config.flush_interval = Duration::from_millis(20);
    // tests drive checkpoints explicitly
    config.checkpoint_interval = Duration::from_secs(600);
    config
}

/// Simulate a crash and recover: everything the flusher had not yet
/// forced is gone.
pub fn crash(db: &TestDb) {
    Database::crash();
    Database::open(db.config.clone()).unwrap();
}

/// Clean shutdown and reopen.
pub fn reopen(db: &TestDb) {
    Database::close().unwrap();
    Database::open(db.config.clone()).unwrap();
}

pub fn exchange(tree: &str) -> Exchange {
    Exchange::new(0, tree, true).unwrap()
}

/// Row key for an integer, ordering numerically.
pub fn row_key(n: u64) -> Vec<u8> {
    number_segment(n)
}

pub fn insert_row(ex: &mut Exchange, tx: &Transaction, n: u64, value: &[u8]) {
    ex.to(&row_key(n)).store(tx, value).unwrap();
}

pub fn commit_rows(ex: &mut Exchange, rows: &[(u64, &[u8])]) {
    let tx = Transaction::new();
    for (n, value) in rows {
        insert_row(ex, &tx, *n, value);
    }
    tx.commit().unwrap();
}

pub fn search_row(ex: &mut Exchange, n: u64) -> Option<Vec<u8>> {
    ex.to(&row_key(n)).fetch().unwrap()
}
