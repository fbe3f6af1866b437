use std::{
    collections::HashMap,
    mem,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard,
    },
    time::Duration,
};

use log::{error, info, warn};
use once_cell::sync::Lazy;

use crate::{
    background::{spawn_worker, WorkerHandle},
    btree::{tree, Tree},
    buffer::{inventory, BufferPool, Session},
    checkpoint,
    cleanup::CleanupManager,
    config::{CommitPolicy, Config},
    error::{ErrorKind, StoreError},
    journal::{copier, record::{IvPayload, ItPayload, RecordKind}, JournalManager},
    page::split::SplitPolicy,
    recovery,
    transaction::{TransactionIndex, WwSequencer},
    types::{PageKey, Pod, StoreResult, Timestamp, TreeId, VolumeId},
    utils::HandyRwLock,
    volume::Volume,
};

/// Monotone engine-wide timestamp source. Orders transactions,
/// checkpoints, and journal records.
pub struct TimestampAllocator {
    next: AtomicU64,
}

impl TimestampAllocator {
    fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> Timestamp {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Exclusive upper bound on every allocated timestamp; used as
    /// the snapshot of non-transactional reads.
    pub fn current(&self) -> Timestamp {
        self.next.load(Ordering::SeqCst)
    }

    /// Never allocate at or below a recovered timestamp.
    pub fn ensure_floor(&self, floor: Timestamp) {
        self.next.fetch_max(floor, Ordering::SeqCst);
    }
}

/// Volumes and trees currently open, by id and by name.
pub struct Catalog {
    volumes: Mutex<HashMap<VolumeId, Arc<Volume>>>,
    trees: Mutex<HashMap<(VolumeId, String), Arc<Tree>>>,
    trees_by_id: Mutex<HashMap<TreeId, Arc<Tree>>>,
    directories: Mutex<HashMap<VolumeId, Arc<Tree>>>,
    next_tree_id: AtomicU32,
}

impl Catalog {
    fn new() -> Self {
        Self {
            volumes: Mutex::new(HashMap::new()),
            trees: Mutex::new(HashMap::new()),
            trees_by_id: Mutex::new(HashMap::new()),
            directories: Mutex::new(HashMap::new()),
            next_tree_id: AtomicU32::new(1),
        }
    }

    pub fn add_volume(&self, volume: Arc<Volume>) {
        self.volumes.lock().unwrap().insert(volume.id(), volume);
    }

    pub fn volume(&self, id: VolumeId) -> Option<Arc<Volume>> {
        self.volumes.lock().unwrap().get(&id).cloned()
    }

    pub fn volumes(&self) -> Vec<Arc<Volume>> {
        let mut out: Vec<Arc<Volume>> = self.volumes.lock().unwrap().values().cloned().collect();
        out.sort_by_key(|v| v.id());
        out
    }

    pub fn register_tree(&self, tree: Arc<Tree>) {
        self.trees
            .lock()
            .unwrap()
            .insert((tree.volume_id(), tree.name().to_string()), Arc::clone(&tree));
        self.trees_by_id.lock().unwrap().insert(tree.id(), tree);
    }

    pub fn unregister_tree(&self, volume_id: VolumeId, name: &str) {
        let removed = self
            .trees
            .lock()
            .unwrap()
            .remove(&(volume_id, name.to_string()));
        if let Some(tree) = removed {
            self.trees_by_id.lock().unwrap().remove(&tree.id());
        }
    }

    pub fn tree(&self, volume_id: VolumeId, name: &str) -> Option<Arc<Tree>> {
        self.trees
            .lock()
            .unwrap()
            .get(&(volume_id, name.to_string()))
            .cloned()
    }

    pub fn tree_by_id(&self, id: TreeId) -> Option<Arc<Tree>> {
        if id == tree::DIRECTORY_TREE_ID {
            return None;
        }
        self.trees_by_id.lock().unwrap().get(&id).cloned()
    }

    pub fn trees(&self) -> Vec<Arc<Tree>> {
        let mut out: Vec<Arc<Tree>> = self.trees.lock().unwrap().values().cloned().collect();
        out.sort_by_key(|t| t.id());
        out
    }

    /// The cached per-volume directory tree (the tree of trees),
    /// created on first use. One instance per volume: root updates
    /// must stay coherent across every holder.
    pub fn directory_tree(&self, volume_id: VolumeId) -> Result<Arc<Tree>, StoreError> {
        let mut directories = self.directories.lock().unwrap();
        if let Some(dir) = directories.get(&volume_id) {
            return Ok(Arc::clone(dir));
        }
        let volume = self.volume(volume_id).ok_or_else(|| {
            StoreError::new(
                ErrorKind::VolumeClosed,
                &format!("volume {} is not open", volume_id),
            )
        })?;
        let session = Session::new(Database::claim_timeout());
        let dir = tree::directory_tree(&session, &volume)?;
        directories.insert(volume_id, Arc::clone(&dir));
        Ok(dir)
    }

    pub fn next_tree_id(&self) -> TreeId {
        self.next_tree_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn seed_tree_ids(&self, floor: TreeId) {
        self.next_tree_id.fetch_max(floor, Ordering::SeqCst);
    }

    /// IV and IT records describing the catalog, written at every
    /// journal block start so each block is a recovery resume point.
    pub fn identity_payloads(&self) -> Vec<(RecordKind, Vec<u8>)> {
        let mut out = Vec::new();
        for volume in self.volumes() {
            let payload = IvPayload {
                volume_id: volume.id(),
                uuid: volume.uuid(),
                path: volume.path().to_string_lossy().to_string(),
            };
            out.push((RecordKind::IV, payload.encode()));
        }
        for tree in self.trees() {
            let payload = ItPayload {
                tree_id: tree.id(),
                volume_id: tree.volume_id(),
                name: tree.name().to_string(),
            };
            out.push((RecordKind::IT, payload.encode()));
        }
        out
    }
}

/// The engine context: every subsystem, by shared ownership, plus the
/// background threads. Cross-references between subsystems are ids
/// (page address, journal address, start timestamp), never pointers.
pub struct Database {
    config: Config,
    catalog: Pod<Catalog>,
    buffer_pool: Pod<BufferPool>,
    journal: Pod<JournalManager>,
    tx_index: Pod<TransactionIndex>,
    cleanup: Pod<CleanupManager>,
    timestamps: TimestampAllocator,
    sequencer: WwSequencer,
    workers: Mutex<Vec<WorkerHandle>>,
    closed: AtomicBool,
}

static mut SINGLETON: *mut Database = 0 as *mut Database;
static SINGLETON_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

impl Database {
    /// Open (or reopen) the engine. Replaces the previous instance,
    /// which must have been closed or crashed first.
    pub fn open(config: Config) -> StoreResult {
        let _guard = SINGLETON_LOCK.lock().unwrap();

        // tear down a previous incarnation
        unsafe {
            if !SINGLETON.is_null() {
                let old = &mut *SINGLETON;
                old.stop_workers();
            }
        }

        std::fs::create_dir_all(&config.datapath)?;
        let journal_dir = config.journal_path();

        let instance = Database {
            catalog: Arc::new(RwLock::new(Catalog::new())),
            buffer_pool: Arc::new(RwLock::new(BufferPool::new(
                config.buffer_counts.clone(),
                crate::config::DEFAULT_BUFFER_COUNT,
            ))),
            journal: Arc::new(RwLock::new(JournalManager::new(
                journal_dir.clone(),
                config.journal_size,
            )?)),
            tx_index: Arc::new(RwLock::new(TransactionIndex::new())),
            cleanup: Arc::new(RwLock::new(CleanupManager::new())),
            timestamps: TimestampAllocator::new(),
            sequencer: WwSequencer::new(),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            config,
        };

        unsafe {
            let old = SINGLETON;
            SINGLETON = mem::transmute(Box::new(instance));
            if !old.is_null() {
                mem::drop(Box::from_raw(old));
            }
        }

        // from here the accessors below work
        let this = Self::global();
        let opened = Self::open_instance(this);
        if opened.is_err() {
            // a half-open instance must not flush anything at close
            this.closed.store(true, Ordering::SeqCst);
        }
        opened
    }

    fn open_instance(this: &'static Database) -> StoreResult {
        let journal_dir = this.config.journal_path();

        // step 1: volumes, in declaration order; ids are stable
        // across restarts
        for (i, spec) in this.config.volumes.iter().enumerate() {
            let volume = Volume::open(i as VolumeId, spec)?;
            Self::catalog().add_volume(Arc::new(volume));
        }

        // step 2: rebuild state from the journal, before any
        // background thread can allocate a timestamp
        let recovered = recovery::scan_and_resume(&journal_dir)?;

        // step 3: the tree catalog reads through the recovered page
        // map
        let session = Session::new(Self::claim_timeout());
        let mut max_tree_id = 0;
        for volume in Self::catalog().volumes() {
            for t in tree::load_trees(&session, &volume)? {
                max_tree_id = max_tree_id.max(t.id());
                Self::catalog().register_tree(t);
            }
        }
        Self::catalog().seed_tree_ids(max_tree_id + 1);

        // step 4: redo the committed tail, then run the scheduled
        // loser pruning to completion so the post-open state is
        // deterministic and retired transactions stop pinning the
        // journal
        recovery::replay(&session, &recovered)?;
        Self::cleanup_manager().drain(&session, usize::MAX)?;

        // step 5: warm the pool from the last inventory snapshot
        inventory::preload(&session, &this.config.datapath.join("pagestore.inventory"));

        // step 6: anchor this incarnation with its own durable
        // checkpoint before any work arrives; the journal base can
        // then advance past what recovery consumed
        checkpoint::run_checkpoint()?;

        this.start_workers();
        info!(
            "pagestore open at {:?}: {} volumes, {} trees, journal through {}",
            this.config.datapath,
            Self::catalog().volumes().len(),
            Self::catalog().trees().len(),
            recovered.end_addr,
        );
        Ok(())
    }

    pub fn global() -> &'static Database {
        unsafe {
            assert!(!SINGLETON.is_null(), "the database is not open");
            &*SINGLETON
        }
    }

    fn start_workers(&self) {
        let mut workers = self.workers.lock().unwrap();

        workers.push(spawn_worker(
            "journal-flusher",
            self.config.flush_interval,
            || Database::journal_manager().force(),
        ));

        let copier_interval = self.config.checkpoint_interval;
        workers.push(spawn_worker("journal-copier", copier_interval, || {
            copier::copy_back_pages().map(|_| ())
        }));

        workers.push(spawn_worker(
            "checkpoint-manager",
            self.config.checkpoint_interval,
            || checkpoint::run_checkpoint().map(|_| ()),
        ));

        let pw_session = Session::new(self.config.timeout);
        workers.push(spawn_worker(
            "page-writer",
            self.config.flush_interval * 4,
            move || {
                Database::buffer_pool()
                    .write_dirty_pages(&pw_session, false)
                    .map(|_| ())
            },
        ));

        let cleanup_session = Session::new(self.config.timeout);
        let cleanup_worker = spawn_worker("cleanup-manager", Duration::from_millis(250), move || {
            Database::cleanup_manager()
                .drain(&cleanup_session, 128)
                .map(|_| ())
        });
        Self::cleanup_manager().set_waker(Some(cleanup_worker.waker()));
        workers.push(cleanup_worker);

        let inv_path = self.config.datapath.join("pagestore.inventory");
        workers.push(spawn_worker(
            "inventory-writer",
            Duration::from_secs(60),
            move || inventory::write_inventory(&inv_path, &Database::buffer_pool().resident_keys()),
        ));
    }

    fn stop_workers(&self) {
        self.cleanup.rl().set_waker(None);
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.iter_mut() {
            worker.shutdown_join();
        }
        workers.clear();
    }

    /// Clean shutdown: quiesce, checkpoint, copy pages home, snapshot
    /// the inventory, and close the volumes.
    pub fn close() -> StoreResult {
        let this = Self::global();
        if this.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        this.stop_workers();

        let session = Session::new(Self::claim_timeout());
        let _ = Self::cleanup_manager().drain(&session, usize::MAX);

        if let Err(e) = checkpoint::run_checkpoint() {
            error!("final checkpoint failed: {}", e);
        }
        if let Err(e) = copier::copy_back_pages() {
            error!("final copy-back failed: {}", e);
        }
        let inv_path = this.config.datapath.join("pagestore.inventory");
        if let Err(e) =
            inventory::write_inventory(&inv_path, &Self::buffer_pool().resident_keys())
        {
            warn!("inventory snapshot failed: {}", e);
        }

        for volume in Self::catalog().volumes() {
            volume.write_header()?;
            volume.close();
        }
        Self::buffer_pool().log_stats();
        info!("pagestore closed");
        Ok(())
    }

    /// Test hook: stop dead without flushing anything. Whatever the
    /// flusher had not yet forced is lost, exactly as in a crash.
    pub fn crash() {
        let this = Self::global();
        this.closed.store(true, Ordering::SeqCst);
        this.stop_workers();
        for volume in Self::catalog().volumes() {
            volume.close();
        }
        warn!("pagestore crashed by request");
    }

    pub fn is_open() -> bool {
        unsafe {
            if SINGLETON.is_null() {
                return false;
            }
        }
        !Self::global().closed.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // subsystem accessors
    // ------------------------------------------------------------------

    pub fn catalog() -> RwLockReadGuard<'static, Catalog> {
        Self::global().catalog.rl()
    }

    pub fn buffer_pool() -> RwLockReadGuard<'static, BufferPool> {
        Self::global().buffer_pool.rl()
    }

    pub fn journal_manager() -> RwLockReadGuard<'static, JournalManager> {
        Self::global().journal.rl()
    }

    pub fn transaction_index() -> RwLockReadGuard<'static, TransactionIndex> {
        Self::global().tx_index.rl()
    }

    pub fn cleanup_manager() -> RwLockReadGuard<'static, CleanupManager> {
        Self::global().cleanup.rl()
    }

    pub fn timestamps() -> &'static TimestampAllocator {
        &Self::global().timestamps
    }

    pub fn sequencer() -> &'static WwSequencer {
        &Self::global().sequencer
    }

    pub fn commit_policy() -> CommitPolicy {
        Self::global().config.commit_policy
    }

    pub fn split_policy() -> SplitPolicy {
        Self::global().config.split_policy
    }

    pub fn claim_timeout() -> Duration {
        Self::global().config.timeout
    }

    pub fn flush_interval() -> Duration {
        Self::global().config.flush_interval
    }

    pub fn ignore_missing_volumes() -> bool {
        Self::global().config.ignore_missing_volumes
    }

    pub fn datapath() -> PathBuf {
        Self::global().config.datapath.clone()
    }

    // ------------------------------------------------------------------
    // engine-level operations
    // ------------------------------------------------------------------

    /// Journal the volume's current superblock image. Called after
    /// every superblock mutation; the copier writes it home later.
    pub fn journal_superblock(volume: &Arc<Volume>) -> StoreResult {
        let image = volume.header().page_image();
        let ts = Self::timestamps().current();
        Self::journal_manager()
            .append_page_image(PageKey::new(volume.id(), 0), &image, ts)
            .map(|_| ())
    }

    /// Force the journal durable through the current write position.
    pub fn flush() -> StoreResult {
        Self::journal_manager().force()
    }

    /// Take a checkpoint now.
    pub fn checkpoint() -> StoreResult {
        checkpoint::run_checkpoint().map(|_| ())
    }

    /// Run a full copier cycle inline.
    pub fn copy_back_pages() -> Result<usize, StoreError> {
        copier::copy_back_pages()
    }
}
