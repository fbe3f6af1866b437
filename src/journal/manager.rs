use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    thread::sleep,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, warn};

use crate::{
    database::Database,
    error::StoreError,
    io::MediatedFile,
    types::{JournalAddr, PageKey, StoreResult, Timestamp},
};

use super::{
    block_file_path, journal_files,
    maps::PageMap,
    record::{
        self, frame, record_size, JePayload, JhPayload, PaPayload, PmPayload, RecordKind,
        TmPayload, JOURNAL_FORMAT_VERSION,
    },
    Checkpoint,
};

pub const MIN_BLOCK_SIZE: u64 = 64 * 1024;

/// Space kept free at a block's tail so the JE record always fits.
const ROLLOVER_SLACK: u64 = 128;

/// A flush slower than this emits a `longJournalIO` diagnostic.
const SLOW_FLUSH: Duration = Duration::from_millis(500);

const DURABLE_POLL: Duration = Duration::from_millis(1);

struct JournalInner {
    dir: PathBuf,
    block_size: u64,
    /// Next append position, absolute across all blocks.
    current_addr: JournalAddr,
    /// Records appended but not yet written to a file.
    buffer: Vec<u8>,
    /// Journal address of `buffer[0]`.
    buffer_base: JournalAddr,
    base_address: JournalAddr,
    checkpoint: Checkpoint,
    page_map: PageMap,
    files: HashMap<u64, MediatedFile>,
}

/// The write-ahead journal: an addressed stream of records across
/// fixed-size block files.
///
/// Appenders serialize on one mutex; a flusher advances the
/// durable-through pointer by forcing the buffered tail to disk.
pub struct JournalManager {
    inner: Mutex<JournalInner>,
    durable: AtomicU64,
}

impl JournalManager {
    pub fn new(dir: PathBuf, block_size: u64) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir)?;
        let block_size = block_size.max(MIN_BLOCK_SIZE);
        Ok(Self {
            inner: Mutex::new(JournalInner {
                dir,
                block_size,
                current_addr: 0,
                buffer: Vec::new(),
                buffer_base: 0,
                base_address: 0,
                checkpoint: Checkpoint::none(),
                page_map: PageMap::new(),
                files: HashMap::new(),
            }),
            durable: AtomicU64::new(0),
        })
    }

    /// Install the state recovery reconstructed. Appending resumes at
    /// a fresh block so every run begins with its own JH.
    pub fn resume(
        &self,
        end_addr: JournalAddr,
        base_address: JournalAddr,
        checkpoint: Checkpoint,
        page_map: PageMap,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let next = if end_addr == 0 {
            0
        } else {
            (end_addr / inner.block_size + 1) * inner.block_size
        };
        inner.current_addr = next;
        inner.buffer.clear();
        inner.buffer_base = next;
        inner.base_address = base_address;
        inner.checkpoint = checkpoint;
        inner.page_map = page_map;
        self.durable.store(next, Ordering::SeqCst);
        info!(
            "journal resumed at {}, base {}, checkpoint ts {}",
            next, base_address, checkpoint.timestamp
        );
    }

    pub fn block_size(&self) -> u64 {
        self.inner.lock().unwrap().block_size
    }

    pub fn current_address(&self) -> JournalAddr {
        self.inner.lock().unwrap().current_addr
    }

    pub fn base_address(&self) -> JournalAddr {
        self.inner.lock().unwrap().base_address
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.inner.lock().unwrap().checkpoint
    }

    pub fn note_checkpoint(&self, cp: Checkpoint) {
        self.inner.lock().unwrap().checkpoint = cp;
    }

    pub fn durable_addr(&self) -> JournalAddr {
        self.durable.load(Ordering::SeqCst)
    }

    pub fn page_map_entries(&self) -> Vec<(PageKey, JournalAddr)> {
        self.inner.lock().unwrap().page_map.entries()
    }

    pub fn lookup_page(&self, key: &PageKey) -> Option<JournalAddr> {
        self.inner.lock().unwrap().page_map.get(key)
    }

    pub fn copied_back(&self, key: &PageKey, addr: JournalAddr) {
        self.inner.lock().unwrap().page_map.copied_back(key, addr);
    }

    // ------------------------------------------------------------------
    // append path
    // ------------------------------------------------------------------

    pub fn append_record(
        &self,
        kind: RecordKind,
        payload: &[u8],
    ) -> Result<JournalAddr, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        self.append_locked(&mut inner, kind, payload)
    }

    /// Journal a page image and point the page map at it.
    pub fn append_page_image(
        &self,
        key: PageKey,
        image: &[u8],
        timestamp: Timestamp,
    ) -> Result<JournalAddr, StoreError> {
        let payload = PaPayload {
            volume_id: key.volume_id,
            page_addr: key.page_addr,
            timestamp,
            image: image.to_vec(),
        }
        .encode();
        let mut inner = self.inner.lock().unwrap();
        let addr = self.append_locked(&mut inner, RecordKind::PA, &payload)?;
        inner.page_map.put(key, addr);
        Ok(addr)
    }

    fn append_locked(
        &self,
        inner: &mut JournalInner,
        kind: RecordKind,
        payload: &[u8],
    ) -> Result<JournalAddr, StoreError> {
        let rec_len = record_size(payload.len()) as u64;
        if rec_len + ROLLOVER_SLACK > inner.block_size {
            return Err(StoreError::corrupt_journal(&format!(
                "{:?} record of {} bytes exceeds the journal block size",
                kind, rec_len
            )));
        }

        if inner.current_addr % inner.block_size == 0 {
            self.write_block_header(inner);
        } else {
            let offset = inner.current_addr % inner.block_size;
            if offset + rec_len + ROLLOVER_SLACK > inner.block_size {
                self.rollover(inner);
            }
        }

        Ok(self.raw_push(inner, kind, payload))
    }

    fn raw_push(&self, inner: &mut JournalInner, kind: RecordKind, payload: &[u8]) -> JournalAddr {
        let addr = inner.current_addr;
        let framed = frame(kind, payload);
        inner.buffer.extend_from_slice(&framed);
        inner.current_addr += framed.len() as u64;
        addr
    }

    /// Close the current block with a JE and open the next one.
    fn rollover(&self, inner: &mut JournalInner) {
        let je = JePayload {
            end_address: inner.current_addr + record_size(8) as u64,
        };
        self.raw_push(inner, RecordKind::JE, &je.encode());

        // zero padding up to the block boundary
        let boundary = (inner.current_addr / inner.block_size + 1) * inner.block_size;
        let pad = (boundary - inner.current_addr) as usize;
        inner.buffer.extend(std::iter::repeat(0u8).take(pad));
        inner.current_addr = boundary;

        debug!("journal rolled over to block {}", boundary / inner.block_size);
        self.write_block_header(inner);
    }

    /// JH plus the self-description records that make each block a
    /// recovery resume point: page map, transaction map, volume and
    /// tree identities.
    fn write_block_header(&self, inner: &mut JournalInner) {
        debug_assert_eq!(inner.current_addr % inner.block_size, 0);

        let jh = JhPayload {
            format_version: JOURNAL_FORMAT_VERSION,
            block_size: inner.block_size,
            base_address: inner.base_address,
            block_address: inner.current_addr,
            checkpoint_ts: inner.checkpoint.timestamp,
            checkpoint_addr: inner.checkpoint.addr,
            created_ts: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        self.raw_push(inner, RecordKind::JH, &jh.encode());

        let pm = PmPayload {
            entries: inner.page_map.entries(),
        };
        self.raw_push(inner, RecordKind::PM, &pm.encode());

        let tm = TmPayload {
            entries: Database::transaction_index().tm_entries(),
        };
        self.raw_push(inner, RecordKind::TM, &tm.encode());

        for payload in Database::catalog().identity_payloads() {
            let (kind, bytes) = payload;
            self.raw_push(inner, kind, &bytes);
        }
    }

    /// Append fresh PM and TM snapshots mid-block. Written at every
    /// checkpoint so recovery resumes from the newest maps and a
    /// retired transaction never re-enters the live table.
    pub fn append_map_snapshots(&self) -> StoreResult {
        let tm = TmPayload {
            entries: Database::transaction_index().tm_entries(),
        }
        .encode();
        let mut inner = self.inner.lock().unwrap();
        let pm = PmPayload {
            entries: inner.page_map.entries(),
        }
        .encode();
        self.append_locked(&mut inner, RecordKind::PM, &pm)?;
        self.append_locked(&mut inner, RecordKind::TM, &tm)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // flush path
    // ------------------------------------------------------------------

    /// Write the buffered tail to its block files and fsync them,
    /// advancing the durable-through pointer.
    pub fn force(&self) -> StoreResult {
        let started = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        self.flush_buffer_locked(&mut inner)?;
        self.durable.store(inner.current_addr, Ordering::SeqCst);
        drop(inner);

        let elapsed = started.elapsed();
        if elapsed > SLOW_FLUSH {
            // diagnostic only
            warn!("longJournalIO: journal flush took {:?}", elapsed);
        }
        Ok(())
    }

    fn flush_buffer_locked(&self, inner: &mut JournalInner) -> StoreResult {
        if inner.buffer.is_empty() {
            return Ok(());
        }

        let bs = inner.block_size;
        let start = inner.buffer_base;
        let end = inner.current_addr;
        let JournalInner {
            dir,
            files,
            buffer,
            buffer_base,
            ..
        } = inner;
        let mut touched = Vec::new();

        let mut pos = start;
        while pos < end {
            let block = pos / bs;
            let block_end = (block + 1) * bs;
            let chunk_end = block_end.min(end);
            let from = (pos - start) as usize;
            let to = (chunk_end - start) as usize;
            let offset_in_block = pos % bs;

            if !files.contains_key(&block) {
                files.insert(block, MediatedFile::create(block_file_path(dir, block))?);
            }
            let file = files.get(&block).unwrap();
            file.write_all_at(offset_in_block, &buffer[from..to])?;
            touched.push(block);
            pos = chunk_end;
        }

        for block in touched {
            if let Some(file) = files.get(&block) {
                file.sync()?;
            }
        }

        buffer.clear();
        *buffer_base = end;
        Ok(())
    }

    /// Block until everything up to `addr` is durable. Used by group
    /// commits; falls back to an inline force when the shared flusher
    /// does not come around in time.
    pub fn wait_durable(&self, addr: JournalAddr, patience: Duration) -> StoreResult {
        let start = Instant::now();
        while self.durable_addr() < addr {
            if start.elapsed() >= patience {
                return self.force();
            }
            sleep(DURABLE_POLL);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // read path
    // ------------------------------------------------------------------

    /// Read the page image of the PA record at `addr`, serving
    /// not-yet-flushed records straight from the buffer.
    pub fn read_page_image(&self, addr: JournalAddr) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let (kind, payload) = if addr >= inner.buffer_base {
            let offset = (addr - inner.buffer_base) as usize;
            match record::parse(&inner.buffer, offset)? {
                Some((kind, payload, _)) => (kind, payload),
                None => {
                    return Err(StoreError::corrupt_journal(&format!(
                        "no record at journal address {}",
                        addr
                    )))
                }
            }
        } else {
            self.read_record_in_file(&inner, addr)?
        };

        if kind != RecordKind::PA {
            return Err(StoreError::corrupt_journal(&format!(
                "expected a PA record at {}, found {:?}",
                addr, kind
            )));
        }
        Ok(PaPayload::decode(&payload)?.image)
    }

    fn read_record_in_file(
        &self,
        inner: &JournalInner,
        addr: JournalAddr,
    ) -> Result<(RecordKind, Vec<u8>), StoreError> {
        let block = addr / inner.block_size;
        let offset = addr % inner.block_size;
        let path = block_file_path(&inner.dir, block);
        if !path.exists() {
            return Err(StoreError::corrupt_journal(&format!(
                "journal file {:?} no longer exists",
                path
            )));
        }
        let file = MediatedFile::open(&path, true)?;

        let mut prefix = vec![0u8; record::RECORD_PREFIX];
        file.read_exact_at(offset, &mut prefix)?;
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

        let mut whole = vec![0u8; record_size(len)];
        file.read_exact_at(offset, &mut whole)?;
        match record::parse(&whole, 0)? {
            Some((kind, payload, _)) => Ok((kind, payload)),
            None => Err(StoreError::corrupt_journal(&format!(
                "no record at journal address {}",
                addr
            ))),
        }
    }

    // ------------------------------------------------------------------
    // base address & pruning
    // ------------------------------------------------------------------

    /// Advance the base address: the minimum of the earliest page-map
    /// reference, the journal address of the earliest live
    /// transaction, and the block holding the durable checkpoint.
    /// The base never decreases; blocks strictly below it are
    /// deleted.
    pub fn recompute_base(&self) -> Result<JournalAddr, StoreError> {
        // retired transactions contribute nothing here, so pruning
        // can never chase a journal file that only a retired
        // transaction referenced
        let checkpoint_ts = self.checkpoint().timestamp;
        let live_tx_min = Database::transaction_index().earliest_live_addr(checkpoint_ts);

        let mut inner = self.inner.lock().unwrap();
        let bs = inner.block_size;
        let checkpoint_block_start = (inner.checkpoint.addr / bs) * bs;

        let mut new_base = checkpoint_block_start;
        if let Some(a) = inner.page_map.min_addr() {
            new_base = new_base.min(a);
        }
        if let Some(a) = live_tx_min {
            new_base = new_base.min(a);
        }

        if new_base < inner.base_address {
            warn!(
                "journal base address would decrease from {} to {}; keeping the old value",
                inner.base_address, new_base
            );
        } else {
            inner.base_address = new_base;
        }
        let base = inner.base_address;

        let current_block = inner.current_addr / bs;
        for (index, path) in journal_files(&inner.dir) {
            if (index + 1) * bs <= base && index != current_block {
                inner.files.remove(&index);
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("could not delete obsolete journal file {:?}: {}", path, e);
                } else {
                    debug!("deleted obsolete journal file {:?}", path);
                }
            }
        }
        Ok(base)
    }
}
