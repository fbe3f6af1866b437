use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use log::{info, warn};

use crate::{
    buffer::Session,
    btree::ops,
    cleanup::CleanupAction,
    database::Database,
    error::{ErrorKind, StoreError},
    io::MediatedFile,
    journal::{
        journal_files,
        maps::PageMap,
        record::{
            self, record_size, AccumSnapshot, CpPayload, JhPayload, PaPayload, PmPayload,
            RecordKind, RedoOp, TcPayload, TmPayload, TsPayload, TxPayload, ABORTED_MARKER,
            RUNNING_MARKER,
        },
        Checkpoint,
    },
    transaction::{accumulator::AccumKind, tx_index},
    types::{JournalAddr, PageKey, StoreResult, Timestamp},
    volume::VolumeHeader,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum RecoveredStatus {
    Running,
    Committed(Timestamp),
    Aborted,
}

#[derive(Debug)]
struct RecoveredTx {
    status: RecoveredStatus,
    start_addr: JournalAddr,
    tx_addr: JournalAddr,
    mvv_count: Option<u64>,
    payload: Option<TxPayload>,
}

/// Everything the journal scan reconstructed. `replay` applies the
/// committed tail once the tree catalog is loaded.
pub struct RecoveredState {
    pub checkpoint: Checkpoint,
    pub end_addr: JournalAddr,
    committed_tail: Vec<TxPayload>,
    accumulators: Vec<AccumSnapshot>,
}

impl RecoveredState {
    fn empty() -> Self {
        Self {
            checkpoint: Checkpoint::none(),
            end_addr: 0,
            committed_tail: Vec::new(),
            accumulators: Vec::new(),
        }
    }

    pub fn committed_tail_len(&self) -> usize {
        self.committed_tail.len()
    }
}

fn read_record_at(
    file: &MediatedFile,
    file_len: u64,
    offset: u64,
) -> Result<Option<(RecordKind, Vec<u8>, u64)>, StoreError> {
    if offset + record::RECORD_PREFIX as u64 > file_len {
        return Ok(None);
    }
    let mut prefix = vec![0u8; record::RECORD_PREFIX];
    file.read_exact_at(offset, &mut prefix)?;
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let kind_raw = u16::from_le_bytes([prefix[4], prefix[5]]);
    if len == 0 && kind_raw == 0 {
        return Ok(None);
    }
    let total = record_size(len) as u64;
    if offset + total > file_len {
        // torn tail
        return Ok(None);
    }
    let mut whole = vec![0u8; total as usize];
    file.read_exact_at(offset, &mut whole)?;
    match record::parse(&whole, 0)? {
        Some((kind, payload, _)) => Ok(Some((kind, payload, total))),
        None => Ok(None),
    }
}

/// Find the keystone: the newest journal file opening with a
/// self-consistent JH.
fn find_keystone(files: &[(u64, std::path::PathBuf)]) -> Option<(u64, JhPayload)> {
    for (index, path) in files.iter().rev() {
        let file = match MediatedFile::open(path, true) {
            Ok(f) => f,
            Err(_) => continue,
        };
        let len = match file.len() {
            Ok(l) => l,
            Err(_) => continue,
        };
        let first = match read_record_at(&file, len, 0) {
            Ok(Some((RecordKind::JH, payload, _))) => payload,
            _ => continue,
        };
        let jh = match JhPayload::decode(&first) {
            Ok(jh) => jh,
            Err(_) => continue,
        };
        if jh.block_address == index * jh.block_size && jh.base_address <= jh.block_address {
            return Some((*index, jh));
        }
        warn!(
            "journal file {:?} carries an inconsistent header, skipping",
            path
        );
    }
    None
}

/// Scan the journal, rebuild the page and transaction maps, install
/// them, and reseed the timestamp allocator. Runs before any
/// background thread starts and before the tree catalog loads.
pub fn scan_and_resume(journal_dir: &Path) -> Result<RecoveredState, StoreError> {
    let files = journal_files(journal_dir);
    if files.is_empty() {
        Database::journal_manager()
            .resume(0, 0, Checkpoint::none(), PageMap::new());
        return Ok(RecoveredState::empty());
    }

    let (keystone_index, keystone_jh) = find_keystone(&files).ok_or_else(|| {
        StoreError::corrupt_journal("no journal file begins with a usable header")
    })?;
    let block_size = keystone_jh.block_size;
    let configured = Database::journal_manager().block_size();
    if block_size != configured {
        return Err(StoreError::corrupt_journal(&format!(
            "journal block size changed: files use {}, configuration says {}",
            block_size, configured
        )));
    }

    let mut page_map = PageMap::new();
    let mut checkpoint = Checkpoint {
        timestamp: keystone_jh.checkpoint_ts,
        addr: keystone_jh.checkpoint_addr,
    };
    let mut base_address = keystone_jh.base_address;
    let mut accumulators: Vec<AccumSnapshot> = Vec::new();
    let mut txs: BTreeMap<Timestamp, RecoveredTx> = BTreeMap::new();
    let mut missing_volumes: BTreeSet<u32> = BTreeSet::new();
    let mut end_addr = keystone_index * block_size;
    let mut tree_identities = 0usize;

    let mut expected_index = keystone_index;
    'files: for (index, path) in files.iter().filter(|(i, _)| *i >= keystone_index) {
        if *index != expected_index {
            // a hole ends the scan; later files belong to a future
            // incarnation
            break;
        }
        expected_index += 1;

        let file = MediatedFile::open(path, true)?;
        let file_len = file.len()?;
        let mut offset = 0u64;
        loop {
            let parsed = match read_record_at(&file, file_len, offset) {
                Ok(p) => p,
                Err(e) => {
                    warn!("journal scan stops at torn record: {}", e);
                    break 'files;
                }
            };
            let (kind, payload, consumed) = match parsed {
                Some(t) => t,
                None => break,
            };
            let addr = index * block_size + offset;

            match kind {
                RecordKind::JH => {
                    let jh = JhPayload::decode(&payload)?;
                    base_address = base_address.max(jh.base_address);
                }
                RecordKind::JE => {
                    end_addr = addr + consumed;
                    offset += consumed;
                    break;
                }
                RecordKind::PM => {
                    let pm = PmPayload::decode(&payload)?;
                    page_map.clear();
                    for (key, a) in pm.entries {
                        page_map.put(key, a);
                    }
                }
                RecordKind::PA => {
                    let pa = PaPayload::decode(&payload)?;
                    if Database::catalog().volume(pa.volume_id).is_none() {
                        missing_volumes.insert(pa.volume_id);
                    }
                    page_map.put(pa.key(), addr);
                }
                RecordKind::TM => {
                    // the snapshot replaces the map: entries it lacks
                    // were retired. Payloads already scanned carry
                    // over for the entries that survive.
                    let tm = TmPayload::decode(&payload)?;
                    let mut old = std::mem::take(&mut txs);
                    for e in tm.entries {
                        let status = match e.commit_ts {
                            RUNNING_MARKER => RecoveredStatus::Running,
                            ABORTED_MARKER => RecoveredStatus::Aborted,
                            cts => RecoveredStatus::Committed(cts),
                        };
                        let carried = old.remove(&e.start_ts);
                        let mvv_count = if e.mvv_count == u32::MAX {
                            tx_index::UNKNOWN_MVV_COUNT
                        } else {
                            e.mvv_count as u64
                        };
                        txs.insert(
                            e.start_ts,
                            RecoveredTx {
                                status,
                                start_addr: e.tx_addr,
                                tx_addr: e.tx_addr,
                                mvv_count: Some(mvv_count),
                                payload: carried.and_then(|c| c.payload),
                            },
                        );
                    }
                }
                RecordKind::TS => {
                    let ts = TsPayload::decode(&payload)?;
                    txs.insert(
                        ts.start_ts,
                        RecoveredTx {
                            status: RecoveredStatus::Running,
                            start_addr: addr,
                            tx_addr: 0,
                            mvv_count: None,
                            payload: None,
                        },
                    );
                }
                RecordKind::TX => {
                    let tx = TxPayload::decode(&payload)?;
                    let entry = txs.entry(tx.start_ts).or_insert(RecoveredTx {
                        status: RecoveredStatus::Running,
                        start_addr: addr,
                        tx_addr: addr,
                        mvv_count: None,
                        payload: None,
                    });
                    entry.tx_addr = addr;
                    entry.payload = Some(tx);
                }
                RecordKind::TC => {
                    let tc = TcPayload::decode(&payload)?;
                    let entry = txs.entry(tc.start_ts).or_insert(RecoveredTx {
                        status: RecoveredStatus::Running,
                        start_addr: addr,
                        tx_addr: 0,
                        mvv_count: None,
                        payload: None,
                    });
                    entry.status = if tc.commit_ts == ABORTED_MARKER {
                        RecoveredStatus::Aborted
                    } else {
                        RecoveredStatus::Committed(tc.commit_ts)
                    };
                }
                RecordKind::CP => {
                    let cp = CpPayload::decode(&payload)?;
                    checkpoint = Checkpoint {
                        timestamp: cp.timestamp,
                        addr,
                    };
                    base_address = base_address.max(cp.base_address);
                    accumulators = cp.accumulators;
                }
                RecordKind::IV => {
                    let iv = record::IvPayload::decode(&payload)?;
                    if Database::catalog().volume(iv.volume_id).is_none() {
                        missing_volumes.insert(iv.volume_id);
                    }
                }
                RecordKind::IT => {
                    let _ = record::ItPayload::decode(&payload)?;
                    tree_identities += 1;
                }
            }

            end_addr = addr + consumed;
            offset += consumed;
        }
    }

    if !missing_volumes.is_empty() {
        if Database::ignore_missing_volumes() {
            warn!(
                "dropping journal page images for missing volumes {:?}",
                missing_volumes
            );
            for (key, _) in page_map.entries() {
                if missing_volumes.contains(&key.volume_id) {
                    let addr = page_map.get(&key).unwrap();
                    page_map.copied_back(&key, addr);
                }
            }
        } else {
            return Err(StoreError::new(
                ErrorKind::RecoveryMissingVolumes,
                &format!("journal references missing volumes {:?}", missing_volumes),
            ));
        }
    }

    // newer superblock images override what the volume files hold
    for volume in Database::catalog().volumes() {
        let key = PageKey::new(volume.id(), 0);
        if let Some(addr) = page_map.get(&key) {
            let image = read_pa_image(journal_dir, block_size, addr)?;
            let header = VolumeHeader::decode(&image)?;
            volume.restore_header(header);
        }
    }

    // the live table: committed transactions after the checkpoint
    // (their redo replays), plus everything running or aborted at end
    // of journal, which is aborted either way
    let mut load = Vec::new();
    let mut committed_tail = Vec::new();
    let mut max_ts = checkpoint.timestamp;
    for (start_ts, tx) in &txs {
        max_ts = max_ts.max(*start_ts);
        match tx.status {
            RecoveredStatus::Committed(cts) => {
                max_ts = max_ts.max(cts);
                if cts > checkpoint.timestamp {
                    load.push((
                        *start_ts,
                        tx_index::TxStatus::Committed(cts),
                        tx.tx_addr.max(tx.start_addr),
                        0,
                    ));
                    match &tx.payload {
                        Some(payload) => committed_tail.push(payload.clone()),
                        None if tx.tx_addr != 0 => {
                            // the TX record predates the scanned
                            // range; read it by address
                            match read_tx_at(journal_dir, block_size, tx.tx_addr) {
                                Ok(payload) => committed_tail.push(payload),
                                Err(e) => {
                                    warn!(
                                        "redo of transaction {} unavailable: {}",
                                        start_ts, e
                                    );
                                }
                            }
                        }
                        None => {}
                    }
                }
            }
            RecoveredStatus::Running | RecoveredStatus::Aborted => {
                load.push((
                    *start_ts,
                    tx_index::TxStatus::Aborted,
                    tx.tx_addr.max(tx.start_addr),
                    tx.mvv_count.unwrap_or(tx_index::UNKNOWN_MVV_COUNT),
                ));
            }
        }
    }
    committed_tail.sort_by_key(|p| p.commit_ts);
    Database::transaction_index().load_recovered(load);

    // no timestamp may collide with anything recovered; reseed before
    // any background thread can allocate
    Database::timestamps().ensure_floor(max_ts + 1);

    Database::journal_manager()
        .resume(end_addr, base_address, checkpoint, page_map);

    info!(
        "recovery scanned journal through {}: checkpoint ts {}, {} committed to replay, {} tree identities",
        end_addr,
        checkpoint.timestamp,
        committed_tail.len(),
        tree_identities
    );
    Ok(RecoveredState {
        checkpoint,
        end_addr,
        committed_tail,
        accumulators,
    })
}

fn read_tx_at(
    journal_dir: &Path,
    block_size: u64,
    addr: JournalAddr,
) -> Result<TxPayload, StoreError> {
    let index = addr / block_size;
    let offset = addr % block_size;
    let path = crate::journal::block_file_path(journal_dir, index);
    let file = MediatedFile::open(&path, true)?;
    let len = file.len()?;
    match read_record_at(&file, len, offset)? {
        Some((RecordKind::TX, payload, _)) => TxPayload::decode(&payload),
        _ => Err(StoreError::corrupt_journal(&format!(
            "no TX record at journal address {}",
            addr
        ))),
    }
}

fn read_pa_image(
    journal_dir: &Path,
    block_size: u64,
    addr: JournalAddr,
) -> Result<Vec<u8>, StoreError> {
    let index = addr / block_size;
    let offset = addr % block_size;
    let path = crate::journal::block_file_path(journal_dir, index);
    let file = MediatedFile::open(&path, true)?;
    let len = file.len()?;
    match read_record_at(&file, len, offset)? {
        Some((RecordKind::PA, payload, _)) => Ok(PaPayload::decode(&payload)?.image),
        _ => Err(StoreError::corrupt_journal(&format!(
            "no PA record at journal address {}",
            addr
        ))),
    }
}

/// Redo the committed tail onto the recovered tree state, restore
/// accumulators, and schedule the cleanup passes that reclaim
/// everything the losers left behind. Requires the tree catalog.
pub fn replay(session: &Session, state: &RecoveredState) -> StoreResult {
    // checkpointed accumulator values first; committed deltas after
    // the checkpoint re-apply on top
    for snap in &state.accumulators {
        if let Some(tree) = Database::catalog().tree_by_id(snap.tree_id) {
            tree.accumulators()
                .restore(snap.index, AccumKind::from_u8(snap.kind)?, snap.value)?;
        }
    }

    for payload in &state.committed_tail {
        for op in &payload.ops {
            match op {
                RedoOp::Store {
                    tree_id,
                    key,
                    value,
                } => {
                    if let Some(tree) = Database::catalog().tree_by_id(*tree_id) {
                        let volume = Database::catalog()
                            .volume(tree.volume_id())
                            .ok_or_else(|| {
                                StoreError::new(ErrorKind::VolumeClosed, "volume gone in replay")
                            })?;
                        ops::store_internal(
                            session,
                            &volume,
                            &tree,
                            key,
                            Some(value.as_slice()),
                            payload.start_ts,
                        )?;
                    }
                }
                RedoOp::Delete { tree_id, key } => {
                    if let Some(tree) = Database::catalog().tree_by_id(*tree_id) {
                        let volume = Database::catalog()
                            .volume(tree.volume_id())
                            .ok_or_else(|| {
                                StoreError::new(ErrorKind::VolumeClosed, "volume gone in replay")
                            })?;
                        ops::store_internal(
                            session,
                            &volume,
                            &tree,
                            key,
                            None,
                            payload.start_ts,
                        )?;
                    }
                }
                RedoOp::Delta {
                    tree_id,
                    index,
                    kind,
                    delta,
                } => {
                    if let Some(tree) = Database::catalog().tree_by_id(*tree_id) {
                        tree.accumulators()
                            .apply(*index, AccumKind::from_u8(*kind)?, *delta);
                    }
                }
            }
        }
    }

    // schedule pruning of everything the aborted and uncommitted
    // transactions left in the trees, then their retirement
    for tree in Database::catalog().trees() {
        Database::cleanup_manager().enqueue(CleanupAction::PruneTree {
            tree_id: tree.id(),
        });
    }
    Database::cleanup_manager().enqueue(CleanupAction::RetireRecovered);
    Ok(())
}
