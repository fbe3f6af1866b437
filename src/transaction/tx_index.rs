use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use log::debug;

use crate::{
    journal::record::{TmEntry, ABORTED_MARKER, RUNNING_MARKER},
    types::{JournalAddr, Timestamp},
};

use super::mvv::VersionStatus;

/// MVV count meaning "unknown, repopulated by the post-recovery
/// sweep"; such an entry retires only through `retire_recovered`.
pub const UNKNOWN_MVV_COUNT: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TxStatus {
    Running,
    Committed(Timestamp),
    Aborted,
}

#[derive(Debug, Clone)]
struct TxEntry {
    status: TxStatus,
    /// Journal address of the TS record.
    start_addr: JournalAddr,
    /// Journal address of the TX record, 0 before commit.
    tx_addr: JournalAddr,
    /// Versions in the trees still carrying this handle.
    mvv_count: u64,
}

/// The live transaction table: start timestamp → status and
/// accounting. An entry stays until every version it installed is
/// pruned out of the trees, then it retires.
///
/// Mutations serialize on a mutex; readers resolve version handles
/// against a copy-on-write snapshot so the read path never contends
/// with begin/commit traffic.
pub struct TransactionIndex {
    inner: Mutex<HashMap<Timestamp, TxEntry>>,
    snapshot: RwLock<Arc<HashMap<Timestamp, TxStatus>>>,
}

impl TransactionIndex {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    fn republish(&self, inner: &HashMap<Timestamp, TxEntry>) {
        let snap: HashMap<Timestamp, TxStatus> =
            inner.iter().map(|(ts, e)| (*ts, e.status)).collect();
        *self.snapshot.write().unwrap() = Arc::new(snap);
    }

    pub fn begin(&self, start_ts: Timestamp, start_addr: JournalAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(
            start_ts,
            TxEntry {
                status: TxStatus::Running,
                start_addr,
                tx_addr: 0,
                mvv_count: 0,
            },
        );
        self.republish(&inner);
    }

    pub fn set_tx_addr(&self, start_ts: Timestamp, addr: JournalAddr) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = inner.get_mut(&start_ts) {
            e.tx_addr = addr;
        }
    }

    pub fn commit(&self, start_ts: Timestamp, commit_ts: Timestamp) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = inner.get_mut(&start_ts) {
            e.status = TxStatus::Committed(commit_ts);
        }
        self.republish(&inner);
    }

    pub fn abort(&self, start_ts: Timestamp) {
        let mut inner = self.inner.lock().unwrap();
        let retire = match inner.get_mut(&start_ts) {
            Some(e) => {
                e.status = TxStatus::Aborted;
                e.mvv_count == 0
            }
            None => false,
        };
        if retire {
            inner.remove(&start_ts);
        }
        self.republish(&inner);
    }

    /// Resolve a version handle for the read path. Handles absent
    /// from the table belong to writers retired long ago.
    pub fn status(&self, handle: u64) -> VersionStatus {
        if handle == 0 {
            return VersionStatus::Retired;
        }
        let snap = Arc::clone(&self.snapshot.read().unwrap());
        match snap.get(&handle) {
            Some(TxStatus::Running) => VersionStatus::Running,
            Some(TxStatus::Committed(cts)) => VersionStatus::Committed(*cts),
            Some(TxStatus::Aborted) => VersionStatus::Aborted,
            None => VersionStatus::Retired,
        }
    }

    /// A freshly installed version carries this handle.
    pub fn register_version(&self, handle: u64) {
        if handle == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = inner.get_mut(&handle) {
            if e.mvv_count != UNKNOWN_MVV_COUNT {
                e.mvv_count += 1;
            }
        }
    }

    /// A version carrying this handle was pruned out of a tree; an
    /// entry whose count reaches zero is retired once its outcome is
    /// final.
    pub fn release_version(&self, handle: u64) {
        if handle == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let retire = match inner.get_mut(&handle) {
            Some(e) => {
                if e.mvv_count != UNKNOWN_MVV_COUNT && e.mvv_count > 0 {
                    e.mvv_count -= 1;
                }
                e.mvv_count == 0 && e.status != TxStatus::Running
            }
            None => false,
        };
        if retire {
            debug!("transaction {} retired", handle);
            inner.remove(&handle);
            self.republish(&inner);
        }
    }

    /// Drop every aborted entry after the post-recovery sweep has
    /// pruned every tree: no version carries their handles anymore,
    /// and they must not survive into the next recovery cycle.
    pub fn retire_recovered(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.retain(|_, e| e.status != TxStatus::Aborted);
        self.republish(&inner);
    }

    /// Earliest journal address still needed by a non-retired
    /// transaction: the TS record of anything running or aborted, and
    /// the TX record of commits newer than the durable checkpoint
    /// (older commits live on in checkpointed page images and need no
    /// replay).
    pub fn earliest_live_addr(&self, checkpoint_ts: Timestamp) -> Option<JournalAddr> {
        let inner = self.inner.lock().unwrap();
        inner
            .values()
            .filter_map(|e| match e.status {
                TxStatus::Running | TxStatus::Aborted => Some(e.start_addr),
                TxStatus::Committed(cts) if cts > checkpoint_ts => {
                    if e.tx_addr != 0 {
                        Some(e.tx_addr)
                    } else {
                        Some(e.start_addr)
                    }
                }
                TxStatus::Committed(_) => None,
            })
            .min()
    }

    /// Forget committed transactions no snapshot at or above `floor`
    /// can still tell apart from ancient history. Their versions then
    /// resolve as retired, which reads identically.
    pub fn retire_committed_before(&self, floor: Timestamp) {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.len();
        inner.retain(|_, e| match e.status {
            TxStatus::Committed(cts) => cts >= floor,
            _ => true,
        });
        if inner.len() != before {
            self.republish(&inner);
        }
    }

    /// Oldest running snapshot; versions below it are beyond any
    /// reader's reach and may be folded by the pruner.
    pub fn oldest_running_start(&self) -> Option<Timestamp> {
        let inner = self.inner.lock().unwrap();
        inner
            .iter()
            .filter(|(_, e)| e.status == TxStatus::Running)
            .map(|(ts, _)| *ts)
            .min()
    }

    pub fn tm_entries(&self) -> Vec<TmEntry> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<TmEntry> = inner
            .iter()
            .map(|(ts, e)| TmEntry {
                start_ts: *ts,
                commit_ts: match e.status {
                    TxStatus::Running => RUNNING_MARKER,
                    TxStatus::Committed(cts) => cts,
                    TxStatus::Aborted => ABORTED_MARKER,
                },
                tx_addr: if e.tx_addr != 0 {
                    e.tx_addr
                } else {
                    e.start_addr
                },
                mvv_count: if e.mvv_count == UNKNOWN_MVV_COUNT {
                    u32::MAX
                } else {
                    e.mvv_count.min(u32::MAX as u64 - 1) as u32
                },
            })
            .collect();
        entries.sort_by_key(|e| e.start_ts);
        entries
    }

    /// Install the table recovery rebuilt. An aborted transaction
    /// whose versions were already pruned (count zero) is not
    /// resurrected.
    pub fn load_recovered(&self, entries: Vec<(Timestamp, TxStatus, JournalAddr, u64)>) {
        let mut inner = self.inner.lock().unwrap();
        inner.clear();
        for (start_ts, status, tx_addr, mvv_count) in entries {
            if status == TxStatus::Aborted && mvv_count == 0 {
                continue;
            }
            inner.insert(
                start_ts,
                TxEntry {
                    status,
                    start_addr: tx_addr,
                    tx_addr,
                    mvv_count,
                },
            );
        }
        self.republish(&inner);
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.clear();
        self.republish(&inner);
    }
}
