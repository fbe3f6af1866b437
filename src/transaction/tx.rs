use core::fmt;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use log::debug;

use crate::{
    config::CommitPolicy,
    database::Database,
    error::{ErrorKind, StoreError},
    journal::record::{
        RecordKind, RedoOp, TcPayload, TsPayload, TxPayload, ABORTED_MARKER,
    },
    types::{StoreResult, Timestamp, TreeId},
};

use super::accumulator::AccumKind;

/// How many `Rollback`s a commit-retry loop tolerates before the
/// failure surfaces as `TransactionFailed`.
pub const COMMIT_RETRY_LIMIT: u32 = 10;

/// One transaction. Writes install MVV versions under the start
/// timestamp as they happen and buffer their redo here; commit
/// journals the redo (TX) and the outcome (TC), then publishes the
/// commit timestamp through the live transaction table.
///
/// A transaction is used by a single thread.
pub struct Transaction {
    start_ts: Timestamp,
    redo: Mutex<Vec<RedoOp>>,
    completed: AtomicBool,
}

impl Transaction {
    pub fn new() -> Self {
        let start_ts = Database::timestamps().allocate();
        let payload = TsPayload { start_ts }.encode();
        let start_addr = Database::journal_manager()
            .append_record(RecordKind::TS, &payload)
            .unwrap();
        Database::transaction_index().begin(start_ts, start_addr);
        debug!("transaction {} begun", start_ts);
        Self {
            start_ts,
            redo: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
        }
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// Snapshot timestamp for reads: repeatable read at the start
    /// timestamp.
    pub fn snapshot(&self) -> Timestamp {
        self.start_ts
    }

    pub(crate) fn buffer_store(&self, tree_id: TreeId, key: &[u8], value: &[u8]) {
        self.redo.lock().unwrap().push(RedoOp::Store {
            tree_id,
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    pub(crate) fn buffer_delete(&self, tree_id: TreeId, key: &[u8]) {
        self.redo.lock().unwrap().push(RedoOp::Delete {
            tree_id,
            key: key.to_vec(),
        });
    }

    /// Record an accumulator delta; merged into the live value only
    /// at commit.
    pub fn update_accumulator(&self, tree_id: TreeId, index: u8, kind: AccumKind, delta: i64) {
        self.redo.lock().unwrap().push(RedoOp::Delta {
            tree_id,
            index,
            kind: kind.to_u8(),
            delta,
        });
    }

    fn complete(&self) -> StoreResult {
        if self.completed.swap(true, Ordering::SeqCst) {
            return Err(StoreError::new(
                ErrorKind::TransactionFailed,
                &format!("transaction {} already completed", self.start_ts),
            ));
        }
        Ok(())
    }

    /// Commit under the engine's default policy.
    pub fn commit(&self) -> StoreResult {
        self.commit_with(Database::commit_policy())
    }

    pub fn commit_with(&self, policy: CommitPolicy) -> StoreResult {
        self.complete()?;
        let redo: Vec<RedoOp> = std::mem::take(&mut *self.redo.lock().unwrap());
        let commit_ts = Database::timestamps().allocate();

        // step 1: journal the redo, then the commit record. An I/O
        // failure on this path aborts the transaction and surfaces as
        // a rollback with the cause attached.
        let journaled = (|| -> StoreResult {
            if !redo.is_empty() {
                let payload = TxPayload {
                    start_ts: self.start_ts,
                    commit_ts,
                    ops: redo.clone(),
                }
                .encode();
                let tx_addr =
                    Database::journal_manager().append_record(RecordKind::TX, &payload)?;
                Database::transaction_index().set_tx_addr(self.start_ts, tx_addr);
            }
            let tc = TcPayload {
                start_ts: self.start_ts,
                commit_ts,
            }
            .encode();
            Database::journal_manager().append_record(RecordKind::TC, &tc)?;
            Ok(())
        })();
        if let Err(e) = journaled {
            Database::transaction_index().abort(self.start_ts);
            return Err(StoreError::new(
                ErrorKind::Rollback,
                &format!("commit of transaction {} failed: {}", self.start_ts, e),
            ));
        }
        let end = Database::journal_manager().current_address();

        // step 2: make the TC record as durable as the policy demands
        match policy {
            CommitPolicy::Hard => Database::journal_manager().force()?,
            CommitPolicy::Group => {
                let patience = Database::flush_interval() * 2;
                Database::journal_manager().wait_durable(end, patience)?;
            }
            CommitPolicy::Soft => {}
        }

        // step 3: merge accumulator deltas into the live values
        for op in &redo {
            if let RedoOp::Delta {
                tree_id,
                index,
                kind,
                delta,
            } = op
            {
                if let Some(tree) = Database::catalog().tree_by_id(*tree_id) {
                    tree.accumulators()
                        .apply(*index, AccumKind::from_u8(*kind)?, *delta);
                }
            }
        }

        // step 4: publish the outcome; versions installed under the
        // start timestamp become visible at commit_ts
        Database::transaction_index().commit(self.start_ts, commit_ts);
        debug!("transaction {} committed at {}", self.start_ts, commit_ts);
        Ok(())
    }

    /// Abort: journal a TC-ABORT, flip the live-table entry, and
    /// schedule the installed versions for pruning. The versions stay
    /// invisible from the moment the entry flips.
    pub fn rollback(&self) -> StoreResult {
        self.complete()?;
        let tc = TcPayload {
            start_ts: self.start_ts,
            commit_ts: ABORTED_MARKER,
        }
        .encode();
        Database::journal_manager().append_record(RecordKind::TC, &tc)?;
        Database::transaction_index().abort(self.start_ts);

        let redo: Vec<RedoOp> = std::mem::take(&mut *self.redo.lock().unwrap());
        for op in redo {
            match op {
                RedoOp::Store { tree_id, key, .. } | RedoOp::Delete { tree_id, key } => {
                    Database::cleanup_manager().enqueue_prune_key(tree_id, key);
                }
                RedoOp::Delta { .. } => {
                    // never merged, never journaled: nothing to undo
                }
            }
        }
        debug!("transaction {} rolled back", self.start_ts);
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.is_completed() {
            // an abandoned transaction aborts
            let _ = self.rollback();
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.start_ts)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// Run `body` in a fresh transaction, retrying on `Rollback` up to
/// the commit-retry limit; beyond it the error surfaces as
/// `TransactionFailed`.
pub fn run_transaction<T, F>(mut body: F) -> Result<T, StoreError>
where
    F: FnMut(&Transaction) -> Result<T, StoreError>,
{
    let mut rollbacks = 0;
    loop {
        let tx = Transaction::new();
        match body(&tx).and_then(|out| tx.commit().map(|_| out)) {
            Ok(out) => return Ok(out),
            Err(e) if e.is_rollback() => {
                if !tx.is_completed() {
                    tx.rollback()?;
                }
                rollbacks += 1;
                if rollbacks >= COMMIT_RETRY_LIMIT {
                    return Err(StoreError::new(
                        ErrorKind::TransactionFailed,
                        &format!("transaction failed after {} rollbacks", rollbacks),
                    ));
                }
            }
            Err(e) => {
                if !tx.is_completed() {
                    tx.rollback()?;
                }
                return Err(e);
            }
        }
    }
}
