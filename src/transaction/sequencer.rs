use std::{sync::Mutex, thread::sleep, time::Duration};

use log::debug;

use crate::error::{ErrorKind, StoreError};

/// Bounded write-write conflict retries before the writer gives up
/// with `Rollback`.
pub const WW_RETRY_LIMIT: u32 = 50;

const WW_BACKOFF: Duration = Duration::from_millis(2);

type Gate = Box<dyn Fn(u32) + Send>;

/// Orchestrates the wait-and-recheck dance after a write-write
/// conflict. The writer releases every latch before calling in, and
/// carries no store state (in particular no long-record pointer)
/// across the retry; whatever the attempt allocated dies with the
/// attempt.
///
/// Tests install a gate to interleave conflicting writers
/// deterministically.
pub struct WwSequencer {
    gate: Mutex<Option<Gate>>,
}

impl WwSequencer {
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(None),
        }
    }

    /// Wait before re-attempting a conflicted store. Fails with
    /// `Rollback` once the retry budget is spent.
    pub fn await_retry(&self, attempt: u32, conflicting: u64) -> Result<(), StoreError> {
        if attempt >= WW_RETRY_LIMIT {
            return Err(StoreError::new(
                ErrorKind::Rollback,
                &format!(
                    "write-write conflict with transaction {} persisted after {} retries",
                    conflicting, attempt
                ),
            ));
        }
        debug!(
            "ww conflict with transaction {}, retry {}",
            conflicting, attempt
        );
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate(attempt);
        }
        sleep(WW_BACKOFF);
        Ok(())
    }

    /// Install (or clear) the test gate.
    pub fn set_gate(&self, gate: Option<Gate>) {
        *self.gate.lock().unwrap() = gate;
    }
}
