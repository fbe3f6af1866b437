use std::{collections::HashMap, sync::Mutex};

use crate::{
    error::{ErrorKind, StoreError},
    journal::record::AccumSnapshot,
    types::TreeId,
};

/// Commutative per-tree aggregate kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumKind {
    Sum,
    Min,
    Max,
    /// Monotonic sequence allocation; merges like SUM, recovers by
    /// taking the maximum so an allocation is never reissued.
    Seq,
}

impl AccumKind {
    pub fn to_u8(self) -> u8 {
        match self {
            AccumKind::Sum => 1,
            AccumKind::Min => 2,
            AccumKind::Max => 3,
            AccumKind::Seq => 4,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, StoreError> {
        match v {
            1 => Ok(AccumKind::Sum),
            2 => Ok(AccumKind::Min),
            3 => Ok(AccumKind::Max),
            4 => Ok(AccumKind::Seq),
            _ => Err(StoreError::new(
                ErrorKind::Conversion,
                &format!("unrecognized accumulator kind: {}", v),
            )),
        }
    }

    fn identity(self) -> i64 {
        match self {
            AccumKind::Sum | AccumKind::Seq => 0,
            AccumKind::Min => i64::MAX,
            AccumKind::Max => i64::MIN,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    kind: AccumKind,
    live: i64,
}

/// The live accumulator values of one tree, merged from committed
/// transaction deltas. Deltas of a transaction that never commits
/// never reach this structure (and never reach the journal), so an
/// aborted delta cannot survive a restart.
pub struct AccumulatorSet {
    accums: Mutex<HashMap<u8, Accumulator>>,
}

impl AccumulatorSet {
    pub fn new() -> Self {
        Self {
            accums: Mutex::new(HashMap::new()),
        }
    }

    /// Merge one committed delta.
    pub fn apply(&self, index: u8, kind: AccumKind, delta: i64) {
        let mut accums = self.accums.lock().unwrap();
        let accum = accums.entry(index).or_insert(Accumulator {
            kind,
            live: kind.identity(),
        });
        accum.live = match kind {
            AccumKind::Sum | AccumKind::Seq => accum.live.wrapping_add(delta),
            AccumKind::Min => accum.live.min(delta),
            AccumKind::Max => accum.live.max(delta),
        };
    }

    pub fn value(&self, index: u8) -> Option<i64> {
        self.accums.lock().unwrap().get(&index).map(|a| a.live)
    }

    pub fn snapshot(&self, tree_id: TreeId) -> Vec<AccumSnapshot> {
        let accums = self.accums.lock().unwrap();
        let mut out: Vec<AccumSnapshot> = accums
            .iter()
            .map(|(index, a)| AccumSnapshot {
                tree_id,
                index: *index,
                kind: a.kind.to_u8(),
                value: a.live,
            })
            .collect();
        out.sort_by_key(|s| s.index);
        out
    }

    /// Restore a checkpointed value exactly. SEQ takes the maximum
    /// of snapshot and anything already replayed, so recovery cannot
    /// move a sequence backwards.
    pub fn restore(&self, index: u8, kind: AccumKind, value: i64) -> Result<(), StoreError> {
        let mut accums = self.accums.lock().unwrap();
        match accums.get_mut(&index) {
            Some(a) if a.kind == kind && kind == AccumKind::Seq => {
                a.live = a.live.max(value);
            }
            _ => {
                accums.insert(index, Accumulator { kind, live: value });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_semantics() {
        let set = AccumulatorSet::new();
        set.apply(0, AccumKind::Sum, 5);
        set.apply(0, AccumKind::Sum, -2);
        assert_eq!(set.value(0), Some(3));

        set.apply(1, AccumKind::Min, 9);
        set.apply(1, AccumKind::Min, 4);
        assert_eq!(set.value(1), Some(4));

        set.apply(2, AccumKind::Max, 9);
        set.apply(2, AccumKind::Max, 4);
        assert_eq!(set.value(2), Some(9));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let set = AccumulatorSet::new();
        set.apply(0, AccumKind::Sum, 7);
        let snaps = set.snapshot(3);
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].value, 7);

        let restored = AccumulatorSet::new();
        restored
            .restore(snaps[0].index, AccumKind::from_u8(snaps[0].kind).unwrap(), snaps[0].value)
            .unwrap();
        assert_eq!(restored.value(0), Some(7));
    }

    #[test]
    fn test_seq_restore_never_regresses() {
        let set = AccumulatorSet::new();
        set.apply(0, AccumKind::Seq, 100);
        set.restore(0, AccumKind::Seq, 60).unwrap();
        assert_eq!(set.value(0), Some(100));
        set.restore(0, AccumKind::Seq, 150).unwrap();
        assert_eq!(set.value(0), Some(150));
    }
}
