use crate::error::{ErrorKind, StoreError};

use super::key_block::KeyBlock;

/// In-memory companion of a tree page: the elided-byte count of every
/// key block, in slot order. Lets key location decide most
/// comparisons without touching key bytes. Rebuilt when a page is
/// loaded, maintained incrementally on single-slot mutation, and
/// never persisted.
#[derive(Debug, Clone, Default)]
pub struct FastIndex {
    ebcs: Vec<u16>,
}

impl FastIndex {
    pub fn new() -> Self {
        Self { ebcs: Vec::new() }
    }

    pub fn rebuild(records: &[KeyBlock]) -> Self {
        Self {
            ebcs: records.iter().map(|r| r.ebc as u16).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ebcs.len()
    }

    pub fn ebc(&self, slot: usize) -> usize {
        self.ebcs[slot] as usize
    }

    pub fn insert(&mut self, slot: usize, ebc: usize) -> Result<(), StoreError> {
        if slot > self.ebcs.len() {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                &format!("fast index insert out of range: {} > {}", slot, self.ebcs.len()),
            ));
        }
        self.ebcs.insert(slot, ebc as u16);
        Ok(())
    }

    pub fn remove(&mut self, slot: usize) -> Result<(), StoreError> {
        if slot >= self.ebcs.len() {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                &format!("fast index remove out of range: {} >= {}", slot, self.ebcs.len()),
            ));
        }
        self.ebcs.remove(slot);
        Ok(())
    }

    pub fn set(&mut self, slot: usize, ebc: usize) -> Result<(), StoreError> {
        if slot >= self.ebcs.len() {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                &format!("fast index set out of range: {} >= {}", slot, self.ebcs.len()),
            ));
        }
        self.ebcs[slot] = ebc as u16;
        Ok(())
    }

    /// Check the structural invariant: slot 0 elides nothing, and
    /// every other slot elides at most the full predecessor key.
    pub fn validate(&self, records: &[KeyBlock]) -> Result<(), StoreError> {
        if self.ebcs.len() != records.len() {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                "fast index length does not match key block count",
            ));
        }
        let mut prev_key_len = 0usize;
        for (i, r) in records.iter().enumerate() {
            if self.ebc(i) != r.ebc {
                return Err(StoreError::new(
                    ErrorKind::InvalidPageStructure,
                    &format!("fast index disagrees with key block {}", i),
                ));
            }
            if i == 0 {
                if r.ebc != 0 {
                    return Err(StoreError::new(
                        ErrorKind::InvalidPageStructure,
                        "first key block has a nonzero elided count",
                    ));
                }
            } else if r.ebc > prev_key_len {
                return Err(StoreError::new(
                    ErrorKind::InvalidPageStructure,
                    &format!(
                        "key block {} elides {} bytes but predecessor key is {} bytes",
                        i, r.ebc, prev_key_len
                    ),
                ));
            }
            prev_key_len = r.ebc + r.suffix.len();
        }
        Ok(())
    }
}
