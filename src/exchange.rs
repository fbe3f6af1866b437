use std::sync::Arc;

use crate::{
    btree::{
        ops::{self, CursorPos, Direction},
        tree, Tree,
    },
    buffer::Session,
    database::Database,
    error::StoreError,
    transaction::Transaction,
    types::{StoreResult, VolumeId},
    volume::Volume,
};

/// A cursor over one tree: the engine's entire public data surface.
///
/// An exchange carries a key position (possibly the BEFORE/AFTER
/// sentinels), the value of the last successful fetch or traversal,
/// and the claim-timeout session its page latches run under.
///
/// Reads outside a transaction see the latest committed state; inside
/// one they see the transaction's snapshot plus its own writes.
pub struct Exchange {
    volume: Arc<Volume>,
    tree: Arc<Tree>,
    session: Session,
    position: CursorPos,
    value: Option<Vec<u8>>,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("position", &self.position)
            .field("value", &self.value)
            .finish()
    }
}

impl Exchange {
    /// Open an exchange on `(volume, tree_name)`, optionally creating
    /// the tree.
    pub fn new(
        volume_id: VolumeId,
        tree_name: &str,
        create_if_absent: bool,
    ) -> Result<Self, StoreError> {
        let volume = Database::catalog().volume(volume_id).ok_or_else(|| {
            StoreError::new(
                crate::error::ErrorKind::VolumeNotFound,
                &format!("no open volume with id {}", volume_id),
            )
        })?;
        let session = Session::new(Database::claim_timeout());

        let existing = Database::catalog().tree(volume_id, tree_name);
        let tree = match existing {
            Some(t) => t,
            None if create_if_absent => tree::create_tree(&session, &volume, tree_name)?,
            None => {
                return Err(StoreError::new(
                    crate::error::ErrorKind::TreeNotFound,
                    &format!("no such tree: {}", tree_name),
                ))
            }
        };

        Ok(Self {
            volume,
            tree,
            session,
            position: CursorPos::Before,
            value: None,
        })
    }

    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Give this exchange its own claim timeout instead of the
    /// engine default.
    pub fn set_timeout(&mut self, timeout: std::time::Duration) {
        self.session = Session::new(timeout);
    }

    // ------------------------------------------------------------------
    // cursor position
    // ------------------------------------------------------------------

    pub fn to(&mut self, key: &[u8]) -> &mut Self {
        self.position = CursorPos::Key(key.to_vec());
        self
    }

    pub fn to_before(&mut self) -> &mut Self {
        self.position = CursorPos::Before;
        self
    }

    pub fn to_after(&mut self) -> &mut Self {
        self.position = CursorPos::After;
        self
    }

    pub fn position(&self) -> &CursorPos {
        &self.position
    }

    pub fn is_before(&self) -> bool {
        self.position == CursorPos::Before
    }

    pub fn is_after(&self) -> bool {
        self.position == CursorPos::After
    }

    /// The key under the cursor, when it is not a sentinel.
    pub fn key(&self) -> Option<&[u8]> {
        match &self.position {
            CursorPos::Key(k) => Some(k),
            _ => None,
        }
    }

    /// The value of the last fetch or traversal hit.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    fn current_key(&self) -> Result<&[u8], StoreError> {
        self.key().ok_or_else(|| {
            StoreError::new(
                crate::error::ErrorKind::Conversion,
                "the cursor is at a sentinel position",
            )
        })
    }

    // ------------------------------------------------------------------
    // reads
    // ------------------------------------------------------------------

    /// Fetch the cursor key outside any transaction: latest committed
    /// state.
    pub fn fetch(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        let key = self.current_key()?.to_vec();
        let found = ops::fetch(
            &self.session,
            &self.volume,
            &self.tree,
            &key,
            Database::timestamps().current(),
            None,
        )?;
        self.value = found.clone();
        Ok(found)
    }

    /// Fetch under a transaction's snapshot; the transaction's own
    /// writes are visible.
    pub fn fetch_tx(&mut self, tx: &Transaction) -> Result<Option<Vec<u8>>, StoreError> {
        let key = self.current_key()?.to_vec();
        let found = ops::fetch(
            &self.session,
            &self.volume,
            &self.tree,
            &key,
            tx.snapshot(),
            Some(tx.start_ts()),
        )?;
        self.value = found.clone();
        Ok(found)
    }

    // ------------------------------------------------------------------
    // writes
    // ------------------------------------------------------------------

    /// Store the value at the cursor key within `tx`. The version is
    /// installed immediately under the transaction's start timestamp
    /// and becomes visible to others at commit.
    pub fn store(&mut self, tx: &Transaction, value: &[u8]) -> StoreResult {
        let key = self.current_key()?.to_vec();
        ops::store_internal(
            &self.session,
            &self.volume,
            &self.tree,
            &key,
            Some(value),
            tx.start_ts(),
        )?;
        tx.buffer_store(self.tree.id(), &key, value);
        Ok(())
    }

    /// Mark the cursor key removed within `tx`.
    pub fn remove(&mut self, tx: &Transaction) -> StoreResult {
        let key = self.current_key()?.to_vec();
        ops::store_internal(
            &self.session,
            &self.volume,
            &self.tree,
            &key,
            None,
            tx.start_ts(),
        )?;
        tx.buffer_delete(self.tree.id(), &key);
        Ok(())
    }

    /// Non-transactional store: the value is immediately the latest
    /// committed state. Durability still flows through the journal's
    /// page images.
    pub fn store_direct(&mut self, value: &[u8]) -> StoreResult {
        let key = self.current_key()?.to_vec();
        ops::store_internal(
            &self.session,
            &self.volume,
            &self.tree,
            &key,
            Some(value),
            crate::transaction::mvv::PRIMORDIAL_HANDLE,
        )
    }

    /// Non-transactional remove; physically erases the record.
    pub fn remove_direct(&mut self) -> StoreResult {
        let key = self.current_key()?.to_vec();
        ops::store_internal(
            &self.session,
            &self.volume,
            &self.tree,
            &key,
            None,
            crate::transaction::mvv::PRIMORDIAL_HANDLE,
        )
    }

    /// Delete every key of the tree, reclaiming its pages.
    pub fn remove_all(&mut self) -> StoreResult {
        tree::truncate_tree(&self.session, &self.volume, &self.tree)?;
        self.position = CursorPos::Before;
        self.value = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // traversal
    // ------------------------------------------------------------------

    /// Step the cursor in `direction`. On a hit the cursor moves to
    /// the found key (value retained). On a miss false is returned
    /// and the cursor comes to rest at the restart edge for its
    /// direction: BEFORE after a forward miss, AFTER after a backward
    /// one; a sentinel start stays where it is.
    pub fn traverse(&mut self, direction: Direction, skip_deleted: bool) -> Result<bool, StoreError> {
        self.traverse_at(direction, skip_deleted, Database::timestamps().current(), None)
    }

    pub fn traverse_tx(
        &mut self,
        tx: &Transaction,
        direction: Direction,
        skip_deleted: bool,
    ) -> Result<bool, StoreError> {
        self.traverse_at(direction, skip_deleted, tx.snapshot(), Some(tx.start_ts()))
    }

    fn traverse_at(
        &mut self,
        direction: Direction,
        skip_deleted: bool,
        snapshot: u64,
        own: Option<u64>,
    ) -> Result<bool, StoreError> {
        let hit = ops::traverse(
            &self.session,
            &self.volume,
            &self.tree,
            &self.position,
            direction,
            skip_deleted,
            snapshot,
            own,
        )?;
        match hit {
            Some((key, value)) => {
                self.position = CursorPos::Key(key);
                self.value = value;
                Ok(true)
            }
            None => {
                // an unsuccessful traverse from a concrete key rests
                // at the restart edge for its direction; a sentinel
                // start stays put
                self.position = match (&self.position, direction.forward()) {
                    (CursorPos::Before, _) => CursorPos::Before,
                    (CursorPos::After, _) => CursorPos::After,
                    (CursorPos::Key(_), true) => CursorPos::Before,
                    (CursorPos::Key(_), false) => CursorPos::After,
                };
                self.value = None;
                Ok(false)
            }
        }
    }
}

/// Drop a tree by name, reclaiming its pages.
pub fn remove_tree(volume_id: VolumeId, tree_name: &str) -> StoreResult {
    let volume = Database::catalog().volume(volume_id).ok_or_else(|| {
        StoreError::new(
            crate::error::ErrorKind::VolumeNotFound,
            &format!("no open volume with id {}", volume_id),
        )
    })?;
    let tree = Database::catalog().tree(volume_id, tree_name).ok_or_else(|| {
        StoreError::new(
            crate::error::ErrorKind::TreeNotFound,
            &format!("no such tree: {}", tree_name),
        )
    })?;
    let session = Session::new(Database::claim_timeout());
    tree::drop_tree(&session, &volume, &tree)
}

/// Build a composite key from raw segments. Each segment is appended
/// with a terminator so that `(a)` orders before `(a, b)` and no
/// segment is a prefix of a sibling's encoding.
pub fn composite_key(segments: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for seg in segments {
        for b in *seg {
            // escape the terminator byte
            if *b == 0x00 {
                out.push(0x00);
                out.push(0xFF);
            } else {
                out.push(*b);
            }
        }
        out.push(0x00);
        out.push(0x00);
    }
    out
}

/// A big-endian u64 segment, ordering numerically.
pub fn number_segment(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}
