use core::fmt;
use std::{
    convert::TryInto,
    sync::{Arc, Mutex},
};

use log::{debug, info};

use crate::{
    buffer::Session,
    database::Database,
    error::{ErrorKind, StoreError},
    journal::record::{ItPayload, RecordKind},
    page::Page,
    transaction::{mvv::PRIMORDIAL_HANDLE, AccumulatorSet},
    types::{PageAddr, StoreResult, TreeId, VolumeId},
    volume::{garbage, Volume},
};

use super::ops;

/// Reserved id of every volume's directory tree (the tree of trees).
pub const DIRECTORY_TREE_ID: TreeId = 0;

/// One B+ tree: a name in a volume, a root page, and its
/// accumulators. The root moves when the root page splits or the
/// tree collapses a level; `persist_root` writes the move down.
pub struct Tree {
    id: TreeId,
    name: String,
    volume_id: VolumeId,
    root: Mutex<PageAddr>,
    accumulators: AccumulatorSet,
}

impl Tree {
    pub fn new(id: TreeId, name: &str, volume_id: VolumeId, root: PageAddr) -> Self {
        Self {
            id,
            name: name.to_string(),
            volume_id,
            root: Mutex::new(root),
            accumulators: AccumulatorSet::new(),
        }
    }

    pub fn id(&self) -> TreeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    pub fn root(&self) -> PageAddr {
        *self.root.lock().unwrap()
    }

    pub fn is_directory(&self) -> bool {
        self.id == DIRECTORY_TREE_ID
    }

    pub fn accumulators(&self) -> &AccumulatorSet {
        &self.accumulators
    }

    /// Swing the root pointer, but only if nobody moved it first.
    pub fn compare_and_set_root(&self, expected: PageAddr, new_root: PageAddr) -> bool {
        let mut root = self.root.lock().unwrap();
        if *root == expected {
            *root = new_root;
            true
        } else {
            false
        }
    }

    pub(crate) fn set_root(&self, new_root: PageAddr) {
        *self.root.lock().unwrap() = new_root;
    }

    /// Make the current root durable: the directory tree records it
    /// for user trees, the superblock records it for the directory
    /// tree itself.
    pub fn persist_root(&self, session: &Session) -> StoreResult {
        let volume = volume_of(self.volume_id)?;
        let root = self.root();
        if self.is_directory() {
            volume.header().directory_root = root;
            Database::journal_superblock(&volume)?;
        } else {
            let directory = Database::catalog().directory_tree(self.volume_id)?;
            let entry = directory_value(self.id, root);
            ops::store_internal(
                session,
                &volume,
                &directory,
                self.name.as_bytes(),
                Some(entry.as_slice()),
                PRIMORDIAL_HANDLE,
            )?;
        }
        Ok(())
    }
}

impl fmt::Display for Tree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<tree {}, id: {}, volume: {}, root: {}>",
            self.name,
            self.id,
            self.volume_id,
            self.root()
        )
    }
}

fn volume_of(volume_id: VolumeId) -> Result<Arc<Volume>, StoreError> {
    Database::catalog().volume(volume_id).ok_or_else(|| {
        StoreError::new(
            ErrorKind::VolumeClosed,
            &format!("volume {} is not open", volume_id),
        )
    })
}

/// Directory entry payload: tree id then root page address.
pub fn directory_value(tree_id: TreeId, root: PageAddr) -> Vec<u8> {
    let mut v = Vec::with_capacity(12);
    v.extend_from_slice(&tree_id.to_le_bytes());
    v.extend_from_slice(&root.to_le_bytes());
    v
}

pub fn parse_directory_value(bytes: &[u8]) -> Result<(TreeId, PageAddr), StoreError> {
    if bytes.len() != 12 {
        return Err(StoreError::new(
            ErrorKind::MalformedValue,
            &format!("directory entry of {} bytes", bytes.len()),
        ));
    }
    Ok((
        u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        u64::from_le_bytes(bytes[4..12].try_into().unwrap()),
    ))
}

/// The volume's directory tree, creating its root on first use.
pub fn directory_tree(session: &Session, volume: &Arc<Volume>) -> Result<Arc<Tree>, StoreError> {
    let root = volume.header().directory_root;
    if root != 0 {
        return Ok(Arc::new(Tree::new(
            DIRECTORY_TREE_ID,
            "_directory",
            volume.id(),
            root,
        )));
    }

    let root = create_empty_root(session, volume)?;
    volume.header().directory_root = root;
    Database::journal_superblock(volume)?;
    debug!("volume {}: directory tree created at {}", volume.id(), root);
    Ok(Arc::new(Tree::new(
        DIRECTORY_TREE_ID,
        "_directory",
        volume.id(),
        root,
    )))
}

fn create_empty_root(session: &Session, volume: &Arc<Volume>) -> Result<PageAddr, StoreError> {
    let addr = garbage::allocate_page(session, volume)?;
    let mut page = Page::new_data(volume.page_size());
    page.set_timestamp(Database::timestamps().current());
    let _guard = Database::buffer_pool().install(session, volume, addr, page)?;
    Ok(addr)
}

/// Create a tree. Fails with `TreeAlreadyExists` when the name is
/// taken.
pub fn create_tree(
    session: &Session,
    volume: &Arc<Volume>,
    name: &str,
) -> Result<Arc<Tree>, StoreError> {
    if Database::catalog().tree(volume.id(), name).is_some() {
        return Err(StoreError::new(
            ErrorKind::TreeAlreadyExists,
            &format!("tree already exists: {}", name),
        ));
    }
    let directory = Database::catalog().directory_tree(volume.id())?;
    if lookup_tree(session, volume, &directory, name)?.is_some() {
        return Err(StoreError::new(
            ErrorKind::TreeAlreadyExists,
            &format!("tree already exists: {}", name),
        ));
    }

    let id = Database::catalog().next_tree_id();
    let root = create_empty_root(session, volume)?;
    let entry = directory_value(id, root);
    ops::store_internal(
        session,
        volume,
        &directory,
        name.as_bytes(),
        Some(entry.as_slice()),
        PRIMORDIAL_HANDLE,
    )?;

    let payload = ItPayload {
        tree_id: id,
        volume_id: volume.id(),
        name: name.to_string(),
    }
    .encode();
    Database::journal_manager().append_record(RecordKind::IT, &payload)?;

    let tree = Arc::new(Tree::new(id, name, volume.id(), root));
    Database::catalog().register_tree(Arc::clone(&tree));
    info!("created tree {} (id {}) in volume {}", name, id, volume.id());
    Ok(tree)
}

fn lookup_tree(
    session: &Session,
    volume: &Arc<Volume>,
    directory: &Tree,
    name: &str,
) -> Result<Option<(TreeId, PageAddr)>, StoreError> {
    let found = ops::fetch(
        session,
        volume,
        directory,
        name.as_bytes(),
        Database::timestamps().current(),
        None,
    )?;
    match found {
        Some(bytes) => Ok(Some(parse_directory_value(&bytes)?)),
        None => Ok(None),
    }
}

/// Load every tree recorded in the volume's directory.
pub fn load_trees(session: &Session, volume: &Arc<Volume>) -> Result<Vec<Arc<Tree>>, StoreError> {
    if volume.header().directory_root == 0 {
        return Ok(Vec::new());
    }
    let directory = Database::catalog().directory_tree(volume.id())?;
    let snapshot = Database::timestamps().current();

    let mut trees = Vec::new();
    let mut pos = ops::CursorPos::Before;
    loop {
        let next = ops::traverse(
            session,
            volume,
            &directory,
            &pos,
            ops::Direction::Gt,
            true,
            snapshot,
            None,
        )?;
        match next {
            Some((key, Some(value))) => {
                let (id, root) = parse_directory_value(&value)?;
                let name = String::from_utf8(key.clone()).map_err(|_| {
                    StoreError::new(ErrorKind::MalformedValue, "tree name is not utf-8")
                })?;
                trees.push(Arc::new(Tree::new(id, &name, volume.id(), root)));
                pos = ops::CursorPos::Key(key);
            }
            Some((key, None)) => {
                pos = ops::CursorPos::Key(key);
            }
            None => break,
        }
    }
    Ok(trees)
}

/// Drop a tree, reclaiming every page it owns through the garbage
/// chain.
pub fn drop_tree(session: &Session, volume: &Arc<Volume>, tree: &Arc<Tree>) -> StoreResult {
    let directory = Database::catalog().directory_tree(volume.id())?;

    let pages = ops::collect_tree_pages(session, volume, tree)?;
    // the directory entry goes first: a crash mid-reclaim must not
    // leave a tree pointing into the garbage chain
    ops::store_internal(
        session,
        volume,
        &directory,
        tree.name().as_bytes(),
        None,
        PRIMORDIAL_HANDLE,
    )?;
    Database::catalog().unregister_tree(tree.volume_id(), tree.name());

    for addr in pages {
        Database::buffer_pool().discard(&crate::types::PageKey::new(volume.id(), addr));
        garbage::free_page(session, volume, addr)?;
    }
    info!("dropped tree {} from volume {}", tree.name(), volume.id());
    Ok(())
}

/// Delete every key of a tree, keeping the (fresh, empty) root.
pub fn truncate_tree(session: &Session, volume: &Arc<Volume>, tree: &Arc<Tree>) -> StoreResult {
    let pages = ops::collect_tree_pages(session, volume, tree)?;

    let new_root = create_empty_root(session, volume)?;
    let old_root = tree.root();
    tree.set_root(new_root);
    tree.persist_root(session)?;

    for addr in pages {
        if addr == new_root {
            continue;
        }
        Database::buffer_pool().discard(&crate::types::PageKey::new(volume.id(), addr));
        garbage::free_page(session, volume, addr)?;
    }
    debug!(
        "truncated tree {}: root {} -> {}",
        tree.name(),
        old_root,
        new_root
    );
    Ok(())
}
