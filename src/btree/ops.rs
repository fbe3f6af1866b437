use std::{convert::TryInto, sync::Arc};

use log::debug;

use crate::{
    buffer::{claim::ClaimMode, PageGuard, Session},
    database::Database,
    error::{ErrorKind, StoreError},
    page::{
        key_block::ValueRef, long_record_capacity, max_inline_value, JoinResult, Page, PageType,
        MAX_KEY_SIZE,
    },
    transaction::mvv::{Mvv, VersionStatus, PRIMORDIAL_HANDLE},
    types::{PageAddr, PageKey, StoreResult, Timestamp},
    utils::HandyRwLock,
    volume::{garbage, Volume},
};

use super::tree::Tree;

/// Defense against cyclic sibling or child chains in a damaged tree.
const MAX_DEPTH: usize = 64;
const MAX_HOPS: usize = 1024;
const MAX_RESTARTS: usize = 16;

/// A page is merge-eligible below a third of its capacity.
const UNDERFLOW_DIVISOR: usize = 3;

/// Cursor position: a concrete key, or one of the two sentinels that
/// order before and after every key.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorPos {
    Before,
    After,
    Key(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Gt,
    Gteq,
    Lt,
    Lteq,
}

impl Direction {
    pub fn forward(self) -> bool {
        self == Direction::Gt || self == Direction::Gteq
    }

    pub fn inclusive(self) -> bool {
        self == Direction::Gteq || self == Direction::Lteq
    }
}

fn resolve(handle: u64) -> VersionStatus {
    Database::transaction_index().status(handle)
}

fn check_key(key: &[u8]) -> StoreResult {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(StoreError::new(
            ErrorKind::Conversion,
            &format!("key length {} out of range", key.len()),
        ));
    }
    Ok(())
}

fn child_addr(page: &Page, slot: usize) -> Result<PageAddr, StoreError> {
    match page.value_at(slot) {
        ValueRef::Inline(bytes) if bytes.len() == 8 => {
            let addr = u64::from_le_bytes(bytes.as_slice().try_into().unwrap());
            if addr == 0 {
                return Err(StoreError::corrupt_volume("invalid page address"));
            }
            Ok(addr)
        }
        _ => Err(StoreError::new(
            ErrorKind::InvalidPageStructure,
            "index entry does not hold a page address",
        )),
    }
}

fn child_value(addr: PageAddr) -> ValueRef {
    ValueRef::Inline(addr.to_le_bytes().to_vec())
}

/// B-link right hop: when `key` lies beyond this page's range, the
/// target page at the same level. The sibling's lowest key decides;
/// an exceeded page without a right sibling covers to +inf.
fn hop_target(
    session: &Session,
    volume: &Arc<Volume>,
    page: &Page,
    key: &[u8],
) -> Result<Option<PageAddr>, StoreError> {
    let right = page.right_sibling();
    if right == 0 {
        return Ok(None);
    }
    if page.key_count() > 0 {
        let last = page.key_at(page.key_count() - 1);
        if key <= last.as_slice() {
            return Ok(None);
        }
    }

    let guard = Database::buffer_pool().get_page(session, ClaimMode::Shared, volume, right)?;
    let pod = guard.page();
    let sibling = pod.rl();
    if sibling.key_count() == 0 {
        return Ok(Some(right));
    }
    if key >= sibling.key_at(0).as_slice() {
        Ok(Some(right))
    } else {
        Ok(None)
    }
}

/// Phase 1 of a descent: shared claims only, one level at a time,
/// recording the ancestor path.
fn locate_leaf_shared(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    key: &[u8],
) -> Result<(PageAddr, Vec<PageAddr>), StoreError> {
    let mut addr = tree.root();
    let mut path = Vec::new();
    for _ in 0..MAX_DEPTH + MAX_HOPS {
        let guard = Database::buffer_pool().get_page(session, ClaimMode::Shared, volume, addr)?;
        let pod = guard.page();
        let page = pod.rl();
        match page.page_type() {
            PageType::Data => return Ok((addr, path)),
            PageType::Index => {
                if let Some(next) = hop_target(session, volume, &page, key)? {
                    addr = next;
                    continue;
                }
                if page.key_count() == 0 {
                    return Err(StoreError::corrupt_volume("empty index page"));
                }
                let (slot, found) = page.find_key(key);
                let child_slot = if found {
                    slot
                } else {
                    slot.saturating_sub(1)
                };
                let child = child_addr(&page, child_slot)?;
                path.push(addr);
                addr = child;
            }
            other => {
                return Err(StoreError::new(
                    ErrorKind::InvalidPageType,
                    &format!("descent reached a {} page", other),
                ))
            }
        }
    }
    Err(StoreError::corrupt_volume("b+tree descent did not terminate"))
}

/// Claim the leaf for `key` in the requested mode, hopping right
/// across concurrent splits. Also returns the ancestor path for
/// upward split propagation.
fn leaf_for_key(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    key: &[u8],
    mode: ClaimMode,
) -> Result<(PageGuard, Vec<PageAddr>), StoreError> {
    for _ in 0..MAX_RESTARTS {
        let (leaf_addr, path) = locate_leaf_shared(session, volume, tree, key)?;

        let mut addr = leaf_addr;
        let mut hops = 0;
        loop {
            let guard = Database::buffer_pool().get_page(session, mode, volume, addr)?;
            let pod = guard.page();
            let stale = pod.rl().page_type() != PageType::Data;
            if stale {
                // the page changed roles while unlatched; re-descend
                break;
            }
            let next = hop_target(session, volume, &pod.rl(), key)?;
            match next {
                Some(next) => {
                    addr = next;
                    hops += 1;
                    if hops > MAX_HOPS {
                        return Err(StoreError::corrupt_volume("sibling chain did not terminate"));
                    }
                }
                None => return Ok((guard, path)),
            }
        }
    }
    Err(StoreError::corrupt_volume("b+tree descent did not stabilize"))
}

// ----------------------------------------------------------------------
// long records
// ----------------------------------------------------------------------

fn write_long_record(
    session: &Session,
    volume: &Arc<Volume>,
    bytes: &[u8],
) -> Result<ValueRef, StoreError> {
    assert!(!bytes.is_empty());
    let cap = long_record_capacity(volume.page_size());
    let chunks: Vec<&[u8]> = bytes.chunks(cap).collect();

    let mut addrs = Vec::with_capacity(chunks.len());
    for _ in 0..chunks.len() {
        addrs.push(garbage::allocate_page(session, volume)?);
    }

    let ts = Database::timestamps().current();
    for (i, chunk) in chunks.iter().enumerate() {
        let mut page = Page::new_raw(PageType::LongRecord, volume.page_size(), chunk.to_vec());
        if i + 1 < addrs.len() {
            page.set_right_sibling(addrs[i + 1]);
        }
        page.set_timestamp(ts);
        let _guard = Database::buffer_pool().install(session, volume, addrs[i], page)?;
    }
    Ok(ValueRef::Long {
        first_page: addrs[0],
        total_len: bytes.len() as u64,
    })
}

fn read_long_record(
    session: &Session,
    volume: &Arc<Volume>,
    first_page: PageAddr,
    total_len: u64,
) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::with_capacity(total_len as usize);
    let mut addr = first_page;
    let mut hops = 0;
    while addr != 0 {
        let guard = Database::buffer_pool().get_page(session, ClaimMode::Shared, volume, addr)?;
        let pod = guard.page();
        let page = pod.rl();
        if page.page_type() != PageType::LongRecord {
            return Err(StoreError::new(
                ErrorKind::InvalidPageType,
                &format!("long-record chain holds a {} page", page.page_type()),
            ));
        }
        out.extend_from_slice(page.raw_bytes());
        addr = page.right_sibling();
        hops += 1;
        if hops > MAX_HOPS {
            return Err(StoreError::corrupt_volume("long-record chain did not terminate"));
        }
    }
    if (out.len() as u64) < total_len {
        return Err(StoreError::corrupt_volume("long-record chain is short"));
    }
    out.truncate(total_len as usize);
    Ok(out)
}

fn free_long_record(
    session: &Session,
    volume: &Arc<Volume>,
    first_page: PageAddr,
) -> StoreResult {
    let mut addrs = Vec::new();
    let mut addr = first_page;
    while addr != 0 && addrs.len() <= MAX_HOPS {
        let next = {
            let guard =
                Database::buffer_pool().get_page(session, ClaimMode::Shared, volume, addr)?;
            let pod = guard.page();
            let next = pod.rl().right_sibling();
            next
        };
        addrs.push(addr);
        addr = next;
    }
    for addr in addrs {
        Database::buffer_pool().discard(&PageKey::new(volume.id(), addr));
        garbage::free_page(session, volume, addr)?;
    }
    Ok(())
}

/// Materialize the MVV at `slot`, chasing a long-record pointer if
/// present. Returns the overflow head so the caller can reclaim it
/// after a successful rewrite.
fn load_mvv(
    session: &Session,
    volume: &Arc<Volume>,
    page: &Page,
    slot: usize,
) -> Result<(Mvv, Option<PageAddr>), StoreError> {
    match page.value_at(slot) {
        ValueRef::Inline(bytes) => Ok((Mvv::decode(bytes), None)),
        ValueRef::Long {
            first_page,
            total_len,
        } => {
            let bytes = read_long_record(session, volume, *first_page, *total_len)?;
            Ok((Mvv::decode(&bytes), Some(*first_page)))
        }
    }
}

// ----------------------------------------------------------------------
// fetch
// ----------------------------------------------------------------------

/// Read `key` at `snapshot`; `own` makes the writer's uncommitted
/// version visible to itself. A visible ANTI version reads as absent.
pub fn fetch(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    key: &[u8],
    snapshot: Timestamp,
    own: Option<u64>,
) -> Result<Option<Vec<u8>>, StoreError> {
    check_key(key)?;
    let (guard, _path) = leaf_for_key(session, volume, tree, key, ClaimMode::Shared)?;
    let pod = guard.page();
    let page = pod.rl();
    let (slot, found) = page.find_key(key);
    if !found {
        return Ok(None);
    }
    let (mvv, _) = load_mvv(session, volume, &page, slot)?;
    match mvv.visible_for(snapshot, own, resolve) {
        Some(v) if !v.anti => Ok(Some(v.bytes.clone())),
        _ => Ok(None),
    }
}

// ----------------------------------------------------------------------
// store
// ----------------------------------------------------------------------

/// Install a version of `key` under `handle` (`None` value = ANTI
/// tombstone). This is the single write path: transactions at store
/// time, recovery replay, and primordial (non-transactional) writes
/// all come through here.
pub fn store_internal(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    key: &[u8],
    value: Option<&[u8]>,
    handle: u64,
) -> StoreResult {
    check_key(key)?;
    let mut attempt = 0;
    loop {
        let (guard, mut path) = leaf_for_key(session, volume, tree, key, ClaimMode::Exclusive)?;
        let pod = guard.page();

        let (slot, found) = pod.rl().find_key(key);
        let (mut mvv, old_long) = if found {
            let page = pod.rl();
            load_mvv(session, volume, &page, slot)?
        } else {
            (Mvv::empty(), None)
        };

        // write-write conflict: another writer's uncommitted version
        // forces us to release every latch, wait, and re-check; no
        // store state survives the retry
        if handle != PRIMORDIAL_HANDLE {
            if let Some(other) = mvv.conflicting_handle(handle, resolve) {
                drop(guard);
                Database::sequencer().await_retry(attempt, other)?;
                attempt += 1;
                continue;
            }
        }

        let fresh = mvv.install(handle, value.is_none(), value.unwrap_or(&[]).to_vec());

        // fold dead history while the chain is in hand
        let floor = prune_floor();
        let released = mvv.prune(floor, resolve);

        let ts = Database::timestamps().current();
        if mvv.is_empty() {
            // the tombstone erased the whole chain: physical removal
            if found {
                pod.wl().remove_record(slot)?;
                pod.wl().set_timestamp(ts);
                Database::buffer_pool().mark_dirty(&guard.key());
            }
        } else {
            let encoded = mvv.encode();
            let new_ref = if encoded.len() <= max_inline_value(volume.page_size()) {
                ValueRef::Inline(encoded)
            } else {
                // allocated only after the conflict check passed;
                // this pointer belongs to this attempt alone
                write_long_record(session, volume, &encoded)?
            };

            if found && pod.rl().fits_replacement(slot, &new_ref) {
                pod.wl().set_value_at(slot, new_ref)?;
                pod.wl().set_timestamp(ts);
                Database::buffer_pool().mark_dirty(&guard.key());
            } else {
                if found {
                    pod.wl().remove_record(slot)?;
                }
                pod.wl().set_timestamp(ts);
                insert_with_split(session, volume, tree, guard, &mut path, key, new_ref)?;
            }
        }

        if fresh && handle != PRIMORDIAL_HANDLE {
            Database::transaction_index().register_version(handle);
        }
        for h in released {
            Database::transaction_index().release_version(h);
        }
        if let Some(first_page) = old_long {
            free_long_record(session, volume, first_page)?;
        }
        if handle == PRIMORDIAL_HANDLE {
            // a non-transactional write has no redo record to replay
            // at recovery; its page images go to the journal now
            Database::buffer_pool().write_dirty_pages(session, false)?;
        }
        return Ok(());
    }
}

fn prune_floor() -> Timestamp {
    Database::transaction_index()
        .oldest_running_start()
        .unwrap_or_else(|| Database::timestamps().current())
}

/// Insert a record into a claimed page, splitting it (and its
/// ancestors, one at a time) when full. Consumes the guard.
fn insert_with_split(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    guard: PageGuard,
    path: &mut Vec<PageAddr>,
    key: &[u8],
    value: ValueRef,
) -> StoreResult {
    let pod = guard.page();
    let (slot, found) = pod.rl().find_key(key);
    debug_assert!(!found);

    if pod.rl().fits(key.len(), value.wire_len()) {
        pod.wl().insert_record(slot, key, value)?;
        Database::buffer_pool().mark_dirty(&guard.key());
        return Ok(());
    }

    // split, per the configured policy
    let policy = Database::split_policy();
    let (mut right, pivot) = pod.wl().split(policy, slot, key.len(), value.wire_len())?;
    let right_addr = garbage::allocate_page(session, volume)?;
    pod.wl().set_right_sibling(right_addr);
    right.set_timestamp(pod.rl().timestamp());

    if key < pivot.as_slice() {
        let (s, _) = pod.rl().find_key(key);
        pod.wl().insert_record(s, key, value)?;
    } else {
        let (s, _) = right.find_key(key);
        right.insert_record(s, key, value)?;
    }

    let left_addr = guard.key().page_addr;
    let right_guard = Database::buffer_pool().install(session, volume, right_addr, right)?;
    Database::buffer_pool().mark_dirty(&guard.key());
    debug!(
        "split page {} of tree {}: new right sibling {}",
        left_addr,
        tree.name(),
        right_addr
    );

    // release the children before climbing: the sibling link keeps
    // the split observable while the separator travels up
    drop(right_guard);
    drop(guard);
    insert_into_parent(session, volume, tree, path, left_addr, pivot, right_addr)
}

/// Propagate a separator upward, latching one ancestor at a time.
/// Terminates because the recorded path shrinks on every round and a
/// root split ends the climb.
fn insert_into_parent(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    path: &mut Vec<PageAddr>,
    mut left_addr: PageAddr,
    mut pivot: Vec<u8>,
    mut right_addr: PageAddr,
) -> StoreResult {
    loop {
        let parent_addr = match path.pop() {
            Some(addr) => addr,
            None => {
                // we split what we believed was the root
                if grow_new_root(session, volume, tree, left_addr, pivot.clone(), right_addr)? {
                    return Ok(());
                }
                // someone re-rooted first: find the true parent
                path.push(find_parent(session, volume, tree, &pivot, left_addr)?);
                continue;
            }
        };

        let mut addr = parent_addr;
        let mut hops = 0;
        loop {
            let guard =
                Database::buffer_pool().get_page(session, ClaimMode::Exclusive, volume, addr)?;
            let pod = guard.page();
            if pod.rl().page_type() != PageType::Index {
                drop(guard);
                addr = find_parent(session, volume, tree, &pivot, left_addr)?;
                continue;
            }
            if let Some(next) = hop_target(session, volume, &pod.rl(), &pivot)? {
                addr = next;
                hops += 1;
                if hops > MAX_HOPS {
                    return Err(StoreError::corrupt_volume("sibling chain did not terminate"));
                }
                continue;
            }

            let (slot, found) = pod.rl().find_key(&pivot);
            if found {
                // a replayed propagation: repoint and stop
                pod.wl().set_value_at(slot, child_value(right_addr))?;
                Database::buffer_pool().mark_dirty(&guard.key());
                return Ok(());
            }
            if pod.rl().fits(pivot.len(), 8) {
                pod.wl().insert_record(slot, &pivot, child_value(right_addr))?;
                Database::buffer_pool().mark_dirty(&guard.key());
                return Ok(());
            }

            // the ancestor splits too
            let policy = Database::split_policy();
            let (mut pright, ppivot) = pod.wl().split(policy, slot, pivot.len(), 8)?;
            let pright_addr = garbage::allocate_page(session, volume)?;
            pod.wl().set_right_sibling(pright_addr);
            pright.set_timestamp(pod.rl().timestamp());

            if pivot.as_slice() < ppivot.as_slice() {
                let (s, _) = pod.rl().find_key(&pivot);
                pod.wl().insert_record(s, &pivot, child_value(right_addr))?;
            } else {
                let (s, _) = pright.find_key(&pivot);
                pright.insert_record(s, &pivot, child_value(right_addr))?;
            }

            let _pright_guard =
                Database::buffer_pool().install(session, volume, pright_addr, pright)?;
            Database::buffer_pool().mark_dirty(&guard.key());

            left_addr = addr;
            pivot = ppivot;
            right_addr = pright_addr;
            break;
        }
    }
}

/// Replace the root with a fresh index page over the split pair.
/// Returns false when the root moved concurrently.
fn grow_new_root(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    left_addr: PageAddr,
    pivot: Vec<u8>,
    right_addr: PageAddr,
) -> Result<bool, StoreError> {
    if tree.root() != left_addr {
        return Ok(false);
    }
    let new_root_addr = garbage::allocate_page(session, volume)?;
    let mut new_root = Page::new_index(volume.page_size());
    new_root.set_items(&[
        (Vec::new(), child_value(left_addr)),
        (pivot, child_value(right_addr)),
    ]);
    new_root.set_timestamp(Database::timestamps().current());

    if !tree.compare_and_set_root(left_addr, new_root_addr) {
        garbage::free_page(session, volume, new_root_addr)?;
        return Ok(false);
    }
    let guard = Database::buffer_pool().install(session, volume, new_root_addr, new_root)?;
    // release the claim first: persisting the root pointer flushes
    // the dirty set, and the new root page must be part of it
    drop(guard);
    tree.persist_root(session)?;
    debug!(
        "tree {} grew a new root {} over {} and {}",
        tree.name(),
        new_root_addr,
        left_addr,
        right_addr
    );
    Ok(true)
}

/// Descend toward `pivot` until the child pointer equals
/// `child`; that page is the parent.
fn find_parent(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    pivot: &[u8],
    child: PageAddr,
) -> Result<PageAddr, StoreError> {
    let mut addr = tree.root();
    for _ in 0..MAX_DEPTH + MAX_HOPS {
        let guard = Database::buffer_pool().get_page(session, ClaimMode::Shared, volume, addr)?;
        let pod = guard.page();
        let page = pod.rl();
        if page.page_type() != PageType::Index {
            break;
        }
        if let Some(next) = hop_target(session, volume, &page, pivot)? {
            addr = next;
            continue;
        }
        let (slot, found) = page.find_key(pivot);
        let child_slot = if found { slot } else { slot.saturating_sub(1) };
        let next = child_addr(&page, child_slot)?;
        if next == child {
            return Ok(addr);
        }
        addr = next;
    }
    Err(StoreError::corrupt_volume("split parent not found"))
}

// ----------------------------------------------------------------------
// traverse
// ----------------------------------------------------------------------

/// The visible value of `slot` for this reader: `None` = nothing
/// visible at all, `Some(None)` = a visible tombstone, `Some(bytes)`
/// = a live value.
fn visible_value(
    session: &Session,
    volume: &Arc<Volume>,
    page: &Page,
    slot: usize,
    snapshot: Timestamp,
    own: Option<u64>,
) -> Result<Option<Option<Vec<u8>>>, StoreError> {
    let (mvv, _) = load_mvv(session, volume, page, slot)?;
    match mvv.visible_for(snapshot, own, resolve) {
        None => Ok(None),
        Some(v) if v.anti => Ok(Some(None)),
        Some(v) => Ok(Some(Some(v.bytes.clone()))),
    }
}

/// Step the cursor. Returns the next key with its visible value, or
/// `None` when traversal falls off the end (the caller's cursor then
/// rests at BEFORE/AFTER).
///
/// With `skip_deleted`, keys whose visible version is a tombstone are
/// passed over; without it they are returned with a `None` value.
/// Keys invisible to the snapshot are always passed over.
pub fn traverse(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    pos: &CursorPos,
    direction: Direction,
    skip_deleted: bool,
    snapshot: Timestamp,
    own: Option<u64>,
) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>, StoreError> {
    if direction.forward() {
        traverse_forward(session, volume, tree, pos, direction, skip_deleted, snapshot, own)
    } else {
        traverse_backward(session, volume, tree, pos, direction, skip_deleted, snapshot, own)
    }
}

fn scan_leaf_forward(
    session: &Session,
    volume: &Arc<Volume>,
    page: &Page,
    from_slot: usize,
    skip_deleted: bool,
    snapshot: Timestamp,
    own: Option<u64>,
) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>, StoreError> {
    for slot in from_slot..page.key_count() {
        match visible_value(session, volume, page, slot, snapshot, own)? {
            None => continue,
            Some(None) => {
                if skip_deleted {
                    continue;
                }
                return Ok(Some((page.key_at(slot), None)));
            }
            Some(Some(bytes)) => return Ok(Some((page.key_at(slot), Some(bytes)))),
        }
    }
    Ok(None)
}

fn traverse_forward(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    pos: &CursorPos,
    direction: Direction,
    skip_deleted: bool,
    snapshot: Timestamp,
    own: Option<u64>,
) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>, StoreError> {
    let (mut guard, mut start) = match pos {
        CursorPos::After => return Ok(None),
        CursorPos::Before => (edge_leaf(session, volume, tree, true)?, 0),
        CursorPos::Key(key) => {
            let (guard, _) = leaf_for_key(session, volume, tree, key, ClaimMode::Shared)?;
            let (slot, found) = {
                let pod = guard.page();
                let r = pod.rl().find_key(key);
                r
            };
            let start = if found && direction.inclusive() {
                slot
            } else if found {
                slot + 1
            } else {
                slot
            };
            (guard, start)
        }
    };

    let mut hops = 0;
    loop {
        let pod = guard.page();
        let found = {
            let page = pod.rl();
            scan_leaf_forward(session, volume, &page, start, skip_deleted, snapshot, own)?
        };
        if let Some(hit) = found {
            return Ok(Some(hit));
        }

        let next = pod.rl().right_sibling();
        if next == 0 {
            return Ok(None);
        }
        // acquire the sibling before releasing the current page so a
        // concurrent merge cannot slip keys past the cursor
        let next_guard =
            Database::buffer_pool().get_page(session, ClaimMode::Shared, volume, next)?;
        guard = next_guard;
        start = 0;
        hops += 1;
        if hops > MAX_HOPS {
            return Err(StoreError::corrupt_volume("sibling chain did not terminate"));
        }
    }
}

fn traverse_backward(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    pos: &CursorPos,
    direction: Direction,
    skip_deleted: bool,
    snapshot: Timestamp,
    own: Option<u64>,
) -> Result<Option<(Vec<u8>, Option<Vec<u8>>)>, StoreError> {
    // (guard, index of the first slot to inspect, scanning down)
    let (mut guard, mut start) = match pos {
        CursorPos::Before => return Ok(None),
        CursorPos::After => {
            let guard = edge_leaf(session, volume, tree, false)?;
            let count = {
                let pod = guard.page();
                let c = pod.rl().key_count();
                c
            };
            if count == 0 {
                return Ok(None);
            }
            (guard, count - 1)
        }
        CursorPos::Key(key) => {
            let (guard, _) = leaf_for_key(session, volume, tree, key, ClaimMode::Shared)?;
            let (slot, found) = {
                let pod = guard.page();
                let r = pod.rl().find_key(key);
                r
            };
            if found && direction.inclusive() {
                (guard, slot)
            } else if slot == 0 {
                // the predecessor lives in an earlier leaf
                match prior_leaf(session, volume, tree, key)? {
                    Some(pair) => pair,
                    None => return Ok(None),
                }
            } else {
                (guard, slot - 1)
            }
        }
    };

    let mut rounds = 0;
    loop {
        let pod = guard.page();
        let mut bound_key = None;
        {
            let page = pod.rl();
            let mut slot = start as isize;
            while slot >= 0 {
                match visible_value(session, volume, &page, slot as usize, snapshot, own)? {
                    None => {}
                    Some(None) => {
                        if !skip_deleted {
                            return Ok(Some((page.key_at(slot as usize), None)));
                        }
                    }
                    Some(Some(bytes)) => {
                        return Ok(Some((page.key_at(slot as usize), Some(bytes))))
                    }
                }
                slot -= 1;
            }
            if page.key_count() > 0 {
                bound_key = Some(page.key_at(0));
            }
        }

        let bound = match bound_key {
            Some(b) => b,
            None => return Ok(None),
        };
        drop(pod);
        drop(guard);
        match prior_leaf(session, volume, tree, &bound)? {
            Some((g, s)) => {
                guard = g;
                start = s;
            }
            None => return Ok(None),
        }
        rounds += 1;
        if rounds > MAX_HOPS {
            return Err(StoreError::corrupt_volume("backward traversal did not terminate"));
        }
    }
}

/// Locate the leaf holding the greatest key strictly below `bound`,
/// and the slot to start scanning from.
fn prior_leaf(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    bound: &[u8],
) -> Result<Option<(PageGuard, usize)>, StoreError> {
    let mut addr = tree.root();
    for _ in 0..MAX_DEPTH + MAX_HOPS {
        let guard = Database::buffer_pool().get_page(session, ClaimMode::Shared, volume, addr)?;
        let pod = guard.page();
        let page = pod.rl();
        match page.page_type() {
            PageType::Index => {
                if page.key_count() == 0 {
                    return Err(StoreError::corrupt_volume("empty index page"));
                }
                let (slot, _found) = page.find_key(bound);
                if slot == 0 {
                    return Ok(None);
                }
                addr = child_addr(&page, slot - 1)?;
            }
            PageType::Data => {
                let (slot, _found) = page.find_key(bound);
                if slot == 0 {
                    return Ok(None);
                }
                let start = slot - 1;
                drop(page);
                drop(pod);
                return Ok(Some((guard, start)));
            }
            other => {
                return Err(StoreError::new(
                    ErrorKind::InvalidPageType,
                    &format!("descent reached a {} page", other),
                ))
            }
        }
    }
    Err(StoreError::corrupt_volume("b+tree descent did not terminate"))
}

/// The leftmost or rightmost leaf of the tree.
fn edge_leaf(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    leftmost: bool,
) -> Result<PageGuard, StoreError> {
    let mut addr = tree.root();
    for _ in 0..MAX_DEPTH + MAX_HOPS {
        let guard = Database::buffer_pool().get_page(session, ClaimMode::Shared, volume, addr)?;
        let pod = guard.page();
        let page = pod.rl();
        match page.page_type() {
            PageType::Data => {
                if !leftmost && page.right_sibling() != 0 {
                    addr = page.right_sibling();
                    continue;
                }
                drop(page);
                drop(pod);
                return Ok(guard);
            }
            PageType::Index => {
                if !leftmost && page.right_sibling() != 0 {
                    // the right edge may have moved through a split
                    // whose separator has not reached this level's
                    // parent yet
                    addr = page.right_sibling();
                    continue;
                }
                if page.key_count() == 0 {
                    return Err(StoreError::corrupt_volume("empty index page"));
                }
                let slot = if leftmost { 0 } else { page.key_count() - 1 };
                addr = child_addr(&page, slot)?;
            }
            other => {
                return Err(StoreError::new(
                    ErrorKind::InvalidPageType,
                    &format!("descent reached a {} page", other),
                ))
            }
        }
    }
    Err(StoreError::corrupt_volume("b+tree descent did not terminate"))
}

// ----------------------------------------------------------------------
// pruning & merge
// ----------------------------------------------------------------------

/// Prune the MVV of one key: drop aborted versions, fold history
/// below every reader's reach, remove the record when nothing is
/// left, and merge or rebalance an underfilled leaf. Idempotent and
/// restartable.
pub fn prune_key(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    key: &[u8],
) -> StoreResult {
    check_key(key)?;
    let (guard, mut path) = leaf_for_key(session, volume, tree, key, ClaimMode::Exclusive)?;
    let pod = guard.page();

    let (slot, found) = pod.rl().find_key(key);
    if !found {
        return Ok(());
    }
    let (mut mvv, old_long) = {
        let page = pod.rl();
        load_mvv(session, volume, &page, slot)?
    };

    let released = mvv.prune(prune_floor(), resolve);
    if released.is_empty() && !mvv.is_empty() {
        return Ok(());
    }

    let ts = Database::timestamps().current();
    if mvv.is_empty() {
        pod.wl().remove_record(slot)?;
        pod.wl().set_timestamp(ts);
        Database::buffer_pool().mark_dirty(&guard.key());
    } else {
        let encoded = mvv.encode();
        let new_ref = if encoded.len() <= max_inline_value(volume.page_size()) {
            ValueRef::Inline(encoded)
        } else {
            write_long_record(session, volume, &encoded)?
        };
        if pod.rl().fits_replacement(slot, &new_ref) {
            pod.wl().set_value_at(slot, new_ref)?;
        } else {
            pod.wl().remove_record(slot)?;
            // shrinking always re-fits without a split
            let (s, _) = pod.rl().find_key(key);
            pod.wl().insert_record(s, key, new_ref)?;
        }
        pod.wl().set_timestamp(ts);
        Database::buffer_pool().mark_dirty(&guard.key());
    }

    for h in released {
        Database::transaction_index().release_version(h);
    }
    if let Some(first_page) = old_long {
        free_long_record(session, volume, first_page)?;
    }

    maybe_merge(session, volume, tree, guard, &mut path)
}

/// Fold an underfilled page into its right sibling, or redistribute
/// when a merged page would exceed a cap. The internal rebalance
/// signalling never escapes this function.
fn maybe_merge(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    guard: PageGuard,
    path: &mut Vec<PageAddr>,
) -> StoreResult {
    let pod = guard.page();
    {
        let page = pod.rl();
        if page.used_space() >= page.capacity() / UNDERFLOW_DIVISOR {
            return Ok(());
        }
        if page.right_sibling() == 0 {
            return Ok(());
        }
    }
    let parent_addr = match path.pop() {
        Some(addr) => addr,
        // a root leaf has nothing to merge with
        None => return Ok(()),
    };

    let right_addr = pod.rl().right_sibling();
    let right_guard =
        Database::buffer_pool().get_page(session, ClaimMode::Exclusive, volume, right_addr)?;
    let rpod = right_guard.page();
    if rpod.rl().page_type() != pod.rl().page_type() {
        return Ok(());
    }

    // find the parent page holding the entry for the right sibling
    let left_addr = guard.key().page_addr;
    let mut addr = parent_addr;
    let (pguard, right_slot) = {
        let mut found = None;
        let mut hops = 0;
        while found.is_none() && hops < MAX_HOPS {
            let pg =
                Database::buffer_pool().get_page(session, ClaimMode::Exclusive, volume, addr)?;
            let ppod = pg.page();
            if ppod.rl().page_type() != PageType::Index {
                return Ok(());
            }
            let slot_of_right = {
                let parent = ppod.rl();
                (0..parent.key_count())
                    .find(|s| child_addr(&parent, *s).ok() == Some(right_addr))
            };
            match slot_of_right {
                Some(slot) => found = Some((pg, slot)),
                None => {
                    let next = ppod.rl().right_sibling();
                    if next == 0 {
                        // the separator is elsewhere; leave the pages
                        // for a later pass
                        return Ok(());
                    }
                    addr = next;
                    hops += 1;
                }
            }
        }
        match found {
            Some(pair) => pair,
            None => return Ok(()),
        }
    };

    let join = {
        let mut left = pod.wl();
        let mut right = rpod.wl();
        left.join_or_rebalance(&mut right)?
    };
    let ppod = pguard.page();
    match join {
        JoinResult::Merged => {
            ppod.wl().remove_record(right_slot)?;
            Database::buffer_pool().mark_dirty(&pguard.key());
            Database::buffer_pool().mark_dirty(&guard.key());
            Database::buffer_pool().discard(&PageKey::new(volume.id(), right_addr));
            drop(rpod);
            drop(right_guard);
            garbage::free_page(session, volume, right_addr)?;
            debug!(
                "merged page {} into {} in tree {}",
                right_addr,
                left_addr,
                tree.name()
            );

            // a root with a single child loses a level
            collapse_root(session, volume, tree, &pguard)?;
        }
        JoinResult::Rebalanced { pivot } => {
            ppod.wl().remove_record(right_slot)?;
            Database::buffer_pool().mark_dirty(&guard.key());
            Database::buffer_pool().mark_dirty(&right_guard.key());
            let fits = ppod.rl().fits(pivot.len(), 8);
            if fits {
                let (s, _) = ppod.rl().find_key(&pivot);
                ppod.wl().insert_record(s, &pivot, child_value(right_addr))?;
                Database::buffer_pool().mark_dirty(&pguard.key());
            } else {
                // rare: the narrower separator no longer fits; climb
                // with the ordinary split machinery
                Database::buffer_pool().mark_dirty(&pguard.key());
                let parent_path_end = pguard.key().page_addr;
                drop(ppod);
                drop(pguard);
                drop(rpod);
                drop(right_guard);
                drop(pod);
                drop(guard);
                let mut climb_path = path.clone();
                climb_path.push(parent_path_end);
                let parent_addr = climb_path.pop().unwrap();
                let reclaim = Database::buffer_pool().get_page(
                    session,
                    ClaimMode::Exclusive,
                    volume,
                    parent_addr,
                )?;
                return insert_with_split(
                    session,
                    volume,
                    tree,
                    reclaim,
                    &mut climb_path,
                    &pivot,
                    child_value(right_addr),
                );
            }
            debug!(
                "rebalanced pages {} and {} in tree {}",
                left_addr,
                right_addr,
                tree.name()
            );
        }
    }
    Ok(())
}

/// If the (index) page behind `pguard` is the root and holds a single
/// child, that child becomes the root.
fn collapse_root(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    pguard: &PageGuard,
) -> StoreResult {
    let parent_addr = pguard.key().page_addr;
    if tree.root() != parent_addr {
        return Ok(());
    }
    let ppod = pguard.page();
    let only_child = {
        let parent = ppod.rl();
        if parent.key_count() == 1 && parent.right_sibling() == 0 {
            Some(child_addr(&parent, 0)?)
        } else {
            None
        }
    };
    if let Some(child) = only_child {
        if tree.compare_and_set_root(parent_addr, child) {
            tree.persist_root(session)?;
            Database::buffer_pool().discard(&PageKey::new(volume.id(), parent_addr));
            garbage::free_page(session, volume, parent_addr)?;
            debug!("tree {} collapsed root {} into {}", tree.name(), parent_addr, child);
        }
    }
    Ok(())
}

/// Sweep one whole tree, pruning every key. Used by the
/// post-recovery cleanup pass.
pub fn prune_tree(session: &Session, volume: &Arc<Volume>, tree: &Tree) -> StoreResult {
    let mut pos = CursorPos::Before;
    loop {
        // physical walk: visit keys whether or not they are visible
        let next = next_physical_key(session, volume, tree, &pos)?;
        let key = match next {
            Some(k) => k,
            None => return Ok(()),
        };
        prune_key(session, volume, tree, &key)?;
        pos = CursorPos::Key(key);
    }
}

/// The next physically present key after the cursor, visibility
/// ignored.
fn next_physical_key(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
    pos: &CursorPos,
) -> Result<Option<Vec<u8>>, StoreError> {
    let (mut guard, mut start) = match pos {
        CursorPos::After => return Ok(None),
        CursorPos::Before => (edge_leaf(session, volume, tree, true)?, 0),
        CursorPos::Key(key) => {
            let (guard, _) = leaf_for_key(session, volume, tree, key, ClaimMode::Shared)?;
            let (slot, found) = {
                let pod = guard.page();
                let r = pod.rl().find_key(key);
                r
            };
            (guard, if found { slot + 1 } else { slot })
        }
    };

    let mut hops = 0;
    loop {
        let pod = guard.page();
        let (count, next_sibling) = {
            let page = pod.rl();
            (page.key_count(), page.right_sibling())
        };
        if start < count {
            let key = pod.rl().key_at(start);
            return Ok(Some(key));
        }
        if next_sibling == 0 {
            return Ok(None);
        }
        let next_guard =
            Database::buffer_pool().get_page(session, ClaimMode::Shared, volume, next_sibling)?;
        guard = next_guard;
        start = 0;
        hops += 1;
        if hops > MAX_HOPS {
            return Err(StoreError::corrupt_volume("sibling chain did not terminate"));
        }
    }
}

// ----------------------------------------------------------------------
// whole-tree walks
// ----------------------------------------------------------------------

/// Every page a tree owns: index and data pages plus long-record
/// chains. Used by drop/truncate to reclaim storage.
pub fn collect_tree_pages(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
) -> Result<Vec<PageAddr>, StoreError> {
    let mut out = Vec::new();
    let mut level_head = tree.root();

    for _ in 0..MAX_DEPTH {
        // walk one level via sibling links, remembering the next
        // level's head
        let mut addr = level_head;
        let mut next_level = None;
        let mut leaf_level = false;
        let mut hops = 0;
        while addr != 0 {
            let guard =
                Database::buffer_pool().get_page(session, ClaimMode::Shared, volume, addr)?;
            let pod = guard.page();
            let page = pod.rl();
            out.push(addr);
            match page.page_type() {
                PageType::Index => {
                    if next_level.is_none() && page.key_count() > 0 {
                        next_level = Some(child_addr(&page, 0)?);
                    }
                }
                PageType::Data => {
                    leaf_level = true;
                    for slot in 0..page.key_count() {
                        if let ValueRef::Long { first_page, .. } = page.value_at(slot) {
                            let mut chain = *first_page;
                            let mut chain_hops = 0;
                            while chain != 0 && chain_hops <= MAX_HOPS {
                                out.push(chain);
                                let cguard = Database::buffer_pool().get_page(
                                    session,
                                    ClaimMode::Shared,
                                    volume,
                                    chain,
                                )?;
                                let cpod = cguard.page();
                                chain = cpod.rl().right_sibling();
                                chain_hops += 1;
                            }
                        }
                    }
                }
                other => {
                    return Err(StoreError::new(
                        ErrorKind::InvalidPageType,
                        &format!("tree walk reached a {} page", other),
                    ))
                }
            }
            addr = page.right_sibling();
            hops += 1;
            if hops > MAX_HOPS {
                return Err(StoreError::corrupt_volume("sibling chain did not terminate"));
            }
        }

        if leaf_level {
            return Ok(out);
        }
        level_head = match next_level {
            Some(a) => a,
            None => return Ok(out),
        };
    }
    Err(StoreError::corrupt_volume("b+tree deeper than supported"))
}

/// Count the physically present keys of a tree; integrity checks and
/// tests use this.
pub fn physical_key_count(
    session: &Session,
    volume: &Arc<Volume>,
    tree: &Tree,
) -> Result<usize, StoreError> {
    let mut count = 0;
    let mut pos = CursorPos::Before;
    while let Some(key) = next_physical_key(session, volume, tree, &pos)? {
        count += 1;
        pos = CursorPos::Key(key);
    }
    Ok(count)
}
