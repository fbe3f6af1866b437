use std::convert::TryInto;
use std::fmt;
use std::io::Cursor;

use crate::{
    error::{ErrorKind, StoreError},
    io::Decodeable,
    types::{PageAddr, Timestamp},
};

use super::{
    fast_index::FastIndex,
    key_block::{common_prefix_len, KeyBlock, ValueRef, LONG_VALUE_FLAG},
    max_keys, KEY_BLOCK_SIZE, PAGE_HEADER_SIZE, VALID_PAGE_SIZES,
};

pub const PAGE_MAGIC: u16 = 0x5061;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageType {
    /// Superblock, page 0 of every volume.
    Head,
    /// B+ tree leaf.
    Data,
    /// B+ tree internal page.
    Index,
    /// A page of free-page numbers on the garbage chain.
    Garbage,
    /// One page of an overflow chain holding a long value.
    LongRecord,
}

impl PageType {
    pub fn to_u8(self) -> u8 {
        match self {
            PageType::Head => 1,
            PageType::Data => 2,
            PageType::Index => 3,
            PageType::Garbage => 4,
            PageType::LongRecord => 5,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, StoreError> {
        match v {
            1 => Ok(PageType::Head),
            2 => Ok(PageType::Data),
            3 => Ok(PageType::Index),
            4 => Ok(PageType::Garbage),
            5 => Ok(PageType::LongRecord),
            _ => Err(StoreError::new(
                ErrorKind::InvalidPageType,
                &format!("unrecognized page type byte: {}", v),
            )),
        }
    }

    pub fn is_tree(self) -> bool {
        self == PageType::Data || self == PageType::Index
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            PageType::Head => "HEAD",
            PageType::Data => "DATA",
            PageType::Index => "INDEX",
            PageType::Garbage => "GARBAGE",
            PageType::LongRecord => "LONG_RECORD",
        };
        write!(f, "{}", s)
    }
}

enum PageBody {
    Tree {
        records: Vec<KeyBlock>,
        fast_index: FastIndex,
    },
    Garbage {
        pages: Vec<PageAddr>,
    },
    Raw {
        bytes: Vec<u8>,
    },
}

/// Result of trying to fold two sibling pages into one.
#[derive(Debug, PartialEq)]
pub enum JoinResult {
    /// Everything fits on the left page; the right page is empty and
    /// may be freed.
    Merged,
    /// Merging would exceed a cap; records were redistributed instead
    /// and the parent separator must become `pivot`.
    Rebalanced { pivot: Vec<u8> },
}

/// In-memory image of one fixed-size page.
///
/// # Wire layout
///
/// ```text
/// 0   u16 magic
/// 2   u8  page type
/// 3   u8  reserved
/// 4   u32 page size
/// 8   u64 raw timestamp of the latest modifier
/// 16  u64 right sibling page address
/// 24  u16 key block count (garbage: entry count)
/// 26  u16 allocation bump (raw pages: used length)
/// 28  u32 checksum
/// 32  key block descriptors, 8 bytes each, then free space, then the
///     suffix/value heap growing down from the page end
/// ```
///
/// Each descriptor is `ebc u16 | suffix_len u16 | heap_off u16 |
/// value_len u16`; bit 15 of `value_len` marks a long-record pointer.
pub struct Page {
    page_type: PageType,
    page_size: usize,
    timestamp: Timestamp,
    right_sibling: PageAddr,
    body: PageBody,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_type", &self.page_type)
            .field("page_size", &self.page_size)
            .field("timestamp", &self.timestamp)
            .field("right_sibling", &self.right_sibling)
            .finish()
    }
}

impl Page {
    pub fn new_tree(page_type: PageType, page_size: usize) -> Self {
        assert!(page_type.is_tree());
        Self {
            page_type,
            page_size,
            timestamp: 0,
            right_sibling: 0,
            body: PageBody::Tree {
                records: Vec::new(),
                fast_index: FastIndex::new(),
            },
        }
    }

    pub fn new_data(page_size: usize) -> Self {
        Self::new_tree(PageType::Data, page_size)
    }

    pub fn new_index(page_size: usize) -> Self {
        Self::new_tree(PageType::Index, page_size)
    }

    pub fn new_garbage(page_size: usize) -> Self {
        Self {
            page_type: PageType::Garbage,
            page_size,
            timestamp: 0,
            right_sibling: 0,
            body: PageBody::Garbage { pages: Vec::new() },
        }
    }

    pub fn new_raw(page_type: PageType, page_size: usize, bytes: Vec<u8>) -> Self {
        assert!(page_type == PageType::Head || page_type == PageType::LongRecord);
        assert!(bytes.len() <= page_size - PAGE_HEADER_SIZE);
        Self {
            page_type,
            page_size,
            timestamp: 0,
            right_sibling: 0,
            body: PageBody::Raw { bytes },
        }
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, ts: Timestamp) {
        self.timestamp = ts;
    }

    pub fn right_sibling(&self) -> PageAddr {
        self.right_sibling
    }

    pub fn set_right_sibling(&mut self, addr: PageAddr) {
        self.right_sibling = addr;
    }

    pub fn capacity(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE
    }

    pub fn max_keys(&self) -> usize {
        max_keys(self.page_size)
    }

    // ------------------------------------------------------------------
    // tree body accessors
    // ------------------------------------------------------------------

    fn tree_body(&self) -> (&Vec<KeyBlock>, &FastIndex) {
        match &self.body {
            PageBody::Tree {
                records,
                fast_index,
            } => (records, fast_index),
            _ => panic!("page {} is not a tree page", self.page_type),
        }
    }

    fn tree_body_mut(&mut self) -> (&mut Vec<KeyBlock>, &mut FastIndex) {
        match &mut self.body {
            PageBody::Tree {
                records,
                fast_index,
            } => (records, fast_index),
            _ => panic!("page {} is not a tree page", self.page_type),
        }
    }

    pub fn key_count(&self) -> usize {
        self.tree_body().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_count() == 0
    }

    pub fn used_space(&self) -> usize {
        self.tree_body().0.iter().map(|r| r.wire_size()).sum()
    }

    pub fn free_space(&self) -> usize {
        self.capacity() - self.used_space()
    }

    pub fn value_at(&self, slot: usize) -> &ValueRef {
        &self.tree_body().0[slot].value
    }

    /// Reconstruct the full key at `slot` from the elided prefixes.
    pub fn key_at(&self, slot: usize) -> Vec<u8> {
        let (records, _) = self.tree_body();
        let mut key: Vec<u8> = Vec::new();
        for r in records.iter().take(slot + 1) {
            key.truncate(r.ebc);
            key.extend_from_slice(&r.suffix);
        }
        key
    }

    /// Full keys and values, reconstructed. Linear in page content;
    /// used by split/merge rebuilds, not the search path.
    pub fn items(&self) -> Vec<(Vec<u8>, ValueRef)> {
        let (records, _) = self.tree_body();
        let mut out = Vec::with_capacity(records.len());
        let mut key: Vec<u8> = Vec::new();
        for r in records {
            key.truncate(r.ebc);
            key.extend_from_slice(&r.suffix);
            out.push((key.clone(), r.value.clone()));
        }
        out
    }

    /// Replace the whole record set, recomputing elided counts.
    pub fn set_items(&mut self, items: &[(Vec<u8>, ValueRef)]) {
        let mut records = Vec::with_capacity(items.len());
        let mut prev: &[u8] = &[];
        for (key, value) in items {
            let ebc = if records.is_empty() {
                0
            } else {
                common_prefix_len(prev, key)
            };
            records.push(KeyBlock::new(ebc, key[ebc..].to_vec(), value.clone()));
            prev = key;
        }
        let fast_index = FastIndex::rebuild(&records);
        match &mut self.body {
            PageBody::Tree {
                records: r,
                fast_index: f,
            } => {
                *r = records;
                *f = fast_index;
            }
            _ => panic!("page {} is not a tree page", self.page_type),
        }
    }

    /// Locate `key`. Returns `(slot, true)` on an exact match, else
    /// `(slot, false)` where `slot` is the insert position (the first
    /// record greater than `key`).
    ///
    /// The scan walks the fast index: a slot whose elided count
    /// differs from the running common-prefix length is decided
    /// without reading any key bytes; only slots where the two agree
    /// compare suffix bytes.
    pub fn find_key(&self, key: &[u8]) -> (usize, bool) {
        let (records, fast_index) = self.tree_body();

        // lcp(key, key_at(i - 1)); maintained while every record seen
        // so far is < key
        let mut lcp = 0usize;

        for i in 0..records.len() {
            let ebc = fast_index.ebc(i);
            if i > 0 {
                if ebc > lcp {
                    // record i agrees with its predecessor beyond the
                    // byte where the predecessor fell below the key,
                    // so it is below the key too
                    continue;
                }
                if ebc < lcp {
                    // record i diverges from its predecessor inside
                    // the span the key shares with it; ascending order
                    // means the diverging byte is greater
                    return (i, false);
                }
            }

            let suffix = &records[i].suffix;
            let rest = &key[lcp.min(key.len())..];
            let common = common_prefix_len(suffix, rest);
            if common == suffix.len() && common == rest.len() {
                return (i, true);
            }
            if common == suffix.len() {
                // record i is a strict prefix of the key: below it
                lcp += common;
                continue;
            }
            if common == rest.len() {
                // key is a strict prefix of record i
                return (i, false);
            }
            if suffix[common] < rest[common] {
                lcp += common;
                continue;
            }
            return (i, false);
        }

        (records.len(), false)
    }

    /// True when a record of `key_len`/`value_len` more bytes still
    /// fits. Conservative: ignores the bytes elision would save.
    pub fn fits(&self, key_len: usize, value_len: usize) -> bool {
        self.key_count() < self.max_keys()
            && KEY_BLOCK_SIZE + key_len + value_len <= self.free_space()
    }

    /// True when the value at `slot` can be replaced by one of
    /// `new_len` bytes.
    pub fn fits_replacement(&self, slot: usize, new_value: &ValueRef) -> bool {
        let old = self.value_at(slot).wire_len();
        self.used_space() - old + new_value.wire_len() <= self.capacity()
    }

    pub fn insert_record(
        &mut self,
        slot: usize,
        key: &[u8],
        value: ValueRef,
    ) -> Result<(), StoreError> {
        if !self.fits(key.len(), value.wire_len()) {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                "insert does not fit on page",
            ));
        }

        let prev_key = if slot > 0 {
            self.key_at(slot - 1)
        } else {
            Vec::new()
        };
        let next_key = if slot < self.key_count() {
            Some(self.key_at(slot))
        } else {
            None
        };

        let ebc = common_prefix_len(&prev_key, key);
        let (records, fast_index) = self.tree_body_mut();
        records.insert(slot, KeyBlock::new(ebc, key[ebc..].to_vec(), value));
        fast_index.insert(slot, ebc)?;

        // the old successor now follows `key`; re-elide it
        if let Some(next_key) = next_key {
            let next_ebc = common_prefix_len(key, &next_key);
            records[slot + 1].ebc = next_ebc;
            records[slot + 1].suffix = next_key[next_ebc..].to_vec();
            fast_index.set(slot + 1, next_ebc)?;
        }
        Ok(())
    }

    pub fn remove_record(&mut self, slot: usize) -> Result<(), StoreError> {
        if slot >= self.key_count() {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                &format!("remove slot {} out of range", slot),
            ));
        }

        let prev_key = if slot > 0 {
            self.key_at(slot - 1)
        } else {
            Vec::new()
        };
        let next_key = if slot + 1 < self.key_count() {
            Some(self.key_at(slot + 1))
        } else {
            None
        };

        let (records, fast_index) = self.tree_body_mut();
        records.remove(slot);
        fast_index.remove(slot)?;

        if let Some(next_key) = next_key {
            let next_ebc = common_prefix_len(&prev_key, &next_key);
            records[slot].ebc = next_ebc;
            records[slot].suffix = next_key[next_ebc..].to_vec();
            fast_index.set(slot, next_ebc)?;
        }
        Ok(())
    }

    pub fn set_value_at(&mut self, slot: usize, value: ValueRef) -> Result<(), StoreError> {
        if !self.fits_replacement(slot, &value) {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                "replacement value does not fit on page",
            ));
        }
        let (records, _) = self.tree_body_mut();
        records[slot].value = value;
        Ok(())
    }

    // ------------------------------------------------------------------
    // split / join
    // ------------------------------------------------------------------

    /// Split this page for a pending insert of `key_len`/`value_len`
    /// at `insert_slot`. Returns the new right page and the pivot key
    /// (the lowest key of the right page). The caller wires siblings
    /// and the parent.
    pub fn split(
        &mut self,
        policy: super::split::SplitPolicy,
        insert_slot: usize,
        key_len: usize,
        value_len: usize,
    ) -> Result<(Page, Vec<u8>), StoreError> {
        use super::split::SplitCandidate;

        let items = self.items();
        let n = items.len();
        let capacity = self.capacity();
        let cap_keys = self.max_keys();
        let insert_size = KEY_BLOCK_SIZE + key_len + value_len;

        // wire size of item i when its predecessor is item i-1
        let sizes: Vec<usize> = items
            .iter()
            .enumerate()
            .map(|(i, (key, value))| {
                let ebc = if i == 0 {
                    0
                } else {
                    common_prefix_len(&items[i - 1].0, key)
                };
                KEY_BLOCK_SIZE + (key.len() - ebc) + value.wire_len()
            })
            .collect();

        let mut candidates = Vec::new();
        for s in 1..n {
            // the first right record stores its full key
            let right_first = KEY_BLOCK_SIZE + items[s].0.len() + items[s].1.wire_len();

            let mut left_bytes: usize = sizes[..s].iter().sum();
            let mut right_bytes: usize =
                right_first + sizes[s + 1..].iter().sum::<usize>();
            let mut left_keys = s;
            let mut right_keys = n - s;

            let insert_left = insert_slot < s;
            if insert_left {
                left_bytes += insert_size;
                left_keys += 1;
            } else {
                right_bytes += insert_size;
                right_keys += 1;
            }

            if left_bytes <= capacity
                && right_bytes <= capacity
                && left_keys <= cap_keys
                && right_keys <= cap_keys
            {
                candidates.push(SplitCandidate {
                    index: s,
                    left_bytes,
                    right_bytes,
                    insert_left,
                });
            }
        }

        let chosen = policy.choose(&candidates).ok_or_else(|| {
            StoreError::new(
                ErrorKind::InvalidPageStructure,
                "no feasible split point for pending insert",
            )
        })?;
        let s = candidates[chosen].index;

        let pivot = items[s].0.clone();
        let mut right = Page::new_tree(self.page_type, self.page_size);
        right.set_items(&items[s..]);
        right.right_sibling = self.right_sibling;
        right.timestamp = self.timestamp;
        self.set_items(&items[..s]);

        Ok((right, pivot))
    }

    /// Fold `right` into `self`, or redistribute when a merged page
    /// would exceed the byte capacity or the max-keys cap. Both
    /// output pages of a redistribution respect both caps.
    pub fn join_or_rebalance(&mut self, right: &mut Page) -> Result<JoinResult, StoreError> {
        if self.page_type != right.page_type {
            return Err(StoreError::new(
                ErrorKind::InvalidPageType,
                "joining pages of different types",
            ));
        }

        let mut items = self.items();
        items.extend(right.items());
        let n = items.len();

        let merged_bytes: usize = {
            let mut prev: &[u8] = &[];
            let mut total = 0usize;
            for (i, (key, value)) in items.iter().enumerate() {
                let ebc = if i == 0 { 0 } else { common_prefix_len(prev, key) };
                total += KEY_BLOCK_SIZE + (key.len() - ebc) + value.wire_len();
                prev = key;
            }
            total
        };

        if merged_bytes <= self.capacity() && n <= self.max_keys() {
            self.set_items(&items);
            self.right_sibling = right.right_sibling;
            right.set_items(&[]);
            return Ok(JoinResult::Merged);
        }

        // redistribute: choose the byte-balanced cut among feasible
        // ones
        let mut best: Option<(usize, i64)> = None;
        for s in 1..n {
            let left_bytes: usize = {
                let mut prev: &[u8] = &[];
                let mut total = 0usize;
                for (i, (key, value)) in items[..s].iter().enumerate() {
                    let ebc = if i == 0 { 0 } else { common_prefix_len(prev, key) };
                    total += KEY_BLOCK_SIZE + (key.len() - ebc) + value.wire_len();
                    prev = key;
                }
                total
            };
            let right_bytes: usize = {
                let mut prev: &[u8] = &[];
                let mut total = 0usize;
                for (i, (key, value)) in items[s..].iter().enumerate() {
                    let ebc = if i == 0 { 0 } else { common_prefix_len(prev, key) };
                    total += KEY_BLOCK_SIZE + (key.len() - ebc) + value.wire_len();
                    prev = key;
                }
                total
            };
            if left_bytes <= self.capacity()
                && right_bytes <= self.capacity()
                && s <= self.max_keys()
                && n - s <= self.max_keys()
            {
                let imbalance = (left_bytes as i64 - right_bytes as i64).abs();
                if best.map(|(_, b)| imbalance < b).unwrap_or(true) {
                    best = Some((s, imbalance));
                }
            }
        }

        let (s, _) = best.ok_or_else(|| {
            StoreError::new(
                ErrorKind::InvalidPageStructure,
                "no feasible redistribution point",
            )
        })?;

        let pivot = items[s].0.clone();
        self.set_items(&items[..s]);
        right.set_items(&items[s..]);
        Ok(JoinResult::Rebalanced { pivot })
    }

    // ------------------------------------------------------------------
    // garbage body
    // ------------------------------------------------------------------

    fn garbage_body(&self) -> &Vec<PageAddr> {
        match &self.body {
            PageBody::Garbage { pages } => pages,
            _ => panic!("page {} is not a garbage page", self.page_type),
        }
    }

    pub fn garbage_capacity(&self) -> usize {
        self.capacity() / 8
    }

    pub fn garbage_count(&self) -> usize {
        self.garbage_body().len()
    }

    pub fn garbage_entries(&self) -> &[PageAddr] {
        self.garbage_body()
    }

    /// Append a freed page number; false when this garbage page is
    /// full.
    pub fn garbage_push(&mut self, addr: PageAddr) -> bool {
        let cap = self.garbage_capacity();
        match &mut self.body {
            PageBody::Garbage { pages } => {
                if pages.len() >= cap {
                    false
                } else {
                    pages.push(addr);
                    true
                }
            }
            _ => panic!("page {} is not a garbage page", self.page_type),
        }
    }

    pub fn garbage_pop(&mut self) -> Option<PageAddr> {
        match &mut self.body {
            PageBody::Garbage { pages } => pages.pop(),
            _ => panic!("page {} is not a garbage page", self.page_type),
        }
    }

    // ------------------------------------------------------------------
    // raw body
    // ------------------------------------------------------------------

    pub fn raw_bytes(&self) -> &[u8] {
        match &self.body {
            PageBody::Raw { bytes } => bytes,
            _ => panic!("page {} is not a raw page", self.page_type),
        }
    }

    pub fn set_raw_bytes(&mut self, new_bytes: Vec<u8>) -> Result<(), StoreError> {
        if new_bytes.len() > self.capacity() {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                "raw payload exceeds page capacity",
            ));
        }
        match &mut self.body {
            PageBody::Raw { bytes } => {
                *bytes = new_bytes;
                Ok(())
            }
            _ => panic!("page {} is not a raw page", self.page_type),
        }
    }

    // ------------------------------------------------------------------
    // codec
    // ------------------------------------------------------------------

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.page_size];

        let (count, bump): (u16, u16) = match &self.body {
            PageBody::Tree { records, .. } => {
                // heap blocks grow down from the page end, descriptors
                // up from the header
                let mut heap_off = self.page_size;
                for (i, r) in records.iter().enumerate() {
                    let block_len = r.suffix.len() + r.value.wire_len();
                    heap_off -= block_len;

                    buf[heap_off..heap_off + r.suffix.len()].copy_from_slice(&r.suffix);
                    let voff = heap_off + r.suffix.len();
                    let vlen: u16;
                    match &r.value {
                        ValueRef::Inline(bytes) => {
                            buf[voff..voff + bytes.len()].copy_from_slice(bytes);
                            vlen = bytes.len() as u16;
                        }
                        ValueRef::Long {
                            first_page,
                            total_len,
                        } => {
                            buf[voff..voff + 8].copy_from_slice(&first_page.to_le_bytes());
                            buf[voff + 8..voff + 16].copy_from_slice(&total_len.to_le_bytes());
                            vlen = 16 | LONG_VALUE_FLAG;
                        }
                    }

                    let d = PAGE_HEADER_SIZE + i * KEY_BLOCK_SIZE;
                    buf[d..d + 2].copy_from_slice(&(r.ebc as u16).to_le_bytes());
                    buf[d + 2..d + 4].copy_from_slice(&(r.suffix.len() as u16).to_le_bytes());
                    buf[d + 4..d + 6].copy_from_slice(&(heap_off as u16).to_le_bytes());
                    buf[d + 6..d + 8].copy_from_slice(&vlen.to_le_bytes());
                }
                (records.len() as u16, heap_off as u16)
            }
            PageBody::Garbage { pages } => {
                for (i, addr) in pages.iter().enumerate() {
                    let off = PAGE_HEADER_SIZE + i * 8;
                    buf[off..off + 8].copy_from_slice(&addr.to_le_bytes());
                }
                (pages.len() as u16, 0)
            }
            PageBody::Raw { bytes } => {
                buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + bytes.len()].copy_from_slice(bytes);
                (0, bytes.len() as u16)
            }
        };

        buf[0..2].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
        buf[2] = self.page_type.to_u8();
        buf[3] = 0;
        buf[4..8].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..24].copy_from_slice(&self.right_sibling.to_le_bytes());
        buf[24..26].copy_from_slice(&count.to_le_bytes());
        buf[26..28].copy_from_slice(&bump.to_le_bytes());

        let checksum = page_checksum(&buf);
        buf[28..32].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Page, StoreError> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                "page image shorter than the header",
            ));
        }

        let mut reader = Cursor::new(bytes);
        let magic = u16::decode_from(&mut reader);
        if magic != PAGE_MAGIC {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                &format!("bad page magic: {:#06x}", magic),
            ));
        }
        let page_type = PageType::from_u8(u8::decode_from(&mut reader))?;
        let _reserved = u8::decode_from(&mut reader);
        let page_size = u32::decode_from(&mut reader) as usize;
        if !VALID_PAGE_SIZES.contains(&page_size) || page_size != bytes.len() {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                &format!("bad page size field: {}", page_size),
            ));
        }
        let timestamp = u64::decode_from(&mut reader);
        let right_sibling = u64::decode_from(&mut reader);
        let count = u16::decode_from(&mut reader) as usize;
        let bump = u16::decode_from(&mut reader) as usize;
        let stored_checksum = u32::decode_from(&mut reader);

        let mut check_buf = bytes.to_vec();
        check_buf[28..32].copy_from_slice(&[0; 4]);
        let computed = page_checksum(&check_buf);
        if computed != stored_checksum {
            return Err(StoreError::new(
                ErrorKind::InvalidPageStructure,
                &format!(
                    "page checksum mismatch: stored {:#010x}, computed {:#010x}",
                    stored_checksum, computed
                ),
            ));
        }

        let body = match page_type {
            PageType::Data | PageType::Index => {
                let mut records = Vec::with_capacity(count);
                for i in 0..count {
                    let d = PAGE_HEADER_SIZE + i * KEY_BLOCK_SIZE;
                    if d + KEY_BLOCK_SIZE > page_size {
                        return Err(StoreError::new(
                            ErrorKind::InvalidPageStructure,
                            "key block descriptors overflow the page",
                        ));
                    }
                    let ebc =
                        u16::from_le_bytes(bytes[d..d + 2].try_into().unwrap()) as usize;
                    let suffix_len =
                        u16::from_le_bytes(bytes[d + 2..d + 4].try_into().unwrap()) as usize;
                    let heap_off =
                        u16::from_le_bytes(bytes[d + 4..d + 6].try_into().unwrap()) as usize;
                    let vlen_raw = u16::from_le_bytes(bytes[d + 6..d + 8].try_into().unwrap());
                    let is_long = vlen_raw & LONG_VALUE_FLAG != 0;
                    let vlen = (vlen_raw & !LONG_VALUE_FLAG) as usize;

                    let block_end = heap_off + suffix_len + vlen;
                    if heap_off < PAGE_HEADER_SIZE + count * KEY_BLOCK_SIZE
                        || block_end > page_size
                    {
                        return Err(StoreError::new(
                            ErrorKind::InvalidPageStructure,
                            &format!("key block {} heap range out of bounds", i),
                        ));
                    }

                    let suffix = bytes[heap_off..heap_off + suffix_len].to_vec();
                    let voff = heap_off + suffix_len;
                    let value = if is_long {
                        if vlen != 16 {
                            return Err(StoreError::new(
                                ErrorKind::InvalidPageStructure,
                                "long-record pointer has a bad length",
                            ));
                        }
                        ValueRef::Long {
                            first_page: u64::from_le_bytes(
                                bytes[voff..voff + 8].try_into().unwrap(),
                            ),
                            total_len: u64::from_le_bytes(
                                bytes[voff + 8..voff + 16].try_into().unwrap(),
                            ),
                        }
                    } else {
                        ValueRef::Inline(bytes[voff..voff + vlen].to_vec())
                    };
                    records.push(KeyBlock::new(ebc, suffix, value));
                }
                let fast_index = FastIndex::rebuild(&records);
                PageBody::Tree {
                    records,
                    fast_index,
                }
            }
            PageType::Garbage => {
                let mut pages = Vec::with_capacity(count);
                for i in 0..count {
                    let off = PAGE_HEADER_SIZE + i * 8;
                    if off + 8 > page_size {
                        return Err(StoreError::new(
                            ErrorKind::InvalidPageStructure,
                            "garbage entries overflow the page",
                        ));
                    }
                    pages.push(u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()));
                }
                PageBody::Garbage { pages }
            }
            PageType::Head | PageType::LongRecord => {
                if PAGE_HEADER_SIZE + bump > page_size {
                    return Err(StoreError::new(
                        ErrorKind::InvalidPageStructure,
                        "raw payload length overflows the page",
                    ));
                }
                PageBody::Raw {
                    bytes: bytes[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + bump].to_vec(),
                }
            }
        };

        let page = Page {
            page_type,
            page_size,
            timestamp,
            right_sibling,
            body,
        };
        page.validate()?;
        Ok(page)
    }

    /// Decode a page that must come up in a particular role.
    pub fn decode_expect(bytes: &[u8], expect: PageType) -> Result<Page, StoreError> {
        let page = Page::decode(bytes)?;
        if page.page_type != expect {
            return Err(StoreError::new(
                ErrorKind::InvalidPageType,
                &format!("expected a {} page, found {}", expect, page.page_type),
            ));
        }
        Ok(page)
    }

    /// Structural invariants: ascending keys, sane elision, content
    /// within capacity.
    pub fn validate(&self) -> Result<(), StoreError> {
        match &self.body {
            PageBody::Tree {
                records,
                fast_index,
            } => {
                fast_index.validate(records)?;
                if records.len() > self.max_keys() {
                    return Err(StoreError::new(
                        ErrorKind::InvalidPageStructure,
                        &format!(
                            "page carries {} key blocks, cap is {}",
                            records.len(),
                            self.max_keys()
                        ),
                    ));
                }
                if self.used_space() > self.capacity() {
                    return Err(StoreError::new(
                        ErrorKind::InvalidPageStructure,
                        "page content exceeds capacity",
                    ));
                }
                let mut prev: Vec<u8> = Vec::new();
                for (i, r) in records.iter().enumerate() {
                    let mut key = prev.clone();
                    key.truncate(r.ebc);
                    key.extend_from_slice(&r.suffix);
                    if i > 0 && key <= prev {
                        return Err(StoreError::new(
                            ErrorKind::InvalidPageStructure,
                            &format!("key blocks not strictly ascending at slot {}", i),
                        ));
                    }
                    prev = key;
                }
                Ok(())
            }
            PageBody::Garbage { pages } => {
                if pages.len() > self.garbage_capacity() {
                    return Err(StoreError::new(
                        ErrorKind::InvalidPageStructure,
                        "garbage page entry count exceeds capacity",
                    ));
                }
                Ok(())
            }
            PageBody::Raw { bytes } => {
                if bytes.len() > self.capacity() {
                    return Err(StoreError::new(
                        ErrorKind::InvalidPageStructure,
                        "raw payload exceeds capacity",
                    ));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{} page, size: {}, ts: {}, right: {}, entries: {}>",
            self.page_type,
            self.page_size,
            self.timestamp,
            self.right_sibling,
            match &self.body {
                PageBody::Tree { records, .. } => records.len(),
                PageBody::Garbage { pages } => pages.len(),
                PageBody::Raw { bytes } => bytes.len(),
            }
        )
    }
}

/// CRC32 of a page image with the checksum field zeroed.
pub fn page_checksum(bytes: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..28]);
    hasher.update(&[0; 4]);
    hasher.update(&bytes[32..]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::split::SplitPolicy;

    fn filled_page(keys: &[&[u8]]) -> Page {
        let mut page = Page::new_data(1024);
        let items: Vec<(Vec<u8>, ValueRef)> = keys
            .iter()
            .map(|k| (k.to_vec(), ValueRef::Inline(vec![0xAB; 4])))
            .collect();
        page.set_items(&items);
        page
    }

    #[test]
    fn test_find_key_with_elision() {
        let page = filled_page(&[b"apple", b"apricot", b"banana", b"bandana", b"cherry"]);
        assert_eq!(page.find_key(b"apple"), (0, true));
        assert_eq!(page.find_key(b"apricot"), (1, true));
        assert_eq!(page.find_key(b"bandana"), (3, true));
        assert_eq!(page.find_key(b"aaa"), (0, false));
        assert_eq!(page.find_key(b"azzz"), (2, false));
        assert_eq!(page.find_key(b"band"), (3, false));
        assert_eq!(page.find_key(b"zzz"), (5, false));
    }

    #[test]
    fn test_insert_remove_maintain_elision() {
        let mut page = filled_page(&[b"car", b"cartoon", b"cat"]);
        let (slot, found) = page.find_key(b"carbon");
        assert!(!found);
        page.insert_record(slot, b"carbon", ValueRef::Inline(vec![1]))
            .unwrap();
        page.validate().unwrap();
        assert_eq!(page.key_at(0), b"car".to_vec());
        assert_eq!(page.key_at(1), b"carbon".to_vec());
        assert_eq!(page.key_at(2), b"cartoon".to_vec());

        page.remove_record(1).unwrap();
        page.validate().unwrap();
        assert_eq!(page.key_at(1), b"cartoon".to_vec());
        assert_eq!(page.find_key(b"carbon"), (1, false));
    }

    #[test]
    fn test_codec_round_trip() {
        let mut page = filled_page(&[b"alpha", b"alphabet", b"beta"]);
        page.set_timestamp(99);
        page.set_right_sibling(7);

        let bytes = page.encode();
        assert_eq!(bytes.len(), 1024);
        let decoded = Page::decode(&bytes).unwrap();
        assert_eq!(decoded.page_type(), PageType::Data);
        assert_eq!(decoded.timestamp(), 99);
        assert_eq!(decoded.right_sibling(), 7);
        assert_eq!(decoded.items(), page.items());
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let page = filled_page(&[b"k1", b"k2"]);
        let mut bytes = page.encode();
        bytes[100] ^= 0xFF;
        let err = Page::decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPageStructure);
    }

    #[test]
    fn test_decode_expect_role() {
        let page = Page::new_garbage(1024);
        let bytes = page.encode();
        let err = Page::decode_expect(&bytes, PageType::Data).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPageType);
    }

    #[test]
    fn test_long_value_round_trip() {
        let mut page = Page::new_data(1024);
        page.set_items(&[(
            b"big".to_vec(),
            ValueRef::Long {
                first_page: 42,
                total_len: 100_000,
            },
        )]);
        let decoded = Page::decode(&page.encode()).unwrap();
        assert_eq!(
            decoded.value_at(0),
            &ValueRef::Long {
                first_page: 42,
                total_len: 100_000
            }
        );
    }

    #[test]
    fn test_garbage_round_trip() {
        let mut page = Page::new_garbage(1024);
        assert!(page.garbage_push(10));
        assert!(page.garbage_push(11));
        let decoded = Page::decode(&page.encode()).unwrap();
        assert_eq!(decoded.garbage_entries(), &[10, 11]);
    }

    #[test]
    fn test_split_respects_caps() {
        let keys: Vec<Vec<u8>> = (0..40u32)
            .map(|i| format!("key{:05}", i).into_bytes())
            .collect();
        let items: Vec<(Vec<u8>, ValueRef)> = keys
            .iter()
            .map(|k| (k.clone(), ValueRef::Inline(vec![0; 12])))
            .collect();
        let mut page = Page::new_data(1024);
        page.set_items(&items);

        let (right, pivot) = page
            .split(SplitPolicy::NiceBias, 40, 8, 12)
            .expect("split must find a feasible point");
        assert!(page.key_count() <= page.max_keys());
        assert!(right.key_count() <= right.max_keys());
        assert_eq!(pivot, right.key_at(0));
        page.validate().unwrap();
        right.validate().unwrap();
    }

    #[test]
    fn test_join_merges_when_it_fits() {
        let mut left = filled_page(&[b"a", b"b"]);
        let mut right = filled_page(&[b"x", b"y"]);
        right.set_right_sibling(33);
        let result = left.join_or_rebalance(&mut right).unwrap();
        assert_eq!(result, JoinResult::Merged);
        assert_eq!(left.key_count(), 4);
        assert_eq!(left.right_sibling(), 33);
        left.validate().unwrap();
    }

    #[test]
    fn test_join_rebalances_over_cap() {
        // two pages that cannot merge: the combined byte count is
        // over capacity
        let left_items: Vec<(Vec<u8>, ValueRef)> = (0..10u32)
            .map(|i| {
                (
                    format!("l{:03}", i).into_bytes(),
                    ValueRef::Inline(vec![0; 40]),
                )
            })
            .collect();
        let right_items: Vec<(Vec<u8>, ValueRef)> = (0..10u32)
            .map(|i| {
                (
                    format!("r{:03}", i).into_bytes(),
                    ValueRef::Inline(vec![0; 40]),
                )
            })
            .collect();
        let mut left = Page::new_data(1024);
        left.set_items(&left_items);
        let mut right = Page::new_data(1024);
        right.set_items(&right_items);

        match left.join_or_rebalance(&mut right).unwrap() {
            JoinResult::Rebalanced { pivot } => {
                assert_eq!(pivot, right.key_at(0));
                assert!(left.key_count() <= left.max_keys());
                assert!(right.key_count() <= right.max_keys());
                assert!(left.used_space() <= left.capacity());
                assert!(right.used_space() <= right.capacity());
            }
            other => panic!("expected a rebalance, got {:?}", other),
        }
    }
}
