use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use log::{debug, warn};

use crate::{
    database::Database,
    error::StoreError,
    page::Page,
    types::{PageKey, Pod, SessionId, StoreResult},
    utils::HandyRwLock,
    volume::Volume,
};

use super::claim::{ClaimMode, ClaimTable, Session};

/// Hit/miss/eviction counters, logged at close.
#[derive(Debug, Default)]
pub struct PoolStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

struct Frame {
    page: Pod<Page>,
    page_size: usize,
    dirty: bool,
    clock_ref: bool,
}

struct PoolInner {
    frames: HashMap<PageKey, Frame>,
    /// clock order; holds stale keys that are skipped lazily
    clock: Vec<PageKey>,
    hand: usize,
    /// resident frame count per page size
    counts: HashMap<usize, usize>,
}

/// Fixed-capacity page cache. One logical pool per page size shares
/// the frame table; capacity is enforced per page size.
///
/// All access goes through claims: callers hold a shared or exclusive
/// claim on the page for as long as the returned guard lives.
pub struct BufferPool {
    inner: Mutex<PoolInner>,
    claims: ClaimTable,
    /// frame capacity per page size
    capacities: HashMap<usize, usize>,
    default_capacity: usize,
    stats: PoolStats,
}

/// A latched page. Dropping the guard releases the claim.
pub struct PageGuard {
    key: PageKey,
    session: SessionId,
    mode: ClaimMode,
    page: Pod<Page>,
}

impl PageGuard {
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn mode(&self) -> ClaimMode {
        self.mode
    }

    pub fn page(&self) -> Pod<Page> {
        Arc::clone(&self.page)
    }

    /// Promote a shared guard in place; fails with the internal
    /// `Retry` signal when other readers are present, in which case
    /// the caller drops the guard and reacquires exclusively.
    pub fn upgrade(&mut self) -> StoreResult {
        if self.mode == ClaimMode::Exclusive {
            return Ok(());
        }
        Database::buffer_pool().claims.upgrade(self.session, self.key)?;
        self.mode = ClaimMode::Exclusive;
        Ok(())
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        Database::buffer_pool()
            .claims
            .release(self.session, self.key, self.mode);
    }
}

impl BufferPool {
    pub fn new(capacities: HashMap<usize, usize>, default_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                frames: HashMap::new(),
                clock: Vec::new(),
                hand: 0,
                counts: HashMap::new(),
            }),
            claims: ClaimTable::new(),
            capacities,
            default_capacity,
            stats: PoolStats::default(),
        }
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    fn capacity(&self, page_size: usize) -> usize {
        *self.capacities.get(&page_size).unwrap_or(&self.default_capacity)
    }

    /// Fetch a page under a claim. On a miss the image is read
    /// journal-first: a page whose latest durable image only exists
    /// in the journal must never be read from the volume file.
    pub fn get_page(
        &self,
        session: &Session,
        mode: ClaimMode,
        volume: &Arc<Volume>,
        page_addr: u64,
    ) -> Result<PageGuard, StoreError> {
        assert_ne!(page_addr, 0, "the superblock is not cached");
        let key = PageKey::new(volume.id(), page_addr);
        self.claims
            .acquire(session.id(), key, mode, session.timeout())?;

        let guard = (|| {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(frame) = inner.frames.get_mut(&key) {
                    frame.clock_ref = true;
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(PageGuard {
                        key,
                        session: session.id(),
                        mode,
                        page: Arc::clone(&frame.page),
                    });
                }
            }

            // miss: load outside the table lock. The claim prevents a
            // racing writer from owning the frame while we read.
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            let image = self.read_image(volume, page_addr)?;
            let page = Page::decode(&image)?;
            let page_size = volume.page_size();

            let mut inner = self.inner.lock().unwrap();
            if let Some(frame) = inner.frames.get(&key) {
                // another reader completed the load first
                return Ok(PageGuard {
                    key,
                    session: session.id(),
                    mode,
                    page: Arc::clone(&frame.page),
                });
            }
            self.make_room(&mut inner, page_size);
            let pod = Arc::new(RwLock::new(page));
            inner.frames.insert(
                key,
                Frame {
                    page: Arc::clone(&pod),
                    page_size,
                    dirty: false,
                    clock_ref: true,
                },
            );
            inner.clock.push(key);
            *inner.counts.entry(page_size).or_insert(0) += 1;
            Ok(PageGuard {
                key,
                session: session.id(),
                mode,
                page: pod,
            })
        })();

        if guard.is_err() {
            self.claims.release(session.id(), key, mode);
        }
        guard
    }

    fn read_image(&self, volume: &Arc<Volume>, page_addr: u64) -> Result<Vec<u8>, StoreError> {
        let key = PageKey::new(volume.id(), page_addr);
        let journal_addr = Database::journal_manager().lookup_page(&key);
        match journal_addr {
            Some(addr) => {
                debug!("page {} read from journal at {}", key, addr);
                Database::journal_manager().read_page_image(addr)
            }
            None => volume.read_page_image(page_addr),
        }
    }

    /// Put a brand-new page (fresh allocation, split output) into the
    /// pool under an exclusive claim, replacing any stale frame.
    pub fn install(
        &self,
        session: &Session,
        volume: &Arc<Volume>,
        page_addr: u64,
        page: Page,
    ) -> Result<PageGuard, StoreError> {
        assert_ne!(page_addr, 0, "the superblock is not cached");
        let key = PageKey::new(volume.id(), page_addr);
        self.claims
            .acquire(session.id(), key, ClaimMode::Exclusive, session.timeout())?;

        let page_size = volume.page_size();
        let mut inner = self.inner.lock().unwrap();
        if inner.frames.remove(&key).is_some() {
            *inner.counts.get_mut(&page_size).unwrap() -= 1;
        }
        self.make_room(&mut inner, page_size);
        let pod = Arc::new(RwLock::new(page));
        inner.frames.insert(
            key,
            Frame {
                page: Arc::clone(&pod),
                page_size,
                dirty: true,
                clock_ref: true,
            },
        );
        inner.clock.push(key);
        *inner.counts.entry(page_size).or_insert(0) += 1;
        Ok(PageGuard {
            key,
            session: session.id(),
            mode: ClaimMode::Exclusive,
            page: pod,
        })
    }

    /// Evict one clean frame of `page_size` when the pool is at
    /// capacity. Dirty frames are never evicted here: the page writer
    /// journals the whole dirty set in one pass (so a half-propagated
    /// split never reaches the journal one page at a time), and only
    /// then are those frames clean enough to reuse.
    fn make_room(&self, inner: &mut PoolInner, page_size: usize) {
        let capacity = self.capacity(page_size);
        if *inner.counts.get(&page_size).unwrap_or(&0) < capacity {
            return;
        }

        let mut steps = 0;
        let max_steps = inner.clock.len() * 2;
        while steps < max_steps && !inner.clock.is_empty() {
            steps += 1;
            if inner.hand >= inner.clock.len() {
                inner.hand = 0;
            }
            let key = inner.clock[inner.hand];

            let frame = match inner.frames.get_mut(&key) {
                Some(f) => f,
                None => {
                    // stale clock entry
                    inner.clock.remove(inner.hand);
                    continue;
                }
            };
            if frame.page_size != page_size {
                inner.hand += 1;
                continue;
            }
            if frame.clock_ref {
                frame.clock_ref = false;
                inner.hand += 1;
                continue;
            }
            if self.claims.is_claimed(&key) {
                inner.hand += 1;
                continue;
            }
            if frame.dirty {
                // hand the dirty set to the journal in one batch: the
                // pages of a half-propagated split reach it together
                // or not at all, then this victim is clean
                self.flush_dirty_locked(inner);
                continue;
            }

            inner.frames.remove(&key);
            inner.clock.remove(inner.hand);
            *inner.counts.get_mut(&page_size).unwrap() -= 1;
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            return;
        }

        warn!(
            "buffer pool for page size {} over capacity: every frame is claimed or dirty",
            page_size
        );
    }

    /// Journal every dirty, unclaimed frame. Runs under the table
    /// lock; claimed frames are mid-mutation and wait for the next
    /// pass.
    fn flush_dirty_locked(&self, inner: &mut PoolInner) {
        for (key, frame) in inner.frames.iter_mut() {
            if !frame.dirty || self.claims.is_claimed(key) {
                continue;
            }
            let image = frame.page.rl().encode();
            let ts = frame.page.rl().timestamp();
            match Database::journal_manager().append_page_image(*key, &image, ts) {
                Ok(_) => frame.dirty = false,
                Err(e) => warn!("could not journal dirty page {}: {}", key, e),
            }
        }
    }

    /// Mark a resident page dirty. Caller holds the exclusive claim.
    pub fn mark_dirty(&self, key: &PageKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(frame) = inner.frames.get_mut(key) {
            frame.dirty = true;
        }
    }

    /// Drop a frame without writing it anywhere. Used when a freed
    /// page's stale image must not be served again.
    pub fn discard(&self, key: &PageKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(frame) = inner.frames.remove(key) {
            *inner.counts.get_mut(&frame.page_size).unwrap() -= 1;
        }
    }

    pub fn resident_keys(&self) -> Vec<PageKey> {
        let inner = self.inner.lock().unwrap();
        inner.frames.keys().cloned().collect()
    }

    pub fn dirty_keys(&self) -> Vec<PageKey> {
        let inner = self.inner.lock().unwrap();
        inner
            .frames
            .iter()
            .filter(|(_, f)| f.dirty)
            .map(|(k, _)| *k)
            .collect()
    }

    /// The page-writer pass: journal the image of every dirty frame
    /// and mark it clean. With `wait` false, frames whose claim is
    /// contended are skipped and picked up on the next pass.
    pub fn write_dirty_pages(&self, session: &Session, wait: bool) -> Result<usize, StoreError> {
        let mut written = 0;
        for key in self.dirty_keys() {
            let claimed = if wait {
                self.claims
                    .acquire(session.id(), key, ClaimMode::Shared, session.timeout())
                    .is_ok()
            } else {
                self.claims.try_acquire(session.id(), key, ClaimMode::Shared)
            };
            if !claimed {
                continue;
            }

            let result = (|| -> StoreResult {
                let mut inner = self.inner.lock().unwrap();
                let frame = match inner.frames.get_mut(&key) {
                    Some(f) if f.dirty => f,
                    _ => return Ok(()),
                };
                let image = frame.page.rl().encode();
                let ts = frame.page.rl().timestamp();
                Database::journal_manager().append_page_image(key, &image, ts)?;
                frame.dirty = false;
                written += 1;
                Ok(())
            })();
            self.claims.release(session.id(), key, ClaimMode::Shared);
            result?;
        }
        Ok(written)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.frames.clear();
        inner.clock.clear();
        inner.counts.clear();
        inner.hand = 0;
    }

    pub fn log_stats(&self) {
        debug!(
            "buffer pool: {} hits, {} misses, {} evictions",
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
            self.stats.evictions.load(Ordering::Relaxed),
        );
    }

}
