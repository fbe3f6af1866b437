use std::sync::Arc;

use log::debug;

use crate::{
    buffer::{ClaimMode, Session},
    database::Database,
    error::{ErrorKind, StoreError},
    page::Page,
    types::{PageAddr, PageKey, StoreResult},
    utils::HandyRwLock,
};

use super::Volume;

/// Chain mutations go to the journal before the affected page can be
/// handed out or the superblock can point at it; recovery then never
/// resurrects a popped entry.
fn journal_chain_page(guard: &crate::buffer::PageGuard) -> StoreResult {
    let pod = guard.page();
    let image = pod.rl().encode();
    let ts = pod.rl().timestamp();
    Database::journal_manager()
        .append_page_image(guard.key(), &image, ts)
        .map(|_| ())
}

/// Pop a free page off the garbage chain, or bump the high-water
/// mark. The chain is the sole authority for free pages.
///
/// When the head garbage page runs out of entries the head itself is
/// the allocation result and its right sibling becomes the new chain
/// root.
pub fn allocate_page(session: &Session, volume: &Arc<Volume>) -> Result<PageAddr, StoreError> {
    let result;
    {
        // superblock mutations serialize on the header lock, taken
        // before any garbage-page claim
        let mut header = volume.header();

        if header.garbage_root != 0 {
            let head_addr = header.garbage_root;
            let guard = Database::buffer_pool().get_page(
                session,
                ClaimMode::Exclusive,
                volume,
                head_addr,
            )?;
            let popped = guard.page().wl().garbage_pop();
            match popped {
                Some(addr) => {
                    Database::buffer_pool().mark_dirty(&guard.key());
                    journal_chain_page(&guard)?;
                    result = addr;
                }
                None => {
                    // exhausted head: reuse the head page itself
                    header.garbage_root = guard.page().rl().right_sibling();
                    Database::buffer_pool().discard(&guard.key());
                    result = head_addr;
                }
            }
        } else if header.next_available_page < header.max_page_count {
            result = header.next_available_page;
            header.next_available_page += 1;
            header.highest_used = header.highest_used.max(result);
        } else {
            return Err(StoreError::new(
                ErrorKind::VolumeFull,
                &format!("volume {} has no allocatable pages left", volume.id()),
            ));
        }
    }

    Database::journal_superblock(volume)?;
    debug!("volume {}: allocated page {}", volume.id(), result);
    Ok(result)
}

/// Return a page to the free list. The freed page is appended to the
/// head garbage page; when the head is full (or the chain is empty)
/// the freed page itself becomes the new head.
pub fn free_page(session: &Session, volume: &Arc<Volume>, addr: PageAddr) -> StoreResult {
    assert_ne!(addr, 0, "the superblock cannot be freed");
    {
        let mut header = volume.header();

        if header.garbage_root != 0 {
            let guard = Database::buffer_pool().get_page(
                session,
                ClaimMode::Exclusive,
                volume,
                header.garbage_root,
            )?;
            let pushed = guard.page().wl().garbage_push(addr);
            if pushed {
                Database::buffer_pool().mark_dirty(&guard.key());
                journal_chain_page(&guard)?;
                debug!("volume {}: freed page {}", volume.id(), addr);
                return Ok(());
            }
        }

        // the freed page becomes the new chain head
        let mut page = Page::new_garbage(volume.page_size());
        page.set_right_sibling(header.garbage_root);
        page.set_timestamp(Database::timestamps().current());
        Database::buffer_pool().discard(&PageKey::new(volume.id(), addr));
        let guard = Database::buffer_pool().install(session, volume, addr, page)?;
        journal_chain_page(&guard)?;
        header.garbage_root = addr;
    }

    Database::journal_superblock(volume)?;
    debug!("volume {}: freed page {} as new garbage root", volume.id(), addr);
    Ok(())
}

/// Walk the whole chain; used by integrity checks and tests.
pub fn chain_pages(session: &Session, volume: &Arc<Volume>) -> Result<Vec<PageAddr>, StoreError> {
    let mut out = Vec::new();
    let mut next = volume.header().garbage_root;
    while next != 0 {
        let guard =
            Database::buffer_pool().get_page(session, ClaimMode::Shared, volume, next)?;
        let page = guard.page();
        let page = page.rl();
        out.extend_from_slice(page.garbage_entries());
        out.push(next);
        next = page.right_sibling();
    }
    Ok(out)
}
