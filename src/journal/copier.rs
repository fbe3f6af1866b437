use log::{debug, warn};

use crate::{
    database::Database,
    error::StoreError,
    page::Page,
    volume::VolumeHeader,
};

/// One copier cycle: write every durable journaled page image back to
/// its volume file, retire the satisfied page-map entries, then
/// advance the base address and prune obsolete journal files.
///
/// Only durable records are copied, so the write-ahead invariant
/// holds: a page reaches its volume file strictly after the journal
/// records describing it are fsynced.
pub fn copy_back_pages() -> Result<usize, StoreError> {
    let durable = Database::journal_manager().durable_addr();
    let entries = Database::journal_manager().page_map_entries();

    let mut copied = 0;
    for (key, addr) in entries {
        if addr >= durable {
            // still only in the ring buffer
            continue;
        }

        let volume = match Database::catalog().volume(key.volume_id) {
            Some(v) => v,
            None => {
                warn!("copier: volume {} is gone, image at {} kept", key.volume_id, addr);
                continue;
            }
        };

        let image = Database::journal_manager().read_page_image(addr)?;

        // verify the image before it can reach the volume file
        if key.page_addr == 0 {
            VolumeHeader::decode(&image)?;
        } else {
            Page::decode(&image)?;
        }

        volume.write_page_image(key.page_addr, &image)?;
        Database::journal_manager().copied_back(&key, addr);
        copied += 1;
    }

    for volume in Database::catalog().volumes() {
        volume.sync()?;
    }

    let base = Database::journal_manager().recompute_base()?;
    if copied > 0 {
        debug!("copier: {} pages copied back, base address {}", copied, base);
    }
    Ok(copied)
}
