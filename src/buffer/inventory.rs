use std::{convert::TryInto, path::Path};

use log::{debug, warn};

use crate::{
    database::Database,
    error::StoreError,
    types::{PageKey, StoreResult},
};

use super::claim::{ClaimMode, Session};

const INVENTORY_MAGIC: u32 = 0x50_52_49_56;

/// Snapshot the resident `(volume, page)` pairs so the next open can
/// warm the pool before the workload arrives.
///
/// # Format
///
/// `magic u32 | count u32 | count * (volume u32, page u64) | crc32`
pub fn write_inventory(path: &Path, keys: &[PageKey]) -> StoreResult {
    let mut buf = Vec::with_capacity(8 + keys.len() * 12 + 4);
    buf.extend_from_slice(&INVENTORY_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(keys.len() as u32).to_le_bytes());
    for key in keys {
        buf.extend_from_slice(&key.volume_id.to_le_bytes());
        buf.extend_from_slice(&key.page_addr.to_le_bytes());
    }
    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    // write-then-rename so a torn snapshot is never picked up
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, path)?;
    debug!("buffer inventory: {} pages snapshotted", keys.len());
    Ok(())
}

pub fn read_inventory(path: &Path) -> Result<Vec<PageKey>, StoreError> {
    let buf = std::fs::read(path)?;
    if buf.len() < 12 {
        return Err(StoreError::io("inventory file is truncated"));
    }
    let (body, crc_bytes) = buf.split_at(buf.len() - 4);
    let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    if crc32fast::hash(body) != stored {
        return Err(StoreError::io("inventory checksum mismatch"));
    }
    if u32::from_le_bytes(body[0..4].try_into().unwrap()) != INVENTORY_MAGIC {
        return Err(StoreError::io("bad inventory magic"));
    }
    let count = u32::from_le_bytes(body[4..8].try_into().unwrap()) as usize;
    if body.len() != 8 + count * 12 {
        return Err(StoreError::io("inventory length mismatch"));
    }
    let mut keys = Vec::with_capacity(count);
    for i in 0..count {
        let off = 8 + i * 12;
        keys.push(PageKey::new(
            u32::from_le_bytes(body[off..off + 4].try_into().unwrap()),
            u64::from_le_bytes(body[off + 4..off + 12].try_into().unwrap()),
        ));
    }
    Ok(keys)
}

/// Pull the previously resident pages back into the pool. Pages that
/// no longer resolve (dropped volume, freed page) are skipped.
pub fn preload(session: &Session, path: &Path) -> usize {
    let keys = match read_inventory(path) {
        Ok(keys) => keys,
        Err(_) => return 0,
    };

    let mut loaded = 0;
    for key in keys {
        if key.page_addr == 0 {
            continue;
        }
        let volume = match Database::catalog().volume(key.volume_id) {
            Some(v) => v,
            None => continue,
        };
        match Database::buffer_pool().get_page(session, ClaimMode::Shared, &volume, key.page_addr)
        {
            Ok(_guard) => loaded += 1,
            Err(e) => {
                warn!("inventory preload skipped {}: {}", key, e);
            }
        }
    }
    debug!("buffer inventory: {} pages preloaded", loaded);
    loaded
}
