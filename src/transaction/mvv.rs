use std::io::Cursor;

use crate::{
    io::{read_exact, Decodeable, StoreWriter},
    types::Timestamp,
};

/// First byte of an MVV-encoded value. A bare (primordial) value
/// never starts with this byte; one that would is escaped as a
/// one-version MVV.
pub const MVV_MARKER: u8 = 0xFE;

/// Version handle of a value that predates version tracking (or
/// whose writer has been pruned out of the live table).
pub const PRIMORDIAL_HANDLE: u64 = 0;

const FLAG_ANTI: u8 = 0x01;

/// What the live transaction table knows about a version handle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VersionStatus {
    Running,
    Committed(Timestamp),
    Aborted,
    /// Not in the table: the writer committed long ago and was
    /// retired.
    Retired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    /// The writing transaction's start timestamp.
    pub handle: u64,
    /// Tombstone: hides any older version.
    pub anti: bool,
    pub bytes: Vec<u8>,
}

/// A multi-version value: the versions of one key, oldest first.
/// Install order matches commit order because write-write conflict
/// detection admits one uncommitted writer per key at a time.
///
/// # Wire form
///
/// `0xFE` then per version: `handle u64 | flags u8 | len u32 | bytes`.
#[derive(Debug, Clone, PartialEq)]
pub struct Mvv {
    versions: Vec<Version>,
}

impl Mvv {
    pub fn empty() -> Self {
        Self {
            versions: Vec::new(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.first() != Some(&MVV_MARKER) {
            // a bare value is a one-version primordial MVV
            return Self {
                versions: vec![Version {
                    handle: PRIMORDIAL_HANDLE,
                    anti: false,
                    bytes: bytes.to_vec(),
                }],
            };
        }

        let mut versions = Vec::new();
        let mut r = Cursor::new(&bytes[1..]);
        let total = (bytes.len() - 1) as u64;
        while r.position() < total {
            let handle = u64::decode_from(&mut r);
            let flags = u8::decode_from(&mut r);
            let len = u32::decode_from(&mut r) as usize;
            let bytes = read_exact(&mut r, len);
            versions.push(Version {
                handle,
                anti: flags & FLAG_ANTI != 0,
                bytes,
            });
        }
        Self { versions }
    }

    pub fn encode(&self) -> Vec<u8> {
        if self.versions.len() == 1 {
            let v = &self.versions[0];
            if v.handle == PRIMORDIAL_HANDLE && !v.anti && v.bytes.first() != Some(&MVV_MARKER) {
                return v.bytes.clone();
            }
        }
        let mut w = StoreWriter::new();
        w.write(&MVV_MARKER);
        for v in &self.versions {
            w.write(&v.handle);
            w.write(&(if v.anti { FLAG_ANTI } else { 0u8 }));
            w.write(&(v.bytes.len() as u32));
            w.write_bytes(&v.bytes);
        }
        w.to_bytes()
    }

    pub fn versions(&self) -> &[Version] {
        &self.versions
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Install (or idempotently replace) the version written under
    /// `handle`. Returns true when the handle was not present before,
    /// so the caller can register it with the live table exactly
    /// once; replay of a recovered transaction replaces in place.
    pub fn install(&mut self, handle: u64, anti: bool, bytes: Vec<u8>) -> bool {
        let fresh = if let Some(pos) = self.versions.iter().position(|v| v.handle == handle) {
            self.versions.remove(pos);
            false
        } else {
            true
        };
        self.versions.push(Version {
            handle,
            anti,
            bytes,
        });
        fresh
    }

    /// The version a reader at snapshot `snapshot` sees: the newest
    /// one whose writer is the reader itself, is primordial, or
    /// committed at or before the snapshot. Versions of running or
    /// aborted writers are invisible.
    pub fn visible_for<F>(
        &self,
        snapshot: Timestamp,
        own: Option<u64>,
        resolve: F,
    ) -> Option<&Version>
    where
        F: Fn(u64) -> VersionStatus,
    {
        for v in self.versions.iter().rev() {
            if Some(v.handle) == own {
                return Some(v);
            }
            if v.handle == PRIMORDIAL_HANDLE {
                return Some(v);
            }
            match resolve(v.handle) {
                VersionStatus::Committed(cts) if cts <= snapshot => return Some(v),
                VersionStatus::Retired => return Some(v),
                _ => continue,
            }
        }
        None
    }

    /// Scan for a version by a still-running writer other than
    /// `self_handle`; the handle found makes the caller wait or roll
    /// back before installing its own version.
    pub fn conflicting_handle<F>(&self, self_handle: u64, resolve: F) -> Option<u64>
    where
        F: Fn(u64) -> VersionStatus,
    {
        for v in self.versions.iter().rev() {
            if v.handle == self_handle || v.handle == PRIMORDIAL_HANDLE {
                continue;
            }
            if resolve(v.handle) == VersionStatus::Running {
                return Some(v.handle);
            }
        }
        None
    }

    /// Remove versions of aborted writers and fold committed history
    /// no snapshot at or above `floor` can still need. Returns the
    /// handles whose versions left the chain, for live-table
    /// release. Until a version is pruned here, readers already hide
    /// it through `visible_for`.
    pub fn prune<F>(&mut self, floor: Timestamp, resolve: F) -> Vec<u64>
    where
        F: Fn(u64) -> VersionStatus,
    {
        let mut released = Vec::new();

        // aborted versions vanish; their left neighbor shows through
        self.versions.retain(|v| {
            if v.handle == PRIMORDIAL_HANDLE {
                return true;
            }
            if resolve(v.handle) == VersionStatus::Aborted {
                released.push(v.handle);
                false
            } else {
                true
            }
        });

        // committed history below the floor: only the newest such
        // version remains reachable, and it becomes primordial
        let mut newest_old: Option<usize> = None;
        for (i, v) in self.versions.iter().enumerate() {
            let old = match resolve(v.handle) {
                VersionStatus::Committed(cts) => cts < floor,
                VersionStatus::Retired => true,
                _ => false,
            };
            if old || v.handle == PRIMORDIAL_HANDLE {
                newest_old = Some(i);
            }
        }
        if let Some(keep) = newest_old {
            let mut i = 0;
            self.versions.retain(|v| {
                let drop_it = i < keep;
                i += 1;
                if drop_it && v.handle != PRIMORDIAL_HANDLE {
                    released.push(v.handle);
                }
                !drop_it
            });
            // the survivor is now primordial
            let first = &mut self.versions[0];
            if first.handle != PRIMORDIAL_HANDLE {
                released.push(first.handle);
                first.handle = PRIMORDIAL_HANDLE;
            }
            // a primordial tombstone carries no information
            if self.versions.len() == 1 && self.versions[0].anti {
                self.versions.clear();
            }
        }

        released
    }
}
