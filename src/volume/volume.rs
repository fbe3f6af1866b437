use std::{
    convert::TryInto,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, info};

use crate::{
    config::VolumeSpec,
    error::{ErrorKind, StoreError},
    io::MediatedFile,
    types::{PageAddr, StoreResult, VolumeId},
};

pub const VOLUME_MAGIC: &[u8; 8] = b"PRSTVOLM";
pub const VOLUME_FORMAT_VERSION: u32 = 1;

/// Size of the encoded superblock, excluding the zero padding that
/// fills the rest of page 0.
pub const VOLUME_HEADER_SIZE: usize = 88;

/// Superblock of a volume, kept at page 0.
///
/// # Wire layout
///
/// ```text
/// 0   8  magic "PRSTVOLM"
/// 8   4  format version
/// 12  4  page size
/// 16  16 volume uuid
/// 32  8  creation timestamp
/// 40  8  next available page
/// 48  8  maximum page count
/// 56  8  directory-tree root page
/// 64  8  garbage-chain root page
/// 72  8  highest used page
/// 80  4  flags
/// 84  4  header checksum (crc32 of bytes 0..84)
/// ```
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub page_size: usize,
    pub uuid: [u8; 16],
    pub creation_ts: u64,
    pub next_available_page: PageAddr,
    pub max_page_count: u64,
    pub directory_root: PageAddr,
    pub garbage_root: PageAddr,
    pub highest_used: PageAddr,
    pub flags: u32,
}

impl VolumeHeader {
    fn new(page_size: usize, max_page_count: u64) -> Self {
        let creation_ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            page_size,
            uuid: *uuid::Uuid::new_v4().as_bytes(),
            creation_ts,
            next_available_page: 1,
            max_page_count,
            directory_root: 0,
            garbage_root: 0,
            highest_used: 0,
            flags: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; VOLUME_HEADER_SIZE];
        buf[0..8].copy_from_slice(VOLUME_MAGIC);
        buf[8..12].copy_from_slice(&VOLUME_FORMAT_VERSION.to_le_bytes());
        buf[12..16].copy_from_slice(&(self.page_size as u32).to_le_bytes());
        buf[16..32].copy_from_slice(&self.uuid);
        buf[32..40].copy_from_slice(&self.creation_ts.to_le_bytes());
        buf[40..48].copy_from_slice(&self.next_available_page.to_le_bytes());
        buf[48..56].copy_from_slice(&self.max_page_count.to_le_bytes());
        buf[56..64].copy_from_slice(&self.directory_root.to_le_bytes());
        buf[64..72].copy_from_slice(&self.garbage_root.to_le_bytes());
        buf[72..80].copy_from_slice(&self.highest_used.to_le_bytes());
        buf[80..84].copy_from_slice(&self.flags.to_le_bytes());
        let checksum = crc32fast::hash(&buf[0..84]);
        buf[84..88].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        if bytes.len() < VOLUME_HEADER_SIZE {
            return Err(StoreError::corrupt_volume("superblock is truncated"));
        }
        if &bytes[0..8] != VOLUME_MAGIC {
            return Err(StoreError::corrupt_volume("bad volume magic"));
        }
        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if version != VOLUME_FORMAT_VERSION {
            return Err(StoreError::corrupt_volume(&format!(
                "unsupported volume format version: {}",
                version
            )));
        }
        let stored = u32::from_le_bytes(bytes[84..88].try_into().unwrap());
        let computed = crc32fast::hash(&bytes[0..84]);
        if stored != computed {
            return Err(StoreError::corrupt_volume(&format!(
                "superblock checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }
        Ok(Self {
            page_size: u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize,
            uuid: bytes[16..32].try_into().unwrap(),
            creation_ts: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            next_available_page: u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
            max_page_count: u64::from_le_bytes(bytes[48..56].try_into().unwrap()),
            directory_root: u64::from_le_bytes(bytes[56..64].try_into().unwrap()),
            garbage_root: u64::from_le_bytes(bytes[64..72].try_into().unwrap()),
            highest_used: u64::from_le_bytes(bytes[72..80].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[80..84].try_into().unwrap()),
        })
    }

    /// Superblock image padded to a full page, as journaled and as
    /// written at page 0.
    pub fn page_image(&self) -> Vec<u8> {
        let mut image = self.encode();
        image.resize(self.page_size, 0);
        image
    }
}

/// A file of fixed-size pages.
pub struct Volume {
    id: VolumeId,
    path: PathBuf,
    file: MediatedFile,
    page_size: usize,
    /// Immutable copy of the superblock uuid, readable without the
    /// header lock.
    uuid: [u8; 16],
    read_only: bool,
    created_here: bool,
    extension_size: u64,
    maximum_size: u64,
    header: Mutex<VolumeHeader>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("uuid", &self.uuid)
            .field("read_only", &self.read_only)
            .field("created_here", &self.created_here)
            .field("extension_size", &self.extension_size)
            .field("maximum_size", &self.maximum_size)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Volume {
    /// Open or create a volume per its declaration.
    pub fn open(id: VolumeId, spec: &VolumeSpec) -> Result<Volume, StoreError> {
        let exists = spec.path.exists();

        if !exists {
            if !spec.create && !spec.create_only {
                return Err(StoreError::new(
                    ErrorKind::VolumeNotFound,
                    &format!("no such volume: {:?}", spec.path),
                ));
            }
            if spec.read_only {
                return Err(StoreError::new(
                    ErrorKind::InvalidVolumeSpec,
                    "cannot create a read-only volume",
                ));
            }
            return Self::create(id, spec);
        }

        if spec.create_only {
            return Err(StoreError::new(
                ErrorKind::VolumeAlreadyExists,
                &format!("volume already exists: {:?}", spec.path),
            ));
        }

        let file = MediatedFile::open(&spec.path, spec.read_only)?;
        let mut head = vec![0u8; VOLUME_HEADER_SIZE];
        file.read_exact_at(0, &mut head)?;
        let header = VolumeHeader::decode(&head)?;
        if header.page_size != spec.page_size {
            // source naming retained for interface compatibility
            return Err(StoreError::new(
                ErrorKind::VolumeAlreadyExists,
                &format!(
                    "volume {:?} has page size {}, requested {}",
                    spec.path, header.page_size, spec.page_size
                ),
            ));
        }

        let volume = Volume {
            id,
            path: spec.path.clone(),
            file,
            page_size: spec.page_size,
            uuid: header.uuid,
            read_only: spec.read_only,
            created_here: false,
            extension_size: spec.extension_size.max(spec.page_size as u64),
            maximum_size: spec.maximum_size,
            header: Mutex::new(header),
            closed: AtomicBool::new(false),
        };

        if spec.truncate {
            let mut v = volume;
            v.created_here = true;
            v.truncate()?;
            return Ok(v);
        }

        debug!("opened volume {} at {:?}", id, spec.path);
        Ok(volume)
    }

    fn create(id: VolumeId, spec: &VolumeSpec) -> Result<Volume, StoreError> {
        if let Some(parent) = spec.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = MediatedFile::create(&spec.path)?;
        let max_page_count = spec.maximum_size / spec.page_size as u64;
        let header = VolumeHeader::new(spec.page_size, max_page_count);

        file.write_all_at(0, &header.page_image())?;
        let initial = spec.initial_size.max(spec.page_size as u64);
        file.set_len(initial)?;
        file.sync()?;

        info!("created volume {} at {:?}", id, spec.path);
        Ok(Volume {
            id,
            path: spec.path.clone(),
            file,
            page_size: spec.page_size,
            uuid: header.uuid,
            read_only: false,
            created_here: true,
            extension_size: spec.extension_size.max(spec.page_size as u64),
            maximum_size: spec.maximum_size,
            header: Mutex::new(header),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn header(&self) -> MutexGuard<'_, VolumeHeader> {
        self.header.lock().unwrap()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn check_open(&self) -> StoreResult {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::new(
                ErrorKind::VolumeClosed,
                &format!("volume {} is closed", self.id),
            ));
        }
        Ok(())
    }

    /// Replace the in-memory superblock, used by recovery when the
    /// journal carries a newer image than the file.
    pub fn restore_header(&self, header: VolumeHeader) {
        *self.header.lock().unwrap() = header;
    }

    pub fn read_page_image(&self, addr: PageAddr) -> Result<Vec<u8>, StoreError> {
        self.check_open()?;
        let mut buf = vec![0u8; self.page_size];
        let pos = addr * self.page_size as u64;
        if pos + self.page_size as u64 > self.file.len()? {
            return Err(StoreError::corrupt_volume(&format!(
                "page {} is beyond the end of volume {}",
                addr, self.id
            )));
        }
        self.file.read_exact_at(pos, &mut buf)?;
        Ok(buf)
    }

    /// Write one page image back to the file, extending it when the
    /// address is past the current end.
    pub fn write_page_image(&self, addr: PageAddr, image: &[u8]) -> StoreResult {
        self.check_open()?;
        if self.read_only {
            return Err(StoreError::new(
                ErrorKind::Io,
                &format!("volume {} is read-only", self.id),
            ));
        }
        assert_eq!(image.len(), self.page_size);

        let pos = addr * self.page_size as u64;
        let needed = pos + self.page_size as u64;
        if needed > self.file.len()? {
            self.extend(needed)?;
        }
        self.file.write_all_at(pos, image)
    }

    /// Grow the file in `extension_size` steps up to `maximum_size`.
    pub fn extend(&self, needed: u64) -> StoreResult {
        if needed > self.maximum_size {
            return Err(StoreError::new(
                ErrorKind::VolumeFull,
                &format!(
                    "volume {} cannot grow to {} bytes (maximum {})",
                    self.id, needed, self.maximum_size
                ),
            ));
        }
        let current = self.file.len()?;
        let mut new_len = current;
        while new_len < needed {
            new_len += self.extension_size;
        }
        let new_len = new_len.min(self.maximum_size);
        debug!("extending volume {} from {} to {}", self.id, current, new_len);
        self.file.set_len(new_len)
    }

    pub fn sync(&self) -> StoreResult {
        self.file.sync()
    }

    /// Drop all content. Only legal on a volume created (or opened
    /// with the truncate flag) by this process.
    pub fn truncate(&self) -> StoreResult {
        if !self.created_here {
            return Err(StoreError::new(
                ErrorKind::TruncateVolume,
                &format!("volume {} was not created by this open", self.id),
            ));
        }
        let mut header = self.header.lock().unwrap();
        header.next_available_page = 1;
        header.directory_root = 0;
        header.garbage_root = 0;
        header.highest_used = 0;
        self.file.set_len(self.page_size as u64)?;
        self.file.write_all_at(0, &header.page_image())?;
        self.file.sync()
    }

    /// Write the current superblock straight to the file. Used at
    /// clean close and by the copier when applying a journaled page-0
    /// image is not available.
    pub fn write_header(&self) -> StoreResult {
        let image = self.header.lock().unwrap().page_image();
        self.file.write_all_at(0, &image)?;
        self.file.sync()
    }
}
