use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::warn;

use crate::{
    error::{ErrorKind, StoreError},
    types::StoreResult,
};

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self;
}

pub fn read_into<T: Decodeable, R: std::io::Read>(reader: &mut R) -> T {
    T::decode_from(reader)
}

pub fn read_exact<R: std::io::Read>(reader: &mut R, bytes_count: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .expect(&format!("io error, expect {}", bytes_count));
    buffer
}

/// Append-only byte buffer used to serialize records and page images.
pub struct StoreWriter {
    buf: Vec<u8>,
}

impl StoreWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }

    /// Pad with zeroes up to `size` (a full page image).
    pub fn to_padded_bytes(&self, size: usize) -> Vec<u8> {
        let mut buf = self.buf.clone();

        if buf.len() > size {
            panic!(
                "buffer size is larger than the given size: {} > {}",
                buf.len(),
                size
            );
        }

        buf.resize(size, 0);
        buf
    }
}

/// # Format
///
/// - 1 byte (0 for false, 1 for true)
impl Encodeable for bool {
    fn encode(&self) -> Vec<u8> {
        vec![*self as u8]
    }
}

impl Decodeable for bool {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        u8::decode_from(reader) == 1
    }
}

/// # Format
///
/// - 2 bytes: length
/// - n bytes: utf-8 payload
impl Encodeable for String {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let len = self.len() as u16;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(self.as_bytes());
        buf
    }
}

impl Decodeable for String {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        let size = u16::from_le_bytes(read_exact(reader, 2).try_into().unwrap());
        let bytes = read_exact(reader, size as usize);
        String::from_utf8(bytes).unwrap()
    }
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
                    let bytes = read_exact(reader, size_of::<Self>());
                    Self::from_le_bytes(bytes.try_into().unwrap())
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, isize, usize, f32, f64);

/// How often an interrupt-closed handle is reopened before the
/// interrupt is surfaced to the caller.
const REOPEN_LIMIT: usize = 3;

/// A positioned-I/O file handle that survives interrupt closure.
///
/// The platform closes a file handle when the owning thread is
/// interrupted during blocking I/O. Any operation that fails that way
/// is retried on a freshly opened handle so that an interrupt never
/// turns into data loss; if the interrupt persists it is surfaced as
/// `ErrorKind::Interrupted`.
pub struct MediatedFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
    read_only: bool,
}

impl MediatedFile {
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(Some(file)),
            read_only,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(Some(file)),
            read_only: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` against the handle, reopening and retrying when the
    /// handle was torn down by an interrupt.
    fn mediated<T, F>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut(&mut File) -> std::io::Result<T>,
    {
        let mut guard = self.file.lock().unwrap();
        let mut attempts = 0;
        loop {
            if guard.is_none() {
                let reopened = OpenOptions::new()
                    .read(true)
                    .write(!self.read_only)
                    .open(&self.path)?;
                *guard = Some(reopened);
            }

            match op(guard.as_mut().unwrap()) {
                Ok(v) => return Ok(v),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    // The handle may have been closed under us. Drop it
                    // and go through the reopen path.
                    *guard = None;
                    attempts += 1;
                    if attempts > REOPEN_LIMIT {
                        return Err(StoreError::new(
                            ErrorKind::Interrupted,
                            &format!("interrupted during io on {:?}", self.path),
                        ));
                    }
                    warn!(
                        "io on {:?} interrupted, reopening (attempt {})",
                        self.path, attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn read_exact_at(&self, pos: u64, buf: &mut Vec<u8>) -> StoreResult {
        let len = buf.len();
        let filled = self.mediated(|f| {
            f.seek(SeekFrom::Start(pos))?;
            let mut tmp = vec![0u8; len];
            f.read_exact(&mut tmp)?;
            Ok(tmp)
        })?;
        buf.copy_from_slice(&filled);
        Ok(())
    }

    pub fn write_all_at(&self, pos: u64, data: &[u8]) -> StoreResult {
        self.mediated(|f| {
            f.seek(SeekFrom::Start(pos))?;
            f.write_all(data)
        })
    }

    pub fn sync(&self) -> StoreResult {
        self.mediated(|f| f.sync_data())
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        self.mediated(|f| f.metadata().map(|m| m.len()))
    }

    pub fn set_len(&self, len: u64) -> StoreResult {
        self.mediated(|f| f.set_len(len))
    }
}
