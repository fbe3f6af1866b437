use std::{error::Error, fmt};

use backtrace::Backtrace;
use log::debug;

/// Flat taxonomy of everything that can go wrong inside the engine.
///
/// `Rebalance` and `Retry` are internal control-flow signals. They are
/// consumed inside the b+ tree and commit paths and must never be
/// returned from a public operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    VolumeNotFound,
    VolumeAlreadyExists,
    InvalidVolumeSpec,
    VolumeClosed,
    VolumeFull,
    TruncateVolume,

    TreeNotFound,
    TreeAlreadyExists,

    CorruptVolume,
    InvalidPageStructure,
    InvalidPageType,
    MalformedValue,
    CorruptJournal,

    Io,
    Interrupted,

    Timeout,
    InUse,

    Rollback,
    TransactionFailed,

    Conversion,
    MissingThread,
    RecoveryMissingVolumes,
    LogInitialization,

    // internal signals, see the enum docs
    Rebalance,
    Retry,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone)]
pub struct StoreError {
    kind: ErrorKind,
    details: String,
}

impl StoreError {
    pub fn new(kind: ErrorKind, msg: &str) -> StoreError {
        StoreError {
            kind,
            details: msg.to_string(),
        }
    }

    pub fn io(msg: &str) -> StoreError {
        StoreError::new(ErrorKind::Io, msg)
    }

    pub fn corrupt_volume(msg: &str) -> StoreError {
        StoreError::new(ErrorKind::CorruptVolume, msg)
    }

    pub fn corrupt_journal(msg: &str) -> StoreError {
        StoreError::new(ErrorKind::CorruptJournal, msg)
    }

    pub fn rollback(msg: &str) -> StoreError {
        StoreError::new(ErrorKind::Rollback, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_rollback(&self) -> bool {
        self.kind == ErrorKind::Rollback
    }

    /// True for the crate-internal signals that public apis must
    /// swallow.
    pub(crate) fn is_internal_signal(&self) -> bool {
        self.kind == ErrorKind::Rebalance || self.kind == ErrorKind::Retry
    }

    pub fn show_backtrace(&self) {
        let bt = Backtrace::new();
        debug!("error: {}, backtrace:\n{:?}", self, bt);
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.details)
        }
    }
}

impl Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::Interrupted {
            StoreError::new(ErrorKind::Interrupted, &e.to_string())
        } else {
            StoreError::new(ErrorKind::Io, &e.to_string())
        }
    }
}
