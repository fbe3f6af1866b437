use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::{
    error::{ErrorKind, StoreError},
    page::split::SplitPolicy,
    page::VALID_PAGE_SIZES,
};

/// Durability regime a commit waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Return once the TC record is in the journal write buffer.
    Soft,
    /// Return after a shared flush that includes the TC record.
    Group,
    /// Return only after the TC record is fsynced.
    Hard,
}

impl CommitPolicy {
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s.to_ascii_uppercase().as_str() {
            "SOFT" => Ok(CommitPolicy::Soft),
            "GROUP" => Ok(CommitPolicy::Group),
            "HARD" => Ok(CommitPolicy::Hard),
            _ => Err(StoreError::new(
                ErrorKind::Conversion,
                &format!("unrecognized commit policy: {}", s),
            )),
        }
    }
}

/// Declaration of one volume, from a `volume.N` property:
///
/// `path,flags,pageSize:P,initialSize:S,extensionSize:E,maximumSize:M`
///
/// Recognized flags: `create`, `createOnly`, `readOnly`, `truncate`.
#[derive(Debug, Clone)]
pub struct VolumeSpec {
    pub path: PathBuf,
    pub create: bool,
    pub create_only: bool,
    pub read_only: bool,
    pub truncate: bool,
    pub page_size: usize,
    pub initial_size: u64,
    pub extension_size: u64,
    pub maximum_size: u64,
}

impl VolumeSpec {
    pub fn new<P: Into<PathBuf>>(path: P, page_size: usize) -> Self {
        Self {
            path: path.into(),
            create: true,
            create_only: false,
            read_only: false,
            truncate: false,
            page_size,
            initial_size: 1024 * 1024,
            extension_size: 1024 * 1024,
            maximum_size: 1024 * 1024 * 1024,
        }
    }

    pub fn parse(decl: &str) -> Result<Self, StoreError> {
        let mut parts = decl.split(',').map(|s| s.trim());
        let path = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| {
            StoreError::new(ErrorKind::InvalidVolumeSpec, "volume path is missing")
        })?;

        let mut spec = VolumeSpec::new(path, 0);
        spec.create = false;

        for part in parts {
            if part.is_empty() {
                continue;
            }
            match part {
                "create" => spec.create = true,
                "createOnly" => spec.create_only = true,
                "readOnly" => spec.read_only = true,
                "truncate" => spec.truncate = true,
                _ => {
                    let mut kv = part.splitn(2, ':');
                    let key = kv.next().unwrap_or("");
                    let value = kv.next().ok_or_else(|| {
                        StoreError::new(
                            ErrorKind::InvalidVolumeSpec,
                            &format!("unrecognized volume attribute: {}", part),
                        )
                    })?;
                    match key {
                        "pageSize" => spec.page_size = parse_size(value)? as usize,
                        "initialSize" => spec.initial_size = parse_size(value)?,
                        "extensionSize" => spec.extension_size = parse_size(value)?,
                        "maximumSize" => spec.maximum_size = parse_size(value)?,
                        _ => {
                            return Err(StoreError::new(
                                ErrorKind::InvalidVolumeSpec,
                                &format!("unrecognized volume attribute: {}", key),
                            ))
                        }
                    }
                }
            }
        }

        if !VALID_PAGE_SIZES.contains(&spec.page_size) {
            return Err(StoreError::new(
                ErrorKind::InvalidVolumeSpec,
                &format!("invalid page size: {}", spec.page_size),
            ));
        }
        Ok(spec)
    }
}

/// Parse a byte count, accepting `k`/`m`/`g` suffixes.
fn parse_size(s: &str) -> Result<u64, StoreError> {
    let s = s.trim();
    let (digits, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let n: u64 = digits.parse().map_err(|_| {
        StoreError::new(ErrorKind::Conversion, &format!("invalid size: {}", s))
    })?;
    Ok(n * multiplier)
}

/// Engine configuration. Built programmatically or from a property
/// map of the recognized options.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for volumes and the journal.
    pub datapath: PathBuf,
    pub volumes: Vec<VolumeSpec>,
    /// Buffer frame count per page size.
    pub buffer_counts: HashMap<usize, usize>,
    pub journal_path: Option<PathBuf>,
    /// Journal block size, bytes.
    pub journal_size: u64,
    pub commit_policy: CommitPolicy,
    pub split_policy: SplitPolicy,
    /// Default claim timeout.
    pub timeout: Duration,
    /// Background flusher / checkpoint / copier intervals.
    pub flush_interval: Duration,
    pub checkpoint_interval: Duration,
    /// Operator override: recover even when the journal references
    /// volumes that are no longer declared, dropping their pages.
    pub ignore_missing_volumes: bool,
}

pub const DEFAULT_JOURNAL_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_BUFFER_COUNT: usize = 512;

impl Config {
    pub fn new<P: Into<PathBuf>>(datapath: P) -> Self {
        Self {
            datapath: datapath.into(),
            volumes: Vec::new(),
            buffer_counts: HashMap::new(),
            journal_path: None,
            journal_size: DEFAULT_JOURNAL_SIZE,
            commit_policy: CommitPolicy::Soft,
            split_policy: SplitPolicy::NiceBias,
            timeout: Duration::from_secs(10),
            flush_interval: Duration::from_millis(100),
            checkpoint_interval: Duration::from_secs(60),
            ignore_missing_volumes: false,
        }
    }

    /// Apply one `key=value` property. Unknown keys are rejected so a
    /// typo does not silently change behavior.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        if let Some(rest) = key.strip_prefix("volume.") {
            let _: u32 = rest.parse().map_err(|_| {
                StoreError::new(
                    ErrorKind::InvalidVolumeSpec,
                    &format!("invalid volume property: {}", key),
                )
            })?;
            self.volumes.push(VolumeSpec::parse(value)?);
            return Ok(());
        }
        if let Some(rest) = key.strip_prefix("buffer.count.") {
            let page_size: usize = rest.parse().map_err(|_| {
                StoreError::new(ErrorKind::Conversion, &format!("invalid page size: {}", rest))
            })?;
            let count: usize = value.parse().map_err(|_| {
                StoreError::new(ErrorKind::Conversion, &format!("invalid count: {}", value))
            })?;
            self.buffer_counts.insert(page_size, count);
            return Ok(());
        }

        match key {
            "datapath" => self.datapath = PathBuf::from(value),
            "journalpath" => self.journal_path = Some(PathBuf::from(value)),
            "journalsize" => self.journal_size = parse_size(value)?,
            "commitpolicy" => self.commit_policy = CommitPolicy::parse(value)?,
            "splitpolicy" => self.split_policy = SplitPolicy::parse(value)?,
            "timeout" => {
                let millis: u64 = value.parse().map_err(|_| {
                    StoreError::new(ErrorKind::Conversion, &format!("invalid timeout: {}", value))
                })?;
                self.timeout = Duration::from_millis(millis);
            }
            // diagnostic log routing and the management adapter are
            // accepted but handled outside the engine core
            "logpath" | "logfile" | "jmx" => {}
            _ => {
                return Err(StoreError::new(
                    ErrorKind::Conversion,
                    &format!("unrecognized property: {}", key),
                ))
            }
        }
        Ok(())
    }

    pub fn journal_path(&self) -> PathBuf {
        self.journal_path
            .clone()
            .unwrap_or_else(|| self.datapath.join("journal"))
    }

    pub fn buffer_count(&self, page_size: usize) -> usize {
        *self
            .buffer_counts
            .get(&page_size)
            .unwrap_or(&DEFAULT_BUFFER_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_spec_parse() {
        let spec = VolumeSpec::parse(
            "data/main.v01,create,pageSize:16384,initialSize:1m,extensionSize:1m,maximumSize:10g",
        )
        .unwrap();
        assert!(spec.create);
        assert!(!spec.create_only);
        assert_eq!(spec.page_size, 16384);
        assert_eq!(spec.initial_size, 1024 * 1024);
        assert_eq!(spec.maximum_size, 10 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_volume_spec_rejects_bad_page_size() {
        let r = VolumeSpec::parse("data/main.v01,create,pageSize:1000");
        assert_eq!(r.unwrap_err().kind(), ErrorKind::InvalidVolumeSpec);
    }

    #[test]
    fn test_config_properties() {
        let mut config = Config::new("data");
        config.set("journalsize", "64m").unwrap();
        config.set("commitpolicy", "HARD").unwrap();
        config.set("splitpolicy", "PACK_BIAS").unwrap();
        config.set("buffer.count.1024", "32").unwrap();
        config
            .set("volume.1", "data/main.v01,create,pageSize:1024")
            .unwrap();

        assert_eq!(config.journal_size, 64 * 1024 * 1024);
        assert_eq!(config.commit_policy, CommitPolicy::Hard);
        assert_eq!(config.split_policy, SplitPolicy::PackBias);
        assert_eq!(config.buffer_count(1024), 32);
        assert_eq!(config.buffer_count(4096), DEFAULT_BUFFER_COUNT);
        assert_eq!(config.volumes.len(), 1);

        assert!(config.set("no.such.option", "1").is_err());
    }
}
