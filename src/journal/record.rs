use std::io::Cursor;

use crate::{
    error::StoreError,
    io::{read_exact, Decodeable, Encodeable, StoreWriter},
    types::{JournalAddr, PageKey, Timestamp, TreeId, VolumeId},
};

/// Journal format version, carried in every JH record. The payload
/// layouts below are frozen per version.
pub const JOURNAL_FORMAT_VERSION: u32 = 1;

/// Record framing overhead: `length u32 | kind u16` before the
/// payload, `crc32 u32` after it. The length covers the payload only;
/// the crc covers kind and payload.
pub const RECORD_PREFIX: usize = 6;
pub const RECORD_SUFFIX: usize = 4;

pub fn record_size(payload_len: usize) -> usize {
    RECORD_PREFIX + payload_len + RECORD_SUFFIX
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Journal header, first record of every block.
    JH,
    /// Journal end, last record of a rolled-over block.
    JE,
    /// Page image.
    PA,
    /// Page map snapshot.
    PM,
    /// Transaction start.
    TS,
    /// Transaction commit (or abort).
    TC,
    /// Transaction payload: the buffered redo.
    TX,
    /// Transaction map snapshot.
    TM,
    /// Checkpoint.
    CP,
    /// Volume identity.
    IV,
    /// Tree identity.
    IT,
}

impl RecordKind {
    pub fn to_u16(self) -> u16 {
        match self {
            RecordKind::JH => 0x4A48,
            RecordKind::JE => 0x4A45,
            RecordKind::PA => 0x5041,
            RecordKind::PM => 0x504D,
            RecordKind::TS => 0x5453,
            RecordKind::TC => 0x5443,
            RecordKind::TX => 0x5458,
            RecordKind::TM => 0x544D,
            RecordKind::CP => 0x4350,
            RecordKind::IV => 0x4956,
            RecordKind::IT => 0x4954,
        }
    }

    pub fn from_u16(v: u16) -> Result<Self, StoreError> {
        match v {
            0x4A48 => Ok(RecordKind::JH),
            0x4A45 => Ok(RecordKind::JE),
            0x5041 => Ok(RecordKind::PA),
            0x504D => Ok(RecordKind::PM),
            0x5453 => Ok(RecordKind::TS),
            0x5443 => Ok(RecordKind::TC),
            0x5458 => Ok(RecordKind::TX),
            0x544D => Ok(RecordKind::TM),
            0x4350 => Ok(RecordKind::CP),
            0x4956 => Ok(RecordKind::IV),
            0x4954 => Ok(RecordKind::IT),
            _ => Err(StoreError::corrupt_journal(&format!(
                "unrecognized record kind: {:#06x}",
                v
            ))),
        }
    }
}

/// Frame one record for the journal stream.
pub fn frame(kind: RecordKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record_size(payload.len()));
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&kind.to_u16().to_le_bytes());
    buf.extend_from_slice(payload);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&kind.to_u16().to_le_bytes());
    hasher.update(payload);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    buf
}

/// Parse one record at `offset` of an in-memory block slice. Returns
/// the kind, payload and the offset past the record; `None` when the
/// offset points at zero padding or the end of the block.
pub fn parse(buf: &[u8], offset: usize) -> Result<Option<(RecordKind, Vec<u8>, usize)>, StoreError> {
    if offset + RECORD_PREFIX > buf.len() {
        return Ok(None);
    }
    let len =
        u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
            as usize;
    let kind_raw = u16::from_le_bytes([buf[offset + 4], buf[offset + 5]]);
    if len == 0 && kind_raw == 0 {
        // padding after a JE
        return Ok(None);
    }
    let kind = RecordKind::from_u16(kind_raw)?;

    let end = offset + record_size(len);
    if end > buf.len() {
        return Err(StoreError::corrupt_journal(
            "record length runs past the end of the block",
        ));
    }
    let payload = buf[offset + RECORD_PREFIX..offset + RECORD_PREFIX + len].to_vec();
    let stored = u32::from_le_bytes([buf[end - 4], buf[end - 3], buf[end - 2], buf[end - 1]]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&kind_raw.to_le_bytes());
    hasher.update(&payload);
    if hasher.finalize() != stored {
        return Err(StoreError::corrupt_journal(&format!(
            "record crc mismatch for {:?} record",
            kind
        )));
    }
    Ok(Some((kind, payload, end)))
}

// ----------------------------------------------------------------------
// payloads
// ----------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct JhPayload {
    pub format_version: u32,
    pub block_size: u64,
    pub base_address: JournalAddr,
    pub block_address: JournalAddr,
    pub checkpoint_ts: Timestamp,
    pub checkpoint_addr: JournalAddr,
    pub created_ts: u64,
}

impl JhPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = StoreWriter::new();
        w.write(&self.format_version);
        w.write(&self.block_size);
        w.write(&self.base_address);
        w.write(&self.block_address);
        w.write(&self.checkpoint_ts);
        w.write(&self.checkpoint_addr);
        w.write(&self.created_ts);
        w.to_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        let mut r = Cursor::new(payload);
        let jh = Self {
            format_version: u32::decode_from(&mut r),
            block_size: u64::decode_from(&mut r),
            base_address: u64::decode_from(&mut r),
            block_address: u64::decode_from(&mut r),
            checkpoint_ts: u64::decode_from(&mut r),
            checkpoint_addr: u64::decode_from(&mut r),
            created_ts: u64::decode_from(&mut r),
        };
        if jh.format_version != JOURNAL_FORMAT_VERSION {
            return Err(StoreError::corrupt_journal(&format!(
                "unsupported journal format version: {}",
                jh.format_version
            )));
        }
        Ok(jh)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaPayload {
    pub volume_id: VolumeId,
    pub page_addr: u64,
    pub timestamp: Timestamp,
    pub image: Vec<u8>,
}

impl PaPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = StoreWriter::new();
        w.write(&self.volume_id);
        w.write(&self.page_addr);
        w.write(&self.timestamp);
        w.write_bytes(&self.image);
        w.to_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        if payload.len() < 20 {
            return Err(StoreError::corrupt_journal("PA payload is truncated"));
        }
        let mut r = Cursor::new(payload);
        let volume_id = u32::decode_from(&mut r);
        let page_addr = u64::decode_from(&mut r);
        let timestamp = u64::decode_from(&mut r);
        Ok(Self {
            volume_id,
            page_addr,
            timestamp,
            image: payload[20..].to_vec(),
        })
    }

    pub fn key(&self) -> PageKey {
        PageKey::new(self.volume_id, self.page_addr)
    }
}

/// One buffered write of a transaction, replayed at recovery.
#[derive(Debug, Clone, PartialEq)]
pub enum RedoOp {
    Store {
        tree_id: TreeId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        tree_id: TreeId,
        key: Vec<u8>,
    },
    Delta {
        tree_id: TreeId,
        index: u8,
        kind: u8,
        delta: i64,
    },
}

impl RedoOp {
    fn encode_into(&self, w: &mut StoreWriter) {
        match self {
            RedoOp::Store {
                tree_id,
                key,
                value,
            } => {
                w.write(&1u8);
                w.write(tree_id);
                w.write(&(key.len() as u16));
                w.write_bytes(key);
                w.write(&(value.len() as u32));
                w.write_bytes(value);
            }
            RedoOp::Delete { tree_id, key } => {
                w.write(&2u8);
                w.write(tree_id);
                w.write(&(key.len() as u16));
                w.write_bytes(key);
            }
            RedoOp::Delta {
                tree_id,
                index,
                kind,
                delta,
            } => {
                w.write(&3u8);
                w.write(tree_id);
                w.write(index);
                w.write(kind);
                w.write(delta);
            }
        }
    }

    fn decode_from<R: std::io::Read>(r: &mut R) -> Result<Self, StoreError> {
        let op = u8::decode_from(r);
        match op {
            1 => {
                let tree_id = u32::decode_from(r);
                let klen = u16::decode_from(r) as usize;
                let key = read_exact(r, klen);
                let vlen = u32::decode_from(r) as usize;
                let value = read_exact(r, vlen);
                Ok(RedoOp::Store {
                    tree_id,
                    key,
                    value,
                })
            }
            2 => {
                let tree_id = u32::decode_from(r);
                let klen = u16::decode_from(r) as usize;
                let key = read_exact(r, klen);
                Ok(RedoOp::Delete { tree_id, key })
            }
            3 => Ok(RedoOp::Delta {
                tree_id: u32::decode_from(r),
                index: u8::decode_from(r),
                kind: u8::decode_from(r),
                delta: i64::decode_from(r),
            }),
            _ => Err(StoreError::corrupt_journal(&format!(
                "unrecognized redo op: {}",
                op
            ))),
        }
    }

    pub fn tree_id(&self) -> TreeId {
        match self {
            RedoOp::Store { tree_id, .. } => *tree_id,
            RedoOp::Delete { tree_id, .. } => *tree_id,
            RedoOp::Delta { tree_id, .. } => *tree_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxPayload {
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
    pub ops: Vec<RedoOp>,
}

impl TxPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = StoreWriter::new();
        w.write(&self.start_ts);
        w.write(&self.commit_ts);
        w.write(&(self.ops.len() as u32));
        for op in &self.ops {
            op.encode_into(&mut w);
        }
        w.to_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        let mut r = Cursor::new(payload);
        let start_ts = u64::decode_from(&mut r);
        let commit_ts = u64::decode_from(&mut r);
        let count = u32::decode_from(&mut r) as usize;
        let mut ops = Vec::with_capacity(count);
        for _ in 0..count {
            ops.push(RedoOp::decode_from(&mut r)?);
        }
        Ok(Self {
            start_ts,
            commit_ts,
            ops,
        })
    }
}

/// Commit timestamp marker for an aborted transaction in TC and TM
/// records.
pub const ABORTED_MARKER: u64 = u64::MAX;
/// Commit timestamp marker for a still-running transaction in TM
/// records.
pub const RUNNING_MARKER: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TsPayload {
    pub start_ts: Timestamp,
}

impl TsPayload {
    pub fn encode(&self) -> Vec<u8> {
        self.start_ts.encode()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        let mut r = Cursor::new(payload);
        Ok(Self {
            start_ts: u64::decode_from(&mut r),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TcPayload {
    pub start_ts: Timestamp,
    /// `ABORTED_MARKER` for a rollback.
    pub commit_ts: Timestamp,
}

impl TcPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = StoreWriter::new();
        w.write(&self.start_ts);
        w.write(&self.commit_ts);
        w.to_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        let mut r = Cursor::new(payload);
        Ok(Self {
            start_ts: u64::decode_from(&mut r),
            commit_ts: u64::decode_from(&mut r),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PmPayload {
    pub entries: Vec<(PageKey, JournalAddr)>,
}

impl PmPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = StoreWriter::new();
        w.write(&(self.entries.len() as u32));
        for (key, addr) in &self.entries {
            w.write(&key.volume_id);
            w.write(&key.page_addr);
            w.write(addr);
        }
        w.to_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        let mut r = Cursor::new(payload);
        let count = u32::decode_from(&mut r) as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let volume_id = u32::decode_from(&mut r);
            let page_addr = u64::decode_from(&mut r);
            let addr = u64::decode_from(&mut r);
            entries.push((PageKey::new(volume_id, page_addr), addr));
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TmEntry {
    pub start_ts: Timestamp,
    /// `RUNNING_MARKER`, `ABORTED_MARKER`, or the commit timestamp.
    pub commit_ts: Timestamp,
    pub tx_addr: JournalAddr,
    pub mvv_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TmPayload {
    pub entries: Vec<TmEntry>,
}

impl TmPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = StoreWriter::new();
        w.write(&(self.entries.len() as u32));
        for e in &self.entries {
            w.write(&e.start_ts);
            w.write(&e.commit_ts);
            w.write(&e.tx_addr);
            w.write(&e.mvv_count);
        }
        w.to_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        let mut r = Cursor::new(payload);
        let count = u32::decode_from(&mut r) as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(TmEntry {
                start_ts: u64::decode_from(&mut r),
                commit_ts: u64::decode_from(&mut r),
                tx_addr: u64::decode_from(&mut r),
                mvv_count: u32::decode_from(&mut r),
            });
        }
        Ok(Self { entries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccumSnapshot {
    pub tree_id: TreeId,
    pub index: u8,
    pub kind: u8,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpPayload {
    pub timestamp: Timestamp,
    pub base_address: JournalAddr,
    pub accumulators: Vec<AccumSnapshot>,
}

impl CpPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = StoreWriter::new();
        w.write(&self.timestamp);
        w.write(&self.base_address);
        w.write(&(self.accumulators.len() as u32));
        for a in &self.accumulators {
            w.write(&a.tree_id);
            w.write(&a.index);
            w.write(&a.kind);
            w.write(&a.value);
        }
        w.to_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        let mut r = Cursor::new(payload);
        let timestamp = u64::decode_from(&mut r);
        let base_address = u64::decode_from(&mut r);
        let count = u32::decode_from(&mut r) as usize;
        let mut accumulators = Vec::with_capacity(count);
        for _ in 0..count {
            accumulators.push(AccumSnapshot {
                tree_id: u32::decode_from(&mut r),
                index: u8::decode_from(&mut r),
                kind: u8::decode_from(&mut r),
                value: i64::decode_from(&mut r),
            });
        }
        Ok(Self {
            timestamp,
            base_address,
            accumulators,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IvPayload {
    pub volume_id: VolumeId,
    pub uuid: [u8; 16],
    pub path: String,
}

impl IvPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = StoreWriter::new();
        w.write(&self.volume_id);
        w.write_bytes(&self.uuid);
        w.write(&self.path);
        w.to_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        let mut r = Cursor::new(payload);
        let volume_id = u32::decode_from(&mut r);
        let uuid_bytes = read_exact(&mut r, 16);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&uuid_bytes);
        Ok(Self {
            volume_id,
            uuid,
            path: String::decode_from(&mut r),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItPayload {
    pub tree_id: TreeId,
    pub volume_id: VolumeId,
    pub name: String,
}

impl ItPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = StoreWriter::new();
        w.write(&self.tree_id);
        w.write(&self.volume_id);
        w.write(&self.name);
        w.to_bytes()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        let mut r = Cursor::new(payload);
        Ok(Self {
            tree_id: u32::decode_from(&mut r),
            volume_id: u32::decode_from(&mut r),
            name: String::decode_from(&mut r),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JePayload {
    pub end_address: JournalAddr,
}

impl JePayload {
    pub fn encode(&self) -> Vec<u8> {
        self.end_address.encode()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, StoreError> {
        let mut r = Cursor::new(payload);
        Ok(Self {
            end_address: u64::decode_from(&mut r),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parse_round_trip() {
        let payload = TsPayload { start_ts: 42 }.encode();
        let framed = frame(RecordKind::TS, &payload);
        assert_eq!(framed.len(), record_size(payload.len()));

        let (kind, parsed, next) = parse(&framed, 0).unwrap().unwrap();
        assert_eq!(kind, RecordKind::TS);
        assert_eq!(parsed, payload);
        assert_eq!(next, framed.len());
    }

    #[test]
    fn test_parse_detects_bit_rot() {
        let payload = TsPayload { start_ts: 42 }.encode();
        let mut framed = frame(RecordKind::TS, &payload);
        let at = framed.len() - 6;
        framed[at] ^= 0x01;
        assert!(parse(&framed, 0).is_err());
    }

    #[test]
    fn test_parse_stops_at_padding() {
        let framed = [0u8; 32];
        assert!(parse(&framed, 0).unwrap().is_none());
    }

    #[test]
    fn test_tx_payload_round_trip() {
        let tx = TxPayload {
            start_ts: 10,
            commit_ts: 12,
            ops: vec![
                RedoOp::Store {
                    tree_id: 1,
                    key: b"k1".to_vec(),
                    value: b"v1".to_vec(),
                },
                RedoOp::Delete {
                    tree_id: 1,
                    key: b"k2".to_vec(),
                },
                RedoOp::Delta {
                    tree_id: 2,
                    index: 0,
                    kind: 1,
                    delta: -5,
                },
            ],
        };
        assert_eq!(TxPayload::decode(&tx.encode()).unwrap(), tx);
    }

    #[test]
    fn test_pa_payload_round_trip() {
        let pa = PaPayload {
            volume_id: 3,
            page_addr: 19,
            timestamp: 77,
            image: vec![9u8; 128],
        };
        assert_eq!(PaPayload::decode(&pa.encode()).unwrap(), pa);
    }

    #[test]
    fn test_map_payload_round_trips() {
        let pm = PmPayload {
            entries: vec![(PageKey::new(0, 4), 100), (PageKey::new(1, 9), 220)],
        };
        assert_eq!(PmPayload::decode(&pm.encode()).unwrap(), pm);

        let tm = TmPayload {
            entries: vec![TmEntry {
                start_ts: 5,
                commit_ts: ABORTED_MARKER,
                tx_addr: 64,
                mvv_count: 3,
            }],
        };
        assert_eq!(TmPayload::decode(&tm.encode()).unwrap(), tm);
    }

    #[test]
    fn test_jh_version_check() {
        let mut jh = JhPayload {
            format_version: JOURNAL_FORMAT_VERSION,
            block_size: 1 << 20,
            base_address: 0,
            block_address: 1 << 20,
            checkpoint_ts: 9,
            checkpoint_addr: 30,
            created_ts: 0,
        };
        assert_eq!(JhPayload::decode(&jh.encode()).unwrap(), jh);
        jh.format_version = 99;
        assert!(JhPayload::decode(&jh.encode()).is_err());
    }
}
