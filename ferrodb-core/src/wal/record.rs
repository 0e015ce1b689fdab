// wal/record.rs
// WAL record format: fixed header + JSON body + trailing CRC32
//
// Binary layout (little-endian):
// - magic: 4 bytes ("FWAL")
// - version: 2 bytes
// - body_len: 4 bytes
// - kind: 1 byte
// - tx_id: 8 bytes
// - lsn: 8 bytes
// - timestamp_ms: 8 bytes
// - body: body_len bytes (JSON-encoded images)
// - crc32: 4 bytes over header + body

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FerroError, Result};

pub const WAL_MAGIC: [u8; 4] = *b"FWAL";
pub const WAL_VERSION: u16 = 1;

/// Header size: 4 + 2 + 4 + 1 + 8 + 8 + 8 = 35 bytes
pub const WAL_HEADER_SIZE: usize = 35;

/// Maximum body size accepted by the reader (guards recovery against OOM
/// from a mangled length field)
pub const MAX_WAL_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Record kind in the WAL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalRecordKind {
    Begin = 0x01,
    Insert = 0x02,
    Update = 0x03,
    Delete = 0x04,
    Commit = 0x05,
    Rollback = 0x06,
    Checkpoint = 0x07,
}

impl WalRecordKind {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(WalRecordKind::Begin),
            0x02 => Ok(WalRecordKind::Insert),
            0x03 => Ok(WalRecordKind::Update),
            0x04 => Ok(WalRecordKind::Delete),
            0x05 => Ok(WalRecordKind::Commit),
            0x06 => Ok(WalRecordKind::Rollback),
            0x07 => Ok(WalRecordKind::Checkpoint),
            other => Err(FerroError::CorruptedLog(format!(
                "unknown record kind 0x{:02x}",
                other
            ))),
        }
    }

    /// Kinds that mutate a document and are replayed by recovery.
    pub fn is_operation(&self) -> bool {
        matches!(
            self,
            WalRecordKind::Insert | WalRecordKind::Update | WalRecordKind::Delete
        )
    }
}

/// Variable body: before/after images plus the touched resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalRecordBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

impl WalRecordBody {
    pub fn is_empty(&self) -> bool {
        self.collection.is_none()
            && self.doc_id.is_none()
            && self.before.is_none()
            && self.after.is_none()
    }
}

/// A single WAL record. The LSN is assigned at append time and is strictly
/// monotonic across segments.
#[derive(Debug, Clone, PartialEq)]
pub struct WalRecord {
    pub lsn: u64,
    pub tx_id: u64,
    pub kind: WalRecordKind,
    pub timestamp_ms: i64,
    pub body: WalRecordBody,
}

impl WalRecord {
    pub fn new(tx_id: u64, kind: WalRecordKind, body: WalRecordBody) -> Self {
        WalRecord {
            lsn: 0, // assigned by the appender
            tx_id,
            kind,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            body,
        }
    }

    pub fn begin(tx_id: u64) -> Self {
        Self::new(tx_id, WalRecordKind::Begin, WalRecordBody::default())
    }

    pub fn commit(tx_id: u64) -> Self {
        Self::new(tx_id, WalRecordKind::Commit, WalRecordBody::default())
    }

    pub fn rollback(tx_id: u64) -> Self {
        Self::new(tx_id, WalRecordKind::Rollback, WalRecordBody::default())
    }

    pub fn checkpoint(min_active_lsn: u64) -> Self {
        Self::new(
            0,
            WalRecordKind::Checkpoint,
            WalRecordBody {
                after: Some(serde_json::json!({ "min_active_lsn": min_active_lsn })),
                ..Default::default()
            },
        )
    }

    /// Serialize to header + body + crc32.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = if self.body.is_empty() {
            Vec::new()
        } else {
            serde_json::to_vec(&self.body)?
        };
        if body.len() > MAX_WAL_BODY_SIZE {
            return Err(FerroError::Validation(format!(
                "WAL record body of {} bytes exceeds the {} byte cap",
                body.len(),
                MAX_WAL_BODY_SIZE
            )));
        }

        let mut buf = Vec::with_capacity(WAL_HEADER_SIZE + body.len() + 4);
        buf.extend_from_slice(&WAL_MAGIC);
        buf.extend_from_slice(&WAL_VERSION.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.tx_id.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&body);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        Ok(buf)
    }

    /// Decode one record from a byte slice (testing and tooling; the
    /// streaming reader decodes incrementally).
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < WAL_HEADER_SIZE + 4 {
            return Err(FerroError::CorruptedLog("truncated record".into()));
        }
        if data[0..4] != WAL_MAGIC {
            return Err(FerroError::CorruptedLog("bad record magic".into()));
        }
        let version = u16::from_le_bytes(data[4..6].try_into().unwrap());
        if version != WAL_VERSION {
            return Err(FerroError::CorruptedLog(format!(
                "unsupported record version {}",
                version
            )));
        }
        let body_len = u32::from_le_bytes(data[6..10].try_into().unwrap()) as usize;
        if body_len > MAX_WAL_BODY_SIZE {
            return Err(FerroError::CorruptedLog("record body length out of range".into()));
        }
        let total = WAL_HEADER_SIZE + body_len + 4;
        if data.len() < total {
            return Err(FerroError::CorruptedLog("truncated record body".into()));
        }

        let kind = WalRecordKind::from_u8(data[10])?;
        let tx_id = u64::from_le_bytes(data[11..19].try_into().unwrap());
        let lsn = u64::from_le_bytes(data[19..27].try_into().unwrap());
        let timestamp_ms = i64::from_le_bytes(data[27..35].try_into().unwrap());

        let body_bytes = &data[WAL_HEADER_SIZE..WAL_HEADER_SIZE + body_len];
        let stored_crc = u32::from_le_bytes(
            data[WAL_HEADER_SIZE + body_len..total].try_into().unwrap(),
        );
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..WAL_HEADER_SIZE + body_len]);
        if hasher.finalize() != stored_crc {
            return Err(FerroError::CorruptedLog("record checksum mismatch".into()));
        }

        let body = if body_len == 0 {
            WalRecordBody::default()
        } else {
            serde_json::from_slice(body_bytes)
                .map_err(|e| FerroError::CorruptedLog(format!("undecodable record body: {}", e)))?
        };

        Ok((
            WalRecord {
                lsn,
                tx_id,
                kind,
                timestamp_ms,
                body,
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_conversion() {
        for kind in [
            WalRecordKind::Begin,
            WalRecordKind::Insert,
            WalRecordKind::Update,
            WalRecordKind::Delete,
            WalRecordKind::Commit,
            WalRecordKind::Rollback,
            WalRecordKind::Checkpoint,
        ] {
            assert_eq!(WalRecordKind::from_u8(kind as u8).unwrap(), kind);
        }
        assert!(WalRecordKind::from_u8(0xEE).is_err());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut record = WalRecord::new(
            42,
            WalRecordKind::Update,
            WalRecordBody {
                collection: Some("users".into()),
                doc_id: Some("u1".into()),
                before: Some(json!({"n": 1})),
                after: Some(json!({"n": 2})),
            },
        );
        record.lsn = 7;

        let bytes = record.encode().unwrap();
        let (decoded, consumed) = WalRecord::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_empty_body_records_are_compact() {
        let record = WalRecord::begin(1);
        let bytes = record.encode().unwrap();
        assert_eq!(bytes.len(), WAL_HEADER_SIZE + 4);
        let (decoded, _) = WalRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.kind, WalRecordKind::Begin);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let record = WalRecord::commit(3);
        let mut bytes = record.encode().unwrap();
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;
        assert!(matches!(
            WalRecord::decode(&bytes),
            Err(FerroError::CorruptedLog(_))
        ));
    }

    #[test]
    fn test_body_flip_detected_by_crc() {
        let mut record = WalRecord::new(
            1,
            WalRecordKind::Insert,
            WalRecordBody {
                collection: Some("c".into()),
                doc_id: Some("d".into()),
                after: Some(json!({"x": 1})),
                ..Default::default()
            },
        );
        record.lsn = 1;
        let mut bytes = record.encode().unwrap();
        bytes[WAL_HEADER_SIZE + 2] ^= 0x01;
        assert!(WalRecord::decode(&bytes).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = WalRecord::begin(1).encode().unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            WalRecord::decode(&bytes),
            Err(FerroError::CorruptedLog(_))
        ));
    }
}
