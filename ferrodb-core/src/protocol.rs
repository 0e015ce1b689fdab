// ferrodb-core/src/protocol.rs
// Length-framed binary wire codec
//
// Frame layout:
//   offset  size  field
//    0      4     magic = "NOSQ"
//    4      2     protocol version (big-endian)
//    6      1     message type
//    7      1     flags
//    8      4     payload length (big-endian, signed, <= configured cap)
//   12      L     payload bytes
//   12+L    4     crc32 over bytes 0..12+L-1 (little-endian)
//
// Validation order on decode: magic, version, length cap, checksum -
// all before a single payload byte is interpreted. Command payloads are
// UTF-8 JSON built with the serializer, never by string interpolation.

use serde_json::Value;

use crate::error::{FerroError, Result};

pub const FRAME_MAGIC: [u8; 4] = *b"NOSQ";
pub const PROTOCOL_VERSION: u16 = 1;
pub const FRAME_HEADER_SIZE: usize = 12;

/// Default payload cap; the live value comes from `server.max_payload_bytes`.
pub const DEFAULT_MAX_PAYLOAD: u32 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Handshake = 1,
    Auth = 2,
    Command = 3,
    Response = 4,
    Error = 5,
    Ping = 6,
    Pong = 7,
    Transaction = 8,
    Bulk = 9,
    DbOp = 10,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Handshake),
            2 => Ok(MessageType::Auth),
            3 => Ok(MessageType::Command),
            4 => Ok(MessageType::Response),
            5 => Ok(MessageType::Error),
            6 => Ok(MessageType::Ping),
            7 => Ok(MessageType::Pong),
            8 => Ok(MessageType::Transaction),
            9 => Ok(MessageType::Bulk),
            10 => Ok(MessageType::DbOp),
            other => Err(FerroError::Validation(format!(
                "unknown message type {}",
                other
            ))),
        }
    }
}

/// One wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub version: u16,
    pub message_type: MessageType,
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            message_type,
            flags: 0,
            payload,
        }
    }

    /// Frame a JSON payload through the serializer.
    pub fn from_json(message_type: MessageType, payload: &Value) -> Result<Self> {
        Ok(Frame::new(message_type, serde_json::to_vec(payload)?))
    }

    /// Parse the payload as a JSON document.
    pub fn payload_json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > i32::MAX as usize {
            return Err(FerroError::Validation("payload too large to frame".into()));
        }
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len() + 4);
        buf.extend_from_slice(&FRAME_MAGIC);
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.push(self.message_type as u8);
        buf.push(self.flags);
        buf.extend_from_slice(&(self.payload.len() as i32).to_be_bytes());
        buf.extend_from_slice(&self.payload);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        Ok(buf)
    }

    /// Decode one frame, enforcing the payload cap before reading payload
    /// bytes. Returns the frame and the number of bytes consumed.
    pub fn decode(data: &[u8], max_payload: u32) -> Result<(Frame, usize)> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FerroError::Validation("frame shorter than header".into()));
        }
        if data[0..4] != FRAME_MAGIC {
            return Err(FerroError::Validation("bad frame magic".into()));
        }
        let version = u16::from_be_bytes(data[4..6].try_into().unwrap());
        if version != PROTOCOL_VERSION {
            return Err(FerroError::Validation(format!(
                "unsupported protocol version {}",
                version
            )));
        }
        let type_byte = data[6];
        let flags = data[7];
        let payload_len = i32::from_be_bytes(data[8..12].try_into().unwrap());
        if payload_len < 0 {
            return Err(FerroError::Validation("negative payload length".into()));
        }
        let payload_len = payload_len as usize;
        if payload_len > max_payload as usize {
            return Err(FerroError::Validation(format!(
                "payload of {} bytes exceeds the {} byte cap",
                payload_len, max_payload
            )));
        }

        let total = FRAME_HEADER_SIZE + payload_len + 4;
        if data.len() < total {
            return Err(FerroError::Validation("truncated frame".into()));
        }

        let body_end = FRAME_HEADER_SIZE + payload_len;
        let stored_crc = u32::from_le_bytes(data[body_end..total].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..body_end]);
        if hasher.finalize() != stored_crc {
            return Err(FerroError::Validation("frame checksum mismatch".into()));
        }

        // Only now is the payload trusted enough to copy out
        let message_type = MessageType::from_u8(type_byte)?;
        Ok((
            Frame {
                version,
                message_type,
                flags,
                payload: data[FRAME_HEADER_SIZE..body_end].to_vec(),
            },
            total,
        ))
    }
}
