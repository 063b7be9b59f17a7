//! Data-channel frame codec
//!
//! Every message on the transfer channel is one binary frame with a fixed
//! 25-byte header, network byte order:
//!
//! ```text
//! offset  size  field
//! 0       1     frame kind
//! 1       16    transfer id (UUID bytes)
//! 17      4     seq (chunks; 0 otherwise)
//! 21      4     payload length
//! 25      ...   payload
//! ```

use crate::transfer::TransferError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed header length.
pub const HEADER_LEN: usize = 25;

/// Frame discriminator, first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Text = 0x01,
    FileStart = 0x02,
    Chunk = 0x03,
    FileEnd = 0x04,
    Cancel = 0x05,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameKind::Text),
            0x02 => Some(FrameKind::FileStart),
            0x03 => Some(FrameKind::Chunk),
            0x04 => Some(FrameKind::FileEnd),
            0x05 => Some(FrameKind::Cancel),
            _ => None,
        }
    }
}

/// `file-start` payload: UTF-8 JSON with the file metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStartPayload {
    pub name: String,
    pub size: u64,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u32,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub kind: FrameKind,
    pub transfer_id: Uuid,
    pub seq: u32,
    pub payload: Vec<u8>,
}

impl DataFrame {
    pub fn new(kind: FrameKind, transfer_id: Uuid, seq: u32, payload: Vec<u8>) -> Self {
        Self { kind, transfer_id, seq, payload }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.payload.len());
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(self.transfer_id.as_bytes());
        bytes.extend_from_slice(&self.seq.to_be_bytes());
        bytes.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse wire bytes, validating the header against the actual length.
    pub fn decode(bytes: &[u8]) -> Result<Self, TransferError> {
        if bytes.len() < HEADER_LEN {
            return Err(TransferError::InvalidFrame(format!(
                "Frame too short: {} bytes",
                bytes.len()
            )));
        }

        let kind = FrameKind::from_byte(bytes[0])
            .ok_or_else(|| TransferError::InvalidFrame(format!("Unknown frame kind {:#04x}", bytes[0])))?;

        let mut id_bytes = [0u8; 16];
        id_bytes.copy_from_slice(&bytes[1..17]);
        let transfer_id = Uuid::from_bytes(id_bytes);

        let mut seq_bytes = [0u8; 4];
        seq_bytes.copy_from_slice(&bytes[17..21]);
        let seq = u32::from_be_bytes(seq_bytes);

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[21..25]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;

        if bytes.len() - HEADER_LEN != payload_len {
            return Err(TransferError::InvalidFrame(format!(
                "Payload length mismatch: header says {}, frame carries {}",
                payload_len,
                bytes.len() - HEADER_LEN
            )));
        }

        Ok(Self {
            kind,
            transfer_id,
            seq,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let id = Uuid::new_v4();
        let frame = DataFrame::new(FrameKind::Chunk, id, 42, b"payload bytes".to_vec());
        let decoded = DataFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn header_layout_is_network_order() {
        let id = Uuid::from_bytes([0x11; 16]);
        let frame = DataFrame::new(FrameKind::Chunk, id, 0x01020304, vec![0xAA, 0xBB]);
        let bytes = frame.encode();

        assert_eq!(bytes[0], 0x03);
        assert_eq!(&bytes[1..17], &[0x11; 16]);
        assert_eq!(&bytes[17..21], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[21..25], &[0x00, 0x00, 0x00, 0x02]);
        assert_eq!(&bytes[25..], &[0xAA, 0xBB]);
    }

    #[test]
    fn empty_payload_is_valid() {
        let frame = DataFrame::new(FrameKind::FileStart, Uuid::new_v4(), 0, Vec::new());
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(DataFrame::decode(&bytes).unwrap().payload.len(), 0);
    }

    #[test]
    fn rejects_short_frames() {
        assert!(DataFrame::decode(&[]).is_err());
        assert!(DataFrame::decode(&[0x03; 24]).is_err());
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut bytes = DataFrame::new(FrameKind::Text, Uuid::new_v4(), 0, Vec::new()).encode();
        bytes[0] = 0x7F;
        assert!(DataFrame::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut bytes = DataFrame::new(FrameKind::Chunk, Uuid::new_v4(), 1, vec![1, 2, 3]).encode();
        bytes.truncate(bytes.len() - 1);
        assert!(DataFrame::decode(&bytes).is_err());
    }

    #[test]
    fn file_start_payload_json_shape() {
        let payload = FileStartPayload {
            name: "hello.txt".into(),
            size: 11,
            total_chunks: 1,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""totalChunks":1"#));
        let back: FileStartPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "hello.txt");
    }
}
