//! Signaling wire protocol
//!
//! Every frame on the room socket is a JSON text message with the shape
//! `{type, from?, to?, data?}`. Directed messages carry `to` and are
//! forwarded by the server with `from` stamped to the sender's peer id;
//! the rest are broadcast or point-to-point server replies.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol-level parse/serialize errors
#[derive(Debug)]
pub enum ProtocolError {
    /// Frame was not valid JSON or did not match any known shape
    InvalidFrame(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Device class reported at join time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
        }
    }
}

/// Peer descriptor as it appears in rosters and `peer-joined` broadcasts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "deviceType")]
    pub device_type: DeviceType,
    #[serde(rename = "browserInfo", default)]
    pub browser_info: Option<String>,
}

/// `join` payload: what a client announces about itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinData {
    pub name: String,
    #[serde(rename = "deviceType", default)]
    pub device_type: DeviceType,
    #[serde(rename = "browserInfo", default)]
    pub browser_info: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLeftData {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameChangedData {
    pub name: String,
}

/// ICE candidate relayed between peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateData {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextData {
    pub text: String,
}

/// One relay-mode frame: sequenced, base64-wrapped, AEAD-sealed payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayPayload {
    pub seq: u32,
    /// base64 of the (encrypted) data-channel frame
    pub payload: String,
    /// true when `payload` is AEAD ciphertext
    pub enc: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyExchangeData {
    /// base64 X25519 public key
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequestData {
    #[serde(rename = "fileId")]
    pub file_id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "totalChunks")]
    pub total_chunks: u32,
    #[serde(rename = "transferMode")]
    pub transfer_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResponseData {
    #[serde(rename = "fileId")]
    pub file_id: String,
    pub accepted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCancelData {
    #[serde(rename = "fileId")]
    pub file_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub error: String,
}

/// The tagged message body; the `type` tag is the wire discriminator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Client's first frame after the socket opens
    Join { data: JoinData },

    /// Server reply to `join`: identity plus the current roster
    Joined {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "roomCode")]
        room_code: String,
        peers: Vec<PeerInfo>,
    },

    /// Broadcast to the rest of the room when a peer joins
    PeerJoined { data: PeerInfo },

    /// Broadcast when a peer's socket closes
    PeerLeft { data: PeerLeftData },

    /// Broadcast when a peer renames itself
    NameChanged { data: NameChangedData },

    /// SDP offer, forwarded peer-to-peer
    Offer { data: String },

    /// SDP answer, forwarded peer-to-peer
    Answer { data: String },

    IceCandidate { data: IceCandidateData },

    /// Small text payload, control-plane delivery
    Text { data: TextData },

    /// Relay-mode data frame (server sees opaque bytes)
    RelayData { data: RelayPayload },

    KeyExchange { data: KeyExchangeData },

    FileRequest { data: FileRequestData },

    FileResponse { data: FileResponseData },

    FileCancel { data: FileCancelData },

    /// Server-side error notification (admission failures and the like)
    Error { data: ErrorData },
}

impl SignalMessage {
    /// Directed messages carry `to` and are forwarded verbatim by the server.
    pub fn is_directed(&self) -> bool {
        matches!(
            self,
            SignalMessage::Offer { .. }
                | SignalMessage::Answer { .. }
                | SignalMessage::IceCandidate { .. }
                | SignalMessage::Text { .. }
                | SignalMessage::RelayData { .. }
                | SignalMessage::KeyExchange { .. }
                | SignalMessage::FileRequest { .. }
                | SignalMessage::FileResponse { .. }
                | SignalMessage::FileCancel { .. }
        )
    }

    /// Wire tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Join { .. } => "join",
            SignalMessage::Joined { .. } => "joined",
            SignalMessage::PeerJoined { .. } => "peer-joined",
            SignalMessage::PeerLeft { .. } => "peer-left",
            SignalMessage::NameChanged { .. } => "name-changed",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::Text { .. } => "text",
            SignalMessage::RelayData { .. } => "relay-data",
            SignalMessage::KeyExchange { .. } => "key-exchange",
            SignalMessage::FileRequest { .. } => "file-request",
            SignalMessage::FileResponse { .. } => "file-response",
            SignalMessage::FileCancel { .. } => "file-cancel",
            SignalMessage::Error { .. } => "error",
        }
    }
}

/// A full wire frame: routing fields plus the tagged body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(flatten)]
    pub message: SignalMessage,
}

impl Envelope {
    /// Parse a signaling frame from JSON text
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(json).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))
    }

    /// Serialize for transmission
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))
    }

    /// An undirected frame (server replies, broadcasts)
    pub fn plain(message: SignalMessage) -> Self {
        Self { from: None, to: None, message }
    }

    /// A directed frame addressed to `to`
    pub fn directed(to: &str, message: SignalMessage) -> Self {
        Self { from: None, to: Some(to.to_string()), message }
    }

    /// Server-side error frame
    pub fn error(code: &str) -> Self {
        Self::plain(SignalMessage::Error {
            data: ErrorData { error: code.to_string() },
        })
    }
}

/// WebSocket close codes used by the admission gate
pub mod close_codes {
    pub const PASSWORD_REQUIRED: u16 = 4001;
    pub const PASSWORD_INCORRECT: u16 = 4002;
    pub const ROOM_FULL: u16 = 4003;
}

/// Normalize a room code: upper-case, validated 4-16 alphanumerics.
pub fn normalize_room_code(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.len() < 4 || trimmed.len() > 16 {
        return None;
    }
    if !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(trimmed.to_ascii_uppercase())
}
