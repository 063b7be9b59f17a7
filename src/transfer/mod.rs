//! Transfer engine
//!
//! File and text semantics on top of the per-peer links: the accept/decline
//! handshake over the room socket, framed chunk streaming over the data
//! channel (or relay), integrity checking, cancellation from either side,
//! and the trusted-sender shortcut.

pub mod engine;
pub mod frame;
pub mod history;
pub mod trust;

pub use engine::TransferEngine;
pub use frame::{DataFrame, FrameKind};
pub use history::MessageHistory;
pub use trust::TrustStore;

use std::error::Error;
use std::fmt;

/// Transfer direction from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

/// Which path the transfer rides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    P2p,
    Relay,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::P2p => "p2p",
            TransferMode::Relay => "relay",
        }
    }
}

/// Why a transfer was cancelled. Rides the wire as one byte in the `cancel`
/// frame and as a string in the `file-cancel` control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    User,
    PeerLeft,
    Error,
}

impl CancelReason {
    pub fn to_byte(self) -> u8 {
        match self {
            CancelReason::User => 0,
            CancelReason::PeerLeft => 1,
            CancelReason::Error => 2,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(CancelReason::User),
            1 => Some(CancelReason::PeerLeft),
            2 => Some(CancelReason::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::User => "user",
            CancelReason::PeerLeft => "peer-left",
            CancelReason::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "user" => Some(CancelReason::User),
            "peer-left" => Some(CancelReason::PeerLeft),
            "error" => Some(CancelReason::Error),
            _ => None,
        }
    }
}

/// Failure kinds surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Declined,
    Timeout,
    Cancelled(CancelReason),
    Corrupt,
    NegotiationFailed,
    TransportClosed,
    InvalidFrame,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Declined => "declined",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled(_) => "cancelled",
            FailureKind::Corrupt => "corrupt",
            FailureKind::NegotiationFailed => "negotiation-failed",
            FailureKind::TransportClosed => "transport-closed",
            FailureKind::InvalidFrame => "invalid-frame",
        }
    }
}

/// Transfer-layer errors
#[derive(Debug)]
pub enum TransferError {
    /// Receiver said no
    Declined,
    /// No file-response within the acceptance window
    Timeout,
    /// Hash mismatch at file-end
    Corrupt,
    /// Malformed or out-of-protocol frame
    InvalidFrame(String),
    /// Cancelled by either side
    Cancelled(CancelReason),
    /// Underlying link failure
    Connection(crate::webrtc::ConnectionError),
    /// No such transfer in flight
    UnknownTransfer(String),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Declined => write!(f, "Recipient declined"),
            TransferError::Timeout => write!(f, "No response from recipient"),
            TransferError::Corrupt => write!(f, "Integrity check failed"),
            TransferError::InvalidFrame(msg) => write!(f, "Invalid frame: {}", msg),
            TransferError::Cancelled(reason) => write!(f, "Cancelled ({})", reason.as_str()),
            TransferError::Connection(e) => write!(f, "Connection error: {}", e),
            TransferError::UnknownTransfer(id) => write!(f, "Unknown transfer: {}", id),
        }
    }
}

impl Error for TransferError {}

impl From<crate::webrtc::ConnectionError> for TransferError {
    fn from(e: crate::webrtc::ConnectionError) -> Self {
        TransferError::Connection(e)
    }
}
