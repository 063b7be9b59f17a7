//! Peer Connection Manager
//!
//! One logical link per remote peer: symmetric offer/answer negotiation over
//! the room socket, a reliable ordered data channel when the direct path
//! comes up, and a server-relayed framed fallback when it does not. The
//! transfer engine sees two primitives regardless of path: `send` and a
//! receive callback.

pub mod connection;
pub mod key_exchange;
pub mod manager;
pub mod negotiation;
pub mod peer_connection;

pub use connection::LinkState;
pub use key_exchange::KeyExchange;
pub use manager::ConnectionManager;

use std::error::Error;
use std::fmt;

/// Connection-layer errors
#[derive(Debug)]
pub enum ConnectionError {
    /// Peer connection creation failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Data channel error
    DataChannelError(String),
    /// Key exchange failed or key unavailable
    KeyExchange(String),
    /// No link exists for the peer
    NoLink(String),
    /// Link is closed
    Closed(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            ConnectionError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            ConnectionError::IceError(msg) => write!(f, "ICE error: {}", msg),
            ConnectionError::DataChannelError(msg) => write!(f, "DataChannel error: {}", msg),
            ConnectionError::KeyExchange(msg) => write!(f, "Key exchange error: {}", msg),
            ConnectionError::NoLink(peer) => write!(f, "No link to peer: {}", peer),
            ConnectionError::Closed(peer) => write!(f, "Link closed: {}", peer),
        }
    }
}

impl Error for ConnectionError {}
