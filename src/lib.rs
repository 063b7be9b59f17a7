//! roomdrop - peer-to-peer file drop core
//!
//! Rooms broker discovery and signaling; data flows browser-to-browser over
//! WebRTC data channels, with an encrypted server-relayed fallback. The
//! library exposes the server (room broker) and the client engine (peer
//! connections, transfers, trust); hosts drain a typed event stream and
//! render it however they like.

pub mod client;
pub mod config;
pub mod crypto;
pub mod events;
pub mod protocol;
pub mod server;
pub mod transfer;
pub mod webrtc;

// Re-exports
pub use client::{ClientIdentity, RoomClient};
pub use config::Config;
pub use events::{Event, EventSink};
pub use protocol::{DeviceType, Envelope, PeerInfo, SignalMessage};
pub use server::{run_server, AppState};
pub use transfer::{TransferEngine, TrustStore};
// `crate::` disambiguates the module from the webrtc crate itself
pub use crate::webrtc::{ConnectionManager, LinkState};
