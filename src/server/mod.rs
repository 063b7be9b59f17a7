//! Room server: admission, presence, and frame forwarding
//!
//! One logical broker per room. Peers connect over WebSocket, announce
//! themselves with a `join` frame, and from then on the server forwards
//! directed signaling/relay frames and broadcasts presence changes. The only
//! durable state is the per-room password hash.

pub mod http;
pub mod room;
pub mod storage;
pub mod ws;

pub use http::{run_server, AppState};
pub use room::RoomRegistry;
pub use storage::{FileStore, MemoryStore, PasswordStore};
