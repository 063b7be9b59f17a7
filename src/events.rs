//! Host-facing events
//!
//! The core never touches presentation. Everything a front-end (web, TUI,
//! test harness) needs to render flows through one bounded channel of typed
//! events which the host drains at its own pace. Overflow drops the event
//! with a warning; progress events are re-emitted every chunk, so a dropped
//! one is recovered by the next.

use crate::protocol::PeerInfo;
use crate::transfer::{CancelReason, Direction, FailureKind, TransferMode};
use crate::webrtc::LinkState;
use log::{debug, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Everything observable about the core.
#[derive(Debug, Clone)]
pub enum Event {
    /// Joined a room; identity plus the roster at that instant
    RoomJoined {
        peer_id: String,
        room_code: String,
        peers: Vec<PeerInfo>,
    },

    PeerJoined(PeerInfo),

    PeerLeft { peer_id: String },

    PeerRenamed { peer_id: String, name: String },

    /// Link to a peer changed state
    ConnectionState { peer_id: String, state: LinkState },

    /// Incoming file request awaiting a verdict from the host
    FileRequest {
        peer_id: String,
        file_id: Uuid,
        file_name: String,
        file_size: u64,
    },

    TransferStart {
        peer_id: String,
        file_id: Uuid,
        file_name: String,
        file_size: u64,
        direction: Direction,
    },

    Progress {
        peer_id: String,
        file_id: Uuid,
        file_name: String,
        file_size: u64,
        percent: f64,
        speed_bps: f64,
        mode: TransferMode,
    },

    /// A file arrived intact
    FileReceived {
        peer_id: String,
        file_name: String,
        bytes: Vec<u8>,
    },

    /// A send completed and the far side has everything
    TransferComplete { peer_id: String, file_id: Uuid },

    TransferCancelled {
        peer_id: String,
        file_id: Uuid,
        reason: CancelReason,
    },

    TransferFailed {
        peer_id: String,
        file_id: Option<Uuid>,
        kind: FailureKind,
    },

    TextReceived { peer_id: String, text: String },

    /// Server refused the room (password gate, room full)
    RoomError { error: String },

    /// The room socket dropped; a reconnect is scheduled
    Disconnected,
}

/// Bounded event channel the host drains.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Push an event without blocking. A full sink drops the event.
    pub fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Event sink full, dropping {:?}", kind_of(&event));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event sink closed");
            }
        }
    }
}

fn kind_of(event: &Event) -> &'static str {
    match event {
        Event::RoomJoined { .. } => "room-joined",
        Event::PeerJoined(_) => "peer-joined",
        Event::PeerLeft { .. } => "peer-left",
        Event::PeerRenamed { .. } => "peer-renamed",
        Event::ConnectionState { .. } => "connection-state",
        Event::FileRequest { .. } => "file-request",
        Event::TransferStart { .. } => "transfer-start",
        Event::Progress { .. } => "progress",
        Event::FileReceived { .. } => "file-received",
        Event::TransferComplete { .. } => "transfer-complete",
        Event::TransferCancelled { .. } => "transfer-cancelled",
        Event::TransferFailed { .. } => "transfer-failed",
        Event::TextReceived { .. } => "text-received",
        Event::RoomError { .. } => "room-error",
        Event::Disconnected => "disconnected",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_and_drain() {
        let (sink, mut rx) = EventSink::new(8);
        sink.emit(Event::TextReceived {
            peer_id: "p".into(),
            text: "hello".into(),
        });
        match rx.recv().await.unwrap() {
            Event::TextReceived { text, .. } => assert_eq!(text, "hello"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn overflow_drops_instead_of_blocking() {
        let (sink, mut rx) = EventSink::new(1);
        sink.emit(Event::Disconnected);
        sink.emit(Event::Disconnected); // dropped, must not block
        assert!(matches!(rx.recv().await, Some(Event::Disconnected)));
        assert!(rx.try_recv().is_err());
    }
}
