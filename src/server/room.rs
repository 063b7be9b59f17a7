//! Room registry and peer roster
//!
//! Rooms are created implicitly by the first join and dropped when the last
//! peer leaves. Every mutation of a room's roster happens under the registry
//! lock, so message handlers are atomic with respect to the peer set.

use crate::protocol::PeerInfo;
use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Outbound handle to one connected peer: its roster entry plus the sender
/// feeding that socket's writer task.
struct PeerHandle {
    info: PeerInfo,
    sender: mpsc::UnboundedSender<String>,
}

struct Room {
    peers: HashMap<String, PeerHandle>,
}

/// All rooms on this server.
pub struct RoomRegistry {
    rooms: Mutex<HashMap<String, Room>>,
    max_peers: usize,
}

/// Why a join was refused.
#[derive(Debug, PartialEq, Eq)]
pub enum JoinRefusal {
    RoomFull,
}

impl RoomRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            max_peers,
        }
    }

    /// Add a peer to a room, creating the room if needed. Returns the roster
    /// of the *other* live peers at this instant.
    pub fn join(
        &self,
        room_code: &str,
        info: PeerInfo,
        sender: mpsc::UnboundedSender<String>,
    ) -> Result<Vec<PeerInfo>, JoinRefusal> {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let room = rooms
            .entry(room_code.to_string())
            .or_insert_with(|| Room { peers: HashMap::new() });

        if room.peers.len() >= self.max_peers {
            return Err(JoinRefusal::RoomFull);
        }

        let roster: Vec<PeerInfo> = room.peers.values().map(|p| p.info.clone()).collect();
        room.peers
            .insert(info.id.clone(), PeerHandle { info, sender });
        Ok(roster)
    }

    /// Remove a peer; drops the room when it empties. Returns true when the
    /// peer was actually present.
    pub fn leave(&self, room_code: &str, peer_id: &str) -> bool {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let Some(room) = rooms.get_mut(room_code) else {
            return false;
        };
        let removed = room.peers.remove(peer_id).is_some();
        if room.peers.is_empty() {
            rooms.remove(room_code);
        }
        removed
    }

    /// Update a peer's display name in its stored attachment.
    pub fn rename(&self, room_code: &str, peer_id: &str, name: &str) {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = rooms.get_mut(room_code) {
            if let Some(peer) = room.peers.get_mut(peer_id) {
                peer.info.name = name.to_string();
            }
        }
    }

    /// Forward a frame to one peer. Frames for peers that are gone are
    /// dropped silently.
    pub fn send_to(&self, room_code: &str, peer_id: &str, frame: String) {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let Some(peer) = rooms.get(room_code).and_then(|r| r.peers.get(peer_id)) else {
            debug!("Dropping frame for unknown peer {} in {}", peer_id, room_code);
            return;
        };
        let _ = peer.sender.send(frame);
    }

    /// Broadcast a frame to every peer except `exclude`.
    pub fn broadcast_except(&self, room_code: &str, exclude: &str, frame: &str) {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(room) = rooms.get(room_code) {
            for (id, peer) in &room.peers {
                if id != exclude {
                    let _ = peer.sender.send(frame.to_string());
                }
            }
        }
    }

    /// (rooms, peers) totals for the health endpoint.
    pub fn counts(&self) -> (usize, usize) {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let peers = rooms.values().map(|r| r.peers.len()).sum();
        (rooms.len(), peers)
    }
}
