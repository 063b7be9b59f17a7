//! Remote peer table
//!
//! Peers live in a generational arena: a handle taken out for an in-flight
//! transfer keeps resolving safely after the peer leaves, and if the same
//! device rejoins under a new id the stale handle resolves to "gone" rather
//! than to the new record.

use crate::protocol::PeerInfo;
use crate::webrtc::LinkState;
use std::collections::HashMap;

/// Stable reference to an arena slot at one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    index: u32,
    generation: u32,
}

/// Client-side mirror of a room peer.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub info: PeerInfo,
    pub trusted: bool,
    pub link_state: LinkState,
}

struct Slot {
    generation: u32,
    occupant: Option<RemotePeer>,
}

/// Generational arena of remote peers, indexed by peer id.
#[derive(Default)]
pub struct PeerArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_id: HashMap<String, PeerHandle>,
}

impl PeerArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a peer. An existing id keeps its handle; a fresh id
    /// takes a free slot (new generation) or grows the arena.
    pub fn insert(&mut self, peer: RemotePeer) -> PeerHandle {
        if let Some(&handle) = self.by_id.get(&peer.info.id) {
            if let Some(slot) = self.slots.get_mut(handle.index as usize) {
                slot.occupant = Some(peer);
                return handle;
            }
        }

        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.occupant = Some(peer.clone());
                PeerHandle { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, occupant: Some(peer.clone()) });
                PeerHandle { index, generation: 0 }
            }
        };
        self.by_id.insert(peer.info.id, handle);
        handle
    }

    /// Resolve a handle; stale generations return None.
    pub fn get(&self, handle: PeerHandle) -> Option<&RemotePeer> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.occupant.as_ref()
    }

    pub fn get_mut(&mut self, handle: PeerHandle) -> Option<&mut RemotePeer> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.occupant.as_mut()
    }

    pub fn handle_of(&self, peer_id: &str) -> Option<PeerHandle> {
        self.by_id.get(peer_id).copied()
    }

    /// Clone out a peer's record by id.
    pub fn peer(&self, peer_id: &str) -> Option<RemotePeer> {
        self.handle_of(peer_id).and_then(|h| self.get(h)).cloned()
    }

    pub fn update<F: FnOnce(&mut RemotePeer)>(&mut self, peer_id: &str, apply: F) -> bool {
        match self.handle_of(peer_id).and_then(|h| {
            let slot = self.slots.get_mut(h.index as usize)?;
            if slot.generation != h.generation {
                return None;
            }
            slot.occupant.as_mut()
        }) {
            Some(peer) => {
                apply(peer);
                true
            }
            None => false,
        }
    }

    /// Remove a peer; its slot's generation advances so outstanding handles
    /// go stale.
    pub fn remove(&mut self, peer_id: &str) -> Option<RemotePeer> {
        let handle = self.by_id.remove(peer_id)?;
        let slot = self.slots.get_mut(handle.index as usize)?;
        let occupant = slot.occupant.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        occupant
    }

    pub fn all(&self) -> Vec<RemotePeer> {
        self.slots
            .iter()
            .filter_map(|slot| slot.occupant.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Drop everyone (socket lost). Generations advance, stale handles die.
    pub fn clear(&mut self) {
        let ids: Vec<String> = self.by_id.keys().cloned().collect();
        for id in ids {
            self.remove(&id);
        }
    }
}
