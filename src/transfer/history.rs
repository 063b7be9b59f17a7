//! Per-peer text message history, in-memory only.

use crate::transfer::Direction;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct TextEntry {
    pub direction: Direction,
    pub text: String,
    pub timestamp: u64,
    pub sending: bool,
    pub failed: bool,
}

/// Ordered message log per peer. Dies with the process.
#[derive(Default)]
pub struct MessageHistory {
    entries: Mutex<HashMap<String, Vec<TextEntry>>>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outgoing message as in-flight; returns its index for the
    /// later sent/failed update.
    pub fn push_outgoing(&self, peer_id: &str, text: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let log = entries.entry(peer_id.to_string()).or_default();
        log.push(TextEntry {
            direction: Direction::Send,
            text: text.to_string(),
            timestamp: now_secs(),
            sending: true,
            failed: false,
        });
        log.len() - 1
    }

    pub fn push_incoming(&self, peer_id: &str, text: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.entry(peer_id.to_string()).or_default().push(TextEntry {
            direction: Direction::Recv,
            text: text.to_string(),
            timestamp: now_secs(),
            sending: false,
            failed: false,
        });
    }

    pub fn mark_sent(&self, peer_id: &str, index: usize) {
        self.update(peer_id, index, |entry| entry.sending = false);
    }

    pub fn mark_failed(&self, peer_id: &str, index: usize) {
        self.update(peer_id, index, |entry| {
            entry.sending = false;
            entry.failed = true;
        });
    }

    fn update(&self, peer_id: &str, index: usize, apply: impl FnOnce(&mut TextEntry)) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(peer_id).and_then(|log| log.get_mut(index)) {
            apply(entry);
        }
    }

    pub fn for_peer(&self, peer_id: &str) -> Vec<TextEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
