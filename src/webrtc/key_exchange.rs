//! Per-peer key agreement for the relay path
//!
//! Each side holds an X25519 secret per remote peer, trades public keys over
//! the room socket, and derives one symmetric key per pair. Keys are dropped
//! when the link closes; the next relay session re-exchanges.

use crate::crypto::{self, SymmetricKey};
use crate::webrtc::ConnectionError;
use base64::Engine;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use x25519_dalek::{PublicKey, StaticSecret};

struct PeerKeys {
    secret: StaticSecret,
    shared: Option<SymmetricKey>,
    sent: bool,
}

/// Key material per remote peer.
pub struct KeyExchange {
    peers: Mutex<HashMap<String, PeerKeys>>,
    /// Woken whenever any shared key lands.
    key_ready: Arc<Notify>,
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            key_ready: Arc::new(Notify::new()),
        }
    }

    /// Our public key for the pair, base64 for the wire. Generates the
    /// secret on first use.
    pub fn local_public(&self, peer_id: &str) -> String {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = peers.entry(peer_id.to_string()).or_insert_with(|| PeerKeys {
            secret: StaticSecret::random_from_rng(OsRng),
            shared: None,
            sent: false,
        });
        let public = PublicKey::from(&entry.secret);
        base64::engine::general_purpose::STANDARD.encode(public.as_bytes())
    }

    /// Our public key, the first time it needs to go on the wire for this
    /// pair; None once it has been handed out. Keeps the exchange to one
    /// message per side per session.
    pub fn public_for_send(&self, peer_id: &str) -> Option<String> {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = peers.entry(peer_id.to_string()).or_insert_with(|| PeerKeys {
            secret: StaticSecret::random_from_rng(OsRng),
            shared: None,
            sent: false,
        });
        if entry.sent {
            return None;
        }
        entry.sent = true;
        let public = PublicKey::from(&entry.secret);
        Some(base64::engine::general_purpose::STANDARD.encode(public.as_bytes()))
    }

    /// Apply the remote side's public key and derive the shared key.
    pub fn set_remote_public(
        &self,
        peer_id: &str,
        public_b64: &str,
    ) -> Result<SymmetricKey, ConnectionError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(public_b64)
            .map_err(|e| ConnectionError::KeyExchange(format!("Bad public key: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ConnectionError::KeyExchange("Public key must be 32 bytes".into()))?;
        let remote = PublicKey::from(bytes);

        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = peers.entry(peer_id.to_string()).or_insert_with(|| PeerKeys {
            secret: StaticSecret::random_from_rng(OsRng),
            shared: None,
            sent: false,
        });
        let shared = entry.secret.diffie_hellman(&remote);
        let key = crypto::derive_peer_key(shared.as_bytes());
        entry.shared = Some(key);
        drop(peers);

        self.key_ready.notify_waiters();
        Ok(key)
    }

    /// The derived key for a peer, if the exchange has completed.
    pub fn key_for(&self, peer_id: &str) -> Option<SymmetricKey> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .and_then(|p| p.shared)
    }

    /// Wait until the key for a peer is available.
    pub async fn wait_for_key(
        &self,
        peer_id: &str,
        timeout: std::time::Duration,
    ) -> Result<SymmetricKey, ConnectionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(key) = self.key_for(peer_id) {
                return Ok(key);
            }
            let notified = self.key_ready.notified();
            if let Some(key) = self.key_for(peer_id) {
                return Ok(key);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ConnectionError::KeyExchange(format!(
                    "No key for {} within {:?}",
                    peer_id, timeout
                )));
            }
        }
    }

    /// Drop the pair's material; the next session starts fresh.
    pub fn rekey(&self, peer_id: &str) {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_key() {
        let alice = KeyExchange::new();
        let bob = KeyExchange::new();

        let alice_pub = alice.local_public("bob");
        let bob_pub = bob.local_public("alice");

        let key_at_alice = alice.set_remote_public("bob", &bob_pub).unwrap();
        let key_at_bob = bob.set_remote_public("alice", &alice_pub).unwrap();

        assert_eq!(key_at_alice, key_at_bob);
        assert_eq!(alice.key_for("bob"), Some(key_at_alice));
    }

    #[test]
    fn responder_without_prior_secret_still_derives() {
        // Bob never called local_public before Alice's key arrived.
        let alice = KeyExchange::new();
        let bob = KeyExchange::new();

        let alice_pub = alice.local_public("bob");
        bob.set_remote_public("alice", &alice_pub).unwrap();
        let bob_pub = bob.local_public("alice");
        let key_at_alice = alice.set_remote_public("bob", &bob_pub).unwrap();

        assert_eq!(bob.key_for("alice"), Some(key_at_alice));
    }

    #[test]
    fn public_for_send_fires_once_per_session() {
        let kx = KeyExchange::new();
        assert!(kx.public_for_send("peer").is_some());
        assert!(kx.public_for_send("peer").is_none());

        kx.rekey("peer");
        assert!(kx.public_for_send("peer").is_some());
    }

    #[test]
    fn rekey_drops_material() {
        let alice = KeyExchange::new();
        let bob = KeyExchange::new();
        let bob_pub = bob.local_public("alice");
        alice.set_remote_public("bob", &bob_pub).unwrap();
        assert!(alice.key_for("bob").is_some());

        alice.rekey("bob");
        assert!(alice.key_for("bob").is_none());
    }

    #[test]
    fn rejects_malformed_public_keys() {
        let kx = KeyExchange::new();
        assert!(kx.set_remote_public("p", "!!!not-base64!!!").is_err());
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 8]);
        assert!(kx.set_remote_public("p", &short).is_err());
    }

    #[tokio::test]
    async fn wait_for_key_times_out() {
        let kx = KeyExchange::new();
        let result = kx
            .wait_for_key("nobody", std::time::Duration::from_millis(20))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_for_key_wakes_on_exchange() {
        let kx = Arc::new(KeyExchange::new());
        let other = KeyExchange::new();
        let remote_pub = other.local_public("x");

        let waiter = {
            let kx = kx.clone();
            tokio::spawn(async move {
                kx.wait_for_key("peer", std::time::Duration::from_secs(2)).await
            })
        };
        tokio::task::yield_now().await;
        kx.set_remote_public("peer", &remote_pub).unwrap();

        let key = waiter.await.unwrap().unwrap();
        assert_eq!(kx.key_for("peer"), Some(key));
    }
}
