//! Per-peer link
//!
//! Tracks one logical connection to a remote peer through its states,
//! carries bytes over the data channel while the direct path is up, and
//! switches to server-relayed framed transport when negotiation times out
//! or ICE gives up. Outbound relay frames are sequenced; inbound ones are
//! reassembled in order before delivery.

use crate::protocol::{Envelope, RelayPayload, SignalMessage};
use crate::webrtc::key_exchange::KeyExchange;
use crate::webrtc::negotiation::{NegotiationState, Role};
use crate::webrtc::ConnectionError;
use base64::Engine;
use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

/// Link lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No negotiation attempted yet
    Idle,
    /// Offer/answer or ICE in progress
    Connecting,
    /// Direct data channel established
    P2p,
    /// Still negotiating past the slow threshold
    Slow,
    /// Server-relayed transport
    Relay,
    /// Torn down
    Closed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::P2p => "p2p",
            LinkState::Slow => "slow",
            LinkState::Relay => "relay",
            LinkState::Closed => "closed",
        }
    }

    /// The link can carry transfer frames in these states.
    pub fn transferable(&self) -> bool {
        matches!(self, LinkState::P2p | LinkState::Relay)
    }
}

/// Delivery callback: (peer id, frame bytes, payload was AEAD-sealed)
pub type ReceiveHandler = Arc<dyn Fn(&str, &[u8], bool) + Send + Sync>;

/// State-change callback toward the host
pub type StateHandler = Arc<dyn Fn(&str, LinkState) + Send + Sync>;

/// Negotiation/fallback timing, lifted from [`crate::config::WebRtcConfig`].
#[derive(Debug, Clone, Copy)]
pub struct LinkTimeouts {
    pub slow_after: Duration,
    pub relay_after: Duration,
    pub disconnect_grace: Duration,
}

struct RelayReassembly {
    next_seq: u32,
    pending: BTreeMap<u32, (Vec<u8>, bool)>,
}

/// One logical connection to a remote peer.
pub struct PeerLink {
    pub peer_id: String,
    state: RwLock<LinkState>,
    pc: RwLock<Option<Arc<RTCPeerConnection>>>,
    channel: RwLock<Option<Arc<RTCDataChannel>>>,
    pub negotiation: StdMutex<NegotiationState>,
    relay_out_seq: AtomicU32,
    relay_in: StdMutex<RelayReassembly>,
    watchdog_armed: AtomicBool,
    signal_tx: mpsc::UnboundedSender<Envelope>,
    keys: Arc<KeyExchange>,
    on_receive: ReceiveHandler,
    on_state: StateHandler,
    timeouts: LinkTimeouts,
}

impl PeerLink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer_id: String,
        role: Role,
        signal_tx: mpsc::UnboundedSender<Envelope>,
        keys: Arc<KeyExchange>,
        on_receive: ReceiveHandler,
        on_state: StateHandler,
        timeouts: LinkTimeouts,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            state: RwLock::new(LinkState::Idle),
            pc: RwLock::new(None),
            channel: RwLock::new(None),
            negotiation: StdMutex::new(NegotiationState::new(role)),
            relay_out_seq: AtomicU32::new(0),
            relay_in: StdMutex::new(RelayReassembly {
                next_seq: 0,
                pending: BTreeMap::new(),
            }),
            watchdog_armed: AtomicBool::new(false),
            signal_tx,
            keys,
            on_receive,
            on_state,
            timeouts,
        })
    }

    pub async fn state(&self) -> LinkState {
        *self.state.read().await
    }

    /// Transition, notify. Closed is terminal.
    pub async fn set_state(&self, new: LinkState) {
        let mut current = self.state.write().await;
        if *current == new || *current == LinkState::Closed {
            return;
        }
        debug!("Link {} state {} -> {}", self.peer_id, current.as_str(), new.as_str());
        *current = new;
        drop(current);
        (self.on_state)(&self.peer_id, new);
    }

    pub async fn set_peer_connection(&self, pc: Arc<RTCPeerConnection>) {
        *self.pc.write().await = Some(pc);
    }

    pub async fn peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.pc.read().await.clone()
    }

    /// Swap in a fresh peer connection, closing the old one. Used by the
    /// polite side to discard its in-flight offer under glare.
    pub async fn replace_peer_connection(&self, pc: Arc<RTCPeerConnection>) {
        let old = self.pc.write().await.replace(pc);
        if let Some(old) = old {
            let _ = old.close().await;
        }
        *self.channel.write().await = None;
    }

    /// Adopt the transfer data channel and wire its callbacks.
    pub async fn adopt_data_channel(self: &Arc<Self>, channel: Arc<RTCDataChannel>) {
        let link = Arc::downgrade(self);
        channel.on_message(Box::new(move |msg| {
            let link = link.clone();
            Box::pin(async move {
                if let Some(link) = link.upgrade() {
                    (link.on_receive)(&link.peer_id, &msg.data, false);
                }
            })
        }));

        let peer_id = self.peer_id.clone();
        channel.on_open(Box::new(move || {
            info!("Data channel open to {}", peer_id);
            Box::pin(async {})
        }));

        let peer_id = self.peer_id.clone();
        channel.on_close(Box::new(move || {
            info!("Data channel to {} closed", peer_id);
            Box::pin(async {})
        }));

        let peer_id = self.peer_id.clone();
        channel.on_error(Box::new(move |err| {
            warn!("Data channel error to {}: {}", peer_id, err);
            Box::pin(async {})
        }));

        *self.channel.write().await = Some(channel);
    }

    /// Arm the negotiation watchdog: slow after 4 s, relay after 8 s.
    /// Re-arming while armed is a no-op.
    pub fn arm_watchdog(self: &Arc<Self>) {
        if self.watchdog_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let timeouts = self.timeouts;
        tokio::spawn(async move {
            tokio::time::sleep(timeouts.slow_after).await;
            let Some(link) = weak.upgrade() else { return };
            if link.state().await == LinkState::Connecting {
                link.set_state(LinkState::Slow).await;
            }
            drop(link);

            tokio::time::sleep(timeouts.relay_after.saturating_sub(timeouts.slow_after)).await;
            let Some(link) = weak.upgrade() else { return };
            if matches!(link.state().await, LinkState::Connecting | LinkState::Slow) {
                info!("Negotiation with {} timed out, falling back to relay", link.peer_id);
                link.fall_back_to_relay().await;
            }
        });
    }

    /// ICE went away mid-session: wait out the grace period, then relay if
    /// it has not recovered.
    pub fn schedule_disconnect_fallback(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let grace = self.timeouts.disconnect_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(link) = weak.upgrade() else { return };
            let still_down = match link.peer_connection().await {
                Some(pc) => {
                    use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
                    matches!(
                        pc.ice_connection_state(),
                        RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed
                    )
                }
                None => true,
            };
            if still_down {
                info!("ICE to {} stayed down, falling back to relay", link.peer_id);
                link.fall_back_to_relay().await;
            }
        });
    }

    /// Switch to relayed transport: drain the channel, kick off the key
    /// exchange, flip the state.
    pub async fn fall_back_to_relay(self: &Arc<Self>) {
        match self.state().await {
            LinkState::Closed | LinkState::Relay => return,
            _ => {}
        }

        self.drain_channel().await;

        if let Some(public) = self.keys.public_for_send(&self.peer_id) {
            let envelope = Envelope::directed(
                &self.peer_id,
                SignalMessage::KeyExchange {
                    data: crate::protocol::KeyExchangeData { public_key: public },
                },
            );
            let _ = self.signal_tx.send(envelope);
        }

        self.set_state(LinkState::Relay).await;
    }

    /// Wait for in-flight channel frames to leave the local buffer before
    /// the path switches.
    async fn drain_channel(&self) {
        let Some(channel) = self.channel.read().await.clone() else {
            return;
        };
        for _ in 0..40 {
            if channel.ready_state() != RTCDataChannelState::Open {
                break;
            }
            if channel.buffered_amount().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// ICE/DTLS came up; the link is direct.
    pub async fn mark_connected(&self) {
        self.watchdog_armed.store(false, Ordering::SeqCst);
        self.set_state(LinkState::P2p).await;
    }

    /// Send one transfer frame. `sealed` marks the payload as AEAD
    /// ciphertext for the relay wrap.
    pub async fn send(&self, bytes: &[u8], sealed: bool) -> Result<(), ConnectionError> {
        match self.state().await {
            LinkState::Closed => return Err(ConnectionError::Closed(self.peer_id.clone())),
            LinkState::Relay => return self.send_relay(bytes, sealed),
            _ => {}
        }

        let channel = self.channel.read().await.clone();
        match channel {
            Some(channel) if channel.ready_state() == RTCDataChannelState::Open => {
                channel
                    .send(&Bytes::copy_from_slice(bytes))
                    .await
                    .map_err(|e| ConnectionError::DataChannelError(format!("Send failed: {}", e)))?;
                Ok(())
            }
            _ => Err(ConnectionError::DataChannelError(
                "Data channel not open".to_string(),
            )),
        }
    }

    fn send_relay(&self, bytes: &[u8], sealed: bool) -> Result<(), ConnectionError> {
        let seq = self.relay_out_seq.fetch_add(1, Ordering::SeqCst);
        let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
        let envelope = Envelope::directed(
            &self.peer_id,
            SignalMessage::RelayData {
                data: RelayPayload { seq, payload, enc: sealed },
            },
        );
        self.signal_tx
            .send(envelope)
            .map_err(|_| ConnectionError::Closed(self.peer_id.clone()))
    }

    /// Bytes sitting in the data channel's outbound buffer.
    pub async fn outbound_buffered(&self) -> usize {
        match self.channel.read().await.clone() {
            Some(channel) => channel.buffered_amount().await,
            None => 0,
        }
    }

    /// An inbound relay frame from the room socket. Frames are delivered in
    /// seq order; gaps hold later frames back until they fill.
    pub fn handle_relay_data(&self, data: RelayPayload) {
        let bytes = match base64::engine::general_purpose::STANDARD.decode(&data.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping undecodable relay frame from {}: {}", self.peer_id, e);
                return;
            }
        };

        let mut ready = Vec::new();
        {
            let mut reassembly = self.relay_in.lock().unwrap_or_else(|e| e.into_inner());
            if data.seq < reassembly.next_seq {
                debug!("Duplicate relay frame {} from {}", data.seq, self.peer_id);
                return;
            }
            reassembly.pending.insert(data.seq, (bytes, data.enc));
            while let Some(frame) = {
                let next_seq = reassembly.next_seq;
                reassembly.pending.remove(&next_seq)
            } {
                reassembly.next_seq += 1;
                ready.push(frame);
            }
        }

        for (bytes, enc) in ready {
            (self.on_receive)(&self.peer_id, &bytes, enc);
        }
    }

    /// Tear the link down and drop the pair's key material.
    pub async fn close(&self) {
        self.set_state(LinkState::Closed).await;
        if let Some(channel) = self.channel.write().await.take() {
            let _ = channel.close().await;
        }
        if let Some(pc) = self.pc.write().await.take() {
            let _ = pc.close().await;
        }
        self.keys.rekey(&self.peer_id);
        info!("Link to {} closed", self.peer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::negotiation::Role;
    use std::sync::Mutex;

    fn test_link() -> (Arc<PeerLink>, mpsc::UnboundedReceiver<Envelope>, Arc<Mutex<Vec<(u32, Vec<u8>, bool)>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let received: Arc<Mutex<Vec<(u32, Vec<u8>, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let received_cb = received.clone();
        let counter = Arc::new(AtomicU32::new(0));
        let link = PeerLink::new(
            "remote-peer".into(),
            Role::Impolite,
            tx,
            Arc::new(KeyExchange::new()),
            Arc::new(move |_peer, bytes, enc| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                received_cb.lock().unwrap().push((n, bytes.to_vec(), enc));
            }),
            Arc::new(|_, _| {}),
            LinkTimeouts {
                slow_after: Duration::from_millis(40),
                relay_after: Duration::from_millis(80),
                disconnect_grace: Duration::from_millis(20),
            },
        );
        (link, rx, received)
    }

    fn relay_frame(seq: u32, bytes: &[u8], enc: bool) -> RelayPayload {
        RelayPayload {
            seq,
            payload: base64::engine::general_purpose::STANDARD.encode(bytes),
            enc,
        }
    }

    #[tokio::test]
    async fn relay_send_wraps_and_sequences() {
        let (link, mut rx, _) = test_link();
        link.set_state(LinkState::Relay).await;

        link.send(b"first", false).await.unwrap();
        link.send(b"second", true).await.unwrap();

        for (expect_seq, expect_enc) in [(0u32, false), (1u32, true)] {
            let env = rx.recv().await.unwrap();
            assert_eq!(env.to.as_deref(), Some("remote-peer"));
            match env.message {
                SignalMessage::RelayData { data } => {
                    assert_eq!(data.seq, expect_seq);
                    assert_eq!(data.enc, expect_enc);
                }
                other => panic!("expected relay-data, got {}", other.kind()),
            }
        }
    }

    #[tokio::test]
    async fn relay_receive_reorders_by_seq() {
        let (link, _rx, received) = test_link();

        link.handle_relay_data(relay_frame(1, b"bbb", false));
        assert!(received.lock().unwrap().is_empty());

        link.handle_relay_data(relay_frame(0, b"aaa", true));
        let got = received.lock().unwrap().clone();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].1, b"aaa");
        assert!(got[0].2);
        assert_eq!(got[1].1, b"bbb");
        assert!(!got[1].2);
    }

    #[tokio::test]
    async fn relay_receive_drops_duplicates() {
        let (link, _rx, received) = test_link();
        link.handle_relay_data(relay_frame(0, b"x", false));
        link.handle_relay_data(relay_frame(0, b"x", false));
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn watchdog_walks_slow_then_relay() {
        let (link, mut rx, _) = test_link();
        link.set_state(LinkState::Connecting).await;
        link.arm_watchdog();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(link.state().await, LinkState::Slow);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(link.state().await, LinkState::Relay);

        // fallback kicked off the key exchange
        let env = rx.recv().await.unwrap();
        assert!(matches!(env.message, SignalMessage::KeyExchange { .. }));
    }

    #[tokio::test]
    async fn watchdog_leaves_connected_links_alone() {
        let (link, _rx, _) = test_link();
        link.set_state(LinkState::Connecting).await;
        link.arm_watchdog();
        link.mark_connected().await;

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(link.state().await, LinkState::P2p);
    }

    #[tokio::test]
    async fn closed_is_terminal() {
        let (link, _rx, _) = test_link();
        link.close().await;
        assert_eq!(link.state().await, LinkState::Closed);
        link.set_state(LinkState::Relay).await;
        assert_eq!(link.state().await, LinkState::Closed);
        assert!(link.send(b"x", false).await.is_err());
    }
}
