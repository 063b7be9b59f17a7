//! Connection table and signaling glue
//!
//! Owns one [`PeerLink`] per remote peer, applies perfect-negotiation
//! verdicts to the live peer connections, and routes relay frames and key
//! exchanges. Outbound signaling goes through one channel the room client
//! drains into its socket.

use crate::config::WebRtcConfig;
use crate::events::{Event, EventSink};
use crate::protocol::{Envelope, IceCandidateData, KeyExchangeData, SignalMessage};
use crate::webrtc::connection::{LinkState, LinkTimeouts, PeerLink, ReceiveHandler};
use crate::webrtc::key_exchange::KeyExchange;
use crate::webrtc::negotiation::{role_for, OfferAction};
use crate::webrtc::peer_connection::{PeerConnectionFactory, DATA_CHANNEL_LABEL};
use crate::webrtc::ConnectionError;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

/// Per-peer connection manager.
pub struct ConnectionManager {
    links: RwLock<HashMap<String, Arc<PeerLink>>>,
    factory: PeerConnectionFactory,
    signal_tx: mpsc::UnboundedSender<Envelope>,
    keys: Arc<KeyExchange>,
    events: EventSink,
    config: WebRtcConfig,
    local_peer_id: StdRwLock<Option<String>>,
    /// Transfer-engine delivery hook; set after construction.
    receive_handler: Arc<StdRwLock<Option<ReceiveHandler>>>,
}

impl ConnectionManager {
    pub fn new(
        config: WebRtcConfig,
        signal_tx: mpsc::UnboundedSender<Envelope>,
        events: EventSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            links: RwLock::new(HashMap::new()),
            factory: PeerConnectionFactory::new(config.clone()),
            signal_tx,
            keys: Arc::new(KeyExchange::new()),
            events,
            config,
            local_peer_id: StdRwLock::new(None),
            receive_handler: Arc::new(StdRwLock::new(None)),
        })
    }

    /// Identity assigned by the server at join; negotiation roles derive
    /// from it.
    pub fn set_local_peer_id(&self, id: &str) {
        *self.local_peer_id.write().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
    }

    /// Install the frame sink (the transfer engine).
    pub fn set_receive_handler(&self, handler: ReceiveHandler) {
        *self.receive_handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn keys(&self) -> Arc<KeyExchange> {
        self.keys.clone()
    }

    fn local_id(&self) -> Result<String, ConnectionError> {
        self.local_peer_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ConnectionError::ConnectionFailed("Not joined to a room".into()))
    }

    fn timeouts(&self) -> LinkTimeouts {
        LinkTimeouts {
            slow_after: Duration::from_secs(self.config.slow_after_secs),
            relay_after: Duration::from_secs(self.config.relay_after_secs),
            disconnect_grace: Duration::from_secs(self.config.disconnect_grace_secs),
        }
    }

    /// Get or create the link for a peer.
    pub async fn ensure_link(self: &Arc<Self>, peer_id: &str) -> Result<Arc<PeerLink>, ConnectionError> {
        if let Some(link) = self.links.read().await.get(peer_id) {
            if link.state().await != LinkState::Closed {
                return Ok(link.clone());
            }
        }

        let local_id = self.local_id()?;
        let role = role_for(&local_id, peer_id);
        debug!("Creating link to {} as {:?}", peer_id, role);

        let handler_slot = self.receive_handler.clone();
        let on_receive: ReceiveHandler = Arc::new(move |peer, bytes, sealed| {
            let handler = handler_slot
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(handler) = handler {
                handler(peer, bytes, sealed);
            }
        });

        let events = self.events.clone();
        let on_state = Arc::new(move |peer: &str, state: LinkState| {
            events.emit(Event::ConnectionState {
                peer_id: peer.to_string(),
                state,
            });
        });

        let link = PeerLink::new(
            peer_id.to_string(),
            role,
            self.signal_tx.clone(),
            self.keys.clone(),
            on_receive,
            on_state,
            self.timeouts(),
        );

        let pc = self.factory.create_peer_connection().await?;
        self.register_pc_callbacks(&link, &pc);
        link.set_peer_connection(pc).await;

        self.links
            .write()
            .await
            .insert(peer_id.to_string(), link.clone());
        Ok(link)
    }

    fn register_pc_callbacks(&self, link: &Arc<PeerLink>, pc: &Arc<RTCPeerConnection>) {
        // Trickle our candidates to the remote side.
        let signal_tx = self.signal_tx.clone();
        let peer_id = link.peer_id.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let signal_tx = signal_tx.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let Ok(init) = candidate.to_json() else { return };
                let envelope = Envelope::directed(
                    &peer_id,
                    SignalMessage::IceCandidate {
                        data: IceCandidateData {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        },
                    },
                );
                let _ = signal_tx.send(envelope);
            })
        }));

        let weak = Arc::downgrade(link);
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(link) = weak.upgrade() else { return };
                info!("Peer connection to {} state: {:?}", link.peer_id, state);
                match state {
                    RTCPeerConnectionState::Connected => link.mark_connected().await,
                    RTCPeerConnectionState::Failed => link.fall_back_to_relay().await,
                    _ => {}
                }
            })
        }));

        let weak = Arc::downgrade(link);
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(link) = weak.upgrade() else { return };
                match state {
                    RTCIceConnectionState::Failed => link.fall_back_to_relay().await,
                    RTCIceConnectionState::Disconnected => link.schedule_disconnect_fallback(),
                    _ => {}
                }
            })
        }));

        // The offering side creates the channel; the answering side receives
        // it here.
        let weak = Arc::downgrade(link);
        pc.on_data_channel(Box::new(move |channel| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(link) = weak.upgrade() else { return };
                if channel.label() == DATA_CHANNEL_LABEL {
                    link.adopt_data_channel(channel).await;
                } else {
                    debug!("Ignoring unexpected data channel {:?}", channel.label());
                }
            })
        }));
    }

    /// Kick off negotiation toward a peer. A no-op when an offer is already
    /// in flight or a session is being set up.
    pub async fn initiate(self: &Arc<Self>, peer_id: &str) -> Result<(), ConnectionError> {
        let link = self.ensure_link(peer_id).await?;

        let proceed = link
            .negotiation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .begin_offer();
        if !proceed {
            return Ok(());
        }

        let pc = link
            .peer_connection()
            .await
            .ok_or_else(|| ConnectionError::NoLink(peer_id.to_string()))?;

        link.set_state(LinkState::Connecting).await;
        link.arm_watchdog();

        let channel = PeerConnectionFactory::create_data_channel(&pc).await?;
        link.adopt_data_channel(channel).await;

        let sdp = PeerConnectionFactory::create_offer(&pc).await?;
        let envelope = Envelope::directed(peer_id, SignalMessage::Offer { data: sdp });
        self.signal_tx
            .send(envelope)
            .map_err(|_| ConnectionError::ConnectionFailed("Signaling channel closed".into()))?;
        Ok(())
    }

    /// Eager negotiation on peer-joined so the first transfer is not
    /// blocked on the handshake. Best-effort.
    pub async fn prewarm(self: &Arc<Self>, peer_id: &str) {
        if !self.config.prewarm {
            return;
        }
        if let Err(e) = self.initiate(peer_id).await {
            debug!("Prewarm toward {} failed: {}", peer_id, e);
        }
    }

    /// Apply one incoming signaling message from a peer.
    pub async fn handle_signal(self: &Arc<Self>, from: &str, message: SignalMessage) {
        let result = match message {
            SignalMessage::Offer { data } => self.handle_offer(from, data).await,
            SignalMessage::Answer { data } => self.handle_answer(from, data).await,
            SignalMessage::IceCandidate { data } => self.handle_candidate(from, data).await,
            SignalMessage::RelayData { data } => {
                if let Some(link) = self.links.read().await.get(from) {
                    link.handle_relay_data(data);
                } else {
                    debug!("Relay frame from {} with no link, dropping", from);
                }
                Ok(())
            }
            SignalMessage::KeyExchange { data } => self.handle_key_exchange(from, data),
            other => {
                debug!("Connection manager ignoring {} from {}", other.kind(), from);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Signal handling for {} failed: {}", from, e);
        }
    }

    async fn handle_offer(self: &Arc<Self>, from: &str, sdp: String) -> Result<(), ConnectionError> {
        let link = self.ensure_link(from).await?;

        let action = link
            .negotiation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_remote_offer();

        match action {
            OfferAction::Ignore => {
                debug!("Glare with {}: impolite side ignoring remote offer", from);
                return Ok(());
            }
            OfferAction::RollbackAndAnswer => {
                debug!("Glare with {}: polite side discarding local offer", from);
                let fresh = self.factory.create_peer_connection().await?;
                self.register_pc_callbacks(&link, &fresh);
                link.replace_peer_connection(fresh).await;
            }
            OfferAction::Answer => {}
        }

        let pc = link
            .peer_connection()
            .await
            .ok_or_else(|| ConnectionError::NoLink(from.to_string()))?;

        link.set_state(LinkState::Connecting).await;
        link.arm_watchdog();

        let answer_sdp = PeerConnectionFactory::handle_offer(&pc, &sdp).await?;
        self.apply_buffered_candidates(&link, &pc).await;

        let envelope = Envelope::directed(from, SignalMessage::Answer { data: answer_sdp });
        self.signal_tx
            .send(envelope)
            .map_err(|_| ConnectionError::ConnectionFailed("Signaling channel closed".into()))?;
        Ok(())
    }

    async fn handle_answer(self: &Arc<Self>, from: &str, sdp: String) -> Result<(), ConnectionError> {
        let Some(link) = self.links.read().await.get(from).cloned() else {
            debug!("Answer from {} with no link, dropping", from);
            return Ok(());
        };

        let accepted = link
            .negotiation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_remote_answer();
        if !accepted {
            debug!("Stray answer from {}, dropping", from);
            return Ok(());
        }

        let pc = link
            .peer_connection()
            .await
            .ok_or_else(|| ConnectionError::NoLink(from.to_string()))?;
        PeerConnectionFactory::handle_answer(&pc, &sdp).await?;
        self.apply_buffered_candidates(&link, &pc).await;
        Ok(())
    }

    async fn handle_candidate(
        self: &Arc<Self>,
        from: &str,
        data: IceCandidateData,
    ) -> Result<(), ConnectionError> {
        let link = self.ensure_link(from).await?;

        let ready = link
            .negotiation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_remote_candidate(data);

        if let Some(candidate) = ready {
            let pc = link
                .peer_connection()
                .await
                .ok_or_else(|| ConnectionError::NoLink(from.to_string()))?;
            PeerConnectionFactory::add_ice_candidate(
                &pc,
                &candidate.candidate,
                candidate.sdp_mid.as_deref(),
                candidate.sdp_mline_index,
            )
            .await?;
        }
        Ok(())
    }

    async fn apply_buffered_candidates(&self, link: &Arc<PeerLink>, pc: &Arc<RTCPeerConnection>) {
        let buffered = link
            .negotiation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain_candidates();
        for candidate in buffered {
            if let Err(e) = PeerConnectionFactory::add_ice_candidate(
                pc,
                &candidate.candidate,
                candidate.sdp_mid.as_deref(),
                candidate.sdp_mline_index,
            )
            .await
            {
                warn!("Buffered candidate for {} rejected: {}", link.peer_id, e);
            }
        }
    }

    fn handle_key_exchange(
        self: &Arc<Self>,
        from: &str,
        data: KeyExchangeData,
    ) -> Result<(), ConnectionError> {
        self.keys.set_remote_public(from, &data.public_key)?;
        info!("Relay key established with {}", from);

        if let Some(public) = self.keys.public_for_send(from) {
            let envelope = Envelope::directed(
                from,
                SignalMessage::KeyExchange {
                    data: KeyExchangeData { public_key: public },
                },
            );
            let _ = self.signal_tx.send(envelope);
        }
        Ok(())
    }

    /// Send one transfer frame to a peer over whichever path the link is on.
    pub async fn send(&self, peer_id: &str, bytes: &[u8], sealed: bool) -> Result<(), ConnectionError> {
        let link = self
            .links
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| ConnectionError::NoLink(peer_id.to_string()))?;
        link.send(bytes, sealed).await
    }

    pub async fn link_state(&self, peer_id: &str) -> LinkState {
        match self.links.read().await.get(peer_id) {
            Some(link) => link.state().await,
            None => LinkState::Idle,
        }
    }

    /// Bytes queued in the peer's outbound data channel buffer.
    pub async fn outbound_buffered(&self, peer_id: &str) -> usize {
        match self.links.read().await.get(peer_id) {
            Some(link) => link.outbound_buffered().await,
            None => 0,
        }
    }

    /// Wait until the link can carry transfer frames (p2p or relay). The
    /// relay watchdog bounds this: it cannot take much longer than the
    /// relay threshold.
    pub async fn wait_until_transferable(
        self: &Arc<Self>,
        peer_id: &str,
        timeout: Duration,
    ) -> Result<LinkState, ConnectionError> {
        self.initiate(peer_id).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.link_state(peer_id).await;
            if state.transferable() {
                return Ok(state);
            }
            if state == LinkState::Closed {
                return Err(ConnectionError::Closed(peer_id.to_string()));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ConnectionError::ConnectionFailed(format!(
                    "Negotiation with {} did not converge",
                    peer_id
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Close and drop the link for a peer.
    pub async fn close_link(&self, peer_id: &str) {
        if let Some(link) = self.links.write().await.remove(peer_id) {
            link.close().await;
        }
    }

    /// Tear down every link (room socket lost, shutting down).
    pub async fn close_all(&self) {
        let links: Vec<_> = self.links.write().await.drain().collect();
        for (_, link) in links {
            link.close().await;
        }
    }

    pub async fn link_count(&self) -> usize {
        self.links.read().await.len()
    }
}
