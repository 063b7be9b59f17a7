//! Room client
//!
//! Composition root for one device: owns the socket to the room server, the
//! connection manager, the transfer engine, the trust store, and the peer
//! table. Reconnects with backoff when the socket drops; stops and clears
//! password material when the server refuses the password.

pub mod peers;

pub use peers::{PeerArena, PeerHandle, RemotePeer};

use crate::config::Config;
use crate::crypto;
use crate::events::{Event, EventSink};
use crate::protocol::{
    close_codes, DeviceType, Envelope, JoinData, NameChangedData, PeerInfo, SignalMessage,
};
use crate::transfer::{CancelReason, TransferEngine, TransferError, TrustStore};
use crate::webrtc::{ConnectionManager, LinkState};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const RECONNECT_INITIAL: Duration = Duration::from_secs(3);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// What this device announces about itself at join.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub name: String,
    pub device_type: DeviceType,
    pub browser_info: Option<String>,
}

/// Outcome of one socket session, deciding the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Transport died; reconnect with backoff
    Reconnect,
    /// Deliberate stop or a refusal reconnecting cannot fix
    Stop,
}

/// Verdict on one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Continue,
    /// Refusal that makes reconnecting pointless
    Fatal,
}

/// One device's connection to a room.
pub struct RoomClient {
    /// Base server URL, e.g. `http://host:port`
    server_url: String,
    identity: StdMutex<ClientIdentity>,
    manager: Arc<ConnectionManager>,
    engine: Arc<TransferEngine>,
    events: EventSink,
    peers: StdMutex<PeerArena>,
    signal_tx: mpsc::UnboundedSender<Envelope>,
    signal_rx: TokioMutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    local_peer_id: StdRwLock<Option<String>>,
    room_code: StdRwLock<Option<String>>,
    /// Raw password, held until join succeeds or the server refuses it
    password: StdMutex<Option<String>>,
    stopping: AtomicBool,
}

impl RoomClient {
    /// Build a client; the returned receiver is the host's event stream.
    pub fn new(
        config: Config,
        server_url: &str,
        identity: ClientIdentity,
        trust: Arc<TrustStore>,
    ) -> (Arc<Self>, mpsc::Receiver<Event>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = EventSink::new(256);

        let manager = ConnectionManager::new(
            config.webrtc.clone(),
            signal_tx.clone(),
            events.clone(),
        );
        let engine = TransferEngine::new(
            manager.clone(),
            signal_tx.clone(),
            events.clone(),
            trust,
            config.transfer.clone(),
        );

        let client = Arc::new(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            identity: StdMutex::new(identity),
            manager,
            engine,
            events,
            peers: StdMutex::new(PeerArena::new()),
            signal_tx,
            signal_rx: TokioMutex::new(Some(signal_rx)),
            local_peer_id: StdRwLock::new(None),
            room_code: StdRwLock::new(None),
            password: StdMutex::new(None),
            stopping: AtomicBool::new(false),
        });
        (client, events_rx)
    }

    /// Remember a room password for the next connect.
    pub fn use_password(&self, password: &str) {
        *self.password.lock().unwrap_or_else(|e| e.into_inner()) = Some(password.to_string());
    }

    fn clear_password(&self) {
        *self.password.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn local_peer_id(&self) -> Option<String> {
        self.local_peer_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn room_code(&self) -> Option<String> {
        self.room_code
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn ws_base(&self) -> String {
        if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            format!("ws://{}", self.server_url)
        }
    }

    fn ws_url(&self, room: Option<&str>) -> String {
        let mut url = format!("{}/ws", self.ws_base());
        let mut sep = '?';
        if let Some(room) = room {
            url.push(sep);
            url.push_str("room=");
            url.push_str(room);
            sep = '&';
        }
        let password = self
            .password
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let (Some(password), Some(room)) = (password, room) {
            let normalized = room.trim().to_ascii_uppercase();
            let hash = crypto::derive_password_hash(&password, &normalized);
            url.push(sep);
            url.push_str("passwordHash=");
            url.push_str(&hash);
        }
        url
    }

    /// Connect and stay in the room until stopped. Reconnects with backoff
    /// on transport loss; does not reconnect past a password refusal.
    pub async fn run(self: &Arc<Self>, room: Option<String>) {
        let mut signal_rx = match self.signal_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("Room client already running");
                return;
            }
        };

        let mut backoff = RECONNECT_INITIAL;
        while !self.stopping.load(Ordering::SeqCst) {
            let url = self.ws_url(room.as_deref());
            info!("Connecting to {}", url);

            match connect_async(url.as_str()).await {
                Ok((stream, _response)) => {
                    backoff = RECONNECT_INITIAL;
                    let end = self.drive_session(stream, &mut signal_rx).await;

                    self.engine.transport_closed();
                    self.manager.close_all();
                    self.peers.lock().unwrap_or_else(|e| e.into_inner()).clear();
                    *self.local_peer_id.write().unwrap_or_else(|e| e.into_inner()) = None;
                    self.events.emit(Event::Disconnected);

                    if end == SessionEnd::Stop {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Connection to room server failed: {}", e);
                }
            }

            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            debug!("Reconnecting in {:?}", backoff);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_CAP);
        }

        *self.signal_rx.lock().await = Some(signal_rx);
    }

    async fn drive_session(
        self: &Arc<Self>,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        signal_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        let join = {
            let identity = self.identity.lock().unwrap_or_else(|e| e.into_inner());
            Envelope::plain(SignalMessage::Join {
                data: JoinData {
                    name: identity.name.clone(),
                    device_type: identity.device_type,
                    browser_info: identity.browser_info.clone(),
                },
            })
        };
        let Ok(join_json) = join.to_json() else {
            return SessionEnd::Stop;
        };
        if write.send(WsMessage::Text(join_json)).await.is_err() {
            return SessionEnd::Reconnect;
        }

        loop {
            tokio::select! {
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            if self.dispatch(&text).await == Dispatch::Fatal {
                                return SessionEnd::Stop;
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let _ = write.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            if let Some(frame) = frame {
                                let code = u16::from(frame.code);
                                if code == close_codes::PASSWORD_REQUIRED
                                    || code == close_codes::PASSWORD_INCORRECT
                                {
                                    info!("Password refused (close {}), not reconnecting", code);
                                    self.clear_password();
                                    return SessionEnd::Stop;
                                }
                                if code == close_codes::ROOM_FULL {
                                    info!("Room full, not reconnecting");
                                    return SessionEnd::Stop;
                                }
                            }
                            return SessionEnd::Reconnect;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("Room socket error: {}", e);
                            return SessionEnd::Reconnect;
                        }
                        None => return SessionEnd::Reconnect,
                    }
                }
                outgoing = signal_rx.recv() => {
                    match outgoing {
                        Some(envelope) => {
                            let Ok(json) = envelope.to_json() else { continue };
                            if write.send(WsMessage::Text(json)).await.is_err() {
                                return SessionEnd::Reconnect;
                            }
                        }
                        None => return SessionEnd::Stop,
                    }
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, text: &str) -> Dispatch {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping unparseable frame: {}", e);
                return Dispatch::Continue;
            }
        };
        let from = envelope.from;

        match envelope.message {
            SignalMessage::Joined { peer_id, room_code, peers } => {
                info!("Joined room {} as {}", room_code, peer_id);
                self.manager.set_local_peer_id(&peer_id);
                *self.local_peer_id.write().unwrap_or_else(|e| e.into_inner()) =
                    Some(peer_id.clone());
                *self.room_code.write().unwrap_or_else(|e| e.into_inner()) =
                    Some(room_code.clone());

                {
                    let mut arena = self.peers.lock().unwrap_or_else(|e| e.into_inner());
                    arena.clear();
                    for info in &peers {
                        let trusted = self.is_trusted(info);
                        arena.insert(RemotePeer {
                            info: info.clone(),
                            trusted,
                            link_state: LinkState::Idle,
                        });
                    }
                }

                self.events.emit(Event::RoomJoined {
                    peer_id,
                    room_code,
                    peers: peers.clone(),
                });

                for info in peers {
                    let manager = self.manager.clone();
                    tokio::spawn(async move {
                        manager.prewarm(&info.id).await;
                    });
                }
            }

            SignalMessage::PeerJoined { data } => {
                info!("Peer {} ({}) joined", data.id, data.name);
                let trusted = self.is_trusted(&data);
                self.peers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(RemotePeer {
                        info: data.clone(),
                        trusted,
                        link_state: LinkState::Idle,
                    });
                let manager = self.manager.clone();
                let peer_id = data.id.clone();
                tokio::spawn(async move {
                    manager.prewarm(&peer_id).await;
                });
                self.events.emit(Event::PeerJoined(data));
            }

            SignalMessage::PeerLeft { data } => {
                info!("Peer {} left", data.id);
                self.peers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&data.id);
                self.engine.peer_left(&data.id);
                self.manager.close_link(&data.id).await;
                self.events.emit(Event::PeerLeft { peer_id: data.id });
            }

            SignalMessage::NameChanged { data } => {
                let Some(from) = from else {
                    debug!("name-changed without sender, dropping");
                    return Dispatch::Continue;
                };
                let name = data.name.clone();
                let trust = self.engine.trust_store();
                self.peers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .update(&from, |peer| {
                        peer.info.name = name.clone();
                        peer.trusted = trust.is_trusted(&crypto::device_fingerprint(
                            &peer.info.name,
                            peer.info.device_type.as_str(),
                            peer.info.browser_info.as_deref().unwrap_or(""),
                        ));
                    });
                self.events.emit(Event::PeerRenamed {
                    peer_id: from,
                    name: data.name,
                });
            }

            message @ (SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::IceCandidate { .. }
            | SignalMessage::RelayData { .. }
            | SignalMessage::KeyExchange { .. }) => {
                let Some(from) = from else {
                    debug!("Directed {} without sender, dropping", message.kind());
                    return Dispatch::Continue;
                };
                self.manager.handle_signal(&from, message).await;
            }

            message @ (SignalMessage::FileRequest { .. }
            | SignalMessage::FileResponse { .. }
            | SignalMessage::FileCancel { .. }
            | SignalMessage::Text { .. }) => {
                let Some(from) = from else {
                    debug!("Directed {} without sender, dropping", message.kind());
                    return Dispatch::Continue;
                };
                let sender_info = self
                    .peers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .peer(&from)
                    .map(|p| p.info);
                self.engine
                    .handle_signal(&from, message, sender_info.as_ref())
                    .await;
            }

            SignalMessage::Error { data } => {
                warn!("Server error: {}", data.error);
                let fatal = matches!(
                    data.error.as_str(),
                    "PASSWORD_REQUIRED" | "PASSWORD_INCORRECT" | "ROOM_FULL"
                );
                if data.error.starts_with("PASSWORD_") {
                    self.clear_password();
                }
                self.events.emit(Event::RoomError { error: data.error });
                if fatal {
                    return Dispatch::Fatal;
                }
            }

            SignalMessage::Join { .. } => {
                debug!("Unexpected join frame from server, dropping");
            }
        }

        Dispatch::Continue
    }

    fn is_trusted(&self, info: &PeerInfo) -> bool {
        self.engine.trust_store().is_trusted(&crypto::device_fingerprint(
            &info.name,
            info.device_type.as_str(),
            info.browser_info.as_deref().unwrap_or(""),
        ))
    }

    // ---- host surface -----------------------------------------------------

    /// Send a file, driving to completion.
    pub async fn send_file(
        &self,
        peer_id: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<Uuid, TransferError> {
        self.engine.send_file(peer_id, file_name, data).await
    }

    /// Spawn a send; the id comes back immediately for cancellation.
    pub fn start_send_file(&self, peer_id: &str, file_name: &str, data: Vec<u8>) -> Uuid {
        self.engine.start_send_file(peer_id, file_name, data)
    }

    pub async fn send_text(&self, peer_id: &str, text: &str) -> Result<(), TransferError> {
        self.engine.send_text(peer_id, text).await
    }

    /// Verdict on a pending file request.
    pub async fn respond_to_request(&self, file_id: Uuid, accepted: bool) -> Result<(), TransferError> {
        self.engine.respond(file_id, accepted).await
    }

    /// "Accept and trust": remember the sender, then accept.
    pub async fn accept_and_trust(&self, file_id: Uuid, peer_id: &str) -> Result<(), TransferError> {
        self.trust_peer(peer_id);
        self.engine.respond(file_id, true).await
    }

    pub async fn cancel_transfer(&self, file_id: Uuid) {
        self.engine.cancel_transfer(file_id, CancelReason::User).await;
    }

    /// Remember a peer's device in the trust store.
    pub fn trust_peer(&self, peer_id: &str) {
        let Some(peer) = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peer(peer_id)
        else {
            warn!("Cannot trust unknown peer {}", peer_id);
            return;
        };
        let info = &peer.info;
        let browser = info.browser_info.as_deref().unwrap_or("");
        let fingerprint =
            crypto::device_fingerprint(&info.name, info.device_type.as_str(), browser);
        self.engine
            .trust_store()
            .trust(&fingerprint, &info.name, info.device_type.as_str(), browser);
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(peer_id, |p| p.trusted = true);
    }

    pub fn untrust_peer(&self, peer_id: &str) {
        let Some(peer) = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peer(peer_id)
        else {
            return;
        };
        let info = &peer.info;
        let fingerprint = crypto::device_fingerprint(
            &info.name,
            info.device_type.as_str(),
            info.browser_info.as_deref().unwrap_or(""),
        );
        self.engine.trust_store().untrust(&fingerprint);
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(peer_id, |p| p.trusted = false);
    }

    /// Change the advertised display name, broadcast to the room.
    pub fn rename(&self, name: &str) {
        self.identity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .name = name.to_string();
        let _ = self.signal_tx.send(Envelope::plain(SignalMessage::NameChanged {
            data: NameChangedData { name: name.to_string() },
        }));
    }

    /// Snapshot of the room's peers with current link states.
    pub async fn peers(&self) -> Vec<RemotePeer> {
        let mut all = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .all();
        for peer in &mut all {
            peer.link_state = self.manager.link_state(&peer.info.id).await;
        }
        all
    }

    pub fn history(&self) -> Arc<crate::transfer::MessageHistory> {
        self.engine.history()
    }

    // ---- password REST ----------------------------------------------------

    /// Set the room password (first writer wins for the room's life).
    pub async fn set_room_password(&self, password: &str) -> Result<(), Box<dyn std::error::Error>> {
        let Some(room) = self.room_code() else {
            return Err("Not in a room yet".into());
        };
        let hash = crypto::derive_password_hash(password, &room);
        let url = format!("{}/api/room/set-password?room={}", self.server_url, room);
        let response: serde_json::Value = reqwest::Client::new()
            .post(url)
            .json(&json!({ "passwordHash": hash }))
            .send()
            .await?
            .json()
            .await?;
        if response["success"].as_bool() == Some(true) {
            self.use_password(password);
            Ok(())
        } else {
            Err(format!(
                "Password not set: {}",
                response["error"].as_str().unwrap_or("unknown")
            )
            .into())
        }
    }

    /// Whether a room requires a password.
    pub async fn check_room_password(&self, room: &str) -> Result<bool, Box<dyn std::error::Error>> {
        let url = format!(
            "{}/api/room/check-password?room={}",
            self.server_url,
            room.trim().to_ascii_uppercase()
        );
        let response: serde_json::Value = reqwest::get(url).await?.json().await?;
        Ok(response["hasPassword"].as_bool().unwrap_or(false))
    }
}
