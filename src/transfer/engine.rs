//! Transfer state machines
//!
//! Sender: init -> requested -> accepted -> streaming -> done/cancelled/failed.
//! Receiver: requested -> accepted -> receiving -> done/cancelled/failed.
//! The accept/decline handshake rides the room socket; frames ride the peer
//! link. Chunk payloads are AEAD-sealed when the link is relayed. Either
//! side can cancel on both planes; the first cancel to land wins and the
//! rest are ignored.

use crate::config::TransferConfig;
use crate::crypto;
use crate::events::{Event, EventSink};
use crate::protocol::{
    Envelope, FileCancelData, FileRequestData, FileResponseData, PeerInfo, SignalMessage, TextData,
};
use crate::transfer::frame::{DataFrame, FileStartPayload, FrameKind};
use crate::transfer::history::MessageHistory;
use crate::transfer::trust::TrustStore;
use crate::transfer::{CancelReason, Direction, FailureKind, TransferError, TransferMode};
use crate::webrtc::{ConnectionError, ConnectionManager, LinkState};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Chunks needed for a payload of `size` bytes.
pub fn total_chunks_for(size: u64, chunk_size: usize) -> u32 {
    ((size + chunk_size as u64 - 1) / chunk_size as u64) as u32
}

fn mode_of(state: LinkState) -> TransferMode {
    match state {
        LinkState::Relay => TransferMode::Relay,
        _ => TransferMode::P2p,
    }
}

struct OutgoingTransfer {
    peer_id: String,
    aborted: Mutex<Option<FailureKind>>,
    response_tx: Mutex<Option<oneshot::Sender<bool>>>,
}

impl OutgoingTransfer {
    /// Mark the transfer dead. The first caller wins; it also unblocks a
    /// pending accept wait by dropping the response channel.
    fn abort(&self, kind: FailureKind) -> bool {
        let mut aborted = self.aborted.lock().unwrap_or_else(|e| e.into_inner());
        if aborted.is_some() {
            return false;
        }
        *aborted = Some(kind);
        drop(aborted);
        self.response_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        true
    }

    fn abort_kind(&self) -> Option<FailureKind> {
        *self.aborted.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(&self, accepted: bool) {
        if let Some(tx) = self
            .response_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = tx.send(accepted);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    Requested,
    Accepted,
    Receiving,
}

struct IncomingTransfer {
    peer_id: String,
    file_name: String,
    size: u64,
    total_chunks: u32,
    state: RecvState,
    buffer: Vec<u8>,
    hasher: Sha256,
    next_seq: u32,
    last_progress: Instant,
    started_at: Instant,
}

/// File/text semantics over the connection manager.
pub struct TransferEngine {
    manager: Arc<ConnectionManager>,
    signal_tx: mpsc::UnboundedSender<Envelope>,
    events: EventSink,
    trust: Arc<TrustStore>,
    history: Arc<MessageHistory>,
    config: TransferConfig,
    outgoing: Mutex<HashMap<Uuid, Arc<OutgoingTransfer>>>,
    incoming: Mutex<HashMap<Uuid, IncomingTransfer>>,
}

impl TransferEngine {
    pub fn new(
        manager: Arc<ConnectionManager>,
        signal_tx: mpsc::UnboundedSender<Envelope>,
        events: EventSink,
        trust: Arc<TrustStore>,
        config: TransferConfig,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            manager: manager.clone(),
            signal_tx,
            events,
            trust,
            history: Arc::new(MessageHistory::new()),
            config,
            outgoing: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
        });

        // Frames from any path land here.
        let weak = Arc::downgrade(&engine);
        manager.set_receive_handler(Arc::new(move |peer, bytes, sealed| {
            if let Some(engine) = weak.upgrade() {
                engine.handle_frame(peer, bytes, sealed);
            }
        }));

        engine
    }

    pub fn history(&self) -> Arc<MessageHistory> {
        self.history.clone()
    }

    pub fn trust_store(&self) -> Arc<TrustStore> {
        self.trust.clone()
    }

    // ---- sending ----------------------------------------------------------

    /// Send a file, driving the transfer to completion. Returns the
    /// transfer id once the receiver holds the full file.
    pub async fn send_file(
        self: &Arc<Self>,
        peer_id: &str,
        file_name: &str,
        data: Vec<u8>,
    ) -> Result<Uuid, TransferError> {
        let transfer_id = Uuid::new_v4();
        match self
            .run_send(peer_id.to_string(), file_name.to_string(), data, transfer_id)
            .await
        {
            Ok(()) => Ok(transfer_id),
            Err(e) => {
                self.finish_outgoing_failure(peer_id, transfer_id, &e);
                Err(e)
            }
        }
    }

    /// Fire-and-forget variant: spawns the send and hands back the id so
    /// the host can cancel it.
    pub fn start_send_file(self: &Arc<Self>, peer_id: &str, file_name: &str, data: Vec<u8>) -> Uuid {
        let transfer_id = Uuid::new_v4();
        let engine = self.clone();
        let peer = peer_id.to_string();
        let name = file_name.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine
                .run_send(peer.clone(), name, data, transfer_id)
                .await
            {
                engine.finish_outgoing_failure(&peer, transfer_id, &e);
            }
        });
        transfer_id
    }

    async fn run_send(
        self: &Arc<Self>,
        peer_id: String,
        file_name: String,
        data: Vec<u8>,
        transfer_id: Uuid,
    ) -> Result<(), TransferError> {
        let size = data.len() as u64;
        let total_chunks = total_chunks_for(size, self.config.chunk_size);

        // Bring the link up first so the advertised mode is honest.
        let link_state = self
            .manager
            .wait_until_transferable(&peer_id, self.negotiation_deadline())
            .await?;

        let record = Arc::new(OutgoingTransfer {
            peer_id: peer_id.clone(),
            aborted: Mutex::new(None),
            response_tx: Mutex::new(None),
        });
        let (response_tx, response_rx) = oneshot::channel();
        *record.response_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(response_tx);
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(transfer_id, record.clone());

        let request = Envelope::directed(
            &peer_id,
            SignalMessage::FileRequest {
                data: FileRequestData {
                    file_id: transfer_id.to_string(),
                    name: file_name.clone(),
                    size,
                    total_chunks,
                    transfer_mode: mode_of(link_state).as_str().to_string(),
                },
            },
        );
        self.signal_tx
            .send(request)
            .map_err(|_| TransferError::Connection(ConnectionError::Closed(peer_id.clone())))?;
        info!(
            "Requested transfer {} ({}, {} bytes) to {}",
            transfer_id, file_name, size, peer_id
        );

        let accept_timeout = Duration::from_secs(self.config.accept_timeout_secs);
        let accepted = match tokio::time::timeout(accept_timeout, response_rx).await {
            Err(_) => return Err(TransferError::Timeout),
            // channel dropped: the transfer was aborted from elsewhere
            Ok(Err(_)) => {
                return Err(match record.abort_kind() {
                    Some(FailureKind::Cancelled(reason)) => TransferError::Cancelled(reason),
                    _ => TransferError::Connection(ConnectionError::Closed(peer_id.clone())),
                });
            }
            Ok(Ok(accepted)) => accepted,
        };
        if !accepted {
            return Err(TransferError::Declined);
        }

        self.events.emit(Event::TransferStart {
            peer_id: peer_id.clone(),
            file_id: transfer_id,
            file_name: file_name.clone(),
            file_size: size,
            direction: Direction::Send,
        });

        let start_payload = serde_json::to_vec(&FileStartPayload {
            name: file_name.clone(),
            size,
            total_chunks,
        })
        .map_err(|e| TransferError::InvalidFrame(e.to_string()))?;
        self.send_frame(
            &peer_id,
            DataFrame::new(FrameKind::FileStart, transfer_id, 0, start_payload),
            false,
        )
        .await?;

        let file_hash = crypto::sha256(&data);
        let started_at = Instant::now();
        let mut bytes_done: u64 = 0;

        for (seq, chunk) in data.chunks(self.config.chunk_size).enumerate() {
            if let Some(kind) = record.abort_kind() {
                return Err(Self::error_for_abort(kind, &peer_id));
            }

            self.wait_for_buffer_drain(&peer_id, &record).await?;

            let state = self.manager.link_state(&peer_id).await;
            let (payload, sealed) = if state == LinkState::Relay {
                let key = self
                    .manager
                    .keys()
                    .wait_for_key(&peer_id, Duration::from_secs(10))
                    .await?;
                let nonce = crypto::transfer_nonce(&transfer_id, seq as u32);
                let sealed_payload = crypto::seal(&key, &nonce, chunk)
                    .map_err(|_| TransferError::Connection(ConnectionError::KeyExchange("Seal failed".into())))?;
                (sealed_payload, true)
            } else {
                (chunk.to_vec(), false)
            };

            self.send_frame(
                &peer_id,
                DataFrame::new(FrameKind::Chunk, transfer_id, seq as u32, payload),
                sealed,
            )
            .await?;

            bytes_done += chunk.len() as u64;
            self.emit_progress(
                &peer_id,
                transfer_id,
                &file_name,
                size,
                bytes_done,
                started_at,
                mode_of(state),
            );
        }

        if let Some(kind) = record.abort_kind() {
            return Err(Self::error_for_abort(kind, &peer_id));
        }

        self.send_frame(
            &peer_id,
            DataFrame::new(FrameKind::FileEnd, transfer_id, 0, file_hash.to_vec()),
            false,
        )
        .await?;

        let final_mode = mode_of(self.manager.link_state(&peer_id).await);
        self.emit_progress(
            &peer_id,
            transfer_id,
            &file_name,
            size,
            size,
            started_at,
            final_mode,
        );
        self.events.emit(Event::TransferComplete {
            peer_id: peer_id.clone(),
            file_id: transfer_id,
        });

        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&transfer_id);
        info!("Transfer {} to {} complete", transfer_id, peer_id);
        Ok(())
    }

    fn error_for_abort(kind: FailureKind, peer_id: &str) -> TransferError {
        match kind {
            FailureKind::Cancelled(reason) => TransferError::Cancelled(reason),
            _ => TransferError::Connection(ConnectionError::Closed(peer_id.to_string())),
        }
    }

    fn negotiation_deadline(&self) -> Duration {
        // Bounded by the relay watchdog plus margin; the link is either
        // direct or relayed well inside this.
        Duration::from_secs(self.config.accept_timeout_secs.min(30))
    }

    /// Backpressure: past the high-water mark, hold until the channel
    /// drains under the low-water mark. A buffer that stops draining for
    /// the stall window fails the transfer.
    async fn wait_for_buffer_drain(
        &self,
        peer_id: &str,
        record: &Arc<OutgoingTransfer>,
    ) -> Result<(), TransferError> {
        if self.manager.outbound_buffered(peer_id).await <= self.config.buffer_high_water {
            return Ok(());
        }

        let stall_deadline = Instant::now() + Duration::from_secs(self.config.stall_timeout_secs);
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Some(kind) = record.abort_kind() {
                return Err(Self::error_for_abort(kind, peer_id));
            }
            if self.manager.outbound_buffered(peer_id).await <= self.config.buffer_low_water {
                return Ok(());
            }
            if Instant::now() >= stall_deadline {
                return Err(TransferError::Connection(ConnectionError::DataChannelError(
                    "Outbound buffer stalled".into(),
                )));
            }
        }
    }

    async fn send_frame(
        &self,
        peer_id: &str,
        frame: DataFrame,
        sealed: bool,
    ) -> Result<(), TransferError> {
        self.manager
            .send(peer_id, &frame.encode(), sealed)
            .await
            .map_err(TransferError::Connection)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_progress(
        &self,
        peer_id: &str,
        file_id: Uuid,
        file_name: &str,
        size: u64,
        bytes_done: u64,
        started_at: Instant,
        mode: TransferMode,
    ) {
        let percent = if size == 0 {
            100.0
        } else {
            bytes_done as f64 / size as f64 * 100.0
        };
        let elapsed = started_at.elapsed().as_secs_f64().max(1e-3);
        self.events.emit(Event::Progress {
            peer_id: peer_id.to_string(),
            file_id,
            file_name: file_name.to_string(),
            file_size: size,
            percent,
            speed_bps: bytes_done as f64 / elapsed,
            mode,
        });
    }

    fn finish_outgoing_failure(&self, peer_id: &str, transfer_id: Uuid, error: &TransferError) {
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&transfer_id);

        // Cancellations already emitted their event at the abort site.
        let kind = match error {
            TransferError::Cancelled(_) => return,
            TransferError::Declined => FailureKind::Declined,
            TransferError::Timeout => FailureKind::Timeout,
            TransferError::Corrupt => FailureKind::Corrupt,
            TransferError::InvalidFrame(_) => FailureKind::InvalidFrame,
            TransferError::Connection(ConnectionError::ConnectionFailed(_)) => {
                FailureKind::NegotiationFailed
            }
            TransferError::Connection(_) => FailureKind::TransportClosed,
            TransferError::UnknownTransfer(_) => FailureKind::InvalidFrame,
        };
        warn!("Transfer {} to {} failed: {}", transfer_id, peer_id, error);
        self.events.emit(Event::TransferFailed {
            peer_id: peer_id.to_string(),
            file_id: Some(transfer_id),
            kind,
        });
    }

    // ---- text -------------------------------------------------------------

    /// Best-effort text: over the data channel when the link is direct,
    /// through the room socket otherwise. Failure raises a local error only.
    pub async fn send_text(self: &Arc<Self>, peer_id: &str, text: &str) -> Result<(), TransferError> {
        let index = self.history.push_outgoing(peer_id, text);

        let over_channel = self.manager.link_state(peer_id).await == LinkState::P2p;
        let result = if over_channel {
            let frame = DataFrame::new(
                FrameKind::Text,
                Uuid::new_v4(),
                0,
                text.as_bytes().to_vec(),
            );
            self.send_frame(peer_id, frame, false).await
        } else {
            self.signal_tx
                .send(Envelope::directed(
                    peer_id,
                    SignalMessage::Text {
                        data: TextData { text: text.to_string() },
                    },
                ))
                .map_err(|_| TransferError::Connection(ConnectionError::Closed(peer_id.to_string())))
        };

        match result {
            Ok(()) => {
                self.history.mark_sent(peer_id, index);
                Ok(())
            }
            Err(e) => {
                self.history.mark_failed(peer_id, index);
                Err(e)
            }
        }
    }

    // ---- receiving --------------------------------------------------------

    /// Control-plane messages routed from the room socket.
    pub async fn handle_signal(
        self: &Arc<Self>,
        from: &str,
        message: SignalMessage,
        sender_info: Option<&PeerInfo>,
    ) {
        match message {
            SignalMessage::FileRequest { data } => self.on_file_request(from, data, sender_info).await,
            SignalMessage::FileResponse { data } => self.on_file_response(from, data),
            SignalMessage::FileCancel { data } => {
                let Ok(id) = Uuid::parse_str(&data.file_id) else {
                    warn!("file-cancel with bad id {:?}", data.file_id);
                    return;
                };
                let reason = CancelReason::from_str(&data.reason).unwrap_or(CancelReason::Error);
                self.on_remote_cancel(id, reason);
            }
            SignalMessage::Text { data } => {
                self.history.push_incoming(from, &data.text);
                self.events.emit(Event::TextReceived {
                    peer_id: from.to_string(),
                    text: data.text,
                });
            }
            other => debug!("Transfer engine ignoring {} from {}", other.kind(), from),
        }
    }

    async fn on_file_request(
        self: &Arc<Self>,
        from: &str,
        data: FileRequestData,
        sender_info: Option<&PeerInfo>,
    ) {
        let Ok(transfer_id) = Uuid::parse_str(&data.file_id) else {
            warn!("file-request with bad id {:?}", data.file_id);
            return;
        };

        {
            let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            if incoming.contains_key(&transfer_id) {
                debug!("Duplicate file-request {}", transfer_id);
                return;
            }
            incoming.insert(
                transfer_id,
                IncomingTransfer {
                    peer_id: from.to_string(),
                    file_name: data.name.clone(),
                    size: data.size,
                    total_chunks: data.total_chunks,
                    state: RecvState::Requested,
                    buffer: Vec::new(),
                    hasher: Sha256::new(),
                    next_seq: 0,
                    last_progress: Instant::now(),
                    started_at: Instant::now(),
                },
            );
        }

        let trusted = sender_info
            .map(|info| {
                let fingerprint = crypto::device_fingerprint(
                    &info.name,
                    info.device_type.as_str(),
                    info.browser_info.as_deref().unwrap_or(""),
                );
                self.trust.is_trusted(&fingerprint)
            })
            .unwrap_or(false);

        if trusted {
            info!("Auto-accepting {} from trusted sender {}", transfer_id, from);
            let _ = self.respond(transfer_id, true).await;
        } else {
            self.events.emit(Event::FileRequest {
                peer_id: from.to_string(),
                file_id: transfer_id,
                file_name: data.name,
                file_size: data.size,
            });
        }
    }

    /// Host verdict on a pending file request.
    pub async fn respond(self: &Arc<Self>, file_id: Uuid, accepted: bool) -> Result<(), TransferError> {
        let (peer_id, file_name, size) = {
            let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            let Some(record) = incoming.get_mut(&file_id) else {
                return Err(TransferError::UnknownTransfer(file_id.to_string()));
            };
            if record.state != RecvState::Requested {
                return Err(TransferError::InvalidFrame("Already responded".into()));
            }
            let meta = (record.peer_id.clone(), record.file_name.clone(), record.size);
            if accepted {
                record.state = RecvState::Accepted;
                record.last_progress = Instant::now();
            } else {
                incoming.remove(&file_id);
            }
            meta
        };

        self.signal_tx
            .send(Envelope::directed(
                &peer_id,
                SignalMessage::FileResponse {
                    data: FileResponseData {
                        file_id: file_id.to_string(),
                        accepted,
                    },
                },
            ))
            .map_err(|_| TransferError::Connection(ConnectionError::Closed(peer_id.clone())))?;

        if accepted {
            self.events.emit(Event::TransferStart {
                peer_id,
                file_id,
                file_name,
                file_size: size,
                direction: Direction::Recv,
            });
            self.spawn_recv_watchdog(file_id);
        }
        Ok(())
    }

    fn on_file_response(self: &Arc<Self>, from: &str, data: FileResponseData) {
        let Ok(transfer_id) = Uuid::parse_str(&data.file_id) else {
            warn!("file-response with bad id {:?}", data.file_id);
            return;
        };
        let record = self
            .outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&transfer_id)
            .cloned();
        match record {
            Some(record) if record.peer_id == from => record.resolve(data.accepted),
            Some(_) => warn!("file-response for {} from wrong peer {}", transfer_id, from),
            None => debug!("file-response for unknown transfer {}", transfer_id),
        }
    }

    /// Frames delivered by the connection manager, either path.
    pub fn handle_frame(self: &Arc<Self>, peer_id: &str, bytes: &[u8], sealed: bool) {
        let frame = match DataFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Undecodable frame from {}: {}", peer_id, e);
                return;
            }
        };

        let payload = if sealed {
            let Some(key) = self.manager.keys().key_for(peer_id) else {
                warn!("Sealed frame from {} but no key, dropping", peer_id);
                return;
            };
            let nonce = crypto::transfer_nonce(&frame.transfer_id, frame.seq);
            match crypto::open(&key, &nonce, &frame.payload) {
                Ok(payload) => payload,
                Err(_) => {
                    warn!("Failed to open sealed frame from {}, dropping", peer_id);
                    return;
                }
            }
        } else {
            frame.payload
        };

        match frame.kind {
            FrameKind::Text => match String::from_utf8(payload) {
                Ok(text) => {
                    self.history.push_incoming(peer_id, &text);
                    self.events.emit(Event::TextReceived {
                        peer_id: peer_id.to_string(),
                        text,
                    });
                }
                Err(_) => warn!("Non-UTF-8 text frame from {}", peer_id),
            },
            FrameKind::FileStart => self.on_file_start(peer_id, frame.transfer_id, &payload),
            FrameKind::Chunk => {
                self.on_chunk(peer_id, frame.transfer_id, frame.seq, payload, sealed)
            }
            FrameKind::FileEnd => self.on_file_end(peer_id, frame.transfer_id, &payload),
            FrameKind::Cancel => {
                let reason = payload
                    .first()
                    .and_then(|b| CancelReason::from_byte(*b))
                    .unwrap_or(CancelReason::Error);
                self.on_remote_cancel(frame.transfer_id, reason);
            }
        }
    }

    fn on_file_start(self: &Arc<Self>, peer_id: &str, transfer_id: Uuid, payload: &[u8]) {
        let meta: FileStartPayload = match serde_json::from_slice(payload) {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Bad file-start payload from {}: {}", peer_id, e);
                return;
            }
        };

        let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
        let Some(record) = incoming.get_mut(&transfer_id) else {
            // only-after-accept: anything unsolicited is dropped
            debug!("Stray file-start {} from {}", transfer_id, peer_id);
            return;
        };
        if record.state != RecvState::Accepted || record.peer_id != peer_id {
            debug!("file-start {} in state {:?}, dropping", transfer_id, record.state);
            return;
        }
        if meta.size != record.size || meta.total_chunks != record.total_chunks {
            warn!(
                "file-start {} metadata mismatch (size {} vs {})",
                transfer_id, meta.size, record.size
            );
            incoming.remove(&transfer_id);
            drop(incoming);
            self.fail_incoming_removed(peer_id, transfer_id, FailureKind::InvalidFrame);
            return;
        }
        record.state = RecvState::Receiving;
        record.buffer.reserve(record.size.min(8 * 1024 * 1024) as usize);
        record.last_progress = Instant::now();
    }

    fn on_chunk(
        self: &Arc<Self>,
        peer_id: &str,
        transfer_id: Uuid,
        seq: u32,
        payload: Vec<u8>,
        sealed: bool,
    ) {
        enum Outcome {
            Progress { file_name: String, size: u64, bytes_done: u64, started_at: Instant },
            Fail(FailureKind),
            Drop,
        }

        let outcome = {
            let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            let Some(record) = incoming.get_mut(&transfer_id) else {
                // tolerated: cancel (or nothing) beat the chunk here
                return;
            };
            if record.state != RecvState::Receiving || record.peer_id != peer_id {
                debug!("Chunk for {} in state {:?}, dropping", transfer_id, record.state);
                return;
            }

            let outcome = if seq < record.next_seq {
                Outcome::Drop
            } else if seq != record.next_seq {
                warn!(
                    "Chunk gap on {}: got {}, expected {}",
                    transfer_id, seq, record.next_seq
                );
                Outcome::Fail(FailureKind::InvalidFrame)
            } else if seq >= record.total_chunks {
                warn!("Chunk {} past totalChunks on {}", seq, transfer_id);
                Outcome::Fail(FailureKind::InvalidFrame)
            } else if record.buffer.len() as u64 + payload.len() as u64 > record.size {
                warn!("Transfer {} overran its declared size", transfer_id);
                Outcome::Fail(FailureKind::InvalidFrame)
            } else {
                record.hasher.update(&payload);
                record.buffer.extend_from_slice(&payload);
                record.next_seq += 1;
                record.last_progress = Instant::now();
                Outcome::Progress {
                    file_name: record.file_name.clone(),
                    size: record.size,
                    bytes_done: record.buffer.len() as u64,
                    started_at: record.started_at,
                }
            };

            if matches!(outcome, Outcome::Fail(_)) {
                incoming.remove(&transfer_id);
            }
            outcome
        };

        match outcome {
            Outcome::Progress { file_name, size, bytes_done, started_at } => {
                let mode = if sealed { TransferMode::Relay } else { TransferMode::P2p };
                self.emit_progress(
                    peer_id,
                    transfer_id,
                    &file_name,
                    size,
                    bytes_done,
                    started_at,
                    mode,
                );
            }
            Outcome::Fail(kind) => self.fail_incoming_removed(peer_id, transfer_id, kind),
            Outcome::Drop => {}
        }
    }

    fn on_file_end(self: &Arc<Self>, peer_id: &str, transfer_id: Uuid, payload: &[u8]) {
        let finished = {
            let mut incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            let Some(record) = incoming.get(&transfer_id) else {
                debug!("Stray file-end {} from {}", transfer_id, peer_id);
                return;
            };
            if record.state != RecvState::Receiving || record.peer_id != peer_id {
                debug!("file-end {} in state {:?}, dropping", transfer_id, record.state);
                return;
            }
            incoming.remove(&transfer_id)
        };
        let Some(record) = finished else { return };

        let complete = record.buffer.len() as u64 == record.size;
        let digest: [u8; 32] = record.hasher.finalize().into();
        if !complete || payload != digest.as_slice() {
            warn!("Integrity failure on {} from {}", transfer_id, peer_id);
            self.fail_incoming_removed(peer_id, transfer_id, FailureKind::Corrupt);
            return;
        }

        self.emit_progress(
            peer_id,
            transfer_id,
            &record.file_name,
            record.size,
            record.size,
            record.started_at,
            TransferMode::P2p,
        );
        info!(
            "Received {} ({} bytes) from {}",
            record.file_name,
            record.size,
            peer_id
        );
        self.events.emit(Event::FileReceived {
            peer_id: peer_id.to_string(),
            file_name: record.file_name,
            bytes: record.buffer,
        });
    }

    fn fail_incoming_removed(&self, peer_id: &str, transfer_id: Uuid, kind: FailureKind) {
        // tell the sender to stop streaming
        let _ = self.signal_tx.send(Envelope::directed(
            peer_id,
            SignalMessage::FileCancel {
                data: FileCancelData {
                    file_id: transfer_id.to_string(),
                    reason: CancelReason::Error.as_str().to_string(),
                },
            },
        ));
        self.events.emit(Event::TransferFailed {
            peer_id: peer_id.to_string(),
            file_id: Some(transfer_id),
            kind,
        });
    }

    // ---- cancellation -----------------------------------------------------

    /// Cancel a transfer in either direction. Sends the cancel on both
    /// planes; duplicate cancels are no-ops.
    pub async fn cancel_transfer(self: &Arc<Self>, file_id: Uuid, reason: CancelReason) {
        if let Some(peer_id) = self.abort_by_id(file_id, reason) {
            let _ = self.signal_tx.send(Envelope::directed(
                &peer_id,
                SignalMessage::FileCancel {
                    data: FileCancelData {
                        file_id: file_id.to_string(),
                        reason: reason.as_str().to_string(),
                    },
                },
            ));
            let cancel_frame =
                DataFrame::new(FrameKind::Cancel, file_id, 0, vec![reason.to_byte()]);
            let _ = self.send_frame(&peer_id, cancel_frame, false).await;
        }
    }

    /// A cancel arrived from the remote side (either plane).
    fn on_remote_cancel(self: &Arc<Self>, file_id: Uuid, reason: CancelReason) {
        self.abort_by_id(file_id, reason);
    }

    /// Common teardown: remove the record, emit exactly one cancelled
    /// event, release buffers. Returns the peer for wire notification.
    fn abort_by_id(&self, file_id: Uuid, reason: CancelReason) -> Option<String> {
        if let Some(record) = self
            .outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&file_id)
        {
            if record.abort(FailureKind::Cancelled(reason)) {
                self.events.emit(Event::TransferCancelled {
                    peer_id: record.peer_id.clone(),
                    file_id,
                    reason,
                });
            }
            return Some(record.peer_id.clone());
        }

        if let Some(record) = self
            .incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&file_id)
        {
            self.events.emit(Event::TransferCancelled {
                peer_id: record.peer_id.clone(),
                file_id,
                reason,
            });
            return Some(record.peer_id);
        }

        debug!("Cancel for unknown transfer {}, ignoring", file_id);
        None
    }

    /// A peer dropped out of the room: its transfers die as peer-left.
    pub fn peer_left(self: &Arc<Self>, peer_id: &str) {
        let ids: Vec<Uuid> = {
            let outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
            let incoming = self.incoming.lock().unwrap_or_else(|e| e.into_inner());
            outgoing
                .iter()
                .filter(|(_, r)| r.peer_id == peer_id)
                .map(|(id, _)| *id)
                .chain(
                    incoming
                        .iter()
                        .filter(|(_, r)| r.peer_id == peer_id)
                        .map(|(id, _)| *id),
                )
                .collect()
        };
        for id in ids {
            self.abort_by_id(id, CancelReason::PeerLeft);
        }
    }

    /// The room socket is gone: everything in flight fails.
    pub fn transport_closed(self: &Arc<Self>) {
        let outgoing: Vec<_> = self
            .outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (id, record) in outgoing {
            if record.abort(FailureKind::TransportClosed) {
                self.events.emit(Event::TransferFailed {
                    peer_id: record.peer_id.clone(),
                    file_id: Some(id),
                    kind: FailureKind::TransportClosed,
                });
            }
        }

        let incoming: Vec<_> = self
            .incoming
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (id, record) in incoming {
            self.events.emit(Event::TransferFailed {
                peer_id: record.peer_id,
                file_id: Some(id),
                kind: FailureKind::TransportClosed,
            });
        }
    }

    /// No streaming progress inside the stall window fails the transfer.
    fn spawn_recv_watchdog(self: &Arc<Self>, file_id: Uuid) {
        let weak = Arc::downgrade(self);
        let stall = Duration::from_secs(self.config.stall_timeout_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let Some(engine) = weak.upgrade() else { return };
                let stalled_peer = {
                    let incoming = engine.incoming.lock().unwrap_or_else(|e| e.into_inner());
                    match incoming.get(&file_id) {
                        None => return,
                        Some(record) if record.last_progress.elapsed() > stall => {
                            Some(record.peer_id.clone())
                        }
                        Some(_) => None,
                    }
                };
                if let Some(peer_id) = stalled_peer {
                    warn!("Transfer {} stalled, failing", file_id);
                    engine
                        .incoming
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&file_id);
                    engine.fail_incoming_removed(&peer_id, file_id, FailureKind::Timeout);
                    return;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebRtcConfig;
    use crate::protocol::DeviceType;

    struct Harness {
        engine: Arc<TransferEngine>,
        manager: Arc<ConnectionManager>,
        signal_rx: mpsc::UnboundedReceiver<Envelope>,
        events_rx: mpsc::Receiver<Event>,
    }

    fn harness() -> Harness {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = EventSink::new(256);
        let manager = ConnectionManager::new(WebRtcConfig::default(), signal_tx.clone(), events.clone());
        manager.set_local_peer_id("self");
        let engine = TransferEngine::new(
            manager.clone(),
            signal_tx,
            events,
            Arc::new(TrustStore::in_memory()),
            TransferConfig::default(),
        );
        Harness { engine, manager, signal_rx, events_rx }
    }

    fn sender_info(name: &str) -> PeerInfo {
        PeerInfo {
            id: "sender".into(),
            name: name.into(),
            device_type: DeviceType::Mobile,
            browser_info: Some("firefox".into()),
        }
    }

    fn request(id: Uuid, size: u64, total_chunks: u32) -> FileRequestData {
        FileRequestData {
            file_id: id.to_string(),
            name: "hello.txt".into(),
            size,
            total_chunks,
            transfer_mode: "p2p".into(),
        }
    }

    async fn accept(h: &mut Harness, id: Uuid) {
        h.engine
            .handle_signal("sender", SignalMessage::FileRequest { data: request(id, 11, 1) }, None)
            .await;
        // FileRequest event surfaced, host accepts
        h.engine.respond(id, true).await.unwrap();
    }

    fn frame_bytes(kind: FrameKind, id: Uuid, seq: u32, payload: &[u8]) -> Vec<u8> {
        DataFrame::new(kind, id, seq, payload.to_vec()).encode()
    }

    fn drain_events(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn chunk_math_boundaries() {
        let cs = 64 * 1024;
        assert_eq!(total_chunks_for(0, cs), 0);
        assert_eq!(total_chunks_for(1, cs), 1);
        assert_eq!(total_chunks_for(cs as u64, cs), 1);
        assert_eq!(total_chunks_for(cs as u64 + 1, cs), 2);
    }

    #[tokio::test]
    async fn happy_path_receive_checks_hash() {
        let mut h = harness();
        let id = Uuid::new_v4();
        accept(&mut h, id).await;

        let start = serde_json::to_vec(&FileStartPayload {
            name: "hello.txt".into(),
            size: 11,
            total_chunks: 1,
        })
        .unwrap();
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileStart, id, 0, &start), false);
        h.engine
            .handle_frame("sender", &frame_bytes(FrameKind::Chunk, id, 0, b"hello world"), false);
        let hash = crypto::sha256(b"hello world");
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileEnd, id, 0, &hash), false);

        let events = drain_events(&mut h.events_rx);
        let received = events.iter().find_map(|e| match e {
            Event::FileReceived { bytes, file_name, .. } => Some((bytes.clone(), file_name.clone())),
            _ => None,
        });
        let (bytes, name) = received.expect("file should arrive");
        assert_eq!(bytes, b"hello world");
        assert_eq!(name, "hello.txt");
        assert!(events.iter().any(|e| matches!(e, Event::Progress { percent, .. } if *percent == 100.0)));
    }

    #[tokio::test]
    async fn corrupt_hash_discards_file() {
        let mut h = harness();
        let id = Uuid::new_v4();
        accept(&mut h, id).await;

        let start = serde_json::to_vec(&FileStartPayload {
            name: "hello.txt".into(),
            size: 11,
            total_chunks: 1,
        })
        .unwrap();
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileStart, id, 0, &start), false);
        h.engine
            .handle_frame("sender", &frame_bytes(FrameKind::Chunk, id, 0, b"hello world"), false);
        h.engine
            .handle_frame("sender", &frame_bytes(FrameKind::FileEnd, id, 0, &[0u8; 32]), false);

        let events = drain_events(&mut h.events_rx);
        assert!(!events.iter().any(|e| matches!(e, Event::FileReceived { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::TransferFailed { kind: FailureKind::Corrupt, .. })));
    }

    #[tokio::test]
    async fn zero_byte_file_completes_without_chunks() {
        let mut h = harness();
        let id = Uuid::new_v4();
        h.engine
            .handle_signal("sender", SignalMessage::FileRequest { data: request(id, 0, 0) }, None)
            .await;
        h.engine.respond(id, true).await.unwrap();

        let start = serde_json::to_vec(&FileStartPayload {
            name: "hello.txt".into(),
            size: 0,
            total_chunks: 0,
        })
        .unwrap();
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileStart, id, 0, &start), false);
        let hash = crypto::sha256(b"");
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileEnd, id, 0, &hash), false);

        let events = drain_events(&mut h.events_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::FileReceived { bytes, .. } if bytes.is_empty())));
    }

    #[tokio::test]
    async fn file_start_before_accept_is_dropped() {
        let mut h = harness();
        let id = Uuid::new_v4();
        h.engine
            .handle_signal("sender", SignalMessage::FileRequest { data: request(id, 11, 1) }, None)
            .await;
        // no respond() yet

        let start = serde_json::to_vec(&FileStartPayload {
            name: "hello.txt".into(),
            size: 11,
            total_chunks: 1,
        })
        .unwrap();
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileStart, id, 0, &start), false);
        h.engine
            .handle_frame("sender", &frame_bytes(FrameKind::Chunk, id, 0, b"hello world"), false);

        let events = drain_events(&mut h.events_rx);
        assert!(!events.iter().any(|e| matches!(e, Event::Progress { .. })));
        assert!(!events.iter().any(|e| matches!(e, Event::FileReceived { .. })));
    }

    #[tokio::test]
    async fn chunk_gap_fails_with_invalid_frame() {
        let mut h = harness();
        let id = Uuid::new_v4();
        h.engine
            .handle_signal("sender", SignalMessage::FileRequest { data: request(id, 200_000, 3) }, None)
            .await;
        h.engine.respond(id, true).await.unwrap();

        let start = serde_json::to_vec(&FileStartPayload {
            name: "hello.txt".into(),
            size: 200_000,
            total_chunks: 3,
        })
        .unwrap();
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileStart, id, 0, &start), false);
        h.engine
            .handle_frame("sender", &frame_bytes(FrameKind::Chunk, id, 2, &[0u8; 100]), false);

        let events = drain_events(&mut h.events_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::TransferFailed { kind: FailureKind::InvalidFrame, .. })));
    }

    #[tokio::test]
    async fn oversized_transfer_is_rejected() {
        let mut h = harness();
        let id = Uuid::new_v4();
        h.engine
            .handle_signal("sender", SignalMessage::FileRequest { data: request(id, 4, 1) }, None)
            .await;
        h.engine.respond(id, true).await.unwrap();

        let start = serde_json::to_vec(&FileStartPayload {
            name: "hello.txt".into(),
            size: 4,
            total_chunks: 1,
        })
        .unwrap();
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileStart, id, 0, &start), false);
        h.engine
            .handle_frame("sender", &frame_bytes(FrameKind::Chunk, id, 0, b"way too many bytes"), false);

        let events = drain_events(&mut h.events_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::TransferFailed { kind: FailureKind::InvalidFrame, .. })));
    }

    #[tokio::test]
    async fn trusted_sender_is_auto_accepted() {
        let mut h = harness();
        let info = sender_info("Blue Fox");
        let fingerprint = crypto::device_fingerprint("Blue Fox", "mobile", "firefox");
        h.engine.trust_store().trust(&fingerprint, "Blue Fox", "mobile", "firefox");

        let id = Uuid::new_v4();
        h.engine
            .handle_signal(
                "sender",
                SignalMessage::FileRequest { data: request(id, 11, 1) },
                Some(&info),
            )
            .await;

        // auto-response went out without any FileRequest event
        let env = h.signal_rx.recv().await.unwrap();
        match env.message {
            SignalMessage::FileResponse { data } => {
                assert!(data.accepted);
                assert_eq!(data.file_id, id.to_string());
            }
            other => panic!("expected file-response, got {}", other.kind()),
        }
        let events = drain_events(&mut h.events_rx);
        assert!(!events.iter().any(|e| matches!(e, Event::FileRequest { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::TransferStart { direction: Direction::Recv, .. }
        )));
    }

    #[tokio::test]
    async fn untrusted_sender_prompts() {
        let mut h = harness();
        let info = sender_info("Stranger");
        let id = Uuid::new_v4();
        h.engine
            .handle_signal(
                "sender",
                SignalMessage::FileRequest { data: request(id, 11, 1) },
                Some(&info),
            )
            .await;

        let events = drain_events(&mut h.events_rx);
        assert!(events.iter().any(|e| matches!(e, Event::FileRequest { .. })));
    }

    #[tokio::test]
    async fn decline_sends_negative_response_and_forgets() {
        let mut h = harness();
        let id = Uuid::new_v4();
        h.engine
            .handle_signal("sender", SignalMessage::FileRequest { data: request(id, 11, 1) }, None)
            .await;
        h.engine.respond(id, false).await.unwrap();

        let env = h.signal_rx.recv().await.unwrap();
        match env.message {
            SignalMessage::FileResponse { data } => assert!(!data.accepted),
            other => panic!("expected file-response, got {}", other.kind()),
        }
        // transfer is gone; a second verdict has nothing to act on
        assert!(h.engine.respond(id, false).await.is_err());
    }

    #[tokio::test]
    async fn remote_cancel_is_idempotent() {
        let mut h = harness();
        let id = Uuid::new_v4();
        accept(&mut h, id).await;
        drain_events(&mut h.events_rx);

        h.engine
            .handle_frame("sender", &frame_bytes(FrameKind::Cancel, id, 0, &[0]), false);
        h.engine
            .handle_frame("sender", &frame_bytes(FrameKind::Cancel, id, 0, &[0]), false);
        h.engine
            .handle_signal(
                "sender",
                SignalMessage::FileCancel {
                    data: FileCancelData { file_id: id.to_string(), reason: "user".into() },
                },
                None,
            )
            .await;

        let events = drain_events(&mut h.events_rx);
        let cancels = events
            .iter()
            .filter(|e| matches!(e, Event::TransferCancelled { .. }))
            .count();
        assert_eq!(cancels, 1);
    }

    #[tokio::test]
    async fn no_completion_after_cancel() {
        let mut h = harness();
        let id = Uuid::new_v4();
        accept(&mut h, id).await;

        let start = serde_json::to_vec(&FileStartPayload {
            name: "hello.txt".into(),
            size: 11,
            total_chunks: 1,
        })
        .unwrap();
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileStart, id, 0, &start), false);
        h.engine
            .handle_frame("sender", &frame_bytes(FrameKind::Cancel, id, 0, &[0]), false);
        drain_events(&mut h.events_rx);

        // stragglers after the cancel are discarded
        h.engine
            .handle_frame("sender", &frame_bytes(FrameKind::Chunk, id, 0, b"hello world"), false);
        let hash = crypto::sha256(b"hello world");
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileEnd, id, 0, &hash), false);

        let events = drain_events(&mut h.events_rx);
        assert!(!events.iter().any(|e| matches!(e, Event::FileReceived { .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::Progress { percent, .. } if *percent == 100.0)));
    }

    #[tokio::test]
    async fn peer_left_kills_its_transfers() {
        let mut h = harness();
        let id = Uuid::new_v4();
        accept(&mut h, id).await;
        drain_events(&mut h.events_rx);

        h.engine.peer_left("sender");

        let events = drain_events(&mut h.events_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::TransferCancelled { reason: CancelReason::PeerLeft, .. }
        )));
    }

    #[tokio::test]
    async fn sealed_chunk_decrypts_with_peer_key() {
        let mut h = harness();

        // establish a key with the sender out of band
        let remote = crate::webrtc::KeyExchange::new();
        let remote_pub = remote.local_public("self");
        let key = h.manager.keys().set_remote_public("sender", &remote_pub).unwrap();

        let id = Uuid::new_v4();
        accept(&mut h, id).await;
        let start = serde_json::to_vec(&FileStartPayload {
            name: "hello.txt".into(),
            size: 11,
            total_chunks: 1,
        })
        .unwrap();
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileStart, id, 0, &start), false);

        let sealed = crypto::seal(&key, &crypto::transfer_nonce(&id, 0), b"hello world").unwrap();
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::Chunk, id, 0, &sealed), true);
        let hash = crypto::sha256(b"hello world");
        h.engine.handle_frame("sender", &frame_bytes(FrameKind::FileEnd, id, 0, &hash), false);

        let events = drain_events(&mut h.events_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::FileReceived { bytes, .. } if bytes == b"hello world")));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Progress { mode: TransferMode::Relay, .. }
        )));
    }

    #[tokio::test]
    async fn transport_closed_fails_everything() {
        let mut h = harness();
        let id = Uuid::new_v4();
        accept(&mut h, id).await;
        drain_events(&mut h.events_rx);

        h.engine.transport_closed();

        let events = drain_events(&mut h.events_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::TransferFailed { kind: FailureKind::TransportClosed, .. }
        )));
    }

    #[tokio::test]
    async fn text_signal_lands_in_history_and_events() {
        let mut h = harness();
        h.engine
            .handle_signal(
                "sender",
                SignalMessage::Text { data: TextData { text: "hi there".into() } },
                None,
            )
            .await;

        let events = drain_events(&mut h.events_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::TextReceived { text, .. } if text == "hi there")));
        assert_eq!(h.engine.history().for_peer("sender").len(), 1);
    }
}
