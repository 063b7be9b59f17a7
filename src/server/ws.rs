//! Per-socket room session
//!
//! Handles one WebSocket from upgrade to close: password admission, the
//! `join` handshake, then the forwarding loop. The socket's writer runs as
//! its own task fed by an unbounded channel; the roster holds a clone of
//! that channel so any handler can push frames to this peer.

use crate::crypto;
use crate::protocol::{
    close_codes, Envelope, PeerInfo, PeerLeftData, SignalMessage,
};
use crate::server::http::AppState;
use crate::server::room::JoinRefusal;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Admission verdict computed against the stored room password.
enum Admission {
    Granted,
    Refused { error: &'static str, close_code: u16 },
}

fn check_admission(stored: Option<String>, presented: Option<&str>) -> Admission {
    let Some(stored) = stored else {
        return Admission::Granted;
    };
    match presented {
        None => Admission::Refused {
            error: "PASSWORD_REQUIRED",
            close_code: close_codes::PASSWORD_REQUIRED,
        },
        Some(hash) if crypto::constant_time_eq(hash, &stored) => Admission::Granted,
        Some(_) => Admission::Refused {
            error: "PASSWORD_INCORRECT",
            close_code: close_codes::PASSWORD_INCORRECT,
        },
    }
}

async fn refuse(
    sender: &mut SplitSink<WebSocket, Message>,
    error: &'static str,
    close_code: u16,
) {
    if let Ok(frame) = Envelope::error(error).to_json() {
        let _ = sender.send(Message::Text(frame.into())).await;
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code,
            reason: error.into(),
        })))
        .await;
}

/// Drive one room socket to completion.
pub async fn handle_room_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    room_code: String,
    presented_hash: Option<String>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    match check_admission(state.store.get(&room_code), presented_hash.as_deref()) {
        Admission::Granted => {}
        Admission::Refused { error, close_code } => {
            info!("Refusing join to {}: {}", room_code, error);
            refuse(&mut ws_sender, error, close_code).await;
            return;
        }
    }

    // Writer task: everything outbound funnels through one channel.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Roster handle: JSON text frames destined for this peer.
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<String>();
    let out_tx_frames = out_tx.clone();
    tokio::spawn(async move {
        while let Some(frame) = peer_rx.recv().await {
            if out_tx_frames.send(Message::Text(frame.into())).is_err() {
                break;
            }
        }
    });

    // The first meaningful frame must be `join`.
    let mut peer_id: Option<String> = None;

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let text_str: &str = text.as_ref();
                let envelope = match Envelope::from_json(text_str) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!("Invalid frame from {:?}: {}", peer_id, e);
                        continue;
                    }
                };

                let to = envelope.to;
                match envelope.message {
                    SignalMessage::Join { data } if peer_id.is_none() => {
                        let id = uuid::Uuid::new_v4().to_string();
                        let info = PeerInfo {
                            id: id.clone(),
                            name: data.name,
                            device_type: data.device_type,
                            browser_info: data.browser_info,
                        };

                        let roster = match state.registry.join(&room_code, info.clone(), peer_tx.clone()) {
                            Ok(roster) => roster,
                            Err(JoinRefusal::RoomFull) => {
                                info!("Room {} full, refusing {}", room_code, info.name);
                                if let Ok(frame) = Envelope::error("ROOM_FULL").to_json() {
                                    let _ = out_tx.send(Message::Text(frame.into()));
                                }
                                let _ = out_tx.send(Message::Close(Some(CloseFrame {
                                    code: close_codes::ROOM_FULL,
                                    reason: "ROOM_FULL".into(),
                                })));
                                break;
                            }
                        };

                        let joined = Envelope::plain(SignalMessage::Joined {
                            peer_id: id.clone(),
                            room_code: room_code.clone(),
                            peers: roster,
                        });
                        if let Ok(frame) = joined.to_json() {
                            let _ = out_tx.send(Message::Text(frame.into()));
                        }

                        let announce = Envelope::plain(SignalMessage::PeerJoined {
                            data: info.clone(),
                        });
                        if let Ok(frame) = announce.to_json() {
                            state.registry.broadcast_except(&room_code, &id, &frame);
                        }

                        info!("Peer {} ({}) joined room {}", id, info.name, room_code);
                        peer_id = Some(id);
                    }
                    message => match peer_id.clone() {
                        Some(id) => handle_peer_frame(&state, &room_code, &id, to, message),
                        None => debug!("Frame {} before join, dropping", message.kind()),
                    },
                }
            }
            Ok(Message::Binary(_)) => {
                // Binary frames are not part of the room protocol.
                debug!("Ignoring binary frame on room socket");
            }
            Ok(Message::Ping(payload)) => {
                let _ = out_tx.send(Message::Pong(payload));
            }
            Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                error!("Room socket error: {}", e);
                break;
            }
        }
    }

    if let Some(id) = peer_id {
        if state.registry.leave(&room_code, &id) {
            let left = Envelope::plain(SignalMessage::PeerLeft {
                data: PeerLeftData { id: id.clone() },
            });
            if let Ok(frame) = left.to_json() {
                state.registry.broadcast_except(&room_code, &id, &frame);
            }
        }
        info!("Peer {} left room {}", id, room_code);
    }

    send_task.abort();
}

/// Dispatch one post-join frame from a peer.
fn handle_peer_frame(
    state: &Arc<AppState>,
    room_code: &str,
    sender_id: &str,
    to: Option<String>,
    message: SignalMessage,
) {
    if message.is_directed() {
        let Some(target) = to else {
            debug!("Directed {} without a target, dropping", message.kind());
            return;
        };

        if let SignalMessage::RelayData { ref data } = message {
            // base64 inflates by 4/3; compare against the configured payload
            // cap plus frame header and AEAD tag overhead.
            let wire_cap = (state.config.transfer.relay_max_payload + 64) * 4 / 3 + 4;
            if data.payload.len() > wire_cap {
                warn!(
                    "Dropping oversized relay frame from {} ({} b64 bytes)",
                    sender_id,
                    data.payload.len()
                );
                return;
            }
        }

        let forwarded = Envelope {
            from: Some(sender_id.to_string()),
            to: Some(target.clone()),
            message,
        };
        if let Ok(frame) = forwarded.to_json() {
            state.registry.send_to(room_code, &target, frame);
        }
        return;
    }

    match message {
        SignalMessage::NameChanged { data } => {
            state.registry.rename(room_code, sender_id, &data.name);
            let announce = Envelope {
                from: Some(sender_id.to_string()),
                to: None,
                message: SignalMessage::NameChanged { data },
            };
            if let Ok(frame) = announce.to_json() {
                state.registry.broadcast_except(room_code, sender_id, &frame);
            }
        }
        other => {
            debug!("Unhandled frame {} from {}", other.kind(), sender_id);
        }
    }
}
