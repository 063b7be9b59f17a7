//! HTTP surface of the room server
//!
//! axum router exposing the WebSocket upgrade plus the small REST API for
//! room passwords and a health endpoint. All state hangs off [`AppState`].

use crate::config::Config;
use crate::crypto;
use crate::protocol::normalize_room_code;
use crate::server::room::RoomRegistry;
use crate::server::storage::{FileStore, MemoryStore, PasswordStore};
use crate::server::ws::handle_room_socket;
use axum::{
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::info;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Shared server state
pub struct AppState {
    pub registry: RoomRegistry,
    pub store: Arc<dyn PasswordStore>,
    pub config: Arc<Config>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let store: Arc<dyn PasswordStore> = match &config.server.password_store {
            Some(path) => {
                info!("Password store at {:?}", path);
                Arc::new(FileStore::open(path.clone()))
            }
            None => Arc::new(MemoryStore::new()),
        };

        Arc::new(Self {
            registry: RoomRegistry::new(config.room.max_peers),
            store,
            config: Arc::new(config),
            start_time: Instant::now(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    room: Option<String>,
    #[serde(rename = "passwordHash")]
    password_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RoomQuery {
    room: String,
}

#[derive(Debug, Deserialize)]
struct SetPasswordBody {
    #[serde(rename = "passwordHash")]
    password_hash: String,
}

/// Room code for clients that did not pick one: derived from the source
/// address so devices behind one NAT meet in the same room.
fn assigned_room_code(addr: &SocketAddr) -> String {
    let digest = crypto::sha256(addr.ip().to_string().as_bytes());
    hex::encode(&digest[..3]).to_ascii_uppercase()
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let room_code = match &query.room {
        Some(raw) => match normalize_room_code(raw) {
            Some(code) => code,
            None => {
                return (StatusCode::BAD_REQUEST, "invalid room code").into_response();
            }
        },
        None => assigned_room_code(&addr),
    };

    ws.on_upgrade(move |socket| {
        handle_room_socket(socket, state, room_code, query.password_hash)
    })
}

async fn set_password_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoomQuery>,
    Json(body): Json<SetPasswordBody>,
) -> Json<serde_json::Value> {
    let Some(room) = normalize_room_code(&query.room) else {
        return Json(json!({ "success": false, "error": "INVALID_ROOM" }));
    };
    if body.password_hash.is_empty() {
        return Json(json!({ "success": false, "error": "EMPTY_PASSWORD" }));
    }

    if state.store.put_if_absent(&room, &body.password_hash) {
        info!("Password set for room {}", room);
        Json(json!({ "success": true }))
    } else {
        Json(json!({ "success": false, "error": "PASSWORD_ALREADY_SET" }))
    }
}

async fn check_password_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoomQuery>,
) -> Json<serde_json::Value> {
    let has_password = normalize_room_code(&query.room)
        .map(|room| state.store.get(&room).is_some())
        .unwrap_or(false);
    Json(json!({ "hasPassword": has_password }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (rooms, peers) = state.registry.counts();
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "rooms": rooms,
        "peers": peers,
    }))
}

/// Build the router over the shared state.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/room/set-password", post(set_password_handler))
        .route("/api/room/check-password", get(check_password_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn run_server(state: Arc<AppState>) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Room server listening on http://{}", addr);

    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, SignalMessage};
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    async fn spawn_server(state: Arc<AppState>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        addr
    }

    fn join_frame(name: &str) -> WsMessage {
        WsMessage::Text(format!(
            r#"{{"type":"join","data":{{"name":"{}","deviceType":"desktop"}}}}"#,
            name
        ))
    }

    async fn next_envelope<S>(stream: &mut S) -> Envelope
    where
        S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = stream.next().await.unwrap().unwrap();
            if let WsMessage::Text(text) = msg {
                return Envelope::from_json(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn join_and_roster() {
        let state = AppState::new(Config::default());
        let addr = spawn_server(state).await;

        let (mut alice, _) = connect_async(format!("ws://{}/ws?room=ROSTER", addr))
            .await
            .unwrap();
        alice.send(join_frame("Alice")).await.unwrap();
        let joined = next_envelope(&mut alice).await;
        let alice_id = match joined.message {
            SignalMessage::Joined { peer_id, room_code, peers } => {
                assert_eq!(room_code, "ROSTER");
                assert!(peers.is_empty());
                peer_id
            }
            other => panic!("expected joined, got {}", other.kind()),
        };

        let (mut bob, _) = connect_async(format!("ws://{}/ws?room=ROSTER", addr))
            .await
            .unwrap();
        bob.send(join_frame("Bob")).await.unwrap();
        let joined = next_envelope(&mut bob).await;
        match joined.message {
            SignalMessage::Joined { peers, .. } => {
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].id, alice_id);
                assert_eq!(peers[0].name, "Alice");
            }
            other => panic!("expected joined, got {}", other.kind()),
        }

        // Alice hears about Bob
        let announce = next_envelope(&mut alice).await;
        match announce.message {
            SignalMessage::PeerJoined { data } => assert_eq!(data.name, "Bob"),
            other => panic!("expected peer-joined, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn directed_forwarding_stamps_from() {
        let state = AppState::new(Config::default());
        let addr = spawn_server(state).await;

        let (mut alice, _) = connect_async(format!("ws://{}/ws?room=FWD42", addr))
            .await
            .unwrap();
        alice.send(join_frame("Alice")).await.unwrap();
        let alice_id = match next_envelope(&mut alice).await.message {
            SignalMessage::Joined { peer_id, .. } => peer_id,
            _ => panic!(),
        };

        let (mut bob, _) = connect_async(format!("ws://{}/ws?room=FWD42", addr))
            .await
            .unwrap();
        bob.send(join_frame("Bob")).await.unwrap();
        let bob_id = match next_envelope(&mut bob).await.message {
            SignalMessage::Joined { peer_id, .. } => peer_id,
            _ => panic!(),
        };

        let text = format!(
            r#"{{"type":"text","to":"{}","data":{{"text":"hi bob"}}}}"#,
            bob_id
        );
        alice.send(WsMessage::Text(text)).await.unwrap();

        let delivered = next_envelope(&mut bob).await;
        assert_eq!(delivered.from.as_deref(), Some(alice_id.as_str()));
        match delivered.message {
            SignalMessage::Text { data } => assert_eq!(data.text, "hi bob"),
            other => panic!("expected text, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn peer_left_broadcast_on_disconnect() {
        let state = AppState::new(Config::default());
        let addr = spawn_server(state).await;

        let (mut alice, _) = connect_async(format!("ws://{}/ws?room=LEAVE", addr))
            .await
            .unwrap();
        alice.send(join_frame("Alice")).await.unwrap();
        next_envelope(&mut alice).await;

        let (mut bob, _) = connect_async(format!("ws://{}/ws?room=LEAVE", addr))
            .await
            .unwrap();
        bob.send(join_frame("Bob")).await.unwrap();
        let bob_id = match next_envelope(&mut bob).await.message {
            SignalMessage::Joined { peer_id, .. } => peer_id,
            _ => panic!(),
        };
        next_envelope(&mut alice).await; // peer-joined

        drop(bob);

        let left = next_envelope(&mut alice).await;
        match left.message {
            SignalMessage::PeerLeft { data } => assert_eq!(data.id, bob_id),
            other => panic!("expected peer-left, got {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn password_gate_refuses_and_admits() {
        let state = AppState::new(Config::default());
        state.store.put_if_absent("GATED", "cafebabe");
        let addr = spawn_server(state).await;

        // No hash: error frame then close 4001
        let (mut carol, _) = connect_async(format!("ws://{}/ws?room=GATED", addr))
            .await
            .unwrap();
        let err = next_envelope(&mut carol).await;
        match err.message {
            SignalMessage::Error { data } => assert_eq!(data.error, "PASSWORD_REQUIRED"),
            other => panic!("expected error, got {}", other.kind()),
        }
        loop {
            match carol.next().await {
                Some(Ok(WsMessage::Close(Some(frame)))) => {
                    assert_eq!(u16::from(frame.code), 4001);
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("expected close frame, got {:?}", other),
            }
        }

        // Wrong hash: close 4002
        let (mut carol, _) = connect_async(format!(
            "ws://{}/ws?room=GATED&passwordHash=wrong",
            addr
        ))
        .await
        .unwrap();
        let err = next_envelope(&mut carol).await;
        match err.message {
            SignalMessage::Error { data } => assert_eq!(data.error, "PASSWORD_INCORRECT"),
            other => panic!("expected error, got {}", other.kind()),
        }

        // Correct hash: joins
        let (mut carol, _) = connect_async(format!(
            "ws://{}/ws?room=GATED&passwordHash=cafebabe",
            addr
        ))
        .await
        .unwrap();
        carol.send(join_frame("Carol")).await.unwrap();
        let joined = next_envelope(&mut carol).await;
        assert!(matches!(joined.message, SignalMessage::Joined { .. }));
    }

    #[tokio::test]
    async fn set_password_once_only() {
        let state = AppState::new(Config::default());

        let first = set_password_handler(
            State(state.clone()),
            Query(RoomQuery { room: "abcd".into() }),
            Json(SetPasswordBody { password_hash: "h1".into() }),
        )
        .await;
        assert_eq!(first.0["success"], true);

        let second = set_password_handler(
            State(state.clone()),
            Query(RoomQuery { room: "ABCD".into() }),
            Json(SetPasswordBody { password_hash: "h2".into() }),
        )
        .await;
        assert_eq!(second.0["success"], false);
        assert_eq!(second.0["error"], "PASSWORD_ALREADY_SET");

        // the stored hash is the first successful argument
        assert_eq!(state.store.get("ABCD").as_deref(), Some("h1"));

        let check = check_password_handler(
            State(state.clone()),
            Query(RoomQuery { room: "abcd".into() }),
        )
        .await;
        assert_eq!(check.0["hasPassword"], true);
    }

    #[tokio::test]
    async fn invalid_room_code_rejected() {
        let state = AppState::new(Config::default());
        let addr = spawn_server(state).await;
        let result = connect_async(format!("ws://{}/ws?room=a", addr)).await;
        assert!(result.is_err());
    }
}
