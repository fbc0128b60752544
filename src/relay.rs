//! The room relay: HTTP surface, WebSocket fan-out, and history replay.
//!
//! Rooms are created over plain HTTP and joined over `GET /ws/{token}`.  The
//! relay is crypto-agnostic: it persists and forwards opaque ciphertext
//! envelopes, assigns the authoritative per-room sequence number on ingress,
//! and replays history to reconnecting clients.  A bad frame never kills the
//! connection — protocol errors go back to the offending sender as an
//! `ERROR` frame and the reader loop continues.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::config::{
    DEFAULT_MAX_ROOM_PEERS, DEFAULT_TTL_SECS, MAX_FRAME_BYTES, REPLAY_PACE_MS, SWEEP_INTERVAL_SECS,
};
use crate::hub::{Connection, HubRegistry, RoomFull};
use crate::logging;
use crate::notify;
use crate::protocol::{
    decode_cipher_payload, error_frame, history_frame, is_persisted, is_relayed_verbatim, Envelope,
};
use crate::storage::{format_rfc3339, now_secs, Storage, StorageError};

#[derive(Clone)]
pub struct RelayConfig {
    /// Maximum concurrent members per room.  A pragmatic guard against
    /// accidental fan-out amplification, not a security property.
    pub max_room_peers: usize,
    pub sweep_interval: Duration,
    /// Delay between rows during history replay.
    pub replay_pace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_room_peers: DEFAULT_MAX_ROOM_PEERS,
            sweep_interval: Duration::from_secs(SWEEP_INTERVAL_SECS),
            replay_pace: Duration::from_millis(REPLAY_PACE_MS),
        }
    }
}

#[derive(Clone)]
pub struct RelayState {
    storage: Arc<Mutex<Storage>>,
    rooms: Arc<HubRegistry>,
    config: RelayConfig,
}

impl RelayState {
    pub fn new(storage: Arc<Mutex<Storage>>, config: RelayConfig) -> Self {
        Self {
            storage,
            rooms: Arc::new(HubRegistry::new()),
            config,
        }
    }

    /// Spawn the background task that purges expired rooms and their
    /// messages.  Failures are logged and retried on the next tick; every
    /// read path re-checks liveness anyway, so the cadence is not a
    /// correctness requirement.
    pub fn start_sweeper(&self, mut shutdown_rx: oneshot::Receiver<()>) {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match state.storage.lock().await.cleanup_expired() {
                            Ok(0) => {}
                            Ok(n) => crate::tlog!("sweeper: purged {n} expired room(s)"),
                            Err(e) => crate::tlog!("sweeper: cleanup failed: {e}"),
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });
    }
}

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(healthcheck))
        .route("/create", post(create_room))
        .route("/room/:token", get(room_info).delete(destroy_room))
        .route("/ws/:token", get(ws_handler))
        .with_state(state)
}

/// Build a standard JSON error response.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = serde_json::json!({ "error": message.into() });
    (status, Json(body)).into_response()
}

async fn healthcheck() -> impl IntoResponse {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Room lifecycle endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateRequest {
    ttl: Option<String>,
}

#[derive(Serialize)]
struct CreateResponse {
    url: String,
    expires_at: String,
}

/// Map a requested TTL to seconds.  Unrecognized values fall back to an hour.
fn parse_ttl(value: &str) -> (&'static str, u64) {
    match value {
        "15m" => ("15m", 900),
        "1h" => ("1h", 3600),
        "24h" => ("24h", 86400),
        _ => ("1h", DEFAULT_TTL_SECS),
    }
}

async fn create_room(
    State(state): State<RelayState>,
    payload: Option<Json<CreateRequest>>,
) -> Response {
    let requested = payload
        .and_then(|Json(req)| req.ttl)
        .unwrap_or_else(|| "1h".to_string());
    let (ttl_label, ttl_secs) = parse_ttl(&requested);

    let (token, expires_at) = match state.storage.lock().await.create_room(ttl_secs) {
        Ok(room) => room,
        Err(e) => {
            crate::tlog!("relay: create room failed: {e}");
            return api_error(StatusCode::INTERNAL_SERVER_ERROR, "server error");
        }
    };

    crate::tlog!("relay: room created {} (ttl {ttl_label})", logging::room_id(&token));
    notify::emit("room.created", &token, ttl_label);

    Json(CreateResponse {
        url: format!("/#{token}"),
        expires_at: format_rfc3339(expires_at),
    })
    .into_response()
}

#[derive(Serialize)]
struct RoomInfoResponse {
    expires_at: String,
    expires_in_sec: i64,
}

async fn room_info(State(state): State<RelayState>, Path(token): Path<String>) -> Response {
    match state.storage.lock().await.room_expiry(&token) {
        Ok(expires_at) => Json(RoomInfoResponse {
            expires_at: format_rfc3339(expires_at),
            expires_in_sec: expires_at - now_secs(),
        })
        .into_response(),
        Err(StorageError::NotFound | StorageError::RoomExpired) => {
            api_error(StatusCode::NOT_FOUND, "room not found or expired")
        }
        Err(e) => {
            crate::tlog!("relay: room lookup failed: {e}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "server error")
        }
    }
}

async fn destroy_room(State(state): State<RelayState>, Path(token): Path<String>) -> Response {
    if let Err(e) = state.storage.lock().await.delete_room(&token) {
        crate::tlog!("relay: room delete failed: {e}");
        return api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to delete room");
    }
    // Live sockets are not force-closed here; the per-frame liveness check
    // ends them on their next frame.
    crate::tlog!("relay: room destroyed {}", logging::room_id(&token));
    StatusCode::NO_CONTENT.into_response()
}

// ---------------------------------------------------------------------------
// WebSocket relay
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WsQuery {
    after_seq: Option<i64>,
    /// Legacy alias for `after_seq`.
    after: Option<i64>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(token): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<RelayState>,
) -> Response {
    match state.storage.lock().await.room_exists(&token) {
        Ok(true) => {}
        Ok(false) => return api_error(StatusCode::NOT_FOUND, "room not found or expired"),
        Err(e) => {
            crate::tlog!("relay: room check failed: {e}");
            return api_error(StatusCode::NOT_FOUND, "room not found or expired");
        }
    }

    if state.rooms.member_count(&token) >= state.config.max_room_peers {
        return api_error(StatusCode::FORBIDDEN, "room full");
    }

    let after_seq = query
        .after_seq
        .or(query.after)
        .filter(|n| *n >= 0)
        .unwrap_or(0);

    // Encrypted image chunks arrive as single large frames; the limit must
    // comfortably exceed 1 MiB of base64-coded ciphertext plus framing.
    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| relay_session(socket, token, after_seq, state))
        .into_response()
}

enum ReplayError {
    Storage(StorageError),
    ConnectionClosed,
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayError::Storage(e) => write!(f, "{e}"),
            ReplayError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

/// Stream all rows with `seq > after_seq` to this connection only, reliably
/// and in order.  The rows are read outside any transaction and paced so a
/// slow consumer is not overwhelmed.
async fn replay_history(
    state: &RelayState,
    conn: &Connection,
    token: &str,
    after_seq: i64,
) -> Result<usize, ReplayError> {
    let rows = state
        .storage
        .lock()
        .await
        .messages_since(token, after_seq)
        .map_err(ReplayError::Storage)?;

    let count = rows.len();
    for row in rows {
        let frame = history_frame(&row.message_type, row.seq, &row.nonce, &row.ciphertext);
        conn.enqueue_reliable(frame)
            .await
            .map_err(|_| ReplayError::ConnectionClosed)?;
        tokio::time::sleep(state.config.replay_pace).await;
    }

    Ok(count)
}

async fn relay_session(socket: WebSocket, token: String, after_seq: i64, state: RelayState) {
    // Re-check capacity now that the socket exists: the pre-upgrade check can
    // race with another join.
    let (hub, conn, mut outbound_rx) =
        match state.rooms.join(&token, state.config.max_room_peers) {
            Ok(joined) => joined,
            Err(RoomFull) => {
                crate::tlog!("relay: room full {}", logging::room_id(&token));
                return;
            }
        };

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer loop: the sole consumer of this connection's outbound queue.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    crate::tlog!("relay: peer joined {}", logging::room_id(&token));

    let mut watermark = after_seq;
    let mut replayed = false;

    while let Some(Ok(message)) = ws_rx.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        // A room can expire or be destroyed mid-session.
        let live = state
            .storage
            .lock()
            .await
            .room_exists(&token)
            .unwrap_or(false);
        if !live {
            crate::tlog!("relay: room gone, closing {}", logging::room_id(&token));
            break;
        }

        let Some(mut envelope) = Envelope::parse(&text) else {
            continue;
        };

        if envelope.kind == "READY" {
            if let Some(seen) = envelope.payload.get("lastSeenSeq").and_then(Value::as_i64) {
                if seen > watermark {
                    watermark = seen;
                }
            }
            if !replayed {
                match replay_history(&state, &conn, &token, watermark).await {
                    Ok(count) => {
                        replayed = true;
                        crate::tlog!(
                            "relay: replayed {count} message(s) after seq {watermark} in {}",
                            logging::room_id(&token)
                        );
                    }
                    Err(e) => crate::tlog!("relay: history replay failed: {e}"),
                }
            }
            // History is per-client; READY is never relayed.
            continue;
        }

        if is_persisted(&envelope.kind) {
            let cipher = match decode_cipher_payload(&envelope.payload) {
                Ok(cipher) => cipher,
                Err(e) => {
                    crate::tlog!("relay: rejected {} frame: {e}", envelope.kind);
                    let reply = error_frame("MSG_REJECTED", &e.to_string());
                    if conn.enqueue_reliable(reply).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let inserted = state.storage.lock().await.insert_message(
                &token,
                &cipher.nonce,
                &cipher.ciphertext,
                now_secs(),
                &envelope.kind,
            );
            let seq = match inserted {
                Ok(seq) => seq,
                Err(e) => {
                    crate::tlog!("relay: persist failed for {}: {e}", envelope.kind);
                    let detail = match e {
                        StorageError::RoomExpired => "room expired",
                        StorageError::NotFound => "room not found",
                        StorageError::Sqlite(_) => "failed to persist message",
                    };
                    let reply = error_frame("MSG_REJECTED", detail);
                    if conn.enqueue_reliable(reply).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            // The client-proposed seq is advisory; the relayed envelope
            // carries the server-assigned value so every peer converges on
            // one ordering.
            if let Some(payload) = envelope.payload.as_object_mut() {
                payload.insert("seq".to_string(), seq.into());
            }
            if let Ok(frame) = serde_json::to_string(&envelope) {
                hub.broadcast_except(&frame, conn.id());
            }
            continue;
        }

        if is_relayed_verbatim(&envelope.kind) {
            hub.broadcast_except(&text, conn.id());
        }
        // Anything else is dropped silently.
    }

    state.rooms.leave(&token, conn.id());
    drop(conn);
    // With every outbound sender gone the writer drains and exits on its own.
    let _ = writer.await;

    crate::tlog!("relay: peer left {}", logging::room_id(&token));
}
