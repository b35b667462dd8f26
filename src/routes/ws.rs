//! WebSocket gateway — transport termination and frame dispatch.
//!
//! DESIGN
//! ======
//! On upgrade the carried ticket is exchanged for a verified identity; an
//! invalid ticket never reaches a room. The connection then enters a
//! `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall prefix
//! - Fan-out frames from room peers → forward to the client
//!
//! Handlers translate wire frames into coordinator calls and return an
//! `Outcome` for the sender only — fan-out to peers happens inside the
//! coordinator's critical section, where ordering is decided.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → verify ticket → send `session:connected` with `client_id`
//! 2. Client joins a room, mutates objects, streams presence
//! 3. Close, transport error, or eviction (outbound channel closed) → the
//!    loop ends and detach runs exactly once; the coordinator's detach is
//!    itself idempotent, so an eviction that already cleaned up is a no-op.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services::identity::{IdentityError, VerifiedIdentity};
use crate::services::object::{self, Mutation};
use crate::services::presence::{self, PresencePatch, presence_to_data};
use crate::services::room;
use crate::state::{AppState, Cursor, PresenceEntry};

/// Session-stable cursor colors, assigned at connect.
const COLOR_PALETTE: [&str; 8] = [
    "#E57373", "#64B5F6", "#81C784", "#FFD54F", "#BA68C8", "#4DB6AC", "#F06292", "#A1887F",
];

// =============================================================================
// GATEWAY ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
enum GatewayError {
    #[error("malformed operation: {0}")]
    Malformed(String),
    #[error("must join a room first")]
    NotJoined,
}

impl crate::frame::ErrorCode for GatewayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "E_MALFORMED",
            Self::NotJoined => "E_NOT_JOINED",
        }
    }
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Result returned by handler functions, consumed by the dispatch layer.
/// Covers the sender side only: peer fan-out already happened inside the
/// coordinator by the time a handler returns.
enum Outcome {
    /// Send done+data to sender.
    Reply(Data),
    /// Send empty done to sender.
    Done,
    /// Send nothing (presence traffic is fire-and-forget).
    Silent,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(ticket) = params.get("ticket") else {
        return (StatusCode::UNAUTHORIZED, "ticket required").into_response();
    };

    match state.verifier.verify(ticket).await {
        Ok(identity) => ws.on_upgrade(move |socket| run_ws(socket, state, identity)),
        Err(IdentityError::Unauthenticated) => {
            (StatusCode::UNAUTHORIZED, "invalid or expired ticket").into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "identity verification failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "identity verification error").into_response()
        }
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, identity: VerifiedIdentity) {
    let client_id = Uuid::new_v4();
    let color = pick_color();

    // Per-connection bounded queue for fan-out frames from room peers.
    // The coordinator drops the sender on overflow, which ends this loop.
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(state.config.outbound_queue_capacity);

    let welcome = Frame::request("session:connected", Data::new())
        .with_data("client_id", client_id.to_string())
        .with_data("user_id", identity.user_id.to_string())
        .with_data("color", color);
    if send_frame(&mut socket, &welcome).await.is_err() {
        return;
    }

    info!(%client_id, user_id = %identity.user_id, "ws: client connected");

    // Which room this connection has joined, if any.
    let mut current_room: Option<Uuid> = None;

    'session: loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let replies = process_inbound_text(
                            &state, &mut current_room, client_id, &identity, color, &client_tx, &text,
                        )
                        .await;
                        for frame in replies {
                            if send_frame(&mut socket, &frame).await.is_err() {
                                break 'session;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            frame = client_rx.recv() => {
                // None means the coordinator evicted us (queue overflow).
                let Some(frame) = frame else { break };
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    // Exactly-once detach: take() clears the slot, and the coordinator's
    // detach is idempotent for the eviction path.
    if let Some(room_id) = current_room.take() {
        room::detach(&state, room_id, client_id).await;
    }
    info!(%client_id, "ws: client disconnected");
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame, returning frames for the
/// sender. Split out of the socket loop so tests can drive dispatch without
/// a live transport.
async fn process_inbound_text(
    state: &AppState,
    current_room: &mut Option<Uuid>,
    client_id: Uuid,
    identity: &VerifiedIdentity,
    color: &'static str,
    client_tx: &mpsc::Sender<Frame>,
    text: &str,
) -> Vec<Frame> {
    if text.len() > state.config.max_frame_bytes {
        warn!(%client_id, len = text.len(), "ws: oversized inbound frame");
        let err = Frame::request("gateway:error", Data::new())
            .with_data("code", "E_MALFORMED")
            .with_data("message", format!("frame exceeds {} bytes", state.config.max_frame_bytes));
        return vec![err];
    }

    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(%client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new())
                .with_data("code", "E_MALFORMED")
                .with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Stamp the authenticated user_id as `from`; clients cannot spoof it.
    req.from = Some(identity.user_id.to_string());

    let is_presence = req.prefix() == "presence";
    if !is_presence {
        info!(%client_id, id = %req.id, syscall = %req.syscall, "ws: recv frame");
    }

    let result = match req.prefix() {
        "room" => handle_room(state, current_room, client_id, identity, color, client_tx, &req).await,
        "object" => handle_object(state, *current_room, client_id, identity.user_id, &req).await,
        "presence" => handle_presence(state, *current_room, client_id, &req).await,
        other => Err(req.error(format!("unknown prefix: {other}"))),
    };

    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::Done) => vec![req.done()],
        Ok(Outcome::Silent) => vec![],
        Err(err_frame) => vec![err_frame],
    }
}

// =============================================================================
// ROOM HANDLERS
// =============================================================================

async fn handle_room(
    state: &AppState,
    current_room: &mut Option<Uuid>,
    client_id: Uuid,
    identity: &VerifiedIdentity,
    color: &'static str,
    client_tx: &mpsc::Sender<Frame>,
    req: &Frame,
) -> Result<Outcome, Frame> {
    match req.op() {
        "join" => {
            let Some(room_id) = req.room_id.or_else(|| parse_uuid(&req.data, "room_id")) else {
                return Err(req.error_from(&GatewayError::Malformed("room_id required".into())));
            };

            // Joining a second room implicitly parts the first.
            if let Some(old_room) = current_room.take() {
                room::detach(state, old_room, client_id).await;
            }

            let name = req
                .data
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or(&identity.name)
                .to_string();
            let entry = PresenceEntry {
                user_id: identity.user_id,
                name,
                color: color.to_string(),
                cursor: req
                    .data
                    .get("cursor")
                    .and_then(|v| serde_json::from_value::<Cursor>(v.clone()).ok()),
                editing: parse_uuid(&req.data, "editing"),
            };

            let outcome = room::attach(state, room_id, client_id, entry, client_tx.clone()).await;
            *current_room = Some(room_id);

            let mut reply = Data::new();
            reply.insert("room_id".into(), serde_json::json!(room_id));
            reply.insert(
                "objects".into(),
                serde_json::json!(outcome.objects.iter().map(object::object_to_data).collect::<Vec<_>>()),
            );
            reply.insert(
                "peers".into(),
                serde_json::json!(
                    outcome
                        .peers
                        .iter()
                        .map(|(peer_id, entry)| presence_to_data(*peer_id, entry))
                        .collect::<Vec<_>>()
                ),
            );
            Ok(Outcome::Reply(reply))
        }
        "leave" => {
            if let Some(room_id) = current_room.take() {
                room::detach(state, room_id, client_id).await;
            }
            Ok(Outcome::Done)
        }
        op => Err(req.error(format!("unknown room op: {op}"))),
    }
}

// =============================================================================
// OBJECT HANDLERS
// =============================================================================

async fn handle_object(
    state: &AppState,
    current_room: Option<Uuid>,
    client_id: Uuid,
    user_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    let Some(room_id) = current_room else {
        return Err(req.error_from(&GatewayError::NotJoined));
    };

    let mutation = match req.op() {
        "insert" => {
            let Some(kind) = req.data.get("kind").and_then(|v| v.as_str()) else {
                return Err(req.error_from(&GatewayError::Malformed("kind required".into())));
            };
            // A client-supplied id must parse; silently regenerating it
            // would desync the client's local key from the authoritative id.
            let id = match req.data.get("id") {
                None => None,
                Some(value) => match value.as_str().and_then(|s| s.parse().ok()) {
                    Some(id) => Some(id),
                    None => {
                        return Err(req.error_from(&GatewayError::Malformed("id must be a uuid".into())));
                    }
                },
            };
            Mutation::Insert {
                id,
                kind: kind.to_string(),
                attrs: req.data.get("attrs").cloned().unwrap_or(serde_json::json!({})),
            }
        }
        "update" => {
            let Some(id) = parse_uuid(&req.data, "id") else {
                return Err(req.error_from(&GatewayError::Malformed("id required".into())));
            };
            let patch = match req.data.get("patch") {
                Some(serde_json::Value::Object(map)) => map.clone(),
                Some(_) => {
                    return Err(req.error_from(&GatewayError::Malformed("patch must be a JSON object".into())));
                }
                None => return Err(req.error_from(&GatewayError::Malformed("patch required".into()))),
            };
            Mutation::Update {
                id,
                patch,
                expected_revision: req.data.get("expected_revision").and_then(serde_json::Value::as_i64),
            }
        }
        "delete" => {
            let Some(id) = parse_uuid(&req.data, "id") else {
                return Err(req.error_from(&GatewayError::Malformed("id required".into())));
            };
            Mutation::Delete { id }
        }
        op => return Err(req.error(format!("unknown object op: {op}"))),
    };

    match object::apply(state, room_id, client_id, user_id, mutation).await {
        Ok(applied) => {
            let (_, data) = applied.to_event();
            Ok(Outcome::Reply(data))
        }
        Err(e) => Err(req.error_from(&e)),
    }
}

// =============================================================================
// PRESENCE HANDLER
// =============================================================================

async fn handle_presence(
    state: &AppState,
    current_room: Option<Uuid>,
    client_id: Uuid,
    req: &Frame,
) -> Result<Outcome, Frame> {
    // Silently ignore presence sent before joining.
    let Some(room_id) = current_room else {
        return Ok(Outcome::Silent);
    };

    if req.op() != "update" {
        return Err(req.error(format!("unknown presence op: {}", req.op())));
    }

    let mut patch = PresencePatch::default();
    if let Some(value) = req.data.get("cursor") {
        patch.cursor = Some(match value {
            serde_json::Value::Null => None,
            v => match serde_json::from_value::<Cursor>(v.clone()) {
                Ok(cursor) => Some(cursor),
                Err(_) => {
                    return Err(req.error_from(&GatewayError::Malformed("cursor must be {x, y}".into())));
                }
            },
        });
    }
    if let Some(value) = req.data.get("editing") {
        patch.editing = Some(match value {
            serde_json::Value::Null => None,
            v => match v.as_str().and_then(|s| s.parse().ok()) {
                Some(id) => Some(id),
                None => {
                    return Err(req.error_from(&GatewayError::Malformed("editing must be an object id".into())));
                }
            },
        });
    }

    match presence::update(state, room_id, client_id, patch).await {
        Ok(()) => Ok(Outcome::Silent),
        Err(e) => Err(req.error_from(&e)),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn pick_color() -> &'static str {
    COLOR_PALETTE[rand::rng().random_range(0..COLOR_PALETTE.len())]
}

fn parse_uuid(data: &Data, key: &str) -> Option<Uuid> {
    data.get(key).and_then(|v| v.as_str()).and_then(|s| s.parse().ok())
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    let is_presence = frame.syscall.starts_with("presence:");
    if !is_presence {
        if frame.status == crate::frame::Status::Error {
            let code = frame.data.get("code").and_then(|v| v.as_str()).unwrap_or("-");
            let message = frame.data.get("message").and_then(|v| v.as_str()).unwrap_or("-");
            warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
        } else {
            info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
        }
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
