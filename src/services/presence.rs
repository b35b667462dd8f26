//! Presence — ephemeral per-connection state relay.
//!
//! DESIGN
//! ======
//! Presence lives only in the room's in-memory table and follows a different
//! lifecycle contract than the object store: created on attach, patched only
//! by its owning connection, deleted on detach, never persisted. Updates are
//! relayed to peers excluding the sender; ordering is guaranteed per-sender
//! only, enforced simply by applying patches in arrival order under the room
//! lock and overwriting the entry.

use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services::room;
use crate::state::{AppState, Cursor, PresenceEntry};

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("not attached to room {0}")]
    NotAttached(Uuid),
    #[error("room not loaded: {0}")]
    RoomNotLoaded(Uuid),
}

impl crate::frame::ErrorCode for PresenceError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotAttached(_) => "E_NOT_ATTACHED",
            Self::RoomNotLoaded(_) => "E_ROOM_NOT_LOADED",
        }
    }
}

/// Partial presence update. Outer `None` means "leave the field alone";
/// inner `None` clears it (cursor left the canvas, text edit finished).
#[derive(Debug, Default)]
pub struct PresencePatch {
    pub cursor: Option<Option<Cursor>>,
    pub editing: Option<Option<Uuid>>,
}

/// Apply a presence patch for one connection and relay the updated entry to
/// all peers except the sender. Cannot touch any other connection's entry
/// and is never validated against the object store.
///
/// # Errors
///
/// `NotAttached` if the connection has no presence entry in this room.
pub async fn update(
    state: &AppState,
    room_id: Uuid,
    client_id: Uuid,
    patch: PresencePatch,
) -> Result<(), PresenceError> {
    let room = state
        .rooms
        .read()
        .await
        .get(&room_id)
        .cloned()
        .ok_or(PresenceError::RoomNotLoaded(room_id))?;
    let mut rs = room.state.lock().await;

    let (data, user_id) = {
        let entry = rs
            .presence
            .get_mut(&client_id)
            .ok_or(PresenceError::NotAttached(room_id))?;
        if let Some(cursor) = patch.cursor {
            entry.cursor = cursor;
        }
        if let Some(editing) = patch.editing {
            entry.editing = editing;
        }
        (presence_to_data(client_id, entry), entry.user_id)
    };

    let frame = Frame::request("presence:update", data)
        .with_room_id(room_id)
        .with_from(user_id.to_string());
    room::fanout(state, &mut rs, room_id, &frame, Some(client_id));
    Ok(())
}

/// Flatten a presence entry into frame payload form.
#[must_use]
pub fn presence_to_data(client_id: Uuid, entry: &PresenceEntry) -> Data {
    let mut data = Data::new();
    data.insert("client_id".into(), serde_json::json!(client_id));
    data.insert("user_id".into(), serde_json::json!(entry.user_id));
    data.insert("name".into(), serde_json::json!(entry.name));
    data.insert("color".into(), serde_json::json!(entry.color));
    data.insert("cursor".into(), serde_json::to_value(entry.cursor).unwrap_or(serde_json::Value::Null));
    data.insert("editing".into(), serde_json::json!(entry.editing));
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_helpers;
    use tokio::sync::mpsc;

    async fn attach_client(state: &AppState, room_id: Uuid) -> (Uuid, mpsc::Receiver<Frame>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(16);
        let entry = test_helpers::dummy_presence(Uuid::new_v4());
        room::attach(state, room_id, client_id, entry, tx).await;
        (client_id, rx)
    }

    #[tokio::test]
    async fn patch_overwrites_only_present_fields() {
        let (state, _) = test_helpers::test_app_state();
        let room_id = test_helpers::seed_room(&state).await;
        let (client_id, _rx) = attach_client(&state, room_id).await;
        let editing = Uuid::new_v4();

        update(
            &state,
            room_id,
            client_id,
            PresencePatch { cursor: Some(Some(Cursor { x: 10.0, y: 20.0 })), editing: Some(Some(editing)) },
        )
        .await
        .unwrap();

        // Patch with only cursor: editing must survive.
        update(
            &state,
            room_id,
            client_id,
            PresencePatch { cursor: Some(Some(Cursor { x: 30.0, y: 40.0 })), editing: None },
        )
        .await
        .unwrap();

        let rooms = state.rooms.read().await;
        let rs = rooms[&room_id].state.lock().await;
        let entry = &rs.presence[&client_id];
        assert_eq!(entry.cursor, Some(Cursor { x: 30.0, y: 40.0 }));
        assert_eq!(entry.editing, Some(editing));
    }

    #[tokio::test]
    async fn explicit_null_clears_a_field() {
        let (state, _) = test_helpers::test_app_state();
        let room_id = test_helpers::seed_room(&state).await;
        let (client_id, _rx) = attach_client(&state, room_id).await;

        update(
            &state,
            room_id,
            client_id,
            PresencePatch { cursor: Some(Some(Cursor { x: 1.0, y: 2.0 })), editing: None },
        )
        .await
        .unwrap();
        update(&state, room_id, client_id, PresencePatch { cursor: Some(None), editing: None })
            .await
            .unwrap();

        let rooms = state.rooms.read().await;
        let rs = rooms[&room_id].state.lock().await;
        assert!(rs.presence[&client_id].cursor.is_none());
    }

    #[tokio::test]
    async fn update_never_mutates_another_connections_entry() {
        let (state, _) = test_helpers::test_app_state();
        let room_id = test_helpers::seed_room(&state).await;
        let (client_a, _rx_a) = attach_client(&state, room_id).await;
        let (client_b, _rx_b) = attach_client(&state, room_id).await;

        update(
            &state,
            room_id,
            client_a,
            PresencePatch { cursor: Some(Some(Cursor { x: 99.0, y: 99.0 })), editing: None },
        )
        .await
        .unwrap();

        let rooms = state.rooms.read().await;
        let rs = rooms[&room_id].state.lock().await;
        assert!(rs.presence[&client_b].cursor.is_none(), "B's entry must be untouched");
        assert_eq!(rs.presence[&client_a].cursor, Some(Cursor { x: 99.0, y: 99.0 }));
    }

    #[tokio::test]
    async fn peers_receive_relay_but_sender_does_not() {
        let (state, _) = test_helpers::test_app_state();
        let room_id = test_helpers::seed_room(&state).await;
        let (client_a, mut rx_a) = attach_client(&state, room_id).await;
        let (client_b, mut rx_b) = attach_client(&state, room_id).await;

        // Drain A's peer:joined for B.
        let joined = rx_a.recv().await.unwrap();
        assert_eq!(joined.syscall, "peer:joined");

        update(
            &state,
            room_id,
            client_b,
            PresencePatch { cursor: Some(Some(Cursor { x: 5.0, y: 6.0 })), editing: None },
        )
        .await
        .unwrap();

        let relayed = rx_a.recv().await.unwrap();
        assert_eq!(relayed.syscall, "presence:update");
        assert_eq!(
            relayed.data.get("client_id").and_then(|v| v.as_str()),
            Some(client_b.to_string().as_str())
        );
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), rx_b.recv())
                .await
                .is_err(),
            "sender must not receive its own presence echo"
        );
        let _ = client_a;
    }

    #[tokio::test]
    async fn update_without_attach_fails() {
        let (state, _) = test_helpers::test_app_state();
        let room_id = test_helpers::seed_room(&state).await;
        let result = update(&state, room_id, Uuid::new_v4(), PresencePatch::default()).await;
        assert!(matches!(result.unwrap_err(), PresenceError::NotAttached(_)));
    }
}
