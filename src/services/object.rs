//! Object mutations — insert, update, delete with per-field LWW merging.
//!
//! DESIGN
//! ======
//! Mutations are applied, revisioned, and fanned out to peers inside the
//! room's single critical section, so the apply and its broadcast are one
//! atomic unit and every connection observes the same total order. Conflict
//! policy is last-applied-wins per field: an update overwrites exactly the
//! `attrs` keys present in its patch and bumps the revision; concurrent
//! updates to disjoint fields both land. An update racing a delete loses
//! with `NotFound`, reported to its sender only.

use tracing::debug;
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services::room;
use crate::state::{AppState, CanvasObject};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("object not found: {0}")]
    NotFound(Uuid),
    #[error("object already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("room not loaded: {0}")]
    RoomNotLoaded(Uuid),
    #[error("malformed operation: {0}")]
    Malformed(String),
}

impl crate::frame::ErrorCode for MutationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::AlreadyExists(_) => "E_ALREADY_EXISTS",
            Self::RoomNotLoaded(_) => "E_ROOM_NOT_LOADED",
            Self::Malformed(_) => "E_MALFORMED",
        }
    }
}

/// One requested mutation of the shared object store.
#[derive(Debug)]
pub enum Mutation {
    /// Insert a new object. The id must be assigned before the object is
    /// visible to peers; when the client omits it the server generates one.
    Insert {
        id: Option<Uuid>,
        kind: String,
        attrs: serde_json::Value,
    },
    /// Merge `patch` into the object's attrs field-by-field.
    /// `expected_revision` is advisory: a mismatch is logged, never rejected.
    Update {
        id: Uuid,
        patch: serde_json::Map<String, serde_json::Value>,
        expected_revision: Option<i64>,
    },
    /// Remove the object entirely. No tombstone is retained.
    Delete { id: Uuid },
}

/// An accepted mutation, carrying the post-apply object for the sender's
/// reply. Peers already received the matching event during apply.
#[derive(Debug, Clone)]
pub enum Applied {
    Inserted(CanvasObject),
    Updated(CanvasObject),
    Deleted { id: Uuid },
}

impl Applied {
    /// Syscall and payload of the fan-out event for this mutation.
    #[must_use]
    pub fn to_event(&self) -> (&'static str, Data) {
        match self {
            Self::Inserted(obj) => ("object:insert", object_to_data(obj)),
            Self::Updated(obj) => ("object:update", object_to_data(obj)),
            Self::Deleted { id } => {
                let mut data = Data::new();
                data.insert("id".into(), serde_json::json!(id));
                ("object:delete", data)
            }
        }
    }
}

// =============================================================================
// APPLY
// =============================================================================

/// Apply one mutation to a room's object store.
///
/// Accepted mutations bump `mutation_seq`, mark the room dirty, and fan out
/// to all peers except the sender before the room lock is released.
/// Rejections never reach the broadcast path and never mutate state.
///
/// # Errors
///
/// `NotFound` when update/delete references a missing id (e.g. raced a
/// delete), `AlreadyExists` on insert id collision, `Malformed` on invalid
/// shape, `RoomNotLoaded` when the room has no live coordinator.
pub async fn apply(
    state: &AppState,
    room_id: Uuid,
    client_id: Uuid,
    user_id: Uuid,
    mutation: Mutation,
) -> Result<Applied, MutationError> {
    let room = state
        .rooms
        .read()
        .await
        .get(&room_id)
        .cloned()
        .ok_or(MutationError::RoomNotLoaded(room_id))?;
    let mut rs = room.state.lock().await;

    let applied = match mutation {
        Mutation::Insert { id, kind, attrs } => {
            if kind.is_empty() {
                return Err(MutationError::Malformed("kind required".into()));
            }
            if !attrs.is_object() {
                return Err(MutationError::Malformed("attrs must be a JSON object".into()));
            }
            let id = id.unwrap_or_else(Uuid::new_v4);
            if rs.objects.contains_key(&id) {
                return Err(MutationError::AlreadyExists(id));
            }
            let obj = CanvasObject { id, kind, attrs, updated_by: user_id, revision: 1 };
            rs.objects.insert(id, obj.clone());
            Applied::Inserted(obj)
        }
        Mutation::Update { id, patch, expected_revision } => {
            let obj = rs.objects.get_mut(&id).ok_or(MutationError::NotFound(id))?;
            if let Some(expected) = expected_revision {
                if expected != obj.revision {
                    debug!(%id, expected, current = obj.revision, "stale expected_revision; applying last-writer-wins");
                }
            }
            if let serde_json::Value::Object(attrs) = &mut obj.attrs {
                for (key, value) in patch {
                    attrs.insert(key, value);
                }
            }
            obj.revision += 1;
            obj.updated_by = user_id;
            Applied::Updated(obj.clone())
        }
        Mutation::Delete { id } => {
            if rs.objects.remove(&id).is_none() {
                return Err(MutationError::NotFound(id));
            }
            Applied::Deleted { id }
        }
    };

    rs.mutation_seq += 1;
    rs.dirty = true;

    let (syscall, data) = applied.to_event();
    let event = Frame::request(syscall, data)
        .with_room_id(room_id)
        .with_from(user_id.to_string());
    room::fanout(state, &mut rs, room_id, &event, Some(client_id));

    Ok(applied)
}

/// Flatten an object into frame payload form.
#[must_use]
pub fn object_to_data(obj: &CanvasObject) -> Data {
    let mut data = Data::new();
    data.insert("id".into(), serde_json::json!(obj.id));
    data.insert("kind".into(), serde_json::json!(obj.kind));
    data.insert("attrs".into(), obj.attrs.clone());
    data.insert("updated_by".into(), serde_json::json!(obj.updated_by));
    data.insert("revision".into(), serde_json::json!(obj.revision));
    data
}
