//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the process-wide room registry plus the two external collaborators
//! (snapshot store, identity verifier) behind trait objects. Each room is an
//! `Arc<Room>` whose entire mutable state sits behind one `Mutex` — that
//! mutex is the serialization point that gives a room its total event order.
//! Rooms never share mutable state, so they run fully in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

use crate::config::Config;
use crate::frame::Frame;
use crate::services::identity::IdentityVerifier;
use crate::services::snapshot::SnapshotStore;

// =============================================================================
// CANVAS OBJECT
// =============================================================================

/// One addressable element on the shared whiteboard.
///
/// `attrs` is an opaque JSON object — the engine revisions and replicates it
/// without ever interpreting its contents. `revision` strictly increases per
/// accepted write and is the sole tie-break authority for concurrent edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasObject {
    pub id: Uuid,
    pub kind: String,
    pub attrs: serde_json::Value,
    pub updated_by: Uuid,
    pub revision: i64,
}

// =============================================================================
// PRESENCE
// =============================================================================

/// Cursor position on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
}

/// Ephemeral per-connection state: never persisted, created on attach,
/// patched only by its owning connection, deleted on detach.
#[derive(Debug, Clone, Serialize)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub name: String,
    /// Assigned at connect from a fixed palette; stable for the session.
    pub color: String,
    /// Absent when the cursor is outside the canvas or the client is idle.
    pub cursor: Option<Cursor>,
    /// Object id the connection is actively text-editing, if any.
    pub editing: Option<Uuid>,
}

// =============================================================================
// ROOM
// =============================================================================

/// Per-room mutable state. Everything here is guarded by `Room::state`, so
/// a lock holder may mutate freely; fan-out uses non-blocking `try_send` and
/// therefore stays inside the critical section without unbounded stalls.
pub struct RoomState {
    /// Authoritative object store keyed by object id.
    pub objects: HashMap<Uuid, CanvasObject>,
    /// Presence table: one entry per attached connection.
    pub presence: HashMap<Uuid, PresenceEntry>,
    /// Attached connections: `client_id` -> bounded outbound frame queue.
    pub clients: HashMap<Uuid, mpsc::Sender<Frame>>,
    /// Set once the snapshot bridge seeded this room. Guards against
    /// re-seeding a room that was legitimately emptied by deletes.
    pub hydrated: bool,
    /// True when the store changed since the last successful snapshot save.
    pub dirty: bool,
    /// Bumped on every accepted mutation; snapshot saves ack against it so a
    /// save that raced a newer write does not clear the dirty flag.
    pub mutation_seq: u64,
    /// Bumped on every attach and on last-detach; a pending retirement timer
    /// only fires if the epoch it captured is still current.
    pub retire_epoch: u64,
    /// Set in retirement's final critical section, just before the room is
    /// removed from the registry. A handle observed with this flag is stale
    /// and must be re-fetched through the registry.
    pub retired: bool,
}

impl RoomState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            presence: HashMap::new(),
            clients: HashMap::new(),
            hydrated: false,
            dirty: false,
            mutation_seq: 0,
            retire_epoch: 0,
            retired: false,
        }
    }
}

impl Default for RoomState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one live room: its id plus the single serialization point.
pub struct Room {
    pub id: Uuid,
    pub state: Mutex<RoomState>,
}

impl Room {
    #[must_use]
    pub fn new(id: Uuid) -> Self {
        Self { id, state: Mutex::new(RoomState::new()) }
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum — all inner fields are Arc-wrapped or Copy.
#[derive(Clone)]
pub struct AppState {
    /// Process-wide registry: room id -> live coordinator handle.
    /// Create-on-miss at attach, removed at retirement.
    pub rooms: Arc<RwLock<HashMap<Uuid, Arc<Room>>>>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub config: Config,
}

impl AppState {
    #[must_use]
    pub fn new(snapshots: Arc<dyn SnapshotStore>, verifier: Arc<dyn IdentityVerifier>, config: Config) -> Self {
        Self { rooms: Arc::new(RwLock::new(HashMap::new())), snapshots, verifier, config }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_state_new_is_empty() {
        let rs = RoomState::new();
        assert!(rs.objects.is_empty());
        assert!(rs.presence.is_empty());
        assert!(rs.clients.is_empty());
        assert!(!rs.hydrated);
        assert!(!rs.dirty);
        assert!(!rs.retired);
        assert_eq!(rs.mutation_seq, 0);
    }

    #[test]
    fn canvas_object_serde_round_trip() {
        let obj = test_helpers::dummy_object();
        let json = serde_json::to_string(&obj).unwrap();
        let restored: CanvasObject = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.id, obj.id);
        assert_eq!(restored.kind, "rect");
        assert_eq!(restored.revision, 1);
        assert_eq!(restored.attrs, obj.attrs);
    }

    #[test]
    fn presence_entry_serializes_nullable_fields() {
        let entry = test_helpers::dummy_presence(Uuid::new_v4());
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("cursor").unwrap().is_null());
        assert!(json.get("editing").unwrap().is_null());
        assert_eq!(json.get("color").unwrap().as_str(), Some("#64B5F6"));
    }
}
