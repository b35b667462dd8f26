//! Snapshot bridge — the durable-storage collaborator boundary.
//!
//! DESIGN
//! ======
//! The engine only ever needs two calls: load a room's objects at creation
//! and save the full object set on a schedule and at retirement. A background
//! task walks the registry every `snapshot_interval_ms`, clones the objects
//! of dirty rooms under their lock, and writes outside all locks so client
//! traffic never waits on storage I/O.
//!
//! ERROR HANDLING
//! ==============
//! Saves retry with linear back-off. The dirty flag is cleared only after a
//! successful save whose captured `mutation_seq` is still current — repeated
//! saves are acceptable, silently losing edits is not. Load failures fall
//! back to an empty room rather than refusing the attach.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::state::{AppState, CanvasObject};

#[derive(Debug, thiserror::Error)]
#[error("snapshot store: {0}")]
pub struct SnapshotError(pub String);

impl From<sqlx::Error> for SnapshotError {
    fn from(e: sqlx::Error) -> Self {
        Self(e.to_string())
    }
}

/// External collaborator boundary for snapshot durability. The storage
/// format is the collaborator's business; presence state never crosses this
/// boundary by construction — the signatures only speak objects.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the object set for a room. An unknown room yields an empty set.
    async fn load(&self, room_id: Uuid) -> Result<Vec<CanvasObject>, SnapshotError>;

    /// Replace the stored object set for a room.
    async fn save(&self, room_id: Uuid, objects: &[CanvasObject]) -> Result<(), SnapshotError>;
}

// =============================================================================
// POSTGRES IMPLEMENTATION
// =============================================================================

/// Snapshot store backed by the `canvas_objects` table.
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn load(&self, room_id: Uuid) -> Result<Vec<CanvasObject>, SnapshotError> {
        let rows = sqlx::query_as::<_, (Uuid, String, serde_json::Value, Uuid, i64)>(
            "SELECT id, kind, attrs, updated_by, revision FROM canvas_objects WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, kind, attrs, updated_by, revision)| CanvasObject { id, kind, attrs, updated_by, revision })
            .collect())
    }

    async fn save(&self, room_id: Uuid, objects: &[CanvasObject]) -> Result<(), SnapshotError> {
        // Whole-room replace in one transaction so a reader never observes a
        // half-written snapshot.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM canvas_objects WHERE room_id = $1")
            .bind(room_id)
            .execute(tx.as_mut())
            .await?;
        for obj in objects {
            sqlx::query(
                "INSERT INTO canvas_objects (id, room_id, kind, attrs, updated_by, revision, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, now())",
            )
            .bind(obj.id)
            .bind(room_id)
            .bind(&obj.kind)
            .bind(&obj.attrs)
            .bind(obj.updated_by)
            .bind(obj.revision)
            .execute(tx.as_mut())
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

// =============================================================================
// BACKGROUND SAVE TASK
// =============================================================================

/// Spawn the periodic snapshot save task. Returns a handle for shutdown.
pub fn spawn_snapshot_task(state: AppState) -> JoinHandle<()> {
    let interval_ms = state.config.snapshot_interval_ms;
    info!(interval_ms, "snapshot save task configured");
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            flush_dirty_rooms(&state).await;
        }
    })
}

/// Save every dirty room, clearing dirty flags only for rooms whose state
/// did not change while the save was in flight.
async fn flush_dirty_rooms(state: &AppState) {
    let handles: Vec<_> = state.rooms.read().await.values().cloned().collect();

    for room in handles {
        let (objects, seq) = {
            let rs = room.state.lock().await;
            if !rs.dirty {
                continue;
            }
            (rs.objects.values().cloned().collect::<Vec<_>>(), rs.mutation_seq)
        };

        if save_with_retry(state, room.id, &objects).await {
            let mut rs = room.state.lock().await;
            // EDGE: keep the dirty flag if a mutation landed after snapshot.
            if rs.mutation_seq == seq {
                rs.dirty = false;
            }
        }
    }
}

/// Attempt a snapshot save with linear back-off. Returns true on success.
pub(crate) async fn save_with_retry(state: &AppState, room_id: Uuid, objects: &[CanvasObject]) -> bool {
    let retries = state.config.snapshot_retries.max(1);
    for attempt in 1..=retries {
        match state.snapshots.save(room_id, objects).await {
            Ok(()) => return true,
            Err(e) if attempt < retries => {
                warn!(error = %e, %room_id, attempt, total = retries, "snapshot save failed; retrying");
                tokio::time::sleep(Duration::from_millis(attempt as u64 * state.config.snapshot_retry_base_ms)).await;
            }
            Err(e) => {
                error!(error = %e, %room_id, count = objects.len(), "snapshot save failed after retries");
            }
        }
    }
    false
}

#[cfg(test)]
pub(crate) async fn flush_dirty_rooms_for_tests(state: &AppState) {
    flush_dirty_rooms(state).await;
}
