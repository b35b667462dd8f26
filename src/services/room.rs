//! Room coordinator — attach/detach, fan-out, and lifecycle.
//!
//! DESIGN
//! ======
//! Each room's state lives behind a single `Mutex`; every attach, detach,
//! mutation, and presence patch runs inside that critical section, which is
//! what gives one room a total order of events without any consensus
//! machinery. Fan-out also happens under the lock with non-blocking
//! `try_send`, so every attached connection's queue observes the identical
//! relative order of object-store events.
//!
//! LIFECYCLE
//! =========
//! First attach creates the room and hydrates it once from the snapshot
//! bridge (load runs outside all locks). Last detach arms a retirement timer
//! carrying the current `retire_epoch`; any attach bumps the epoch and the
//! stale timer aborts. At expiry the final snapshot is saved and the room is
//! removed from the registry.
//!
//! ERROR HANDLING
//! ==============
//! A full outbound queue evicts that connection on the spot: its sender is
//! dropped, the gateway loop ends on the closed channel, and the client must
//! rejoin for a fresh snapshot. Backpressure never reaches the coordinator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::frame::Frame;
use crate::services::presence::presence_to_data;
use crate::services::snapshot;
use crate::state::{AppState, CanvasObject, PresenceEntry, Room, RoomState};

// =============================================================================
// ATTACH / DETACH
// =============================================================================

/// State handed to a freshly attached connection: the full object snapshot
/// and the presence of everyone already in the room.
pub struct AttachOutcome {
    pub objects: Vec<CanvasObject>,
    pub peers: Vec<(Uuid, PresenceEntry)>,
}

/// Attach a connection to a room, creating the room on first join.
///
/// Inserts the presence entry, announces `peer:joined` to everyone else, and
/// returns a full copy of the current object store so the new client renders
/// immediately. Cancels any pending retirement. Never waits on another
/// client's I/O.
pub async fn attach(
    state: &AppState,
    room_id: Uuid,
    client_id: Uuid,
    entry: PresenceEntry,
    tx: mpsc::Sender<Frame>,
) -> AttachOutcome {
    loop {
        let room = room_handle(state, room_id).await;
        let mut rs = room.state.lock().await;

        // Retirement can deregister the room while this attach is queued on
        // its lock. The flag marks the handle stale; retry through the
        // registry, which no longer contains it, and create a fresh room.
        if rs.retired {
            continue;
        }

        // Any pending retirement timer captured an older epoch and will abort.
        rs.retire_epoch += 1;

        let objects: Vec<CanvasObject> = rs.objects.values().cloned().collect();
        let peers: Vec<(Uuid, PresenceEntry)> = rs.presence.iter().map(|(id, e)| (*id, e.clone())).collect();

        let joined = Frame::request("peer:joined", presence_to_data(client_id, &entry))
            .with_room_id(room_id)
            .with_from(entry.user_id.to_string());
        rs.clients.insert(client_id, tx);
        rs.presence.insert(client_id, entry);
        fanout(state, &mut rs, room_id, &joined, Some(client_id));

        info!(%room_id, %client_id, clients = rs.clients.len(), "client attached");
        return AttachOutcome { objects, peers };
    }
}

/// Detach a connection from a room. Idempotent: a connection that was
/// already evicted or detached is a no-op and produces no second
/// `peer:left`. Returns whether anything was removed.
pub async fn detach(state: &AppState, room_id: Uuid, client_id: Uuid) -> bool {
    let Some(room) = state.rooms.read().await.get(&room_id).cloned() else {
        return false;
    };
    let mut rs = room.state.lock().await;

    let had_client = rs.clients.remove(&client_id).is_some();
    let removed_presence = rs.presence.remove(&client_id);
    if !had_client && removed_presence.is_none() {
        return false;
    }

    let left = peer_left_frame(room_id, client_id, removed_presence.map(|e| e.user_id));
    fanout(state, &mut rs, room_id, &left, Some(client_id));
    info!(%room_id, %client_id, remaining = rs.clients.len(), "client detached");

    if rs.clients.is_empty() {
        arm_retirement(state, &mut rs, room_id);
    }
    true
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Get the live handle for a room, creating and hydrating it on first use.
///
/// The snapshot load runs outside all locks; if two attaches race, one seeds
/// the room and the other's load is discarded. Load failure degrades to an
/// empty room rather than refusing the attach.
pub async fn room_handle(state: &AppState, room_id: Uuid) -> Arc<Room> {
    if let Some(room) = state.rooms.read().await.get(&room_id) {
        return room.clone();
    }

    let loaded = match state.snapshots.load(room_id).await {
        Ok(objects) => objects,
        Err(e) => {
            warn!(error = %e, %room_id, "snapshot load failed; starting with empty room");
            Vec::new()
        }
    };

    let room = {
        let mut rooms = state.rooms.write().await;
        rooms
            .entry(room_id)
            .or_insert_with(|| Arc::new(Room::new(room_id)))
            .clone()
    };

    let mut rs = room.state.lock().await;
    if !rs.hydrated {
        for obj in loaded {
            rs.objects.insert(obj.id, obj);
        }
        rs.hydrated = true;
        info!(%room_id, count = rs.objects.len(), "room hydrated from snapshot store");
    }
    drop(rs);
    room
}

// =============================================================================
// FAN-OUT
// =============================================================================

/// Deliver a frame to every attached connection except `exclude`.
///
/// Runs inside the caller's critical section so all queues see the same
/// relative order. `try_send` keeps the section bounded: a full queue means
/// that connection is too slow and gets evicted rather than stalling peers.
pub(crate) fn fanout(state: &AppState, rs: &mut RoomState, room_id: Uuid, frame: &Frame, exclude: Option<Uuid>) {
    let mut overflowed: Vec<Uuid> = Vec::new();
    for (client_id, tx) in &rs.clients {
        if exclude == Some(*client_id) {
            continue;
        }
        match tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(*client_id),
            // Closed means the gateway loop already ended; detach will reap it.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    // Evicting one client relays a peer:left that can itself overflow
    // another stalled queue; cascade until the pass leaves no full queue
    // behind. Terminates because every eviction shrinks the client set.
    while let Some(client_id) = overflowed.pop() {
        overflowed.extend(evict(state, rs, room_id, client_id));
    }
}

/// Force-detach a connection whose outbound queue overflowed. Dropping its
/// sender closes the gateway's receive loop; the client must rejoin and
/// resynchronize via a fresh attach snapshot. Returns the peers whose
/// queues overflowed while the eviction notice was relayed.
fn evict(state: &AppState, rs: &mut RoomState, room_id: Uuid, client_id: Uuid) -> Vec<Uuid> {
    let had_client = rs.clients.remove(&client_id).is_some();
    let removed_presence = rs.presence.remove(&client_id);
    if !had_client && removed_presence.is_none() {
        return Vec::new();
    }
    warn!(%room_id, %client_id, "outbound queue overflow; connection evicted");

    let left = peer_left_frame(room_id, client_id, removed_presence.map(|e| e.user_id));
    let mut overflowed = Vec::new();
    for (peer_id, tx) in &rs.clients {
        match tx.try_send(left.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => overflowed.push(*peer_id),
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    if rs.clients.is_empty() {
        arm_retirement(state, rs, room_id);
    }
    overflowed
}

fn peer_left_frame(room_id: Uuid, client_id: Uuid, user_id: Option<Uuid>) -> Frame {
    let mut frame = Frame::request("peer:left", crate::frame::Data::new())
        .with_room_id(room_id)
        .with_data("client_id", client_id.to_string());
    if let Some(user_id) = user_id {
        frame = frame.with_data("user_id", user_id.to_string()).with_from(user_id.to_string());
    }
    frame
}

// =============================================================================
// RETIREMENT
// =============================================================================

/// Arm the idle retirement timer for an empty room. The epoch captured here
/// is invalidated by any later attach.
fn arm_retirement(state: &AppState, rs: &mut RoomState, room_id: Uuid) {
    rs.retire_epoch += 1;
    let epoch = rs.retire_epoch;
    info!(%room_id, grace_ms = state.config.idle_grace_ms, "room empty; retirement armed");
    tokio::spawn(retire(state.clone(), room_id, epoch));
}

/// Retirement task: after the grace period, flush the final snapshot and
/// remove the room from the registry. Aborts silently if anyone attached in
/// the meantime. On save failure the room is retained dirty and the timer
/// re-arms for another grace period.
async fn retire(state: AppState, room_id: Uuid, epoch: u64) {
    let grace = Duration::from_millis(state.config.idle_grace_ms);
    loop {
        tokio::time::sleep(grace).await;

        let Some(room) = state.rooms.read().await.get(&room_id).cloned() else {
            return;
        };
        let (objects, seq, dirty) = {
            let rs = room.state.lock().await;
            if rs.retire_epoch != epoch || !rs.clients.is_empty() {
                return;
            }
            (rs.objects.values().cloned().collect::<Vec<_>>(), rs.mutation_seq, rs.dirty)
        };

        if dirty && !snapshot::save_with_retry(&state, room_id, &objects).await {
            warn!(%room_id, "final snapshot flush failed; room retained for retry");
            continue;
        }

        let mut rooms = state.rooms.write().await;
        {
            let mut rs = room.state.lock().await;
            if rs.retire_epoch != epoch || !rs.clients.is_empty() || rs.mutation_seq != seq {
                return;
            }
            rs.dirty = false;
            // An attach already queued on this lock will see the flag and
            // retry through the registry instead of joining a removed room.
            rs.retired = true;
        }
        rooms.remove(&room_id);
        info!(%room_id, "room retired");
        return;
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
