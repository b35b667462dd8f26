use super::*;
use crate::config::Config;
use crate::services::object::{self, Mutation};
use crate::services::snapshot::SnapshotStore;
use crate::state::test_helpers;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;

async fn recv_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("frame channel closed unexpectedly")
}

async fn assert_no_frame(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no frame"
    );
}

fn entry() -> PresenceEntry {
    test_helpers::dummy_presence(Uuid::new_v4())
}

#[tokio::test]
async fn attach_returns_snapshot_and_announces_peer() {
    let (state, _) = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room_with_objects(&state, vec![test_helpers::dummy_object()]).await;

    let client_a = Uuid::new_v4();
    let (tx_a, mut rx_a) = mpsc::channel(16);
    let outcome = attach(&state, room_id, client_a, entry(), tx_a).await;
    assert_eq!(outcome.objects.len(), 1);
    assert!(outcome.peers.is_empty());

    let client_b = Uuid::new_v4();
    let (tx_b, _rx_b) = mpsc::channel(16);
    let outcome = attach(&state, room_id, client_b, entry(), tx_b).await;
    assert_eq!(outcome.objects.len(), 1);
    assert_eq!(outcome.peers.len(), 1);
    assert_eq!(outcome.peers[0].0, client_a);

    let joined = recv_frame(&mut rx_a).await;
    assert_eq!(joined.syscall, "peer:joined");
    assert_eq!(
        joined.data.get("client_id").and_then(|v| v.as_str()),
        Some(client_b.to_string().as_str())
    );
}

#[tokio::test]
async fn first_attach_hydrates_from_snapshot_store() {
    let (state, snapshots) = test_helpers::test_app_state();
    let room_id = Uuid::new_v4();
    let obj = test_helpers::dummy_object();
    snapshots.save(room_id, &[obj.clone()]).await.unwrap();

    let (tx, _rx) = mpsc::channel(16);
    let outcome = attach(&state, room_id, Uuid::new_v4(), entry(), tx).await;
    assert_eq!(outcome.objects.len(), 1);
    assert_eq!(outcome.objects[0].id, obj.id);
}

#[tokio::test]
async fn emptied_room_is_not_rehydrated() {
    let (state, snapshots) = test_helpers::test_app_state();
    let room_id = Uuid::new_v4();
    let obj = test_helpers::dummy_object();
    snapshots.save(room_id, &[obj.clone()]).await.unwrap();

    let client_a = Uuid::new_v4();
    let (tx, _rx) = mpsc::channel(16);
    attach(&state, room_id, client_a, entry(), tx).await;
    object::apply(&state, room_id, client_a, Uuid::new_v4(), Mutation::Delete { id: obj.id })
        .await
        .unwrap();

    // A second attach must see the emptied store, not the stale snapshot.
    let (tx_b, _rx_b) = mpsc::channel(16);
    let outcome = attach(&state, room_id, Uuid::new_v4(), entry(), tx_b).await;
    assert!(outcome.objects.is_empty());
}

#[tokio::test]
async fn detach_is_idempotent_and_leak_free() {
    let (state, _) = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state).await;

    let client_a = Uuid::new_v4();
    let (tx_a, mut rx_a) = mpsc::channel(16);
    attach(&state, room_id, client_a, entry(), tx_a).await;
    let client_b = Uuid::new_v4();
    let (tx_b, _rx_b) = mpsc::channel(16);
    attach(&state, room_id, client_b, entry(), tx_b).await;
    recv_frame(&mut rx_a).await; // peer:joined for B

    assert!(detach(&state, room_id, client_b).await);
    assert!(!detach(&state, room_id, client_b).await, "double detach must be a no-op");

    let left = recv_frame(&mut rx_a).await;
    assert_eq!(left.syscall, "peer:left");
    assert_no_frame(&mut rx_a).await;

    let rooms = state.rooms.read().await;
    let rs = rooms[&room_id].state.lock().await;
    assert!(!rs.presence.contains_key(&client_b));
    assert!(!rs.clients.contains_key(&client_b));
}

#[tokio::test]
async fn all_connections_observe_mutations_in_the_same_total_order() {
    let (state, _) = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state).await;

    // Two observers with roomy queues.
    let obs_a = Uuid::new_v4();
    let (tx_a, mut rx_a) = mpsc::channel(512);
    attach(&state, room_id, obs_a, entry(), tx_a).await;
    let obs_b = Uuid::new_v4();
    let (tx_b, mut rx_b) = mpsc::channel(512);
    attach(&state, room_id, obs_b, entry(), tx_b).await;
    recv_frame(&mut rx_a).await; // peer:joined for B

    // Two writers mutating the same object concurrently.
    let obj = object::apply(
        &state,
        room_id,
        Uuid::new_v4(),
        Uuid::new_v4(),
        Mutation::Insert { id: None, kind: "rect".into(), attrs: json!({}) },
    )
    .await
    .unwrap();
    let object::Applied::Inserted(obj) = obj else { panic!("expected insert") };

    let mut writers = Vec::new();
    for _ in 0..2 {
        let state = state.clone();
        let object_id = obj.id;
        writers.push(tokio::spawn(async move {
            let writer = Uuid::new_v4();
            for i in 0..25 {
                object::apply(
                    &state,
                    room_id,
                    writer,
                    writer,
                    Mutation::Update {
                        id: object_id,
                        patch: [("x".to_string(), json!(i))].into_iter().collect(),
                        expected_revision: None,
                    },
                )
                .await
                .unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    // 1 insert + 50 updates, observed identically by both connections.
    let mut order_a = Vec::new();
    let mut order_b = Vec::new();
    for _ in 0..51 {
        let frame = recv_frame(&mut rx_a).await;
        order_a.push(frame.data.get("revision").cloned());
        let frame = recv_frame(&mut rx_b).await;
        order_b.push(frame.data.get("revision").cloned());
    }
    assert_eq!(order_a, order_b);

    // Revision monotonicity: every accepted update strictly increased it.
    let revisions: Vec<i64> = order_a
        .iter()
        .map(|v| v.as_ref().and_then(serde_json::Value::as_i64).unwrap())
        .collect();
    for pair in revisions.windows(2) {
        assert!(pair[1] > pair[0], "revisions must strictly increase: {revisions:?}");
    }
    assert_eq!(*revisions.last().unwrap(), 51);
}

#[tokio::test]
async fn stalled_connection_is_evicted_on_queue_overflow() {
    let (state, _) = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state).await;

    // Stalled observer: queue of 1, never drained.
    let stalled = Uuid::new_v4();
    let (tx_stalled, rx_stalled) = mpsc::channel(1);
    attach(&state, room_id, stalled, entry(), tx_stalled).await;

    let healthy = Uuid::new_v4();
    let (tx_healthy, mut rx_healthy) = mpsc::channel(64);
    attach(&state, room_id, healthy, entry(), tx_healthy).await;

    // First event fills the stalled queue, second overflows it.
    let writer = Uuid::new_v4();
    for i in 0..3 {
        object::apply(
            &state,
            room_id,
            writer,
            writer,
            Mutation::Insert { id: None, kind: "rect".into(), attrs: json!({"n": i}) },
        )
        .await
        .unwrap();
    }

    {
        let rooms = state.rooms.read().await;
        let rs = rooms[&room_id].state.lock().await;
        assert!(!rs.clients.contains_key(&stalled), "stalled client must be evicted");
        assert!(!rs.presence.contains_key(&stalled), "evicted presence must be removed");
        assert!(rs.clients.contains_key(&healthy));
    }

    // The healthy peer saw the inserts and then the eviction notice.
    let mut saw_peer_left = false;
    for _ in 0..4 {
        let frame = recv_frame(&mut rx_healthy).await;
        if frame.syscall == "peer:left" {
            saw_peer_left = true;
            assert_eq!(
                frame.data.get("client_id").and_then(|v| v.as_str()),
                Some(stalled.to_string().as_str())
            );
        }
    }
    assert!(saw_peer_left);

    // A detach from the evicted client's gateway is a clean no-op.
    assert!(!detach(&state, room_id, stalled).await);
    drop(rx_stalled);

    // Rejoining resynchronizes with a fresh snapshot of everything missed.
    let (tx_again, _rx_again) = mpsc::channel(64);
    let outcome = attach(&state, room_id, Uuid::new_v4(), entry(), tx_again).await;
    assert_eq!(outcome.objects.len(), 3);
}

#[tokio::test]
async fn idle_room_is_retired_with_exactly_one_final_save() {
    let config = Config { idle_grace_ms: 50, snapshot_interval_ms: 3_600_000, ..Config::default() };
    let (state, snapshots) = test_helpers::test_app_state_with_config(config);
    let room_id = Uuid::new_v4();

    let client_id = Uuid::new_v4();
    let (tx, _rx) = mpsc::channel(16);
    attach(&state, room_id, client_id, entry(), tx).await;
    let applied = object::apply(
        &state,
        room_id,
        client_id,
        Uuid::new_v4(),
        Mutation::Insert { id: None, kind: "rect".into(), attrs: json!({}) },
    )
    .await
    .unwrap();
    let object::Applied::Inserted(obj) = applied else { panic!("expected insert") };

    detach(&state, room_id, client_id).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(snapshots.save_count(), 1, "retirement must save exactly once");
    assert_eq!(snapshots.saved_for(room_id).unwrap().len(), 1);
    assert!(!state.rooms.read().await.contains_key(&room_id), "room must be retired");

    // A later attach recreates the room from the saved snapshot.
    let (tx_again, _rx_again) = mpsc::channel(16);
    let outcome = attach(&state, room_id, Uuid::new_v4(), entry(), tx_again).await;
    assert_eq!(outcome.objects.len(), 1);
    assert_eq!(outcome.objects[0].id, obj.id);
}

#[tokio::test]
async fn attach_during_grace_period_cancels_retirement() {
    let config = Config { idle_grace_ms: 100, snapshot_interval_ms: 3_600_000, ..Config::default() };
    let (state, _) = test_helpers::test_app_state_with_config(config);
    let room_id = test_helpers::seed_room(&state).await;

    let client_a = Uuid::new_v4();
    let (tx_a, _rx_a) = mpsc::channel(16);
    attach(&state, room_id, client_a, entry(), tx_a).await;
    detach(&state, room_id, client_a).await;

    // Reattach before the grace period elapses.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let (tx_b, _rx_b) = mpsc::channel(16);
    attach(&state, room_id, Uuid::new_v4(), entry(), tx_b).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        state.rooms.read().await.contains_key(&room_id),
        "room with a live client must not be retired"
    );
}

#[tokio::test]
async fn retirement_save_failure_retains_room_for_retry() {
    let config = Config {
        idle_grace_ms: 40,
        snapshot_retries: 1,
        snapshot_retry_base_ms: 1,
        snapshot_interval_ms: 3_600_000,
        ..Config::default()
    };
    let (state, snapshots) = test_helpers::test_app_state_with_config(config);
    let room_id = Uuid::new_v4();

    let client_id = Uuid::new_v4();
    let (tx, _rx) = mpsc::channel(16);
    attach(&state, room_id, client_id, entry(), tx).await;
    object::apply(
        &state,
        room_id,
        client_id,
        Uuid::new_v4(),
        Mutation::Insert { id: None, kind: "rect".into(), attrs: json!({}) },
    )
    .await
    .unwrap();

    snapshots.fail_next_saves(1);
    detach(&state, room_id, client_id).await;

    // First expiry fails to save; the room must survive the attempt.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(state.rooms.read().await.contains_key(&room_id));

    // The re-armed timer succeeds on the next cycle.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!state.rooms.read().await.contains_key(&room_id));
    assert_eq!(snapshots.save_count(), 1);
}

#[tokio::test]
async fn attach_racing_retirement_lands_in_a_live_room() {
    let (state, _) = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state).await;
    let room = state.rooms.read().await[&room_id].clone();

    // Hold the room lock so the attach below fetches its handle and then
    // queues on the mutex.
    let mut guard = room.state.lock().await;

    let client_id = Uuid::new_v4();
    let attach_task = {
        let state = state.clone();
        tokio::spawn(async move {
            let (tx, rx) = mpsc::channel(16);
            let outcome = attach(&state, room_id, client_id, entry(), tx).await;
            (outcome, rx)
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Retirement's final critical section: mark the handle stale, then pull
    // the room from the registry, then let the queued attach proceed.
    guard.retired = true;
    state.rooms.write().await.remove(&room_id);
    drop(guard);

    let (outcome, _rx) = attach_task.await.unwrap();
    assert!(outcome.objects.is_empty());

    // The attach must have landed in a freshly registered room, not the
    // deregistered one.
    {
        let rooms = state.rooms.read().await;
        let live = rooms.get(&room_id).expect("room must be re-registered");
        let rs = live.state.lock().await;
        assert!(!rs.retired);
        assert!(rs.clients.contains_key(&client_id));
        assert!(rs.presence.contains_key(&client_id));
    }

    // Mutations from the joined client resolve the room through the registry.
    object::apply(
        &state,
        room_id,
        client_id,
        Uuid::new_v4(),
        Mutation::Insert { id: None, kind: "rect".into(), attrs: json!({}) },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn eviction_relay_overflow_cascades_in_the_same_pass() {
    let (state, _) = test_helpers::test_app_state();
    let room_id = test_helpers::seed_room(&state).await;

    let healthy = Uuid::new_v4();
    let (tx_healthy, mut rx_healthy) = mpsc::channel(64);
    attach(&state, room_id, healthy, entry(), tx_healthy).await;

    // stalled_b's queue fills with stalled_a's join announcement;
    // stalled_a's queue has room for exactly one more frame.
    let stalled_b = Uuid::new_v4();
    let (tx_b, _rx_b) = mpsc::channel(1);
    attach(&state, room_id, stalled_b, entry(), tx_b).await;
    let stalled_a = Uuid::new_v4();
    let (tx_a, _rx_a) = mpsc::channel(1);
    attach(&state, room_id, stalled_a, entry(), tx_a).await;

    // One mutation: stalled_b overflows and is evicted; the peer:left relay
    // overflows stalled_a, which must be evicted in the same pass.
    object::apply(
        &state,
        room_id,
        Uuid::new_v4(),
        Uuid::new_v4(),
        Mutation::Insert { id: None, kind: "rect".into(), attrs: json!({}) },
    )
    .await
    .unwrap();

    {
        let rooms = state.rooms.read().await;
        let rs = rooms[&room_id].state.lock().await;
        assert!(!rs.clients.contains_key(&stalled_b));
        assert!(
            !rs.clients.contains_key(&stalled_a),
            "secondary overflow must evict in the same pass, not on the next fan-out"
        );
        assert!(rs.clients.contains_key(&healthy));
        assert_eq!(rs.presence.len(), 1);
    }

    // The healthy peer observed both departures.
    let mut syscalls = Vec::new();
    for _ in 0..5 {
        syscalls.push(recv_frame(&mut rx_healthy).await.syscall);
    }
    assert_eq!(syscalls.iter().filter(|s| *s == "peer:left").count(), 2);
}

#[tokio::test]
async fn clean_room_retires_without_saving() {
    let config = Config { idle_grace_ms: 40, snapshot_interval_ms: 3_600_000, ..Config::default() };
    let (state, snapshots) = test_helpers::test_app_state_with_config(config);
    let room_id = Uuid::new_v4();

    let client_id = Uuid::new_v4();
    let (tx, _rx) = mpsc::channel(16);
    attach(&state, room_id, client_id, entry(), tx).await;
    detach(&state, room_id, client_id).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!state.rooms.read().await.contains_key(&room_id));
    assert_eq!(snapshots.save_count(), 0, "nothing changed, nothing to save");
}
