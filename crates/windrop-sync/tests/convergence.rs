//! End-to-end sync scenarios over the in-memory transport
//!
//! These drive whole engines against each other: real tickers, real
//! outbox backoff, real jitter. Timings stay generous so slow CI does
//! not flake them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;

use windrop_core::{
    ContentId, ControlMsg, FileEntry, Manifest, MemoryBroker, PeerId, RoomId, RoomTransport,
    Topic, TransportEvent,
};
use windrop_sync::{JoinOptions, SyncEngine};

fn room() -> RoomId {
    RoomId::from("abcdef0123456789")
}

fn two_file_manifest() -> Manifest {
    Manifest::new(
        vec![
            FileEntry::new("a.txt", Some(7), ContentId::from("bafy-c1")),
            FileEntry::new("b.txt", Some(7), ContentId::from("bafy-c2")),
        ],
        Some(1_700_000_000_000),
    )
}

/// Poll until `check` passes or the deadline expires.
async fn wait_for<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn host_with_two_files_syncs_one_joiner() {
    let broker = MemoryBroker::new();
    let host = SyncEngine::new(Arc::new(broker.endpoint("peer-host")));
    let host_room = host.join(room(), JoinOptions::new()).await.unwrap();
    host_room.set_manifest(&two_file_manifest()).await.unwrap();

    let manifest_fires = Arc::new(AtomicUsize::new(0));
    let fires = Arc::clone(&manifest_fires);
    let joiner = SyncEngine::new(Arc::new(broker.endpoint("peer-join")));
    let joiner_room = joiner
        .join(
            room(),
            JoinOptions::new().on_manifest_update(Box::new(move |_| {
                fires.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await
        .unwrap();

    wait_for("joiner to converge on the manifest", Duration::from_secs(10), || {
        let joiner_room = Arc::clone(&joiner_room);
        async move { joiner_room.manifest().await.unwrap() == two_file_manifest() }
    })
    .await;

    // Let any stray handshake traffic settle, then compare replicas.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(joiner_room.heads().await, host_room.heads().await);
    // Once on the initial empty state, once on the applied snapshot.
    assert_eq!(manifest_fires.load(Ordering::SeqCst), 2);

    host.shutdown().await;
    joiner.shutdown().await;
}

#[tokio::test]
async fn bidirectional_chat_converges_in_one_order() {
    let broker = MemoryBroker::new();
    let engine_a = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
    let engine_b = SyncEngine::new(Arc::new(broker.endpoint("peer-b")));
    let room_a = engine_a.join(room(), JoinOptions::new()).await.unwrap();
    let room_b = engine_b.join(room(), JoinOptions::new()).await.unwrap();

    room_a.send_chat("hello from p1").await.unwrap();
    room_b.send_chat("hello from p2").await.unwrap();

    wait_for("both peers to hold both messages", Duration::from_secs(10), || {
        let (room_a, room_b) = (Arc::clone(&room_a), Arc::clone(&room_b));
        async move {
            room_a.chat_messages().await.unwrap().len() == 2
                && room_b.chat_messages().await.unwrap().len() == 2
        }
    })
    .await;

    let chat_a = room_a.chat_messages().await.unwrap();
    let chat_b = room_b.chat_messages().await.unwrap();
    assert_eq!(chat_a, chat_b, "total order must agree");
    let texts: Vec<&str> = chat_a.iter().map(|m| m.text.as_str()).collect();
    assert!(texts.contains(&"hello from p1"));
    assert!(texts.contains(&"hello from p2"));

    engine_a.shutdown().await;
    engine_b.shutdown().await;
}

#[tokio::test]
async fn outbox_drains_to_late_joiner_in_order() {
    let broker = MemoryBroker::new();
    let engine_a = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
    let room_a = engine_a.join(room(), JoinOptions::new()).await.unwrap();

    // Alone in the room: every publish lands in the outbox.
    let m1 = room_a.send_chat("m1").await.unwrap();
    let m2 = room_a.send_chat("m2").await.unwrap();
    let m3 = room_a.send_chat("m3").await.unwrap();

    let engine_b = SyncEngine::new(Arc::new(broker.endpoint("peer-b")));
    let room_b = engine_b.join(room(), JoinOptions::new()).await.unwrap();

    wait_for("the queue to drain to the joiner", Duration::from_secs(8), || {
        let room_b = Arc::clone(&room_b);
        async move { room_b.chat_messages().await.unwrap().len() == 3 }
    })
    .await;

    let chat_b = room_b.chat_messages().await.unwrap();
    let ids: Vec<&str> = chat_b.iter().map(|m| m.msg_id.as_str()).collect();
    assert_eq!(ids, vec![&m1.msg_id, &m2.msg_id, &m3.msg_id]);

    engine_a.shutdown().await;
    engine_b.shutdown().await;
}

#[tokio::test]
async fn duplicate_message_is_processed_once() {
    let broker = MemoryBroker::new();
    let engine = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
    let room_a = engine.join(room(), JoinOptions::new()).await.unwrap();

    // A raw endpoint injects the same chat delta twice.
    let raw = broker.endpoint("peer-raw");
    let topic = room().topic();
    raw.subscribe(&topic).await.unwrap();

    let mut source = windrop_state::RoomDoc::new().unwrap();
    let delta = source
        .append_chat(&windrop_core::ChatMessage::now(
            "just once",
            PeerId::from("peer-raw"),
        ))
        .unwrap();
    let msg = ControlMsg::YUpdate {
        room_id: room(),
        update: delta,
        msg_id: Some("dup-1".to_string()),
        ttl: Some(0),
    };
    let data = msg.encode().unwrap();
    raw.publish(&topic, data.clone()).await.unwrap();
    raw.publish(&topic, data).await.unwrap();

    wait_for("the first copy to apply", Duration::from_secs(5), || {
        let room_a = Arc::clone(&room_a);
        async move { room_a.chat_messages().await.unwrap().len() == 1 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(room_a.chat_messages().await.unwrap().len(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn ttl_zero_is_never_forwarded_and_ttl_one_is() {
    let broker = MemoryBroker::new();
    let engine = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
    let _room_a = engine.join(room(), JoinOptions::new()).await.unwrap();

    let raw = broker.endpoint("peer-raw");
    let topic: Topic = room().topic();
    raw.subscribe(&topic).await.unwrap();
    let mut raw_events = raw.events();

    let mut source = windrop_state::RoomDoc::new().unwrap();
    let delta_a = source
        .append_chat(&windrop_core::ChatMessage::now("no hop", PeerId::from("x")))
        .unwrap();
    let delta_b = source
        .append_chat(&windrop_core::ChatMessage::now("one hop", PeerId::from("x")))
        .unwrap();

    // ttl 0: nobody republishes.
    let quiet = ControlMsg::YUpdate {
        room_id: room(),
        update: delta_a,
        msg_id: Some("quiet-1".to_string()),
        ttl: Some(0),
    };
    raw.publish(&topic, quiet.encode().unwrap()).await.unwrap();
    let echo = tokio::time::timeout(Duration::from_millis(600), raw_events.recv()).await;
    assert!(echo.is_err(), "ttl=0 message must not be forwarded");

    // ttl 1: the peer forwards exactly one hop, ttl exhausted.
    let loud = ControlMsg::YUpdate {
        room_id: room(),
        update: delta_b,
        msg_id: Some("loud-1".to_string()),
        ttl: Some(1),
    };
    raw.publish(&topic, loud.encode().unwrap()).await.unwrap();
    let forwarded = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(TransportEvent::Message { data, .. }) = raw_events.recv().await {
                if let Ok(msg) = ControlMsg::decode(&data) {
                    if msg.msg_id() == Some("loud-1") {
                        return msg;
                    }
                }
            }
        }
    })
    .await
    .expect("ttl=1 message should be forwarded once");
    assert_eq!(forwarded.effective_ttl(), 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn snapshot_requests_stop_after_sync() {
    let broker = MemoryBroker::new();
    let engine_a = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
    let engine_b = SyncEngine::new(Arc::new(broker.endpoint("peer-b")));
    let room_a = engine_a.join(room(), JoinOptions::new()).await.unwrap();
    let room_b = engine_b.join(room(), JoinOptions::new()).await.unwrap();

    wait_for("both peers to reach synced", Duration::from_secs(10), || {
        let (room_a, room_b) = (Arc::clone(&room_a), Arc::clone(&room_b));
        async move {
            room_a.status() == windrop_state::SyncStatus::Synced
                && room_b.status() == windrop_state::SyncStatus::Synced
        }
    })
    .await;

    // Watch the topic: no SNAPSHOT_REQUEST may appear after quiescence.
    let raw = broker.endpoint("peer-watch");
    let topic = room().topic();
    raw.subscribe(&topic).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut raw_events = raw.events();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(6);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), raw_events.recv()).await {
            Ok(Ok(TransportEvent::Message { data, .. })) => {
                if let Ok(msg) = ControlMsg::decode(&data) {
                    assert_ne!(
                        msg.tag(),
                        "SNAPSHOT_REQUEST",
                        "ticker must stop once synced"
                    );
                }
            }
            _ => {}
        }
    }

    engine_a.shutdown().await;
    engine_b.shutdown().await;
}

#[tokio::test]
async fn persistence_survives_rejoin_without_network() {
    let dir = tempfile::tempdir().unwrap();

    // First life: alone in the room, persist everything locally.
    {
        let broker = MemoryBroker::new();
        let engine = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
        let store = windrop_store::FileSnapshotStore::new(dir.path());
        let room_a = engine
            .join(room(), JoinOptions::new().with_store(Box::new(store)))
            .await
            .unwrap();
        room_a.set_manifest(&two_file_manifest()).await.unwrap();
        room_a.send_chat("remember me").await.unwrap();

        wait_for("the snapshot to land on disk", Duration::from_secs(5), || async {
            dir.path().join(format!("{}.bin", room())).exists()
        })
        .await;
        // One more settle so the latest coalesced save includes the chat.
        tokio::time::sleep(Duration::from_millis(300)).await;
        engine.shutdown().await;
    }

    // Second life: fresh broker, zero peers. State comes from disk alone.
    {
        let broker = MemoryBroker::new();
        let engine = SyncEngine::new(Arc::new(broker.endpoint("peer-a2")));
        let store = windrop_store::FileSnapshotStore::new(dir.path());
        let room_a = engine
            .join(room(), JoinOptions::new().with_store(Box::new(store)))
            .await
            .unwrap();

        assert_eq!(room_a.manifest().await.unwrap(), two_file_manifest());
        let chat = room_a.chat_messages().await.unwrap();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].text, "remember me");
        engine.shutdown().await;
    }
}

#[tokio::test]
async fn new_files_handler_sees_only_additions() {
    let broker = MemoryBroker::new();
    let host = SyncEngine::new(Arc::new(broker.endpoint("peer-host")));
    let host_room = host.join(room(), JoinOptions::new()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let joiner = SyncEngine::new(Arc::new(broker.endpoint("peer-join")));
    let _joiner_room = joiner
        .join(
            room(),
            JoinOptions::new().on_new_files(Box::new(move |files| {
                let _ = tx.send(files);
            })),
        )
        .await
        .unwrap();

    host_room.set_manifest(&two_file_manifest()).await.unwrap();

    let added = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("new files should be reported")
        .unwrap();
    let cids: Vec<&str> = added.iter().map(|f| f.cid.as_str()).collect();
    assert_eq!(cids, vec!["bafy-c1", "bafy-c2"]);

    // Re-announcing the same manifest adds nothing.
    host_room.set_manifest(&two_file_manifest()).await.unwrap();
    let again = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
    assert!(again.is_err(), "unchanged manifest must not re-report files");

    host.shutdown().await;
    joiner.shutdown().await;
}
