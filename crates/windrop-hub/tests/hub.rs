//! Hub end-to-end scenarios over the in-memory transport
//!
//! A hub endpoint and peer engines share one broker; peers reach the hub
//! both through `/y-sync/1.0.0` streams and through room gossip.

use std::sync::Arc;
use std::time::Duration;

use windrop_core::{
    ContentId, ControlMsg, FileEntry, Manifest, MemoryBroker, MemoryContentClient, PeerId, RoomId,
    RoomTransport,
};
use windrop_hub::{Hub, HubConfig, Modes};
use windrop_sync::{JoinOptions, SyncEngine};

fn room() -> RoomId {
    RoomId::from("abcdef0123456789")
}

fn hub_peer() -> PeerId {
    PeerId::from("hub-main")
}

fn one_file_manifest() -> Manifest {
    Manifest::new(
        vec![FileEntry::new("a.txt", Some(7), ContentId::from("bafy-c1"))],
        Some(1_700_000_000_000),
    )
}

fn hub_on(
    broker: &MemoryBroker,
    peer: &PeerId,
    data_dir: &std::path::Path,
    mirror: bool,
) -> (Arc<Hub>, Arc<MemoryContentClient>) {
    let transport: Arc<dyn RoomTransport> = Arc::new(broker.endpoint(peer.as_str()));
    let content = Arc::new(MemoryContentClient::new());
    let hub = Hub::new(
        transport,
        mirror.then(|| content.clone() as Arc<dyn windrop_core::ContentClient>),
        HubConfig {
            modes: Modes {
                relay: false,
                sync: true,
                mirror,
            },
            data_dir: data_dir.to_path_buf(),
        },
    )
    .unwrap();
    hub.start().unwrap();
    (hub, content)
}

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
async fn hub_relays_state_between_generations_of_peers() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let (hub, _) = hub_on(&broker, &hub_peer(), dir.path(), false);

    // First generation: one peer shares a manifest over its hub stream.
    let engine_a = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
    let room_a = engine_a
        .join(room(), JoinOptions::new().with_hub_peers(vec![hub_peer()]))
        .await
        .unwrap();
    wait_for("peer A's hub stream", Duration::from_secs(5), || {
        let room_a = Arc::clone(&room_a);
        async move { room_a.has_hub_stream() }
    })
    .await;
    room_a.set_manifest(&one_file_manifest()).await.unwrap();

    wait_for("the hub to hold the manifest", Duration::from_secs(5), || {
        let registry = Arc::clone(hub.registry());
        async move {
            match registry.get(&room()) {
                Some(hub_room) => hub_room.manifest_len().await == 1,
                None => false,
            }
        }
    })
    .await;
    engine_a.shutdown().await;

    // Second generation: a fresh peer learns the room from the hub alone.
    let engine_b = SyncEngine::new(Arc::new(broker.endpoint("peer-b")));
    let room_b = engine_b
        .join(room(), JoinOptions::new().with_hub_peers(vec![hub_peer()]))
        .await
        .unwrap();

    wait_for("peer B to receive the full state", Duration::from_secs(5), || {
        let room_b = Arc::clone(&room_b);
        async move { room_b.manifest().await.unwrap() == one_file_manifest() }
    })
    .await;

    engine_b.shutdown().await;
    hub.shutdown();
}

#[tokio::test]
async fn hub_restart_recovers_persisted_state() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();

    {
        let (hub, _) = hub_on(&broker, &hub_peer(), dir.path(), false);
        let engine_a = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
        let room_a = engine_a
            .join(room(), JoinOptions::new().with_hub_peers(vec![hub_peer()]))
            .await
            .unwrap();
        room_a.set_manifest(&one_file_manifest()).await.unwrap();

        wait_for("the room snapshot on disk", Duration::from_secs(5), || async {
            let path = dir.path().join("ydocs").join(format!("{}.bin", room()));
            tokio::fs::metadata(&path).await.map(|m| m.len() > 0).unwrap_or(false)
        })
        .await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        engine_a.shutdown().await;
        hub.shutdown();
        broker.kill(&hub_peer()).await;
    }

    // Restarted hub, same data dir, new endpoint identity.
    let restarted = PeerId::from("hub-restarted");
    let (hub2, _) = hub_on(&broker, &restarted, dir.path(), false);

    let engine_b = SyncEngine::new(Arc::new(broker.endpoint("peer-b")));
    let room_b = engine_b
        .join(room(), JoinOptions::new().with_hub_peers(vec![restarted]))
        .await
        .unwrap();

    wait_for("state recovered from disk via the hub", Duration::from_secs(5), || {
        let room_b = Arc::clone(&room_b);
        async move { room_b.manifest().await.unwrap() == one_file_manifest() }
    })
    .await;

    engine_b.shutdown().await;
    hub2.shutdown();
}

#[tokio::test]
async fn stream_and_gossip_echo_apply_once() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let (hub, _) = hub_on(&broker, &hub_peer(), dir.path(), false);

    // Raw peer with both paths to the hub: a stream and the topic.
    let raw = broker.endpoint("peer-raw");
    let topic = room().topic();
    raw.subscribe(&topic).await.unwrap();

    let mut stream = raw
        .dial(&hub_peer(), windrop_core::SYNC_PROTOCOL, Duration::from_secs(5))
        .await
        .unwrap();
    stream
        .send(ControlMsg::JoinRoom { room_id: room() }.encode().unwrap())
        .await
        .unwrap();
    let first = stream.recv().await.expect("full state reply");
    assert!(matches!(
        ControlMsg::decode(&first).unwrap(),
        ControlMsg::SyncFullState { .. }
    ));

    // The same delta arrives via stream, then echoes in over gossip.
    let mut source = windrop_state::RoomDoc::new().unwrap();
    let delta = source
        .append_chat(&windrop_core::ChatMessage::now("once", PeerId::from("raw")))
        .unwrap();
    let msg = ControlMsg::YUpdate {
        room_id: room(),
        update: delta,
        msg_id: Some("echoed-1".to_string()),
        ttl: Some(1),
    };
    stream.send(msg.encode().unwrap()).await.unwrap();

    wait_for("the stream copy to apply", Duration::from_secs(5), || {
        let registry = Arc::clone(hub.registry());
        async move {
            match registry.get(&room()) {
                Some(hub_room) => hub_room.chat_len().await == 1,
                None => false,
            }
        }
    })
    .await;

    raw.publish(&topic, msg.encode().unwrap()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Applied once, and the gossip echo was not bridged back to us.
    let hub_room = hub.registry().get(&room()).unwrap();
    assert_eq!(hub_room.chat_len().await, 1);
    let echo = tokio::time::timeout(Duration::from_millis(400), stream.recv()).await;
    assert!(echo.is_err(), "deduplicated echo must not come back down the stream");

    hub.shutdown();
}

#[tokio::test]
async fn dead_stream_leaves_no_stale_queue() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let (hub, _) = hub_on(&broker, &hub_peer(), dir.path(), false);

    let raw = broker.endpoint("peer-raw");
    let mut stream = raw
        .dial(&hub_peer(), windrop_core::SYNC_PROTOCOL, Duration::from_secs(5))
        .await
        .unwrap();
    stream
        .send(ControlMsg::JoinRoom { room_id: room() }.encode().unwrap())
        .await
        .unwrap();
    let _ = stream.recv().await.expect("full state reply");

    let hub_room = hub.registry().get(&room()).unwrap();
    assert_eq!(hub_room.stream_count(), 1);

    drop(stream);
    wait_for("the hub to drop the dead stream", Duration::from_secs(5), || {
        let hub_room = Arc::clone(&hub_room);
        async move { hub_room.stream_count() == 0 }
    })
    .await;

    hub.shutdown();
}

#[tokio::test]
async fn mirror_hub_pins_manifest_content_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let (hub, content) = hub_on(&broker, &hub_peer(), dir.path(), true);

    let engine = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
    let room_a = engine
        .join(room(), JoinOptions::new().with_hub_peers(vec![hub_peer()]))
        .await
        .unwrap();
    wait_for("peer A's hub stream", Duration::from_secs(5), || {
        let room_a = Arc::clone(&room_a);
        async move { room_a.has_hub_stream() }
    })
    .await;

    let manifest = Manifest::new(
        vec![FileEntry::new("c.bin", Some(9), ContentId::from("bafy-c3"))],
        Some(1),
    );
    room_a.set_manifest(&manifest).await.unwrap();

    wait_for("the hub to pin the new cid", Duration::from_secs(5), || {
        let content = Arc::clone(&content);
        async move { content.is_pinned(&ContentId::from("bafy-c3")) }
    })
    .await;
    assert_eq!(content.pin_call_count(), 1);

    // The identical manifest again: no new pin calls.
    room_a.set_manifest(&manifest).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(content.pin_call_count(), 1);

    // Dropping the file does not unpin (pinning is monotone).
    room_a
        .set_manifest(&Manifest::new(vec![], Some(2)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(content.is_pinned(&ContentId::from("bafy-c3")));

    engine.shutdown().await;
    hub.shutdown();
}

#[tokio::test]
async fn gossip_only_peer_syncs_through_warm_hub() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let (hub, _) = hub_on(&broker, &hub_peer(), dir.path(), false);

    // Warm the room so the hub subscribes to its topic.
    hub.join_room(&room()).await.unwrap();

    // A peer with no hub candidates at all: pure gossip.
    let engine_a = SyncEngine::new(Arc::new(broker.endpoint("peer-a")));
    let room_a = engine_a.join(room(), JoinOptions::new()).await.unwrap();
    room_a.send_chat("over gossip").await.unwrap();

    wait_for("the hub to apply the gossip delta", Duration::from_secs(8), || {
        let registry = Arc::clone(hub.registry());
        async move {
            match registry.get(&room()) {
                Some(hub_room) => hub_room.chat_len().await == 1,
                None => false,
            }
        }
    })
    .await;

    engine_a.shutdown().await;
    hub.shutdown();
}
