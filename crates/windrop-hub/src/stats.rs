//! Periodic operational stats
//!
//! Every 30 seconds, one log line for the process (connections by
//! transport, room count) and one per room (files, chat entries, open
//! streams). Operability tooling greps for these.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use windrop_core::RoomTransport;

use crate::room::RoomRegistry;

/// Interval between stat lines.
pub const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Spawn the stats loop.
pub fn spawn_stats_loop(
    transport: Arc<dyn RoomTransport>,
    registry: Arc<RoomRegistry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            log_stats(&transport, &registry).await;
        }
    })
}

async fn log_stats(transport: &Arc<dyn RoomTransport>, registry: &Arc<RoomRegistry>) {
    let mut by_transport: BTreeMap<&'static str, usize> = BTreeMap::new();
    for connection in transport.connections() {
        *by_transport.entry(connection.transport).or_insert(0) += 1;
    }
    let connections: Vec<String> = by_transport
        .iter()
        .map(|(label, count)| format!("{label}={count}"))
        .collect();

    info!(
        connections = %connections.join(","),
        rooms = registry.room_count(),
        "hub stats"
    );

    for room in registry.rooms() {
        let files = room.manifest_len().await;
        let chat = room.chat_len().await;
        info!(
            room = %room.room_id(),
            files,
            chat,
            streams = room.stream_count(),
            "room stats"
        );
    }
}
