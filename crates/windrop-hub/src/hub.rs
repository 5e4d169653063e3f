//! The hub daemon
//!
//! Wires the pieces together: accepts `/y-sync/1.0.0` streams, bridges
//! room gossip, persists room state under `<data_dir>/ydocs/`, pins
//! manifest content in mirror mode, and logs stats.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use windrop_core::{
    ContentClient, InboundStream, RoomId, RoomTransport, SYNC_PROTOCOL, TransportEvent,
};

use crate::config::Modes;
use crate::error::HubError;
use crate::pinning::Pinner;
use crate::room::{RoomRegistry, serve_stream};
use crate::stats::spawn_stats_loop;

/// Configuration for an embedded hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub modes: Modes,
    pub data_dir: PathBuf,
}

/// An assembled hub over some transport.
pub struct Hub {
    transport: Arc<dyn RoomTransport>,
    registry: Arc<RoomRegistry>,
    config: HubConfig,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Build a hub. `content` is required for mirror mode and ignored
    /// otherwise.
    pub fn new(
        transport: Arc<dyn RoomTransport>,
        content: Option<Arc<dyn ContentClient>>,
        config: HubConfig,
    ) -> Result<Arc<Self>, HubError> {
        let pinner = if config.modes.mirror {
            let content = content.ok_or_else(|| {
                HubError::Startup("mirror mode needs a content client".to_string())
            })?;
            Some(Pinner::new(content))
        } else {
            None
        };

        let registry = Arc::new(RoomRegistry::new(
            Arc::clone(&transport),
            &config.data_dir,
            pinner,
        ));

        Ok(Arc::new(Self {
            transport,
            registry,
            config,
            tasks: std::sync::Mutex::new(Vec::new()),
        }))
    }

    /// Start the hub's loops. Idempotent setup is per room; this is
    /// called once per process.
    pub fn start(self: &Arc<Self>) -> Result<(), HubError> {
        let mut tasks = self.tasks.lock().unwrap();

        if self.config.modes.sync {
            let (stream_tx, stream_rx) = mpsc::channel::<InboundStream>(64);
            self.transport.handle_protocol(SYNC_PROTOCOL, stream_tx);
            tasks.push(tokio::spawn(accept_loop(
                stream_rx,
                Arc::clone(&self.registry),
            )));
            tasks.push(tokio::spawn(gossip_loop(
                self.transport.events(),
                Arc::clone(&self.registry),
            )));
        }

        tasks.push(spawn_stats_loop(
            Arc::clone(&self.transport),
            Arc::clone(&self.registry),
        ));

        info!(
            sync = self.config.modes.sync,
            mirror = self.config.modes.mirror,
            relay = self.config.modes.relay,
            data_dir = %self.config.data_dir.display(),
            "hub started"
        );
        Ok(())
    }

    /// Warm a room up explicitly (subscribes its topic, loads state).
    pub async fn join_room(&self, room_id: &RoomId) -> Result<(), HubError> {
        self.registry.get_or_create(room_id).await?;
        Ok(())
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn pinner(&self) -> Option<&Arc<Pinner>> {
        self.registry.pinner()
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(mut streams: mpsc::Receiver<InboundStream>, registry: Arc<RoomRegistry>) {
    while let Some(inbound) = streams.recv().await {
        tokio::spawn(serve_stream(Arc::clone(&registry), inbound));
    }
}

async fn gossip_loop(
    mut events: broadcast::Receiver<TransportEvent>,
    registry: Arc<RoomRegistry>,
) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Message { topic, from, data }) => {
                let Some(room_id) = topic.room_id() else {
                    continue;
                };
                // Cold rooms warm up on their first message.
                match registry.get_or_create(&room_id).await {
                    Ok(room) => room.handle_gossip(&from, &data).await,
                    Err(e) => warn!(room = %room_id, error = %e, "room setup failed"),
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "hub gossip stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
