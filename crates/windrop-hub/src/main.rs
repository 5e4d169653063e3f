//! windrop hub daemon

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use windrop_core::{ContentClient, MemoryContentClient, RoomTransport};
use windrop_hub::{Hub, HubArgs, HubConfig};
use windrop_transport::{IrohRoomTransport, TransportConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "hub failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = HubArgs::parse();
    let modes = args.modes();

    tokio::fs::create_dir_all(&args.data_dir).await?;

    let transport_config = TransportConfig {
        port: args.port,
        enable_relay: modes.relay,
        ..TransportConfig::default()
    };
    let transport: Arc<dyn RoomTransport> = Arc::new(
        IrohRoomTransport::bind(transport_config).await?,
    );
    info!(peer = %transport.local_peer(), "endpoint bound");

    // The block layer proper lives outside this process; the embedded
    // client keeps uploaded blocks and the pin ledger in memory.
    let content: Arc<dyn ContentClient> = Arc::new(MemoryContentClient::new());

    let hub = Hub::new(
        Arc::clone(&transport),
        modes.mirror.then(|| Arc::clone(&content)),
        HubConfig {
            modes,
            data_dir: args.data_dir.clone(),
        },
    )?;
    hub.start()?;

    if modes.mirror {
        let pinner = hub
            .pinner()
            .cloned()
            .expect("mirror mode always builds a pinner");
        let addr = args.http_addr();
        tokio::spawn(async move {
            if let Err(e) = windrop_hub::upload::serve(addr, content, pinner).await {
                error!(error = %e, "upload endpoint failed");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    hub.shutdown();
    Ok(())
}
