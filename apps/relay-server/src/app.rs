//! Application orchestrator: wires the hub and the WebSocket server together.

use std::sync::Arc;

use chatrelay_hub::{Hub, RelayServer};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs the relay until Ctrl-C or a server failure.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let server_config = config.server_config()?;

    // -- Hub control loop --
    let (hub, handle) = Hub::new(config.hub_config());
    let hub_task = tokio::spawn(hub.run(cancel.clone()));

    // -- WS server --
    let server = RelayServer::new(server_config, handle.clone(), cancel.clone());
    let server_run = Arc::clone(&server);
    let mut server_task = tokio::spawn(async move { server_run.run().await });

    tracing::info!("relay ready");

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
            Ok(())
        }
        joined = &mut server_task => {
            match joined {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("relay server failed")),
                Err(e) => Err(anyhow::Error::new(e).context("relay server task panicked")),
            }
        }
    };

    // -- Graceful shutdown --
    tracing::info!(
        online = handle.online_count().await,
        connections = handle.connection_count().await,
        "stopping services..."
    );
    server.shutdown();
    if let Err(e) = hub_task.await {
        tracing::error!("hub task failed: {e}");
    }

    result
}
