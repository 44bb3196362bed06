//! chatgated — chat connection gateway daemon.
//!
//! Usage: chatgated [config-path]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use chatgate_core::config::GatewayConfig;
use chatgate_net::{serve, Server};

mod dispatch;

use dispatch::EchoDispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    let loaded = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => GatewayConfig::load_from(&path),
        None => {
            if let Err(e) = GatewayConfig::write_default_if_missing() {
                tracing::warn!(error = %e, "failed to write default config");
            }
            GatewayConfig::load()
        }
    };
    let config = loaded.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        GatewayConfig::default()
    });
    tracing::info!(
        addr = %config.server.addr,
        shards = config.manager.shards,
        send_queue_size = config.server.send_queue_size,
        "chatgated starting"
    );

    let server = Arc::new(
        Server::bind(&config)
            .await
            .context("failed to bind listener")?,
    );
    tracing::info!(addr = %server.local_addr(), "listening");

    let serve_task = tokio::spawn(serve(server.clone(), Arc::new(EchoDispatcher)));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    server.stop().await;
    serve_task.await.context("serve task panicked")??;

    tracing::info!("chatgated stopped");
    Ok(())
}
