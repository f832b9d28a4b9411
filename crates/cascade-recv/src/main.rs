//! cascade-recv — Cascade receiver entry point.

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use cascade_core::config::CascadeConfig;
use cascade_recv::{ReceiverSession, TransferUri};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let uri = std::env::args()
        .nth(1)
        .context("usage: cascade-recv <mc://host[:port]/path | mcs://...> [root-folder]")?;
    let uri = TransferUri::parse(&uri)?;

    let config = CascadeConfig::load().context("failed to load configuration")?;
    let mut client_config = config.client;
    if let Some(root) = std::env::args().nth(2) {
        client_config.root_folder = root.into();
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(());
        }
    });

    let session = ReceiverSession::new(uri, client_config)?;
    let report = session.run(shutdown_rx).await?;
    tracing::info!(
        path = report.path,
        files = report.files.len(),
        bytes = report.bytes_total,
        waves = report.waves,
        dropped_datagrams = report.decode_failures,
        "transfer complete"
    );
    Ok(())
}
