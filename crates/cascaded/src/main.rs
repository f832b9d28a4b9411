//! cascaded — Cascade distribution daemon entry point.

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use cascade_core::config::CascadeConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = CascadeConfig::load().context("failed to load configuration")?;
    let mut server_config = config.server;
    if let Some(root) = std::env::args().nth(1) {
        server_config.root_folder = root.into();
    }
    tracing::info!(
        root = %server_config.root_folder.display(),
        bind = server_config.bind_address,
        group = %server_config.multicast_address,
        sealed = server_config.passphrase().is_some(),
        "cascaded starting"
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let handle = cascaded::serve(server_config, shutdown_tx.clone()).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(());
    let _ = handle.task.await;
    Ok(())
}
