//! Long-running service mode.

use std::sync::Arc;

use chunkpost_transfer::{Sweeper, UploadService};

use crate::config::Config;

/// Runs the upload service until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let upload = config.upload.clone();
    tracing::info!(
        chunk_dir = %upload.chunk_dir.display(),
        output_dir = %upload.output_dir.display(),
        "opening chunk store"
    );

    let service = Arc::new(UploadService::from_config(upload)?);

    // Sessions interrupted by the last shutdown.
    let restored = service.recover().await?;
    if restored > 0 {
        tracing::info!(restored, "resumed interrupted uploads");
    }

    let sweeper = Sweeper::start(Arc::clone(&service), service.config().sweep_interval());

    tracing::info!(name = %config.name, "agent ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    tracing::info!("stopping services...");
    sweeper.stop().await;

    Ok(())
}
