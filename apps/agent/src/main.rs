//! chunkpost agent entry point.
//!
//! ```text
//! chunkpost-agent                       run the upload service until Ctrl-C
//! chunkpost-agent push <file> [size]    upload a local file in chunks
//! ```

mod app;
mod config;
mod push;

use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chunkpost=debug")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting chunkpost agent"
    );

    let config = config::Config::load()?;
    tracing::info!(name = %config.name, "configuration loaded");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let rt = tokio::runtime::Runtime::new()?;

    match args.first().map(String::as_str) {
        None | Some("serve") => rt.block_on(app::run(config))?,
        Some("push") => {
            let Some(file) = args.get(1) else {
                anyhow::bail!("usage: chunkpost-agent push <file> [chunk-size]");
            };
            let chunk_size = match args.get(2) {
                Some(s) => s.parse()?,
                None => 0,
            };
            rt.block_on(push::run(config, PathBuf::from(file), chunk_size))?;
        }
        Some(other) => anyhow::bail!("unknown command: {other}"),
    }

    tracing::info!("agent shut down cleanly");
    Ok(())
}
