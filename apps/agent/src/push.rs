//! Local upload driver: splits a file and feeds it through the service.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkpost_protocol::{SessionKey, SessionStatus};
use chunkpost_transfer::{Admission, ChunkPayload, ChunkReader, FinalArtifact, UploadService};

use crate::config::Config;

const CONTENT_TYPE: &str = "application/octet-stream";

/// Uploads `path` in `chunk_size` pieces (0 = default) and prints the
/// published artifact.
pub async fn run(config: Config, path: PathBuf, chunk_size: usize) -> anyhow::Result<()> {
    let service = Arc::new(UploadService::from_config(config.upload)?);
    let artifact = push_file(&service, &path, chunk_size).await?;

    println!("{}", artifact.path.display());
    println!("  {} bytes, sha256 {}", artifact.len, artifact.sha256);
    Ok(())
}

/// Uploads one file and returns the merged artifact.
pub async fn push_file(
    service: &UploadService,
    path: &Path,
    chunk_size: usize,
) -> anyhow::Result<FinalArtifact> {
    let logical_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow::anyhow!("{} has no usable file name", path.display()))?;

    let mut reader = ChunkReader::new(path, chunk_size)?;
    let total = reader.total_chunks();
    if total == 0 {
        anyhow::bail!("{} is empty", path.display());
    }

    let key = service
        .begin_or_continue_upload(logical_name, None, total)
        .await?;
    tracing::info!(session = %key, total, bytes = reader.file_size(), "pushing file");

    while let Some(chunk) = reader.next_chunk()? {
        let payload = ChunkPayload::new(chunk.data, CONTENT_TYPE).with_checksum(chunk.checksum);
        match service.admit_chunk(&key, chunk.index, total, payload).await {
            Ok(Admission::SessionComplete(artifact)) => return Ok(artifact),
            Ok(Admission::Accepted(status)) => {
                tracing::debug!(
                    session = %key,
                    index = chunk.index,
                    percent = status.percentage(),
                    "chunk accepted"
                );
            }
            Err(e) => {
                abort_quietly(service, &key).await;
                return Err(e.into());
            }
        }
    }

    match service.session_status(&key)? {
        SessionStatus::Failed { reason } => anyhow::bail!("upload {key} failed: {reason}"),
        status => anyhow::bail!("upload {key} did not complete: {status:?}"),
    }
}

async fn abort_quietly(service: &UploadService, key: &SessionKey) {
    if let Err(e) = service.abort_upload(key).await {
        tracing::warn!(session = %key, error = %e, "failed to abort upload");
    }
}
