//! Ordered reassembly of a session's chunks into the final artifact.

use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chunkpost_protocol::{FailureReason, UploadStatus};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::config::ChunkCleanup;
use crate::registry::SessionEntry;
use crate::store::ChunkStore;

const COPY_BUF_SIZE: usize = 64 * 1024;

/// A published, fully merged file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalArtifact {
    pub path: PathBuf,
    /// Sum of all chunk lengths.
    pub len: u64,
    /// SHA-256 hex digest of the whole artifact.
    pub sha256: String,
    pub completed_at: DateTime<Utc>,
}

/// Counts and hashes everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Concatenates chunks `0..total` in order and publishes the result.
pub struct MergeCoordinator {
    store: Arc<dyn ChunkStore>,
    output_dir: PathBuf,
    cleanup: ChunkCleanup,
}

impl MergeCoordinator {
    pub fn new(store: Arc<dyn ChunkStore>, output_dir: PathBuf, cleanup: ChunkCleanup) -> Self {
        Self {
            store,
            output_dir,
            cleanup,
        }
    }

    /// Path the session's artifact is published under.
    pub fn final_path(&self, entry: &SessionEntry) -> PathBuf {
        self.output_dir.join(entry.key().as_str())
    }

    /// Merges a session that is in `Merging`.
    ///
    /// Blocking; run it on a blocking pool. The caller records the outcome
    /// on failure (see [`failure_reason`](Self::failure_reason)); success is
    /// recorded here, atomically with publication.
    pub fn merge(&self, entry: &SessionEntry) -> Result<FinalArtifact, TransferError> {
        let key = entry.key();
        std::fs::create_dir_all(&self.output_dir).map_err(TransferError::FinalWrite)?;

        let final_path = self.final_path(entry);
        let temp_path = self
            .output_dir
            .join(format!(".{key}.{}.partial", uuid::Uuid::new_v4()));

        debug!(session = %key, total = entry.total_chunks(), temp = %temp_path.display(), "merging chunks");

        let (len, sha256) = match self.write_temp(entry, &temp_path) {
            Ok(v) => v,
            Err(e) => {
                let _ = std::fs::remove_file(&temp_path);
                // An abort deletes chunks underneath us; report the abort,
                // not the missing chunk it caused.
                if entry.upload_status() == UploadStatus::Failed {
                    return Err(TransferError::MergeAborted);
                }
                return Err(e);
            }
        };

        // Linking fails instead of replacing an existing final file.
        let published = entry.finish_merge(|| {
            std::fs::hard_link(&temp_path, &final_path).map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    TransferError::Publication(format!("{} already exists", final_path.display()))
                } else {
                    TransferError::Publication(format!(
                        "link to {} failed: {e}",
                        final_path.display()
                    ))
                }
            })?;
            Ok(FinalArtifact {
                path: final_path.clone(),
                len,
                sha256: sha256.clone(),
                completed_at: Utc::now(),
            })
        });

        if let Err(e) = std::fs::remove_file(&temp_path) {
            warn!(session = %key, temp = %temp_path.display(), error = %e, "failed to remove temporary merge file");
        }

        let artifact = match published {
            Some(Ok(artifact)) => artifact,
            Some(Err(e)) => return Err(e),
            None => return Err(TransferError::MergeAborted),
        };

        // Chunks are only reclaimed once the artifact is visible.
        match self.store.delete_session(key) {
            Ok(removed) => debug!(session = %key, removed, "reclaimed chunks"),
            Err(e) => warn!(session = %key, error = %e, "failed to reclaim chunks after merge"),
        }

        info!(
            session = %key,
            path = %artifact.path.display(),
            bytes = artifact.len,
            "artifact published"
        );
        Ok(artifact)
    }

    /// Streams every chunk into `temp_path`, returning `(len, sha256)`.
    ///
    /// Failures writing the temporary file are `FinalWrite`; failures
    /// reading chunks keep their store error.
    fn write_temp(
        &self,
        entry: &SessionEntry,
        temp_path: &Path,
    ) -> Result<(u64, String), TransferError> {
        let key = entry.key();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp_path)
            .map_err(TransferError::FinalWrite)?;
        let mut out = HashingWriter {
            inner: BufWriter::new(file),
            hasher: Sha256::new(),
            written: 0,
        };

        for index in 0..entry.total_chunks() {
            let mut reader = self
                .store
                .open(key, index)?
                .ok_or(TransferError::MissingChunkAtMerge { index })?;
            copy_chunk(&mut reader, &mut out)?;
            drop(reader);

            if self.cleanup == ChunkCleanup::Eager {
                // The copy must be durable before its source goes away.
                out.flush().map_err(TransferError::FinalWrite)?;
                out.inner
                    .get_ref()
                    .sync_data()
                    .map_err(TransferError::FinalWrite)?;
                self.store.delete(key, index)?;
            }
        }

        out.flush().map_err(TransferError::FinalWrite)?;
        out.inner
            .get_ref()
            .sync_all()
            .map_err(TransferError::FinalWrite)?;
        Ok((out.written, hex::encode(out.hasher.finalize())))
    }

    /// How a failed merge is recorded on the session. `None` means the
    /// session already reached a terminal state on its own.
    pub fn failure_reason(err: &TransferError) -> Option<FailureReason> {
        match err {
            TransferError::MergeAborted => None,
            TransferError::MissingChunkAtMerge { index } => {
                Some(FailureReason::MissingChunk { index: *index })
            }
            TransferError::Publication(message) => Some(FailureReason::Publication {
                message: message.clone(),
            }),
            other => Some(FailureReason::Storage {
                message: other.to_string(),
            }),
        }
    }
}

fn copy_chunk<R: Read + ?Sized, W: Write>(
    reader: &mut R,
    out: &mut W,
) -> Result<(), TransferError> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Io(e)),
        };
        out.write_all(&buf[..n]).map_err(TransferError::FinalWrite)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChunkRecord, Receipt};
    use crate::store::FilesystemChunkStore;
    use crate::checksum_bytes;
    use chunkpost_protocol::SessionKey;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<FilesystemChunkStore>,
        output: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FilesystemChunkStore::new(dir.path().join("chunks")).unwrap());
        let output = dir.path().join("out");
        Fixture {
            _dir: dir,
            store,
            output,
        }
    }

    /// Stores `parts` and records them so the session is ready to merge.
    fn ready_session(store: &FilesystemChunkStore, parts: &[&[u8]]) -> SessionEntry {
        let entry = SessionEntry::new(
            SessionKey::new("tok", "clip.mp4"),
            "clip.mp4".into(),
            parts.len() as u32,
        );
        let mut last = None;
        for (i, part) in parts.iter().enumerate() {
            store.put(entry.key(), i as u32, part).unwrap();
            last = Some(
                entry
                    .mark_received(
                        i as u32,
                        ChunkRecord {
                            len: part.len() as u64,
                            sha256: checksum_bytes(part),
                        },
                    )
                    .unwrap(),
            );
        }
        assert_eq!(last, Some(Receipt::Complete));
        entry
    }

    fn coordinator(f: &Fixture, cleanup: ChunkCleanup) -> MergeCoordinator {
        let store: Arc<dyn ChunkStore> = f.store.clone();
        MergeCoordinator::new(store, f.output.clone(), cleanup)
    }

    #[test]
    fn merge_concatenates_in_order_and_reclaims_chunks() {
        let f = fixture();
        let entry = ready_session(&f.store, &[b"The quick ", b"brown fox ", b"jumps"]);
        let artifact = coordinator(&f, ChunkCleanup::AfterPublish)
            .merge(&entry)
            .unwrap();

        let content = std::fs::read(&artifact.path).unwrap();
        assert_eq!(&content, b"The quick brown fox jumps");
        assert_eq!(artifact.len, 25);
        assert_eq!(artifact.sha256, checksum_bytes(b"The quick brown fox jumps"));
        assert_eq!(artifact.path, f.output.join("tok-clip.mp4"));
        assert_eq!(entry.upload_status(), UploadStatus::Completed);
        assert!(f.store.list_indices(entry.key()).unwrap().is_empty());

        // No temporary files left behind.
        let names: Vec<_> = std::fs::read_dir(&f.output)
            .unwrap()
            .flatten()
            .map(|e| e.file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn merge_is_byte_exact() {
        let f = fixture();
        let a: Vec<u8> = (0..=255u8).collect();
        let b = b"\r\n\0\r\n".to_vec();
        let entry = ready_session(&f.store, &[&a, &b]);
        let artifact = coordinator(&f, ChunkCleanup::AfterPublish)
            .merge(&entry)
            .unwrap();
        let mut expected = a.clone();
        expected.extend_from_slice(&b);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), expected);
    }

    #[test]
    fn missing_chunk_aborts_and_preserves_others() {
        let f = fixture();
        let entry = ready_session(&f.store, &[b"aa", b"bb", b"cc"]);
        f.store.delete(entry.key(), 1).unwrap();

        let err = coordinator(&f, ChunkCleanup::AfterPublish)
            .merge(&entry)
            .unwrap_err();
        assert!(matches!(err, TransferError::MissingChunkAtMerge { index: 1 }));
        assert_eq!(
            MergeCoordinator::failure_reason(&err),
            Some(FailureReason::MissingChunk { index: 1 })
        );
        assert_eq!(f.store.list_indices(entry.key()).unwrap(), vec![0, 2]);
        assert!(!f.output.join("tok-clip.mp4").exists());
        assert_eq!(std::fs::read_dir(&f.output).unwrap().count(), 0);
    }

    #[test]
    fn existing_final_path_is_publication_failure() {
        let f = fixture();
        let entry = ready_session(&f.store, &[b"new"]);
        std::fs::create_dir_all(&f.output).unwrap();
        std::fs::write(f.output.join("tok-clip.mp4"), b"old").unwrap();

        let err = coordinator(&f, ChunkCleanup::AfterPublish)
            .merge(&entry)
            .unwrap_err();
        assert!(matches!(err, TransferError::Publication(_)));
        assert_eq!(std::fs::read(f.output.join("tok-clip.mp4")).unwrap(), b"old");
        assert_eq!(f.store.list_indices(entry.key()).unwrap(), vec![0]);
        assert_eq!(std::fs::read_dir(&f.output).unwrap().count(), 1);
        assert_eq!(entry.upload_status(), UploadStatus::Merging);
    }

    #[test]
    fn unwritable_output_is_final_write_failure() {
        let f = fixture();
        let entry = ready_session(&f.store, &[b"a", b"b"]);
        // A regular file where the output directory should be.
        std::fs::write(&f.output, b"not a directory").unwrap();

        let err = coordinator(&f, ChunkCleanup::AfterPublish)
            .merge(&entry)
            .unwrap_err();
        assert!(matches!(err, TransferError::FinalWrite(_)));
        assert_eq!(err.code(), chunkpost_protocol::ErrorCode::StorageWriteFailure);
        assert!(matches!(
            MergeCoordinator::failure_reason(&err),
            Some(FailureReason::Storage { .. })
        ));
        assert_eq!(f.store.list_indices(entry.key()).unwrap(), vec![0, 1]);
    }

    #[test]
    fn copy_chunk_separates_write_failures() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk full"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut src: &[u8] = b"payload";
        let err = copy_chunk(&mut src, &mut Full).unwrap_err();
        assert!(matches!(err, TransferError::FinalWrite(_)));

        let mut src: &[u8] = b"payload";
        let mut sink = Vec::new();
        copy_chunk(&mut src, &mut sink).unwrap();
        assert_eq!(sink, b"payload");
    }

    #[test]
    fn aborted_session_is_not_published() {
        let f = fixture();
        let entry = ready_session(&f.store, &[b"x", b"y"]);
        entry.abort().unwrap();

        let err = coordinator(&f, ChunkCleanup::AfterPublish)
            .merge(&entry)
            .unwrap_err();
        assert!(matches!(err, TransferError::MergeAborted));
        assert!(MergeCoordinator::failure_reason(&err).is_none());
        assert!(!f.output.join("tok-clip.mp4").exists());
    }

    #[test]
    fn eager_cleanup_deletes_while_copying() {
        let f = fixture();
        let entry = ready_session(&f.store, &[b"1", b"2", b"3"]);
        f.store.delete(entry.key(), 2).unwrap();

        let err = coordinator(&f, ChunkCleanup::Eager)
            .merge(&entry)
            .unwrap_err();
        assert!(matches!(err, TransferError::MissingChunkAtMerge { index: 2 }));
        // Chunks already copied were consumed.
        assert!(f.store.list_indices(entry.key()).unwrap().is_empty());
    }

    #[test]
    fn eager_cleanup_merges_correctly() {
        let f = fixture();
        let entry = ready_session(&f.store, &[b"ab", b"cd"]);
        let artifact = coordinator(&f, ChunkCleanup::Eager).merge(&entry).unwrap();
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"abcd");
    }
}
