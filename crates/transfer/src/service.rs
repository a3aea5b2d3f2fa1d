//! Per-request orchestration of chunk admission, bookkeeping and merge.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chunkpost_protocol::{
    ChunkOutcome, ErrorCode, FailureReason, SessionKey, SessionStatus, UploadStatus,
};
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::chunked::checksum_bytes;
use crate::config::TransferConfig;
use crate::merge::{FinalArtifact, MergeCoordinator};
use crate::registry::{ChunkRecord, Receipt, SessionEntry, SessionRegistry};
use crate::store::{ChunkStore, FilesystemChunkStore, SessionManifest};
use crate::token;
use crate::validation::{ChunkMeta, ChunkValidator, PolicyValidator, validate_logical_name};

/// Bytes and declared metadata of one inbound chunk.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub data: Vec<u8>,
    pub content_type: String,
    /// Optional SHA-256 hex checksum declared by the sender.
    pub checksum: Option<String>,
}

impl ChunkPayload {
    pub fn new(data: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            data,
            content_type: content_type.into(),
            checksum: None,
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }
}

/// Successful result of [`UploadService::admit_chunk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The chunk is stored (or was already stored with identical bytes).
    Accepted(SessionStatus),
    /// This admission completed the session and the artifact was published.
    /// Returned at most once per session.
    SessionComplete(FinalArtifact),
}

/// What one background sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Open sessions that timed out and were failed.
    pub expired: usize,
    /// Terminal sessions evicted after retention.
    pub evicted: usize,
    /// Chunk blobs deleted.
    pub chunks_removed: usize,
}

/// Entry point of the upload core.
pub struct UploadService {
    registry: SessionRegistry,
    store: Arc<dyn ChunkStore>,
    validator: Arc<dyn ChunkValidator>,
    merger: Arc<MergeCoordinator>,
    config: TransferConfig,
}

impl UploadService {
    pub fn new(
        config: TransferConfig,
        store: Arc<dyn ChunkStore>,
        validator: Arc<dyn ChunkValidator>,
    ) -> Self {
        let merger = Arc::new(MergeCoordinator::new(
            Arc::clone(&store),
            config.output_dir.clone(),
            config.cleanup,
        ));
        Self {
            registry: SessionRegistry::new(),
            store,
            validator,
            merger,
            config,
        }
    }

    /// Builds a service backed by the filesystem store and the configured
    /// size/type policy.
    pub fn from_config(config: TransferConfig) -> Result<Self, TransferError> {
        let store = Arc::new(FilesystemChunkStore::new(&config.chunk_dir)?);
        let validator = Arc::new(PolicyValidator::new(
            config.allowed_types.clone(),
            config.max_chunk_size,
        ));
        Ok(Self::new(config, store, validator))
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Runs a store operation on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, TransferError>
    where
        F: FnOnce(&dyn ChunkStore) -> Result<T, TransferError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(store.as_ref())).await?
    }

    /// Starts a new session, or resumes one when `session_token` is given.
    pub async fn begin_or_continue_upload(
        &self,
        logical_name: &str,
        session_token: Option<&str>,
        total_chunks: u32,
    ) -> Result<SessionKey, TransferError> {
        validate_logical_name(logical_name)?;
        if total_chunks == 0 {
            return Err(TransferError::Validation(
                "total chunks must be positive".into(),
            ));
        }
        if total_chunks > self.config.max_total_chunks {
            return Err(TransferError::Validation(format!(
                "total chunks {total_chunks} exceeds limit of {}",
                self.config.max_total_chunks
            )));
        }

        if let Some(token) = session_token {
            if !token::is_well_formed(token) {
                return Err(TransferError::InvalidName(format!(
                    "malformed session token: {token}"
                )));
            }
            let key = SessionKey::new(token, logical_name);
            let entry = self.registry.get(&key)?;
            if entry.total_chunks() != total_chunks {
                return Err(TransferError::TotalChunksMismatch {
                    expected: entry.total_chunks(),
                    got: total_chunks,
                });
            }
            debug!(session = %key, "continuing upload session");
            return Ok(key);
        }

        let key = SessionKey::new(&token::generate_token(), logical_name);
        let manifest = SessionManifest {
            key: key.clone(),
            logical_name: logical_name.to_string(),
            total_chunks,
            created_at: Utc::now(),
            failure: None,
        };
        self.blocking(move |store| store.write_manifest(&manifest))
            .await?;
        self.registry.register(&key, logical_name, total_chunks)?;

        info!(session = %key, total_chunks, "upload session created");
        Ok(key)
    }

    /// Admits one chunk.
    ///
    /// Validation happens before any mutation. The blob is stored before
    /// the index is recorded, and the admission that records the last
    /// missing index runs the merge.
    pub async fn admit_chunk(
        &self,
        key: &SessionKey,
        index: u32,
        total_chunks: u32,
        payload: ChunkPayload,
    ) -> Result<Admission, TransferError> {
        self.validator.validate(&ChunkMeta {
            content_type: &payload.content_type,
            len: payload.data.len(),
        })?;
        let sha256 = checksum_bytes(&payload.data);
        if let Some(declared) = &payload.checksum
            && !declared.eq_ignore_ascii_case(&sha256)
        {
            return Err(TransferError::ChecksumMismatch { index });
        }

        let entry = self.registry.get(key)?;
        if entry.total_chunks() != total_chunks {
            return Err(TransferError::TotalChunksMismatch {
                expected: entry.total_chunks(),
                got: total_chunks,
            });
        }
        if index >= total_chunks {
            return Err(TransferError::IndexOutOfRange {
                index,
                total: total_chunks,
            });
        }

        let _index_guard = entry.lock_index(index).await;

        let status = entry.upload_status();
        if let Some(existing) = entry.record(index)
            && status != UploadStatus::Failed
        {
            if existing.sha256 != sha256 {
                warn!(session = %key, index, "conflicting resubmission rejected");
                return Err(TransferError::DuplicateChunkConflict { index });
            }
            debug!(session = %key, index, "identical resubmission");
            return Ok(Admission::Accepted(entry.status()));
        }

        if status != UploadStatus::Open {
            return Err(TransferError::SessionNotOpen {
                key: key.to_string(),
                status,
            });
        }

        let record = ChunkRecord {
            len: payload.data.len() as u64,
            sha256,
        };
        let put_key = key.clone();
        self.blocking(move |store| store.put(&put_key, index, &payload.data))
            .await
            .map_err(|e| match e {
                TransferError::Io(source) => TransferError::StorageWrite { index, source },
                other => other,
            })?;

        match entry.mark_received(index, record) {
            Ok(Receipt::Pending { received, total }) => {
                debug!(session = %key, index, received, total, "chunk stored");
                Ok(Admission::Accepted(entry.status()))
            }
            Ok(Receipt::Complete) => {
                info!(session = %key, total = entry.total_chunks(), "all chunks received");
                self.run_merge(entry).await.map(Admission::SessionComplete)
            }
            Err(e) => {
                // Aborted while the blob was being written.
                let orphan = key.clone();
                if let Err(del) = self.blocking(move |store| store.delete(&orphan, index)).await {
                    warn!(session = %key, index, error = %del, "failed to delete orphaned chunk");
                }
                Err(e)
            }
        }
    }

    async fn run_merge(&self, entry: Arc<SessionEntry>) -> Result<FinalArtifact, TransferError> {
        let merger = Arc::clone(&self.merger);
        let merging = Arc::clone(&entry);
        let result = tokio::task::spawn_blocking(move || merger.merge(&merging)).await?;

        if let Err(e) = &result {
            warn!(session = %entry.key(), error = %e, "merge failed");
            if let Some(reason) = MergeCoordinator::failure_reason(e)
                && entry.fail(reason.clone())
            {
                self.persist_failure(&entry, reason).await;
            }
        }
        result
    }

    /// Records a failure in the session manifest so a restart restores the
    /// session as `Failed` with its chunks kept for [`retry_failed`](Self::retry_failed).
    async fn persist_failure(&self, entry: &SessionEntry, reason: FailureReason) {
        let manifest = SessionManifest {
            key: entry.key().clone(),
            logical_name: entry.logical_name().to_string(),
            total_chunks: entry.total_chunks(),
            created_at: entry.created_at(),
            failure: Some(reason),
        };
        if let Err(e) = self
            .blocking(move |store| store.write_manifest(&manifest))
            .await
        {
            warn!(session = %entry.key(), error = %e, "failed to persist session failure");
        }
    }

    /// Admits a chunk of an existing session and reports the outcome in
    /// interface form. Never fails; errors become [`ChunkOutcome::Error`].
    pub async fn upload_chunk(
        &self,
        key: &SessionKey,
        index: u32,
        payload: ChunkPayload,
    ) -> ChunkOutcome {
        let total = match self.registry.get(key) {
            Ok(entry) => entry.total_chunks(),
            Err(e) => return error_outcome(&e),
        };

        match self.admit_chunk(key, index, total, payload).await {
            Ok(Admission::SessionComplete(artifact)) => ChunkOutcome::Success {
                final_path: artifact.path.to_string_lossy().into_owned(),
            },
            Ok(Admission::Accepted(status)) => match status {
                SessionStatus::Open {
                    received_count,
                    total_chunks,
                } => ChunkOutcome::InProgress {
                    received_count,
                    total_chunks,
                },
                SessionStatus::Merging => ChunkOutcome::InProgress {
                    received_count: total,
                    total_chunks: total,
                },
                SessionStatus::Completed { final_path } => ChunkOutcome::Success { final_path },
                SessionStatus::Failed { reason } => ChunkOutcome::Error {
                    code: ErrorCode::SessionNotOpen,
                    message: reason.to_string(),
                },
            },
            Err(e) => error_outcome(&e),
        }
    }

    /// Aborts a session and deletes its chunks.
    ///
    /// Idempotent. Returns the number of chunk blobs removed. A merge in
    /// flight notices the abort and does not publish.
    pub async fn abort_upload(&self, key: &SessionKey) -> Result<usize, TransferError> {
        let entry = self.registry.get(key)?;
        let changed = entry.abort()?;

        let doomed = key.clone();
        let removed = self
            .blocking(move |store| store.delete_session(&doomed))
            .await?;

        if changed {
            info!(session = %key, removed, "upload aborted");
        }
        Ok(removed)
    }

    pub fn session_status(&self, key: &SessionKey) -> Result<SessionStatus, TransferError> {
        self.registry.status(key)
    }

    /// Indices recorded as received.
    pub fn received_indices(&self, key: &SessionKey) -> Result<Vec<u32>, TransferError> {
        Ok(self.registry.get(key)?.received_indices())
    }

    pub fn missing_indices(&self, key: &SessionKey) -> Result<Vec<u32>, TransferError> {
        Ok(self.registry.get(key)?.missing_indices())
    }

    /// Indices whose blob is actually present in the store.
    pub async fn persisted_indices(&self, key: &SessionKey) -> Result<Vec<u32>, TransferError> {
        self.registry.get(key)?;
        let key = key.clone();
        self.blocking(move |store| store.list_indices(&key)).await
    }

    /// Client acknowledgement: forgets a terminal session and any chunks
    /// it still holds.
    pub async fn acknowledge(&self, key: &SessionKey) -> Result<(), TransferError> {
        self.registry.evict(key)?;
        let evicted = key.clone();
        self.blocking(move |store| store.delete_session(&evicted))
            .await?;
        debug!(session = %key, "session acknowledged");
        Ok(())
    }

    /// Restarts a failed session under a fresh key.
    ///
    /// Chunks that survived the failure move to the new session, so only
    /// [`missing_indices`](Self::missing_indices) need to be re-uploaded.
    /// If nothing is missing the merge runs again immediately.
    pub async fn retry_failed(&self, key: &SessionKey) -> Result<SessionKey, TransferError> {
        let old = self.registry.get(key)?;
        let reason = match old.failure() {
            Some(reason) if old.upload_status() == UploadStatus::Failed => reason,
            _ => {
                return Err(TransferError::SessionNotOpen {
                    key: key.to_string(),
                    status: old.upload_status(),
                });
            }
        };
        if !reason.is_retryable() {
            return Err(TransferError::SessionNotOpen {
                key: format!("{key} ({reason})"),
                status: UploadStatus::Failed,
            });
        }

        let new_key = SessionKey::new(&token::generate_token(), old.logical_name());
        let manifest = SessionManifest {
            key: new_key.clone(),
            logical_name: old.logical_name().to_string(),
            total_chunks: old.total_chunks(),
            created_at: Utc::now(),
            failure: None,
        };
        let from = key.clone();
        let received = self
            .blocking(move |store| {
                store.rehome(&from, &manifest.key)?;
                store.write_manifest(&manifest)?;
                collect_records(store, &manifest.key)
            })
            .await?;

        let entry = Arc::new(SessionEntry::restore(
            new_key.clone(),
            old.logical_name().to_string(),
            old.total_chunks(),
            Utc::now(),
            received,
        ));
        self.registry.insert(Arc::clone(&entry));
        if let Err(e) = self.registry.evict(key) {
            warn!(session = %key, error = %e, "failed to evict retried session");
        }

        info!(
            session = %key,
            retry = %new_key,
            missing = entry.missing_indices().len(),
            "failed session re-opened"
        );

        if entry.try_begin_merge() {
            // Outcome is visible through the session status.
            let _ = self.run_merge(entry).await;
        }
        Ok(new_key)
    }

    /// Rebuilds sessions from manifests and stored chunks after a restart.
    ///
    /// Sessions whose chunks are all present are merged right away; sessions
    /// that had failed come back as `Failed`. Returns the number of sessions
    /// restored.
    pub async fn recover(&self) -> Result<usize, TransferError> {
        let restored = self
            .blocking(|store| {
                let mut restored = Vec::new();
                for manifest in store.load_manifests()? {
                    let received = collect_records(store, &manifest.key)?;
                    restored.push((manifest, received));
                }
                Ok(restored)
            })
            .await?;

        let mut count = 0;
        let mut ready = Vec::new();
        for (manifest, received) in restored {
            let entry = Arc::new(SessionEntry::restore(
                manifest.key,
                manifest.logical_name,
                manifest.total_chunks,
                manifest.created_at,
                received,
            ));
            if !self.registry.insert(Arc::clone(&entry)) {
                continue;
            }
            count += 1;
            if let Some(reason) = manifest.failure {
                debug!(session = %entry.key(), %reason, "restored failed session");
                entry.fail(reason);
            } else if entry.try_begin_merge() {
                ready.push(entry);
            }
        }

        for entry in ready {
            let key = entry.key().clone();
            match self.run_merge(entry).await {
                Ok(artifact) => info!(session = %key, path = %artifact.path.display(), "recovered session merged"),
                Err(e) => warn!(session = %key, error = %e, "recovered session failed to merge"),
            }
        }

        info!(sessions = count, "recovered upload sessions");
        Ok(count)
    }

    /// Fails open sessions past the session timeout and evicts terminal
    /// sessions past retention.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for key in self
            .registry
            .expired_terminal(now, self.config.retention())
        {
            if self.registry.evict(&key).is_err() {
                continue;
            }
            report.evicted += 1;
            let doomed = key.clone();
            match self
                .blocking(move |store| store.delete_session(&doomed))
                .await
            {
                Ok(n) => report.chunks_removed += n,
                Err(e) => warn!(session = %key, error = %e, "failed to delete evicted session"),
            }
        }

        for entry in self
            .registry
            .expired_open(now, self.config.session_timeout())
        {
            if !entry.fail(FailureReason::Expired) {
                continue;
            }
            report.expired += 1;
            let doomed = entry.key().clone();
            match self
                .blocking(move |store| store.delete_session(&doomed))
                .await
            {
                Ok(n) => report.chunks_removed += n,
                Err(e) => {
                    warn!(session = %entry.key(), error = %e, "failed to delete expired session")
                }
            }
            info!(session = %entry.key(), "upload session expired");
        }

        report
    }
}

/// Reads back length and digest of every stored chunk of a session.
fn collect_records(
    store: &dyn ChunkStore,
    key: &SessionKey,
) -> Result<BTreeMap<u32, ChunkRecord>, TransferError> {
    let mut received = BTreeMap::new();
    for index in store.list_indices(key)? {
        if let Some(record) = store.record(key, index)? {
            received.insert(index, record);
        }
    }
    Ok(received)
}

fn error_outcome(e: &TransferError) -> ChunkOutcome {
    ChunkOutcome::Error {
        code: e.code(),
        message: e.to_string(),
    }
}
