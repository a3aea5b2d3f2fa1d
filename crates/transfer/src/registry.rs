use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chunkpost_protocol::{FailureReason, SessionKey, SessionStatus, UploadStatus};
use tokio::sync::OwnedMutexGuard;

use crate::TransferError;
use crate::merge::FinalArtifact;

/// Length and digest of a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub len: u64,
    pub sha256: String,
}

/// Result of recording a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    /// More distinct indices are still expected.
    Pending { received: u32, total: u32 },
    /// This call moved the session into `Merging`. Returned once per session.
    Complete,
}

/// One upload session (thread-safe).
///
/// Bookkeeping sits behind a per-session mutex; sessions never contend
/// with each other.
pub struct SessionEntry {
    key: SessionKey,
    logical_name: String,
    total_chunks: u32,
    inner: Mutex<SessionInner>,
    index_locks: Mutex<HashMap<u32, Arc<tokio::sync::Mutex<()>>>>,
}

struct SessionInner {
    status: UploadStatus,
    received: BTreeMap<u32, ChunkRecord>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    failure: Option<FailureReason>,
    artifact: Option<FinalArtifact>,
}

impl SessionEntry {
    /// Creates a new open session.
    pub fn new(key: SessionKey, logical_name: String, total_chunks: u32) -> Self {
        Self::restore(key, logical_name, total_chunks, Utc::now(), BTreeMap::new())
    }

    /// Rebuilds an open session from persisted state.
    pub fn restore(
        key: SessionKey,
        logical_name: String,
        total_chunks: u32,
        created_at: DateTime<Utc>,
        received: BTreeMap<u32, ChunkRecord>,
    ) -> Self {
        Self {
            key,
            logical_name,
            total_chunks,
            inner: Mutex::new(SessionInner {
                status: UploadStatus::Open,
                received,
                created_at,
                updated_at: created_at,
                finished_at: None,
                failure: None,
                artifact: None,
            }),
            index_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().created_at
    }

    /// Serializes admissions of one index. Different indices proceed
    /// concurrently.
    pub async fn lock_index(&self, index: u32) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.index_locks.lock().unwrap();
            Arc::clone(locks.entry(index).or_default())
        };
        lock.lock_owned().await
    }

    pub fn upload_status(&self) -> UploadStatus {
        self.inner.lock().unwrap().status
    }

    /// Returns the interface snapshot of this session.
    pub fn status(&self) -> SessionStatus {
        let s = self.inner.lock().unwrap();
        match s.status {
            UploadStatus::Open => SessionStatus::Open {
                received_count: s.received.len() as u32,
                total_chunks: self.total_chunks,
            },
            UploadStatus::Merging => SessionStatus::Merging,
            UploadStatus::Completed => SessionStatus::Completed {
                final_path: s
                    .artifact
                    .as_ref()
                    .map(|a| a.path.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            },
            UploadStatus::Failed => SessionStatus::Failed {
                reason: s.failure.clone().unwrap_or(FailureReason::Aborted),
            },
        }
    }

    /// Record of a previously accepted chunk.
    pub fn record(&self, index: u32) -> Option<ChunkRecord> {
        self.inner.lock().unwrap().received.get(&index).cloned()
    }

    /// Indices accepted so far, ascending.
    pub fn received_indices(&self) -> Vec<u32> {
        self.inner.lock().unwrap().received.keys().copied().collect()
    }

    /// Indices not yet accepted, ascending.
    pub fn missing_indices(&self) -> Vec<u32> {
        let s = self.inner.lock().unwrap();
        (0..self.total_chunks)
            .filter(|i| !s.received.contains_key(i))
            .collect()
    }

    pub fn received_bytes(&self) -> u64 {
        self.inner.lock().unwrap().received.values().map(|r| r.len).sum()
    }

    pub fn failure(&self) -> Option<FailureReason> {
        self.inner.lock().unwrap().failure.clone()
    }

    pub fn artifact(&self) -> Option<FinalArtifact> {
        self.inner.lock().unwrap().artifact.clone()
    }

    /// Records a durably stored chunk.
    ///
    /// Completeness counts distinct indices; the transition to `Merging`
    /// happens under the session lock, so exactly one caller sees
    /// [`Receipt::Complete`].
    pub fn mark_received(&self, index: u32, record: ChunkRecord) -> Result<Receipt, TransferError> {
        if index >= self.total_chunks {
            return Err(TransferError::IndexOutOfRange {
                index,
                total: self.total_chunks,
            });
        }

        let mut s = self.inner.lock().unwrap();
        if s.status != UploadStatus::Open {
            return Err(TransferError::SessionNotOpen {
                key: self.key.to_string(),
                status: s.status,
            });
        }
        if let Some(existing) = s.received.get(&index)
            && existing.sha256 != record.sha256
        {
            return Err(TransferError::DuplicateChunkConflict { index });
        }

        s.received.insert(index, record);
        s.updated_at = Utc::now();

        let received = s.received.len() as u32;
        if received == self.total_chunks {
            s.status = UploadStatus::Merging;
            Ok(Receipt::Complete)
        } else {
            Ok(Receipt::Pending {
                received,
                total: self.total_chunks,
            })
        }
    }

    /// Moves an open session whose every index is already recorded into
    /// `Merging`. Used for sessions rebuilt from disk.
    pub fn try_begin_merge(&self) -> bool {
        let mut s = self.inner.lock().unwrap();
        if s.status == UploadStatus::Open && s.received.len() as u32 == self.total_chunks {
            s.status = UploadStatus::Merging;
            s.updated_at = Utc::now();
            true
        } else {
            false
        }
    }

    /// Publishes a merged artifact while holding the session lock.
    ///
    /// `publish` only runs if the session is still merging, and a successful
    /// publication moves it to `Completed` before the lock is released, so a
    /// concurrent abort either happens before publication or not at all.
    /// Returns `None` if the session left `Merging` (e.g. was aborted).
    pub fn finish_merge<E>(
        &self,
        publish: impl FnOnce() -> Result<FinalArtifact, E>,
    ) -> Option<Result<FinalArtifact, E>> {
        let mut s = self.inner.lock().unwrap();
        if s.status != UploadStatus::Merging {
            return None;
        }
        let result = publish();
        if let Ok(artifact) = &result {
            s.status = UploadStatus::Completed;
            s.artifact = Some(artifact.clone());
            let now = Utc::now();
            s.finished_at = Some(now);
            s.updated_at = now;
        }
        Some(result)
    }

    /// Marks the session as failed. Returns `false` if it was already terminal.
    pub fn fail(&self, reason: FailureReason) -> bool {
        let mut s = self.inner.lock().unwrap();
        if s.status.is_terminal() {
            return false;
        }
        s.status = UploadStatus::Failed;
        s.failure = Some(reason);
        let now = Utc::now();
        s.finished_at = Some(now);
        s.updated_at = now;
        true
    }

    /// Aborts the session.
    ///
    /// Idempotent on failed sessions (`Ok(false)`); completed sessions
    /// cannot be aborted.
    pub fn abort(&self) -> Result<bool, TransferError> {
        let mut s = self.inner.lock().unwrap();
        match s.status {
            UploadStatus::Completed => Err(TransferError::SessionNotOpen {
                key: self.key.to_string(),
                status: s.status,
            }),
            UploadStatus::Failed => Ok(false),
            UploadStatus::Open | UploadStatus::Merging => {
                s.status = UploadStatus::Failed;
                s.failure = Some(FailureReason::Aborted);
                let now = Utc::now();
                s.finished_at = Some(now);
                s.updated_at = now;
                Ok(true)
            }
        }
    }

    fn open_since(&self, cutoff: DateTime<Utc>) -> bool {
        let s = self.inner.lock().unwrap();
        s.status == UploadStatus::Open && s.created_at < cutoff
    }

    fn finished_before(&self, cutoff: DateTime<Utc>) -> bool {
        let s = self.inner.lock().unwrap();
        s.status.is_terminal() && s.finished_at.is_some_and(|t| t < cutoff)
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
}

/// Tracks every live upload session by key.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionKey, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session for `key`, creating it if absent.
    ///
    /// The boolean is `true` when a new session was created. An existing
    /// session must agree on `total_chunks`.
    pub fn register(
        &self,
        key: &SessionKey,
        logical_name: &str,
        total_chunks: u32,
    ) -> Result<(Arc<SessionEntry>, bool), TransferError> {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(existing) = sessions.get(key) {
            if existing.total_chunks() != total_chunks {
                return Err(TransferError::TotalChunksMismatch {
                    expected: existing.total_chunks(),
                    got: total_chunks,
                });
            }
            return Ok((Arc::clone(existing), false));
        }

        let entry = Arc::new(SessionEntry::new(
            key.clone(),
            logical_name.to_string(),
            total_chunks,
        ));
        sessions.insert(key.clone(), Arc::clone(&entry));
        Ok((entry, true))
    }

    /// Inserts a rebuilt session, replacing nothing.
    pub fn insert(&self, entry: Arc<SessionEntry>) -> bool {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.contains_key(entry.key()) {
            return false;
        }
        sessions.insert(entry.key().clone(), entry);
        true
    }

    pub fn get(&self, key: &SessionKey) -> Result<Arc<SessionEntry>, TransferError> {
        self.sessions
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| TransferError::SessionNotFound(key.to_string()))
    }

    pub fn mark_received(
        &self,
        key: &SessionKey,
        index: u32,
        record: ChunkRecord,
    ) -> Result<Receipt, TransferError> {
        self.get(key)?.mark_received(index, record)
    }

    pub fn status(&self, key: &SessionKey) -> Result<SessionStatus, TransferError> {
        Ok(self.get(key)?.status())
    }

    /// Forgets a terminal session. Open or merging sessions are kept.
    pub fn evict(&self, key: &SessionKey) -> Result<(), TransferError> {
        let mut sessions = self.sessions.write().unwrap();
        let entry = sessions
            .get(key)
            .ok_or_else(|| TransferError::SessionNotFound(key.to_string()))?;
        let status = entry.upload_status();
        if !status.is_terminal() {
            return Err(TransferError::SessionNotOpen {
                key: key.to_string(),
                status,
            });
        }
        sessions.remove(key);
        Ok(())
    }

    /// Open sessions created more than `timeout` before `now`.
    pub fn expired_open(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<Arc<SessionEntry>> {
        let Some(cutoff) = cutoff(now, timeout) else {
            return Vec::new();
        };
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|e| e.open_since(cutoff))
            .cloned()
            .collect()
    }

    /// Terminal sessions that finished more than `retention` before `now`.
    pub fn expired_terminal(&self, now: DateTime<Utc>, retention: Duration) -> Vec<SessionKey> {
        let Some(cutoff) = cutoff(now, retention) else {
            return Vec::new();
        };
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|e| e.finished_before(cutoff))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
