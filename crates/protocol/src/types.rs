use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one upload session: `{token}-{logical_name}`.
///
/// The token is issued by the server, so two uploads of files sharing a
/// logical name never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Builds a key from a server-issued token and the caller's logical name.
    pub fn new(token: &str, logical_name: &str) -> Self {
        Self(format!("{token}-{logical_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the key into `(token, logical_name)`.
    pub fn parts(&self) -> Option<(&str, &str)> {
        self.0.split_once('-')
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of an upload session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Open,
    Merging,
    Completed,
    Failed,
}

impl UploadStatus {
    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a session ended up `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// Explicitly aborted by the caller.
    Aborted,
    /// Left open past the session timeout and garbage-collected.
    Expired,
    /// A chunk recorded as received was gone at merge time.
    MissingChunk { index: u32 },
    /// The merged file could not be published under its final name.
    Publication { message: String },
    /// The merge hit an I/O error before publication.
    Storage { message: String },
}

impl FailureReason {
    /// A failed session can be retried unless the caller aborted it or
    /// the sweeper already reclaimed its chunks.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Aborted | Self::Expired)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => f.write_str("aborted by caller"),
            Self::Expired => f.write_str("session expired"),
            Self::MissingChunk { index } => write!(f, "chunk {index} missing at merge"),
            Self::Publication { message } => write!(f, "publication failed: {message}"),
            Self::Storage { message } => write!(f, "storage failure: {message}"),
        }
    }
}

/// Snapshot returned by `getSessionStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionStatus {
    #[serde(rename_all = "camelCase")]
    Open {
        received_count: u32,
        total_chunks: u32,
    },
    Merging,
    #[serde(rename_all = "camelCase")]
    Completed { final_path: String },
    Failed { reason: FailureReason },
}

impl SessionStatus {
    /// Returns the upload progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        match self {
            Self::Open {
                received_count,
                total_chunks,
            } => {
                if *total_chunks == 0 {
                    return 0.0;
                }
                f64::from(*received_count) / f64::from(*total_chunks) * 100.0
            }
            Self::Merging | Self::Completed { .. } => 100.0,
            Self::Failed { .. } => 0.0,
        }
    }
}

/// Stable, machine-readable failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    IndexOutOfRange,
    TotalChunksMismatch,
    DuplicateChunkConflict,
    StorageWriteFailure,
    MissingChunkAtMerge,
    PublicationFailure,
    MergeAborted,
    SessionNotFound,
    SessionNotOpen,
    InvalidName,
    Internal,
}

impl ErrorCode {
    /// Returns `true` when the caller may retry the same request unchanged.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::StorageWriteFailure)
    }
}

/// Result of `uploadChunk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkOutcome {
    #[serde(rename_all = "camelCase")]
    InProgress {
        received_count: u32,
        total_chunks: u32,
    },
    #[serde(rename_all = "camelCase")]
    Success { final_path: String },
    Error { code: ErrorCode, message: String },
}
