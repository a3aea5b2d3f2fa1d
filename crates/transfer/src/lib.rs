//! Chunked upload ingestion and merge.
//!
//! Chunks of one logical file arrive as independent requests, are persisted
//! under `(session, index)`, and are concatenated into the final artifact
//! once every distinct index has been stored.

mod chunked;
mod config;
mod merge;
mod registry;
mod service;
mod store;
mod sweep;
mod token;
mod validation;

pub use chunked::{Chunk, ChunkReader, checksum_bytes};
pub use config::{ChunkCleanup, TransferConfig};
pub use merge::{FinalArtifact, MergeCoordinator};
pub use registry::{ChunkRecord, Receipt, SessionEntry, SessionRegistry};
pub use service::{Admission, ChunkPayload, SweepReport, UploadService};
pub use store::{ChunkStore, FilesystemChunkStore, SessionManifest};
pub use sweep::Sweeper;
pub use token::generate_token;
pub use validation::{
    ChunkMeta, ChunkValidator, PolicyValidator, validate_logical_name, validate_upload_path,
};

use chunkpost_protocol::{ErrorCode, UploadStatus};

/// Default chunk size used by [`ChunkReader`]: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chunk rejected: {0}")]
    Validation(String),

    #[error("checksum mismatch for chunk {index}")]
    ChecksumMismatch { index: u32 },

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("chunk index {index} out of range (total {total})")]
    IndexOutOfRange { index: u32, total: u32 },

    #[error("total chunks mismatch: session expects {expected}, request says {got}")]
    TotalChunksMismatch { expected: u32, got: u32 },

    #[error("chunk {index} already stored with different content")]
    DuplicateChunkConflict { index: u32 },

    #[error("failed to store chunk {index}: {source}")]
    StorageWrite {
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write merged artifact: {0}")]
    FinalWrite(#[source] std::io::Error),

    #[error("chunk {index} missing at merge")]
    MissingChunkAtMerge { index: u32 },

    #[error("publication failed: {0}")]
    Publication(String),

    #[error("merge aborted: session was aborted concurrently")]
    MergeAborted,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {key} is not open ({status:?})")]
    SessionNotOpen { key: String, status: UploadStatus },

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// Maps the error onto its stable interface code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) | Self::ChecksumMismatch { .. } => ErrorCode::ValidationError,
            Self::InvalidName(_) => ErrorCode::InvalidName,
            Self::IndexOutOfRange { .. } => ErrorCode::IndexOutOfRange,
            Self::TotalChunksMismatch { .. } => ErrorCode::TotalChunksMismatch,
            Self::DuplicateChunkConflict { .. } => ErrorCode::DuplicateChunkConflict,
            Self::StorageWrite { .. } | Self::FinalWrite(_) => ErrorCode::StorageWriteFailure,
            Self::MissingChunkAtMerge { .. } => ErrorCode::MissingChunkAtMerge,
            Self::Publication(_) => ErrorCode::PublicationFailure,
            Self::MergeAborted => ErrorCode::MergeAborted,
            Self::SessionNotFound(_) => ErrorCode::SessionNotFound,
            Self::SessionNotOpen { .. } => ErrorCode::SessionNotOpen,
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_follow_taxonomy() {
        assert_eq!(
            TransferError::Validation("too big".into()).code(),
            ErrorCode::ValidationError
        );
        assert_eq!(
            TransferError::IndexOutOfRange { index: 5, total: 5 }.code(),
            ErrorCode::IndexOutOfRange
        );
        assert_eq!(
            TransferError::StorageWrite {
                index: 0,
                source: std::io::Error::other("disk full"),
            }
            .code(),
            ErrorCode::StorageWriteFailure
        );
        assert!(
            TransferError::StorageWrite {
                index: 0,
                source: std::io::Error::other("disk full"),
            }
            .code()
            .is_retryable()
        );
        assert_eq!(
            TransferError::FinalWrite(std::io::Error::other("read-only fs")).code(),
            ErrorCode::StorageWriteFailure
        );
        assert_eq!(
            TransferError::DuplicateChunkConflict { index: 1 }.code(),
            ErrorCode::DuplicateChunkConflict
        );
    }

    #[test]
    fn error_messages_are_human_readable() {
        let e = TransferError::TotalChunksMismatch {
            expected: 4,
            got: 5,
        };
        assert_eq!(
            e.to_string(),
            "total chunks mismatch: session expects 4, request says 5"
        );
    }
}
