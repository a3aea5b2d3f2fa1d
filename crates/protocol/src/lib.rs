//! Core-facing interface types for chunked uploads.
//!
//! The transport layer (HTTP, CLI) maps these to whatever encoding it uses;
//! they serialize to camelCase JSON with snake_case tags.

pub mod types;

pub use types::{
    ChunkOutcome, ErrorCode, FailureReason, SessionKey, SessionStatus, UploadStatus,
};
