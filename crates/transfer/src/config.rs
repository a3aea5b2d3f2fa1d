//! Tunables for the upload core.
//!
//! Deserialized from the `[upload]` table of the agent configuration; every
//! field has a default so partial tables are valid.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When chunk blobs are reclaimed during a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkCleanup {
    /// Delete chunks only after the artifact is published. A failed or
    /// interrupted merge can be retried without re-upload.
    #[default]
    AfterPublish,
    /// Delete each chunk as soon as it is durably copied into the
    /// temporary file. Bounds storage, but a crash mid-merge loses data.
    Eager,
}

/// Upload core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Root directory for chunk blobs and session manifests.
    #[serde(default = "default_chunk_dir")]
    pub chunk_dir: PathBuf,

    /// Directory merged artifacts are published into.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Largest accepted chunk, in bytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    /// Largest accepted `total_chunks` for one session.
    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: u32,

    /// Content-type whitelist (`video/*` style wildcards). Empty allows all.
    #[serde(default)]
    pub allowed_types: Vec<String>,

    /// Open sessions idle longer than this are garbage-collected.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,

    /// Completed/failed sessions are evicted after this long.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Background sweep period.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default)]
    pub cleanup: ChunkCleanup,
}

fn default_chunk_dir() -> PathBuf {
    std::env::temp_dir().join("chunkpost").join("chunks")
}

fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join("chunkpost").join("uploads")
}

fn default_max_chunk_size() -> usize {
    16 * 1024 * 1024
}

fn default_max_total_chunks() -> u32 {
    100_000
}

fn default_session_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_retention_secs() -> u64 {
    60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_dir: default_chunk_dir(),
            output_dir: default_output_dir(),
            max_chunk_size: default_max_chunk_size(),
            max_total_chunks: default_max_total_chunks(),
            allowed_types: Vec::new(),
            session_timeout_secs: default_session_timeout_secs(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            cleanup: ChunkCleanup::default(),
        }
    }
}

impl TransferConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Sweep period, never shorter than one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
