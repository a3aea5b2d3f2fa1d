//! Chunk blob storage keyed by `(session, index)`.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use chunkpost_protocol::{FailureReason, SessionKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TransferError;
use crate::registry::ChunkRecord;

const MANIFEST_FILE: &str = "session.json";
const PART_EXT: &str = "part";

/// Durable description of a session, written when it is registered so that
/// chunks stored before a crash can be reattached on restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionManifest {
    pub key: SessionKey,
    pub logical_name: String,
    pub total_chunks: u32,
    pub created_at: DateTime<Utc>,
    /// Set once the session has failed; such sessions are restored as
    /// `Failed`, never reopened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

/// Blob storage for chunks.
///
/// Implementations perform blocking I/O; async callers offload calls to
/// `tokio::task::spawn_blocking`. Keys of different sessions never overlap.
pub trait ChunkStore: Send + Sync {
    /// Stores a chunk. The blob is either fully written or absent.
    fn put(&self, key: &SessionKey, index: u32, data: &[u8]) -> Result<(), TransferError>;

    /// Opens a chunk for streaming. Returns `None` if the blob is absent.
    fn open(
        &self,
        key: &SessionKey,
        index: u32,
    ) -> Result<Option<Box<dyn Read + Send>>, TransferError>;

    /// Length and SHA-256 hex digest of a stored chunk, `None` if absent.
    fn record(&self, key: &SessionKey, index: u32) -> Result<Option<ChunkRecord>, TransferError>;

    /// Deletes one chunk. Returns `false` if it did not exist.
    fn delete(&self, key: &SessionKey, index: u32) -> Result<bool, TransferError>;

    /// Deletes every chunk and the manifest of a session.
    ///
    /// Returns the number of chunk blobs removed.
    fn delete_session(&self, key: &SessionKey) -> Result<usize, TransferError>;

    /// Indices with a stored blob, ascending.
    fn list_indices(&self, key: &SessionKey) -> Result<Vec<u32>, TransferError>;

    /// Moves all blobs of `from` under `to`.
    fn rehome(&self, from: &SessionKey, to: &SessionKey) -> Result<(), TransferError>;

    fn write_manifest(&self, manifest: &SessionManifest) -> Result<(), TransferError>;

    fn load_manifests(&self) -> Result<Vec<SessionManifest>, TransferError>;
}

/// Stores chunks as `<root>/<session>/<index>.part`.
pub struct FilesystemChunkStore {
    root: PathBuf,
}

impl FilesystemChunkStore {
    /// Creates the store, creating `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, TransferError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn session_dir(&self, key: &SessionKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn chunk_path(&self, key: &SessionKey, index: u32) -> PathBuf {
        self.session_dir(key).join(format!("{index}.{PART_EXT}"))
    }
}

/// Writes `data` to a unique sibling of `path`, fsyncs, then renames it into
/// place.
fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.tmp.{}", uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        std::fs::rename(&temp_path, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result
}

fn not_found_as_none<T>(result: std::io::Result<T>) -> std::io::Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl ChunkStore for FilesystemChunkStore {
    fn put(&self, key: &SessionKey, index: u32, data: &[u8]) -> Result<(), TransferError> {
        std::fs::create_dir_all(self.session_dir(key))?;
        write_atomic(&self.chunk_path(key, index), data)?;
        Ok(())
    }

    fn open(
        &self,
        key: &SessionKey,
        index: u32,
    ) -> Result<Option<Box<dyn Read + Send>>, TransferError> {
        let file = not_found_as_none(std::fs::File::open(self.chunk_path(key, index)))?;
        Ok(file.map(|f| Box::new(f) as Box<dyn Read + Send>))
    }

    fn record(&self, key: &SessionKey, index: u32) -> Result<Option<ChunkRecord>, TransferError> {
        let Some(mut file) = not_found_as_none(std::fs::File::open(self.chunk_path(key, index)))?
        else {
            return Ok(None);
        };
        let mut hasher = Sha256::new();
        let len = std::io::copy(&mut file, &mut hasher)?;
        Ok(Some(ChunkRecord {
            len,
            sha256: hex::encode(hasher.finalize()),
        }))
    }

    fn delete(&self, key: &SessionKey, index: u32) -> Result<bool, TransferError> {
        Ok(not_found_as_none(std::fs::remove_file(self.chunk_path(key, index)))?.is_some())
    }

    fn delete_session(&self, key: &SessionKey) -> Result<usize, TransferError> {
        let removed = self.list_indices(key)?.len();
        if not_found_as_none(std::fs::remove_dir_all(self.session_dir(key)))?.is_some() {
            tracing::debug!(session = %key, removed, "deleted session chunks");
        }
        Ok(removed)
    }

    fn list_indices(&self, key: &SessionKey) -> Result<Vec<u32>, TransferError> {
        let Some(entries) = not_found_as_none(std::fs::read_dir(self.session_dir(key)))? else {
            return Ok(Vec::new());
        };

        let mut indices = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(index) = name
                .strip_suffix(PART_EXT)
                .and_then(|stem| stem.strip_suffix('.'))
                .and_then(|stem| stem.parse::<u32>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    fn rehome(&self, from: &SessionKey, to: &SessionKey) -> Result<(), TransferError> {
        let target = self.session_dir(to);
        if target.exists() {
            return Err(TransferError::Internal(format!(
                "session directory already exists: {}",
                target.display()
            )));
        }
        match not_found_as_none(std::fs::rename(self.session_dir(from), &target))? {
            Some(()) => {}
            None => std::fs::create_dir_all(&target)?,
        }
        // The old manifest names the old key.
        let _ = std::fs::remove_file(target.join(MANIFEST_FILE));
        Ok(())
    }

    fn write_manifest(&self, manifest: &SessionManifest) -> Result<(), TransferError> {
        let dir = self.session_dir(&manifest.key);
        std::fs::create_dir_all(&dir)?;
        let json = serde_json::to_vec_pretty(manifest)?;
        write_atomic(&dir.join(MANIFEST_FILE), &json)?;
        Ok(())
    }

    fn load_manifests(&self) -> Result<Vec<SessionManifest>, TransferError> {
        let mut manifests = Vec::new();
        for entry in std::fs::read_dir(&self.root)?.flatten() {
            let path = entry.path().join(MANIFEST_FILE);
            let Some(content) = not_found_as_none(std::fs::read(&path))? else {
                continue;
            };
            match serde_json::from_slice::<SessionManifest>(&content) {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session manifest");
                }
            }
        }
        Ok(manifests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum_bytes;
    use tempfile::TempDir;

    fn key(s: &str) -> SessionKey {
        SessionKey::new("tok", s)
    }

    fn read_all(store: &FilesystemChunkStore, k: &SessionKey, index: u32) -> Option<Vec<u8>> {
        store.open(k, index).unwrap().map(|mut r| {
            let mut buf = Vec::new();
            r.read_to_end(&mut buf).unwrap();
            buf
        })
    }

    #[test]
    fn put_open_delete() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).unwrap();
        let k = key("a.bin");

        store.put(&k, 0, b"hello").unwrap();
        assert_eq!(read_all(&store, &k, 0).as_deref(), Some(&b"hello"[..]));
        assert!(read_all(&store, &k, 1).is_none());

        assert!(store.delete(&k, 0).unwrap());
        assert!(!store.delete(&k, 0).unwrap());
        assert!(read_all(&store, &k, 0).is_none());
    }

    #[test]
    fn put_overwrites_atomically_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).unwrap();
        let k = key("a.bin");

        store.put(&k, 3, b"first").unwrap();
        store.put(&k, 3, b"second").unwrap();
        assert_eq!(read_all(&store, &k, 3).as_deref(), Some(&b"second"[..]));

        let names: Vec<_> = std::fs::read_dir(dir.path().join(k.as_str()))
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["3.part".to_string()]);
    }

    #[test]
    fn record_matches_checksum_bytes() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).unwrap();
        let k = key("a.bin");
        store.put(&k, 0, b"payload").unwrap();
        assert_eq!(
            store.record(&k, 0).unwrap(),
            Some(ChunkRecord {
                len: 7,
                sha256: checksum_bytes(b"payload"),
            })
        );
        assert_eq!(store.record(&k, 9).unwrap(), None);
    }

    #[test]
    fn sessions_are_isolated() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).unwrap();
        let a = SessionKey::new("t1", "same.bin");
        let b = SessionKey::new("t2", "same.bin");

        store.put(&a, 0, b"A").unwrap();
        store.put(&b, 0, b"B").unwrap();
        assert_eq!(store.delete_session(&a).unwrap(), 1);
        assert_eq!(read_all(&store, &b, 0).as_deref(), Some(&b"B"[..]));
    }

    #[test]
    fn list_indices_sorted_and_ignores_manifest() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).unwrap();
        let k = key("a.bin");
        for i in [10, 2, 7] {
            store.put(&k, i, b"x").unwrap();
        }
        store
            .write_manifest(&SessionManifest {
                key: k.clone(),
                logical_name: "a.bin".into(),
                total_chunks: 11,
                created_at: Utc::now(),
                failure: None,
            })
            .unwrap();
        assert_eq!(store.list_indices(&k).unwrap(), vec![2, 7, 10]);
        assert!(store.list_indices(&key("missing")).unwrap().is_empty());
    }

    #[test]
    fn delete_session_counts_only_blobs() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).unwrap();
        let k = key("a.bin");
        for i in 0..3 {
            store.put(&k, i, b"x").unwrap();
        }
        store
            .write_manifest(&SessionManifest {
                key: k.clone(),
                logical_name: "a.bin".into(),
                total_chunks: 5,
                created_at: Utc::now(),
                failure: None,
            })
            .unwrap();
        assert_eq!(store.delete_session(&k).unwrap(), 3);
        assert!(!dir.path().join(k.as_str()).exists());
        assert_eq!(store.delete_session(&k).unwrap(), 0);
    }

    #[test]
    fn manifests_roundtrip_and_skip_garbage() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).unwrap();
        let manifest = SessionManifest {
            key: key("a.bin"),
            logical_name: "a.bin".into(),
            total_chunks: 4,
            created_at: Utc::now(),
            failure: None,
        };
        store.write_manifest(&manifest).unwrap();
        let failed = SessionManifest {
            key: key("b.bin"),
            logical_name: "b.bin".into(),
            total_chunks: 2,
            created_at: Utc::now(),
            failure: Some(FailureReason::MissingChunk { index: 1 }),
        };
        store.write_manifest(&failed).unwrap();

        let junk = dir.path().join("junk");
        std::fs::create_dir_all(&junk).unwrap();
        std::fs::write(junk.join(MANIFEST_FILE), b"{not json").unwrap();

        let mut loaded = store.load_manifests().unwrap();
        loaded.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(loaded, vec![manifest, failed]);

        let raw = std::fs::read_to_string(dir.path().join(key("a.bin").as_str()).join(MANIFEST_FILE))
            .unwrap();
        assert!(!raw.contains("failure"));
    }

    #[test]
    fn rehome_moves_blobs_and_drops_old_manifest() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).unwrap();
        let from = SessionKey::new("old", "a.bin");
        let to = SessionKey::new("new", "a.bin");
        store.put(&from, 1, b"one").unwrap();
        store
            .write_manifest(&SessionManifest {
                key: from.clone(),
                logical_name: "a.bin".into(),
                total_chunks: 2,
                created_at: Utc::now(),
                failure: None,
            })
            .unwrap();

        store.rehome(&from, &to).unwrap();
        assert_eq!(store.list_indices(&to).unwrap(), vec![1]);
        assert!(store.list_indices(&from).unwrap().is_empty());
        assert!(store.load_manifests().unwrap().is_empty());
    }
}
