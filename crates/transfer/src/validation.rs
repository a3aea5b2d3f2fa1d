use std::path::{Component, Path};

use crate::TransferError;

/// Validates that a relative file path does not escape its base directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_upload_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::InvalidName("empty path".into()));
    }

    let path = Path::new(file_path);

    if path.is_absolute() {
        return Err(TransferError::InvalidName(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::InvalidName(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) => {
                return Err(TransferError::InvalidName(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::RootDir => {
                return Err(TransferError::InvalidName(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Validates a caller-supplied logical file name.
///
/// The name becomes part of the session key and of the published file
/// name, so it must be a single path component.
pub fn validate_logical_name(name: &str) -> Result<(), TransferError> {
    validate_upload_path(name)?;
    if name.contains('/') || name.contains('\\') {
        return Err(TransferError::InvalidName(format!(
            "separators not allowed in file name: {name}"
        )));
    }
    if name == "." || name.starts_with('.') {
        return Err(TransferError::InvalidName(format!(
            "hidden file names not allowed: {name}"
        )));
    }
    Ok(())
}

/// Declared metadata of an inbound chunk.
#[derive(Debug, Clone, Copy)]
pub struct ChunkMeta<'a> {
    pub content_type: &'a str,
    pub len: usize,
}

/// Accepts or rejects a chunk before anything is stored.
pub trait ChunkValidator: Send + Sync {
    fn validate(&self, meta: &ChunkMeta<'_>) -> Result<(), TransferError>;
}

/// Size and content-type whitelist policy.
#[derive(Debug, Clone)]
pub struct PolicyValidator {
    allowed_types: Vec<String>,
    max_chunk_size: usize,
}

impl PolicyValidator {
    /// An empty `allowed_types` list accepts every content type.
    pub fn new(allowed_types: Vec<String>, max_chunk_size: usize) -> Self {
        Self {
            allowed_types,
            max_chunk_size,
        }
    }

    fn type_allowed(&self, content_type: &str) -> bool {
        if self.allowed_types.is_empty() {
            return true;
        }
        // Ignore parameters such as `; charset=binary`.
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.allowed_types.iter().any(|allowed| {
            match allowed.strip_suffix("/*") {
                Some(major) => essence
                    .split_once('/')
                    .is_some_and(|(m, _)| m.eq_ignore_ascii_case(major)),
                None => allowed.eq_ignore_ascii_case(&essence),
            }
        })
    }
}

impl ChunkValidator for PolicyValidator {
    fn validate(&self, meta: &ChunkMeta<'_>) -> Result<(), TransferError> {
        if meta.len == 0 {
            return Err(TransferError::Validation("empty chunk".into()));
        }
        if meta.len > self.max_chunk_size {
            return Err(TransferError::Validation(format!(
                "chunk of {} bytes exceeds limit of {} bytes",
                meta.len, self.max_chunk_size
            )));
        }
        if !self.type_allowed(meta.content_type) {
            return Err(TransferError::Validation(format!(
                "content type not allowed: {}",
                meta.content_type
            )));
        }
        Ok(())
    }
}
