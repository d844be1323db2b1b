//! In-memory file store for tests.

use super::{admit_delete, admit_version, validate_path, FileStore};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use peersync_types::FileMeta;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct StoredFile {
    meta: FileMeta,
    content: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    files: BTreeMap<String, StoredFile>,
    directories: BTreeSet<String>,
    /// Reserved transfers: expected descriptor and bytes so far.
    staged: HashMap<String, (FileMeta, Vec<u8>)>,
}

/// Thread-safe in-memory [`FileStore`].
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    inner: Mutex<Inner>,
}

impl MemoryFileStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a file in place directly, bypassing transfers.
    pub fn insert_file(&self, path: &str, content: &[u8], last_modified: u64) -> FileMeta {
        let meta = FileMeta::of_content(content, last_modified);
        self.lock().files.insert(
            path.to_string(),
            StoredFile {
                meta: meta.clone(),
                content: content.to_vec(),
            },
        );
        meta
    }

    /// Content of a committed file.
    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).map(|f| f.content.clone())
    }

    /// Whether a directory exists.
    pub fn has_directory(&self, path: &str) -> bool {
        self.lock().directories.contains(path)
    }

    /// Whether a transfer is reserved for `path`.
    pub fn is_reserved(&self, path: &str) -> bool {
        self.lock().staged.contains_key(path)
    }

    /// Paths of committed files, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    fn reserve(&self, path: &str, meta: &FileMeta, must_exist: bool) -> StoreResult<()> {
        validate_path(path)?;
        let mut inner = self.lock();
        if inner.staged.contains_key(path) {
            return Err(StoreError::TransferInProgress {
                path: path.to_string(),
            });
        }
        let existing = inner.files.get(path).map(|f| &f.meta);
        admit_version(path, existing, meta, must_exist)?;
        inner
            .staged
            .insert(path.to_string(), (meta.clone(), Vec::new()));
        Ok(())
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn file_meta(&self, path: &str) -> StoreResult<Option<FileMeta>> {
        validate_path(path)?;
        Ok(self.lock().files.get(path).map(|f| f.meta.clone()))
    }

    async fn create_path(&self, path: &str, meta: &FileMeta) -> StoreResult<()> {
        self.reserve(path, meta, false)
    }

    async fn modify_path(&self, path: &str, meta: &FileMeta) -> StoreResult<()> {
        self.reserve(path, meta, true)
    }

    async fn delete_path(&self, path: &str, meta: &FileMeta) -> StoreResult<()> {
        validate_path(path)?;
        let mut inner = self.lock();
        if inner.staged.contains_key(path) {
            return Err(StoreError::TransferInProgress {
                path: path.to_string(),
            });
        }
        admit_delete(path, inner.files.get(path).map(|f| &f.meta), meta)?;
        inner.files.remove(path);
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> StoreResult<()> {
        validate_path(path)?;
        let mut inner = self.lock();
        if !inner.directories.insert(path.to_string()) {
            return Err(StoreError::AlreadyExists {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> StoreResult<()> {
        validate_path(path)?;
        let mut inner = self.lock();
        let prefix = format!("{path}/");
        let occupied = inner.files.keys().any(|f| f.starts_with(&prefix))
            || inner.directories.iter().any(|d| d.starts_with(&prefix));
        if occupied {
            return Err(StoreError::Io(std::io::Error::other(format!(
                "directory {path} is not empty"
            ))));
        }
        if !inner.directories.remove(path) {
            return Err(StoreError::NotFound {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn read_range(
        &self,
        path: &str,
        meta: &FileMeta,
        position: u64,
        length: u64,
    ) -> StoreResult<Vec<u8>> {
        validate_path(path)?;
        let inner = self.lock();
        let file = inner.files.get(path).ok_or_else(|| StoreError::NotFound {
            path: path.to_string(),
        })?;
        if file.meta.identity != meta.identity {
            return Err(StoreError::IdentityMismatch {
                path: path.to_string(),
            });
        }
        let size = file.content.len() as u64;
        let start = position.min(size) as usize;
        let end = position.saturating_add(length).min(size) as usize;
        Ok(file.content[start..end].to_vec())
    }

    async fn write_range(&self, path: &str, position: u64, content: &[u8]) -> StoreResult<()> {
        let mut inner = self.lock();
        let (_, buffer) = inner
            .staged
            .get_mut(path)
            .ok_or_else(|| StoreError::NotReserved {
                path: path.to_string(),
            })?;
        let start = position as usize;
        let end = start + content.len();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(content);
        Ok(())
    }

    async fn finalize(&self, path: &str, expected: &FileMeta) -> StoreResult<()> {
        let mut inner = self.lock();
        let (reserved, content) = inner.staged.remove(path).ok_or_else(|| StoreError::NotReserved {
            path: path.to_string(),
        })?;
        if reserved.identity != expected.identity {
            return Err(StoreError::IdentityMismatch {
                path: path.to_string(),
            });
        }
        let actual = content.len() as u64;
        if actual != expected.file_size {
            return Err(StoreError::SizeMismatch {
                path: path.to_string(),
                expected: expected.file_size,
                actual,
            });
        }
        if peersync_types::content_identity(&content) != expected.identity {
            return Err(StoreError::IdentityMismatch {
                path: path.to_string(),
            });
        }
        inner.files.insert(
            path.to_string(),
            StoredFile {
                meta: expected.clone(),
                content,
            },
        );
        Ok(())
    }

    async fn abandon(&self, path: &str) -> StoreResult<()> {
        self.lock().staged.remove(path);
        Ok(())
    }
}
