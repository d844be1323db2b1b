//! File store backed by a local directory.
//!
//! Incoming content is assembled in a staging file under
//! `<root>/.peersync-staging/`, verified against its descriptor and only
//! then renamed over the target, so a half-received file is never visible
//! in the share.

use super::{admit_delete, admit_version, validate_path, FileStore};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use filetime::FileTime;
use peersync_types::FileMeta;
use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Name of the staging directory inside the share root.
pub const STAGING_DIR: &str = ".peersync-staging";

/// Hex BLAKE3 of a file's content. Blocking.
pub(crate) fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Modification time in milliseconds since the Unix epoch.
pub(crate) fn modified_millis(metadata: &std::fs::Metadata) -> u64 {
    let time = FileTime::from_last_modification_time(metadata);
    let secs = u64::try_from(time.unix_seconds()).unwrap_or(0);
    secs * 1000 + u64::from(time.nanoseconds() / 1_000_000)
}

fn file_time(millis: u64) -> FileTime {
    let secs = i64::try_from(millis / 1000).unwrap_or(i64::MAX);
    FileTime::from_unix_time(secs, ((millis % 1000) * 1_000_000) as u32)
}

/// Identity computed for a file, valid while size and mtime are unchanged.
#[derive(Debug, Clone)]
struct CachedIdentity {
    file_size: u64,
    last_modified: u64,
    identity: String,
}

/// [`FileStore`] over a directory on disk.
#[derive(Debug)]
pub struct LocalFileStore {
    root: PathBuf,
    staging: PathBuf,
    /// Reserved transfers and the version each expects.
    reservations: Mutex<HashMap<String, FileMeta>>,
    identities: Mutex<HashMap<String, CachedIdentity>>,
}

impl LocalFileStore {
    /// Open a store rooted at `root`, creating it if needed.
    ///
    /// Leftover staging files from an earlier run are removed.
    pub async fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        let staging = root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging).await?;

        let mut leftovers = tokio::fs::read_dir(&staging).await?;
        while let Some(entry) = leftovers.next_entry().await? {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                tracing::warn!("Could not remove stale staging file {:?}: {}", entry.path(), e);
            }
        }

        Ok(Self {
            root,
            staging,
            reservations: Mutex::new(HashMap::new()),
            identities: Mutex::new(HashMap::new()),
        })
    }

    /// The share root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }

    fn staging_path(&self, path: &str) -> PathBuf {
        self.staging
            .join(blake3::hash(path.as_bytes()).to_hex().as_str())
    }

    fn reservations(&self) -> MutexGuard<'_, HashMap<String, FileMeta>> {
        self.reservations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn identities(&self) -> MutexGuard<'_, HashMap<String, CachedIdentity>> {
        self.identities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_unreserved(&self, path: &str) -> StoreResult<()> {
        if self.reservations().contains_key(path) {
            return Err(StoreError::TransferInProgress {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn reserve(&self, path: &str, meta: &FileMeta, must_exist: bool) -> StoreResult<()> {
        self.ensure_unreserved(path)?;
        let existing = self.file_meta(path).await?;
        admit_version(path, existing.as_ref(), meta, must_exist)?;

        {
            let mut reservations = self.reservations();
            if reservations.contains_key(path) {
                return Err(StoreError::TransferInProgress {
                    path: path.to_string(),
                });
            }
            reservations.insert(path.to_string(), meta.clone());
        }

        if let Err(e) = tokio::fs::File::create(self.staging_path(path)).await {
            self.reservations().remove(path);
            return Err(e.into());
        }
        tracing::debug!("Reserved {} for {} bytes", path, meta.file_size);
        Ok(())
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn file_meta(&self, path: &str) -> StoreResult<Option<FileMeta>> {
        let full = self.resolve(path)?;
        let metadata = match tokio::fs::metadata(&full).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !metadata.is_file() {
            return Err(StoreError::InvalidPath {
                path: path.to_string(),
                reason: "not a regular file",
            });
        }

        let file_size = metadata.len();
        let last_modified = modified_millis(&metadata);
        let cached = self.identities().get(path).cloned();
        let identity = match cached {
            Some(c) if c.file_size == file_size && c.last_modified == last_modified => c.identity,
            _ => {
                let identity = tokio::task::spawn_blocking(move || hash_file(&full))
                    .await
                    .map_err(io::Error::other)??;
                self.identities().insert(
                    path.to_string(),
                    CachedIdentity {
                        file_size,
                        last_modified,
                        identity: identity.clone(),
                    },
                );
                identity
            }
        };

        Ok(Some(FileMeta::new(identity, last_modified, file_size)))
    }

    async fn create_path(&self, path: &str, meta: &FileMeta) -> StoreResult<()> {
        self.reserve(path, meta, false).await
    }

    async fn modify_path(&self, path: &str, meta: &FileMeta) -> StoreResult<()> {
        self.reserve(path, meta, true).await
    }

    async fn delete_path(&self, path: &str, meta: &FileMeta) -> StoreResult<()> {
        self.ensure_unreserved(path)?;
        let existing = self.file_meta(path).await?;
        admit_delete(path, existing.as_ref(), meta)?;
        tokio::fs::remove_file(self.resolve(path)?).await?;
        self.identities().remove(path);
        Ok(())
    }

    async fn create_directory(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        if tokio::fs::try_exists(&full).await? {
            return Err(StoreError::AlreadyExists {
                path: path.to_string(),
            });
        }
        tokio::fs::create_dir_all(&full).await?;
        Ok(())
    }

    async fn delete_directory(&self, path: &str) -> StoreResult<()> {
        let full = self.resolve(path)?;
        match tokio::fs::metadata(&full).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => {
                return Err(StoreError::InvalidPath {
                    path: path.to_string(),
                    reason: "not a directory",
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    path: path.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        tokio::fs::remove_dir(&full).await?;
        Ok(())
    }

    async fn read_range(
        &self,
        path: &str,
        meta: &FileMeta,
        position: u64,
        length: u64,
    ) -> StoreResult<Vec<u8>> {
        let full = self.resolve(path)?;
        let mut file = match tokio::fs::File::open(&full).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    path: path.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let metadata = file.metadata().await?;
        if metadata.len() != meta.file_size || modified_millis(&metadata) != meta.last_modified {
            return Err(StoreError::IdentityMismatch {
                path: path.to_string(),
            });
        }

        file.seek(SeekFrom::Start(position)).await?;
        let mut content = Vec::with_capacity(length.min(metadata.len()) as usize);
        file.take(length).read_to_end(&mut content).await?;
        Ok(content)
    }

    async fn write_range(&self, path: &str, position: u64, content: &[u8]) -> StoreResult<()> {
        if !self.reservations().contains_key(path) {
            return Err(StoreError::NotReserved {
                path: path.to_string(),
            });
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.staging_path(path))
            .await?;
        file.seek(SeekFrom::Start(position)).await?;
        file.write_all(content).await?;
        file.flush().await?;
        Ok(())
    }

    async fn finalize(&self, path: &str, expected: &FileMeta) -> StoreResult<()> {
        let reserved = self
            .reservations()
            .remove(path)
            .ok_or_else(|| StoreError::NotReserved {
                path: path.to_string(),
            })?;
        let staged = self.staging_path(path);
        let target = self.resolve(path)?;

        let owned_path = path.to_string();
        let expected_meta = expected.clone();
        let verified = tokio::task::spawn_blocking(move || {
            commit_staged(&owned_path, &reserved, &expected_meta, &staged, &target)
        })
        .await
        .map_err(io::Error::other)?;

        match verified {
            Ok(()) => {
                self.identities().insert(
                    path.to_string(),
                    CachedIdentity {
                        file_size: expected.file_size,
                        last_modified: expected.last_modified,
                        identity: expected.identity.clone(),
                    },
                );
                tracing::debug!("Committed {} ({} bytes)", path, expected.file_size);
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(self.staging_path(path)).await;
                Err(e)
            }
        }
    }

    async fn abandon(&self, path: &str) -> StoreResult<()> {
        if self.reservations().remove(path).is_none() {
            return Ok(());
        }
        match tokio::fs::remove_file(self.staging_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Verify a staged file and move it into place. Blocking.
fn commit_staged(
    path: &str,
    reserved: &FileMeta,
    expected: &FileMeta,
    staged: &Path,
    target: &Path,
) -> StoreResult<()> {
    if reserved.identity != expected.identity {
        return Err(StoreError::IdentityMismatch {
            path: path.to_string(),
        });
    }

    let actual = std::fs::metadata(staged)?.len();
    if actual != expected.file_size {
        return Err(StoreError::SizeMismatch {
            path: path.to_string(),
            expected: expected.file_size,
            actual,
        });
    }
    if hash_file(staged)? != expected.identity {
        return Err(StoreError::IdentityMismatch {
            path: path.to_string(),
        });
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(staged, target)?;
    filetime::set_file_mtime(target, file_time(expected.last_modified))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_staging_dir() {
        let dir = tempdir().unwrap();
        let store = LocalFileStore::open(dir.path().join("share")).await.unwrap();
        assert!(store.root().join(STAGING_DIR).is_dir());
    }

    #[tokio::test]
    async fn transfer_commits_with_remote_mtime() {
        let dir = tempdir().unwrap();
        let store = LocalFileStore::open(dir.path()).await.unwrap();
        let content = b"0123456789abcdef";
        let meta = FileMeta::of_content(content, 1_700_000_000_123);

        store.create_path("docs/n.txt", &meta).await.unwrap();
        store.write_range("docs/n.txt", 0, &content[..10]).await.unwrap();
        store.write_range("docs/n.txt", 10, &content[10..]).await.unwrap();
        assert!(!dir.path().join("docs/n.txt").exists());

        store.finalize("docs/n.txt", &meta).await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("docs/n.txt")).unwrap(), content);
        assert_eq!(store.file_meta("docs/n.txt").await.unwrap(), Some(meta));
    }

    #[tokio::test]
    async fn mismatched_content_is_discarded() {
        let dir = tempdir().unwrap();
        let store = LocalFileStore::open(dir.path()).await.unwrap();
        let meta = FileMeta::of_content(b"good", 1_000);

        store.create_path("f", &meta).await.unwrap();
        store.write_range("f", 0, b"evil").await.unwrap();

        assert!(matches!(
            store.finalize("f", &meta).await,
            Err(StoreError::IdentityMismatch { .. })
        ));
        assert!(!dir.path().join("f").exists());
        assert!(!store.staging_path("f").exists());
    }

    #[tokio::test]
    async fn short_content_is_a_size_mismatch() {
        let dir = tempdir().unwrap();
        let store = LocalFileStore::open(dir.path()).await.unwrap();
        let meta = FileMeta::of_content(b"four", 1_000);

        store.create_path("f", &meta).await.unwrap();
        store.write_range("f", 0, b"fo").await.unwrap();

        assert!(matches!(
            store.finalize("f", &meta).await,
            Err(StoreError::SizeMismatch { expected: 4, actual: 2, .. })
        ));
    }

    #[tokio::test]
    async fn abandon_releases_reservation() {
        let dir = tempdir().unwrap();
        let store = LocalFileStore::open(dir.path()).await.unwrap();
        let meta = FileMeta::of_content(b"x", 1_000);

        store.create_path("f", &meta).await.unwrap();
        assert!(matches!(
            store.create_path("f", &meta).await,
            Err(StoreError::TransferInProgress { .. })
        ));
        store.abandon("f").await.unwrap();
        store.create_path("f", &meta).await.unwrap();
    }

    #[tokio::test]
    async fn identical_file_already_exists() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"same").unwrap();
        let store = LocalFileStore::open(dir.path()).await.unwrap();
        let local = store.file_meta("f").await.unwrap().unwrap();
        let incoming = FileMeta::of_content(b"same", local.last_modified + 10);

        assert!(matches!(
            store.create_path("f", &incoming).await,
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn read_range_checks_version() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"0123456789").unwrap();
        let store = LocalFileStore::open(dir.path()).await.unwrap();
        let meta = store.file_meta("f").await.unwrap().unwrap();

        assert_eq!(store.read_range("f", &meta, 4, 3).await.unwrap(), b"456");
        assert_eq!(store.read_range("f", &meta, 8, 100).await.unwrap(), b"89");

        let other = FileMeta::new(meta.identity.clone(), meta.last_modified, 99);
        assert!(matches!(
            store.read_range("f", &other, 0, 1).await,
            Err(StoreError::IdentityMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn delete_and_directories() {
        let dir = tempdir().unwrap();
        let store = LocalFileStore::open(dir.path()).await.unwrap();

        store.create_directory("d/e").await.unwrap();
        assert!(matches!(
            store.create_directory("d/e").await,
            Err(StoreError::AlreadyExists { .. })
        ));
        std::fs::write(dir.path().join("d/e/f"), b"x").unwrap();
        assert!(store.delete_directory("d/e").await.is_err());

        let meta = store.file_meta("d/e/f").await.unwrap().unwrap();
        store.delete_path("d/e/f", &meta).await.unwrap();
        store.delete_directory("d/e").await.unwrap();
        assert!(!dir.path().join("d/e").exists());
        assert!(matches!(
            store.delete_directory("d/e").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn escaping_paths_rejected() {
        let dir = tempdir().unwrap();
        let store = LocalFileStore::open(dir.path()).await.unwrap();
        let meta = FileMeta::of_content(b"x", 1);
        assert!(matches!(
            store.create_path("../escape", &meta).await,
            Err(StoreError::InvalidPath { .. })
        ));
    }

    #[test]
    fn file_time_roundtrip_is_millisecond_exact() {
        let t = file_time(1_700_000_000_123);
        assert_eq!(t.unix_seconds(), 1_700_000_000);
        assert_eq!(t.nanoseconds(), 123_000_000);
    }
}
