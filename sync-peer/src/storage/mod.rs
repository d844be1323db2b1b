//! Storage capability for the shared directory.
//!
//! The replication engine never touches the filesystem directly; it asks a
//! [`FileStore`] to reserve, fill, commit or discard file versions.
//!
//! Conflicts resolve by last writer wins on the descriptor's modification
//! time: an incoming version replaces a different local one only when it
//! is newer, and a delete is refused when the local copy is newer than the
//! version being deleted.

mod local;
mod memory;

pub use local::{LocalFileStore, STAGING_DIR};
pub use memory::MemoryFileStore;

pub(crate) use local::{hash_file, modified_millis};

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use peersync_types::FileMeta;
use std::path::{Component, Path};

/// Trait for shared-directory backends.
///
/// Paths are relative to the share root and `/`-separated.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Descriptor of the file at `path`, if there is one.
    async fn file_meta(&self, path: &str) -> StoreResult<Option<FileMeta>>;

    /// Reserve `path` for a new file with the given descriptor.
    async fn create_path(&self, path: &str, meta: &FileMeta) -> StoreResult<()>;

    /// Reserve `path` for new content replacing the existing file.
    async fn modify_path(&self, path: &str, meta: &FileMeta) -> StoreResult<()>;

    /// Delete the file at `path`, which the peer knew as `meta`.
    async fn delete_path(&self, path: &str, meta: &FileMeta) -> StoreResult<()>;

    /// Create a directory (and any missing parents).
    async fn create_directory(&self, path: &str) -> StoreResult<()>;

    /// Remove an empty directory.
    async fn delete_directory(&self, path: &str) -> StoreResult<()>;

    /// Read up to `length` bytes from `position` of the file described by
    /// `meta`.
    ///
    /// Fails with [`StoreError::IdentityMismatch`] if the local file is no
    /// longer that version.
    async fn read_range(
        &self,
        path: &str,
        meta: &FileMeta,
        position: u64,
        length: u64,
    ) -> StoreResult<Vec<u8>>;

    /// Write received bytes into the reserved transfer for `path`.
    async fn write_range(&self, path: &str, position: u64, content: &[u8]) -> StoreResult<()>;

    /// Verify the assembled content against `expected` and commit it.
    ///
    /// The reservation is released whether or not verification passes.
    async fn finalize(&self, path: &str, expected: &FileMeta) -> StoreResult<()>;

    /// Discard the reservation for `path`. Succeeds if there is none.
    async fn abandon(&self, path: &str) -> StoreResult<()>;
}

/// Reject paths that could escape the share or collide with staging.
pub fn validate_path(path: &str) -> StoreResult<()> {
    let invalid = |reason| {
        Err(StoreError::InvalidPath {
            path: path.to_string(),
            reason,
        })
    };

    if path.is_empty() {
        return invalid("empty");
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return invalid("absolute");
    }

    let mut named = 0;
    for component in Path::new(path).components() {
        match component {
            Component::Normal(name) if named == 0 && name == STAGING_DIR => {
                return invalid("reserved");
            }
            Component::Normal(_) => named += 1,
            Component::CurDir => {}
            Component::ParentDir => return invalid("parent reference"),
            Component::RootDir | Component::Prefix(_) => return invalid("absolute"),
        }
    }
    if named == 0 {
        return invalid("empty");
    }
    Ok(())
}

/// Decide whether `incoming` may replace what is at `path`.
///
/// `existing` is the local version, `must_exist` distinguishes modify from
/// create.
pub(crate) fn admit_version(
    path: &str,
    existing: Option<&FileMeta>,
    incoming: &FileMeta,
    must_exist: bool,
) -> StoreResult<()> {
    match existing {
        None if must_exist => Err(StoreError::NotFound {
            path: path.to_string(),
        }),
        None => Ok(()),
        Some(local) if local.identity == incoming.identity => Err(StoreError::AlreadyExists {
            path: path.to_string(),
        }),
        Some(local) if incoming.is_newer_than(local) => Ok(()),
        Some(_) => Err(StoreError::Stale {
            path: path.to_string(),
        }),
    }
}

/// Decide whether the local version at `path` may be deleted.
pub(crate) fn admit_delete(
    path: &str,
    existing: Option<&FileMeta>,
    incoming: &FileMeta,
) -> StoreResult<()> {
    match existing {
        None => Err(StoreError::NotFound {
            path: path.to_string(),
        }),
        Some(local) if local.is_newer_than(incoming) => Err(StoreError::Stale {
            path: path.to_string(),
        }),
        Some(_) => Ok(()),
    }
}
