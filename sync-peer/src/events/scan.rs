//! Polling directory scanner.
//!
//! Each call walks the share, compares the result with the previous walk
//! and reports the difference. Content is only re-hashed when a file's size
//! or modification time changed since the last walk.

use super::EventSource;
use crate::error::EventSourceError;
use crate::storage::{hash_file, modified_millis, STAGING_DIR};
use async_trait::async_trait;
use peersync_types::{EventKind, FileMeta, FileSystemEvent};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Directory,
    File(FileMeta),
}

type Snapshot = BTreeMap<String, Entry>;

/// [`EventSource`] that detects changes by rescanning a directory.
#[derive(Debug)]
pub struct ScanEventSource {
    root: PathBuf,
    previous: Mutex<Option<Snapshot>>,
}

impl ScanEventSource {
    /// Watch `root`. The first scan establishes the baseline.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            previous: Mutex::new(None),
        }
    }

    async fn scan(&self, previous: Option<Snapshot>) -> Result<Snapshot, EventSourceError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            scan_tree(&root, previous.as_ref()).map_err(|source| EventSourceError::Scan {
                path: root.clone(),
                source,
            })
        })
        .await
        .map_err(|e| EventSourceError::Task(e.to_string()))?
    }
}

#[async_trait]
impl EventSource for ScanEventSource {
    async fn generate_sync_events(&self) -> Result<Vec<FileSystemEvent>, EventSourceError> {
        let mut previous = self.previous.lock().await;
        let current = self.scan(previous.clone()).await?;

        let mut events = match previous.as_ref() {
            Some(old) => diff(old, &current),
            None => Vec::new(),
        };
        let announced: HashSet<String> = events
            .iter()
            .filter(|e| matches!(e.kind, EventKind::FileCreate | EventKind::FileModify | EventKind::DirectoryCreate))
            .map(|e| e.path.clone())
            .collect();
        events.extend(
            full_state(&current)
                .into_iter()
                .filter(|e| !announced.contains(&e.path)),
        );

        tracing::debug!("Scan of {:?}: {} entries, {} events", self.root, current.len(), events.len());
        *previous = Some(current);
        Ok(events)
    }

    async fn current_state(&self) -> Result<Vec<FileSystemEvent>, EventSourceError> {
        let cache = self.previous.lock().await.clone();
        Ok(full_state(&self.scan(cache).await?))
    }
}

/// Walk `root`, reusing identities from `previous` where possible. Blocking.
fn scan_tree(root: &Path, previous: Option<&Snapshot>) -> io::Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(wanted);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // Removed between listing and stat.
            Err(e) if e.depth() > 0 && e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                continue
            }
            Err(e) => return Err(e.into()),
        };
        if entry.depth() == 0 {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = path_key(relative);

        if entry.file_type().is_dir() {
            snapshot.insert(key, Entry::Directory);
        } else if entry.file_type().is_file() {
            match describe(entry.path(), previous.and_then(|p| p.get(&key))) {
                Ok(meta) => {
                    snapshot.insert(key, Entry::File(meta));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            }
        }
    }

    Ok(snapshot)
}

/// Skip the staging area and anything whose name is not UTF-8.
fn wanted(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    if entry.depth() == 1 && entry.file_name() == STAGING_DIR {
        return false;
    }
    if entry.file_name().to_str().is_none() {
        tracing::warn!("Skipping non UTF-8 name {:?}", entry.path());
        return false;
    }
    true
}

fn describe(full: &Path, known: Option<&Entry>) -> io::Result<FileMeta> {
    let metadata = std::fs::metadata(full)?;
    let file_size = metadata.len();
    let last_modified = modified_millis(&metadata);
    let identity = match known {
        Some(Entry::File(meta)) if meta.file_size == file_size && meta.last_modified == last_modified => {
            meta.identity.clone()
        }
        _ => hash_file(full)?,
    };
    Ok(FileMeta::new(identity, last_modified, file_size))
}

fn path_key(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Changes from `old` to `new`: directory creates (parents first), file
/// creates and modifies, file deletes, directory deletes (children first).
fn diff(old: &Snapshot, new: &Snapshot) -> Vec<FileSystemEvent> {
    let mut events = Vec::new();

    for (path, entry) in new {
        if entry == &Entry::Directory && old.get(path) != Some(&Entry::Directory) {
            events.push(FileSystemEvent::directory(EventKind::DirectoryCreate, path.clone()));
        }
    }
    for (path, entry) in new {
        let Entry::File(meta) = entry else { continue };
        match old.get(path) {
            Some(Entry::File(before)) if before.identity == meta.identity => {}
            Some(Entry::File(_)) => {
                events.push(FileSystemEvent::file(EventKind::FileModify, path.clone(), meta.clone()))
            }
            _ => events.push(FileSystemEvent::file(EventKind::FileCreate, path.clone(), meta.clone())),
        }
    }
    for (path, entry) in old {
        if let Entry::File(meta) = entry {
            if !matches!(new.get(path), Some(Entry::File(_))) {
                events.push(FileSystemEvent::file(EventKind::FileDelete, path.clone(), meta.clone()));
            }
        }
    }
    for (path, entry) in old.iter().rev() {
        if entry == &Entry::Directory && new.get(path) != Some(&Entry::Directory) {
            events.push(FileSystemEvent::directory(EventKind::DirectoryDelete, path.clone()));
        }
    }

    events
}

/// Everything in `snapshot` as create events, directories first.
fn full_state(snapshot: &Snapshot) -> Vec<FileSystemEvent> {
    let directories = snapshot
        .iter()
        .filter(|(_, entry)| **entry == Entry::Directory)
        .map(|(path, _)| FileSystemEvent::directory(EventKind::DirectoryCreate, path.clone()));
    let files = snapshot.iter().filter_map(|(path, entry)| match entry {
        Entry::File(meta) => Some(FileSystemEvent::file(EventKind::FileCreate, path.clone(), meta.clone())),
        Entry::Directory => None,
    });
    directories.chain(files).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn kinds(events: &[FileSystemEvent]) -> Vec<(EventKind, &str)> {
        events.iter().map(|e| (e.kind, e.path.as_str())).collect()
    }

    #[tokio::test]
    async fn first_scan_reports_full_state_directories_first() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"bb").unwrap();

        let source = ScanEventSource::new(dir.path());
        let events = source.generate_sync_events().await.unwrap();

        assert_eq!(
            kinds(&events),
            vec![
                (EventKind::DirectoryCreate, "sub"),
                (EventKind::DirectoryCreate, "sub/deeper"),
                (EventKind::FileCreate, "a.txt"),
                (EventKind::FileCreate, "sub/b.txt"),
            ]
        );
        let meta = events[3].meta.as_ref().unwrap();
        assert_eq!(meta.file_size, 2);
        assert_eq!(meta.identity, peersync_types::content_identity(b"bb"));
    }

    #[tokio::test]
    async fn later_scans_lead_with_changes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"k").unwrap();
        std::fs::write(dir.path().join("edit.txt"), b"v1").unwrap();
        std::fs::write(dir.path().join("gone.txt"), b"g").unwrap();
        std::fs::create_dir(dir.path().join("olddir")).unwrap();

        let source = ScanEventSource::new(dir.path());
        source.generate_sync_events().await.unwrap();

        std::fs::write(dir.path().join("edit.txt"), b"version two").unwrap();
        std::fs::remove_file(dir.path().join("gone.txt")).unwrap();
        std::fs::remove_dir(dir.path().join("olddir")).unwrap();
        std::fs::create_dir(dir.path().join("newdir")).unwrap();
        std::fs::write(dir.path().join("newdir/new.txt"), b"n").unwrap();

        let events = source.generate_sync_events().await.unwrap();
        assert_eq!(
            kinds(&events),
            vec![
                (EventKind::DirectoryCreate, "newdir"),
                (EventKind::FileModify, "edit.txt"),
                (EventKind::FileCreate, "newdir/new.txt"),
                (EventKind::FileDelete, "gone.txt"),
                (EventKind::DirectoryDelete, "olddir"),
                (EventKind::FileCreate, "keep.txt"),
            ]
        );
    }

    #[tokio::test]
    async fn current_state_does_not_consume_changes() {
        let dir = tempdir().unwrap();
        let source = ScanEventSource::new(dir.path());
        source.generate_sync_events().await.unwrap();

        std::fs::write(dir.path().join("f"), b"x").unwrap();
        assert_eq!(source.current_state().await.unwrap().len(), 1);

        let events = source.generate_sync_events().await.unwrap();
        assert_eq!(kinds(&events), vec![(EventKind::FileCreate, "f")]);
    }

    #[tokio::test]
    async fn staging_directory_is_ignored() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join(STAGING_DIR)).unwrap();
        std::fs::write(dir.path().join(STAGING_DIR).join("partial"), b"x").unwrap();

        let source = ScanEventSource::new(dir.path());
        assert!(source.generate_sync_events().await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_are_not_followed() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();
        std::fs::write(dir.path().join("real.txt"), b"r").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let source = ScanEventSource::new(dir.path());
        let events = source.generate_sync_events().await.unwrap();
        assert_eq!(kinds(&events), vec![(EventKind::FileCreate, "real.txt")]);
    }

    #[tokio::test]
    async fn missing_root_is_a_scan_error() {
        let dir = tempdir().unwrap();
        let source = ScanEventSource::new(dir.path().join("absent"));
        assert!(matches!(
            source.generate_sync_events().await,
            Err(EventSourceError::Scan { .. })
        ));
    }
}
