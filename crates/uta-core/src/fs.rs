//! Filesystem capability used by the store and the backup manager.
//!
//! The core never touches `std::fs` directly; every read, write, listing and
//! deletion goes through [`FileSystem`] so platforms can supply their own
//! provider. Two providers ship with the crate:
//!
//! - [`LocalFileSystem`]: tokio-backed; writes go to a staging file that is
//!   renamed (or hard-linked when overwriting is not allowed) into place, so a
//!   reader never observes a half-written file.
//! - [`MemoryFileSystem`]: in-process map, used by tests and embedders that
//!   keep everything in memory.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

const STAGING_SUFFIX: &str = ".staging";

#[derive(Debug, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => FsError::NotFound(path.to_path_buf()),
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_path_buf()),
            _ => FsError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

/// One item of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_file: bool,
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read `dir/name` as UTF-8 text.
    async fn read_as_text(&self, dir: &Path, name: &str) -> Result<String, FsError>;

    /// Write `contents` to `dir/name`. With `overwrite == false` an existing
    /// file is left untouched and `FsError::AlreadyExists` is returned.
    async fn write_file(
        &self,
        dir: &Path,
        name: &str,
        contents: &str,
        overwrite: bool,
    ) -> Result<(), FsError>;

    /// List the entries of `dir`, sorted by name.
    async fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>, FsError>;

    /// Create `parent/name`. Succeeds when the directory already exists.
    async fn create_dir(&self, parent: &Path, name: &str, recursive: bool) -> Result<(), FsError>;

    async fn remove_file(&self, dir: &Path, name: &str) -> Result<(), FsError>;
}

// ── Local disk ──────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }

    async fn write_staging(staging: &Path, contents: &str) -> Result<(), FsError> {
        let mut file = tokio::fs::File::create(staging)
            .await
            .map_err(|e| FsError::from_io(staging, e))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| FsError::from_io(staging, e))?;
        file.sync_all()
            .await
            .map_err(|e| FsError::from_io(staging, e))?;
        Ok(())
    }

    /// Create `dest` exclusively and write it in place. Used where hard
    /// links are unsupported, e.g. FAT or exFAT removable storage.
    async fn write_new(dest: &Path, contents: &str) -> io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dest)
            .await?;
        let written = match file.write_all(contents.as_bytes()).await {
            Ok(()) => file.sync_all().await,
            Err(e) => Err(e),
        };
        if written.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        written
    }

    #[cfg(unix)]
    async fn fsync_dir(dir: &Path) {
        match tokio::fs::File::open(dir).await {
            Ok(handle) => {
                if let Err(e) = handle.sync_all().await {
                    warn!(dir = %dir.display(), "directory fsync failed: {e}");
                }
            }
            Err(e) => warn!(dir = %dir.display(), "cannot open directory for fsync: {e}"),
        }
    }

    #[cfg(not(unix))]
    async fn fsync_dir(_dir: &Path) {}
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn read_as_text(&self, dir: &Path, name: &str) -> Result<String, FsError> {
        let path = dir.join(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| FsError::from_io(&path, e))
    }

    async fn write_file(
        &self,
        dir: &Path,
        name: &str,
        contents: &str,
        overwrite: bool,
    ) -> Result<(), FsError> {
        let dest = dir.join(name);
        let staging = dir.join(format!(".{name}.{}{STAGING_SUFFIX}", Uuid::new_v4()));

        if let Err(e) = Self::write_staging(&staging, contents).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }

        // rename replaces atomically; hard_link refuses to clobber.
        let placed = if overwrite {
            tokio::fs::rename(&staging, &dest).await
        } else {
            let linked = tokio::fs::hard_link(&staging, &dest).await;
            let _ = tokio::fs::remove_file(&staging).await;
            match linked {
                Err(e) if e.kind() != io::ErrorKind::AlreadyExists => {
                    debug!(path = %dest.display(), "hard link failed ({e}), writing in place");
                    Self::write_new(&dest, contents).await
                }
                linked => linked,
            }
        };
        if let Err(e) = placed {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(FsError::from_io(&dest, e));
        }
        Self::fsync_dir(dir).await;
        debug!(path = %dest.display(), bytes = contents.len(), "file written");
        Ok(())
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>, FsError> {
        let mut reader = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| FsError::from_io(dir, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| FsError::from_io(dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(STAGING_SUFFIX) {
                continue;
            }
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            entries.push(DirEntry {
                name,
                path: entry.path(),
                is_file,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_dir(&self, parent: &Path, name: &str, recursive: bool) -> Result<(), FsError> {
        let path = parent.join(name);
        let created = if recursive {
            tokio::fs::create_dir_all(&path).await
        } else {
            tokio::fs::create_dir(&path).await
        };
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_dir() => Ok(()),
                    _ => Err(FsError::from_io(&path, e)),
                }
            }
            Err(e) => Err(FsError::from_io(&path, e)),
        }
    }

    async fn remove_file(&self, dir: &Path, name: &str) -> Result<(), FsError> {
        let path = dir.join(name);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| FsError::from_io(&path, e))
    }
}

// ── In memory ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, String>,
    dirs: BTreeSet<PathBuf>,
}

/// Filesystem kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    state: Mutex<MemoryState>,
    writes: AtomicUsize,
    read_only: AtomicBool,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `write_file` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent write fail with a permission error.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Raw contents of `dir/name`, if present.
    pub fn contents(&self, dir: &Path, name: &str) -> Option<String> {
        self.state.lock().files.get(&dir.join(name)).cloned()
    }

    fn denied(path: PathBuf) -> FsError {
        FsError::Io {
            path,
            source: io::Error::new(io::ErrorKind::PermissionDenied, "filesystem is read-only"),
        }
    }
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn read_as_text(&self, dir: &Path, name: &str) -> Result<String, FsError> {
        let path = dir.join(name);
        self.state
            .lock()
            .files
            .get(&path)
            .cloned()
            .ok_or(FsError::NotFound(path))
    }

    async fn write_file(
        &self,
        dir: &Path,
        name: &str,
        contents: &str,
        overwrite: bool,
    ) -> Result<(), FsError> {
        let path = dir.join(name);
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Self::denied(path));
        }
        let mut state = self.state.lock();
        if !overwrite && state.files.contains_key(&path) {
            return Err(FsError::AlreadyExists(path));
        }
        state.files.insert(path, contents.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_dir(&self, dir: &Path) -> Result<Vec<DirEntry>, FsError> {
        let state = self.state.lock();
        let mut entries: Vec<DirEntry> = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter(|p| p.parent() == Some(dir))
            .filter_map(|p| {
                let name = p.file_name()?.to_string_lossy().into_owned();
                Some(DirEntry {
                    name,
                    path: p.clone(),
                    is_file: state.files.contains_key(p),
                })
            })
            .collect();
        if entries.is_empty() && !state.dirs.contains(dir) {
            return Err(FsError::NotFound(dir.to_path_buf()));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create_dir(&self, parent: &Path, name: &str, recursive: bool) -> Result<(), FsError> {
        let path = parent.join(name);
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Self::denied(path));
        }
        let mut state = self.state.lock();
        if !recursive && !parent.as_os_str().is_empty() && !state.dirs.contains(parent) {
            return Err(FsError::NotFound(parent.to_path_buf()));
        }
        if recursive {
            for ancestor in path.ancestors() {
                if ancestor.as_os_str().is_empty() {
                    break;
                }
                state.dirs.insert(ancestor.to_path_buf());
            }
        } else {
            state.dirs.insert(path);
        }
        Ok(())
    }

    async fn remove_file(&self, dir: &Path, name: &str) -> Result<(), FsError> {
        let path = dir.join(name);
        if self.read_only.load(Ordering::SeqCst) {
            return Err(Self::denied(path));
        }
        match self.state.lock().files.remove(&path) {
            Some(_) => Ok(()),
            None => Err(FsError::NotFound(path)),
        }
    }
}
