use directories::{ProjectDirs, UserDirs};
use std::path::{Path, PathBuf};

use crate::error::{DiaryError, Result};

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "utadiary";
pub const APP_NAME: &str = "UtaDiary";

pub const DATA_DIR_ENV: &str = "UTA_DATA_DIR";
pub const BACKUP_ROOT_ENV: &str = "UTA_BACKUP_ROOT";

pub const BACKUP_PARENT_NAME: &str = "UtaDiary";
pub const BACKUP_DIR_NAME: &str = "backups";

/// Platform application-data directory (or `UTA_DATA_DIR`).
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| DiaryError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Root under which `UtaDiary/backups/` is created: the user's documents
/// folder, falling back to home (or `UTA_BACKUP_ROOT`).
pub fn backup_root() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(BACKUP_ROOT_ENV) {
        return Ok(PathBuf::from(override_path));
    }
    let dirs = UserDirs::new()
        .ok_or_else(|| DiaryError::Config("cannot determine home directory".into()))?;
    Ok(dirs
        .document_dir()
        .unwrap_or_else(|| dirs.home_dir())
        .to_path_buf())
}

/// `<root>/UtaDiary/backups/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupLayout {
    root: PathBuf,
}

impl BackupLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn parent(&self) -> PathBuf {
        self.root.join(BACKUP_PARENT_NAME)
    }

    pub fn directory(&self) -> PathBuf {
        self.parent().join(BACKUP_DIR_NAME)
    }
}
