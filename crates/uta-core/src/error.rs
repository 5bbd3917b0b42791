use thiserror::Error;

use crate::fs::FsError;

#[derive(Debug, Error)]
pub enum DiaryError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encryption,

    #[error("Integrity check failed (wrong passphrase or tampered data)")]
    Integrity,

    #[error("Invalid database: {0}")]
    InvalidDatabase(String),

    #[error("Migration {at_migration_id} failed: {reason}")]
    MigrationFailed { at_migration_id: u32, reason: String },

    #[error("Migration chain misconfigured: {0}")]
    MigrationChain(String),

    #[error("Commit failed: {0}")]
    Commit(#[source] FsError),

    #[error("Load failed: {0}")]
    Load(#[source] FsError),

    #[error("Error reading backup {name}: {source}")]
    BackupRead {
        name: String,
        #[source]
        source: FsError,
    },

    #[error("Error parsing backup {name}: {source}")]
    BackupParse {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Error writing backup {name}: {source}")]
    BackupWrite {
        name: String,
        #[source]
        source: FsError,
    },

    #[error("Error creating backup directories: {0}")]
    BackupDirectory(#[source] FsError),

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Error deleting file {name}: {source}")]
    Delete {
        name: String,
        #[source]
        source: FsError,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Diary is locked, unlock with the passphrase first")]
    Locked,

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No async runtime: {0}")]
    NoRuntime(String),
}

impl DiaryError {
    /// True for failures that leave on-disk data unreadable with the
    /// current key ring rather than merely missing.
    pub fn is_integrity(&self) -> bool {
        matches!(self, DiaryError::Integrity)
    }
}

pub type Result<T> = std::result::Result<T, DiaryError>;
