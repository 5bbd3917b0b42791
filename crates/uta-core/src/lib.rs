//! uta-core: the encrypted local diary store.
//!
//! A passphrase and salt yield a [`KeyRing`]; the [`DiaryStore`] uses it to
//! seal the whole [`DiaryDocument`] into one file, migrating older documents
//! on load. [`BackupManager`] moves signed plaintext snapshots in and out,
//! and [`EntryEditor`] drives debounced autosave commits while an entry is
//! being written. All disk access goes through the [`FileSystem`] trait.

pub mod backup;
pub mod config;
pub mod crypto;
pub mod document;
pub mod editor;
pub mod error;
pub mod fs;
pub mod keyring;
pub mod migration;
pub mod paths;
pub mod store;

pub use backup::{BackupFile, BackupManager};
pub use config::DiaryConfig;
pub use document::{Chat, DiaryDocument, DiaryStats, Entry, MigrationRef, NewChat, NewEntry};
pub use editor::{EditorSettings, EditorState, EntryEditor, Notification, NotificationKind};
pub use error::{DiaryError, Result};
pub use fs::{FileSystem, FsError, LocalFileSystem, MemoryFileSystem};
pub use keyring::{generate_salt, Argon2Kdf, KdfParams, KeyDerivation, KeyRing};
pub use migration::Migrator;
pub use paths::BackupLayout;
pub use store::DiaryStore;
