//! Plaintext JSON backups under `<root>/UtaDiary/backups/`.
//!
//! Exports are a full snapshot of the live document plus a top-level
//! `signature`: an Ed25519 signature, made with the key ring's signing key,
//! over the canonical JSON of the document without that key. Backups stay
//! readable by humans and other tools while imports can still detect edits.
//! A file without a signature is refused unless unsigned imports were
//! explicitly allowed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::crypto;
use crate::error::{DiaryError, Result};
use crate::fs::{FileSystem, FsError};
use crate::keyring::KeyRing;
use crate::paths::{BackupLayout, BACKUP_DIR_NAME, BACKUP_PARENT_NAME};
use crate::store::DiaryStore;

pub const SIGNATURE_KEY: &str = "signature";

// ── Data Models ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub name: String,
    pub path: PathBuf,
}

// ── Manager ─────────────────────────────────────────────────────────────────

pub struct BackupManager {
    fs: Arc<dyn FileSystem>,
    store: Arc<DiaryStore>,
    layout: BackupLayout,
    verify_signatures: bool,
    allow_unsigned: bool,
}

impl BackupManager {
    pub fn new(fs: Arc<dyn FileSystem>, store: Arc<DiaryStore>, layout: BackupLayout) -> Self {
        Self {
            fs,
            store,
            layout,
            verify_signatures: true,
            allow_unsigned: false,
        }
    }

    /// Accept backups whose signature does not match this key ring, e.g.
    /// ones exported under a different passphrase.
    pub fn with_signature_check(mut self, verify: bool) -> Self {
        self.verify_signatures = verify;
        self
    }

    /// Accept backups that carry no signature at all, such as hand-written
    /// or older files.
    pub fn with_unsigned_allowed(mut self, allow: bool) -> Self {
        self.allow_unsigned = allow;
        self
    }

    /// Directory holding the backup files.
    pub fn directory(&self) -> PathBuf {
        self.layout.directory()
    }

    /// Files in the backup directory. A listing failure is logged and
    /// reported as no backups.
    pub async fn list_backup_files(&self) -> Vec<BackupFile> {
        let dir = self.layout.directory();
        match self.fs.list_dir(&dir).await {
            Ok(entries) => entries
                .into_iter()
                .filter(|e| e.is_file)
                .map(|e| BackupFile {
                    name: e.name,
                    path: dir.clone(),
                })
                .collect(),
            Err(e) => {
                error!(dir = %dir.display(), "Error listing backup files: {e}");
                Vec::new()
            }
        }
    }

    /// Write the live document to `name` in the backup directory, creating
    /// the directory chain first. Without `overwrite` an existing file makes
    /// this fail with [`DiaryError::FileExists`].
    pub async fn export_file(&self, name: &str, overwrite: bool) -> Result<BackupFile> {
        self.ensure_directories().await?;

        let key_ring = self.store.key_ring()?;
        let mut document = serde_json::to_value(self.store.snapshot())?;
        sign_document(&mut document, &key_ring)?;
        let body = serde_json::to_string_pretty(&document)?;

        let dir = self.layout.directory();
        self.fs
            .write_file(&dir, name, &body, overwrite)
            .await
            .map_err(|source| match source {
                FsError::AlreadyExists(_) => DiaryError::FileExists(name.to_string()),
                source => DiaryError::BackupWrite {
                    name: name.to_string(),
                    source,
                },
            })?;
        info!(name, overwrite, "backup exported");
        Ok(BackupFile {
            name: name.to_string(),
            path: dir,
        })
    }

    /// Read `dir/name`, check its signature, and hand it to
    /// [`DiaryStore::import_document`]. Validation failures from the store
    /// come back unchanged.
    pub async fn import_file(&self, dir: &Path, name: &str) -> Result<()> {
        let text = self
            .fs
            .read_as_text(dir, name)
            .await
            .map_err(|source| DiaryError::BackupRead {
                name: name.to_string(),
                source,
            })?;
        let mut document: Value =
            serde_json::from_str(&text).map_err(|source| DiaryError::BackupParse {
                name: name.to_string(),
                source,
            })?;

        match take_signature(&mut document) {
            Some(signature) if self.verify_signatures => {
                let key_ring = self.store.key_ring()?;
                crypto::verify(&serde_json::to_vec(&document)?, &signature, &key_ring)
                    .map_err(|e| {
                        warn!(name, "backup signature mismatch");
                        e
                    })?;
            }
            Some(_) => {}
            None if self.allow_unsigned => {
                warn!(name, "backup carries no signature, importing unverified")
            }
            None => {
                warn!(name, "unsigned backup refused");
                return Err(DiaryError::Integrity);
            }
        }

        self.store.import_document(document).await?;
        info!(name, "backup imported");
        Ok(())
    }

    pub async fn delete_file(&self, dir: &Path, name: &str) -> Result<()> {
        self.fs
            .remove_file(dir, name)
            .await
            .map_err(|source| DiaryError::Delete {
                name: name.to_string(),
                source,
            })?;
        info!(name, "backup deleted");
        Ok(())
    }

    async fn ensure_directories(&self) -> Result<()> {
        self.fs
            .create_dir(self.layout.root(), BACKUP_PARENT_NAME, true)
            .await
            .map_err(DiaryError::BackupDirectory)?;
        self.fs
            .create_dir(&self.layout.parent(), BACKUP_DIR_NAME, true)
            .await
            .map_err(DiaryError::BackupDirectory)
    }
}

/// Add a `signature` over the canonical bytes of `document`.
fn sign_document(document: &mut Value, key_ring: &KeyRing) -> Result<()> {
    let object = document
        .as_object_mut()
        .ok_or_else(|| DiaryError::InvalidDatabase("document is not an object".into()))?;
    object.remove(SIGNATURE_KEY);
    // serde_json maps are key-sorted, so this serialisation is canonical.
    let canonical = serde_json::to_vec(&*object)?;
    let signature = crypto::sign(&canonical, key_ring);
    object.insert(SIGNATURE_KEY.into(), Value::String(signature));
    Ok(())
}

/// Remove and return the signature. A non-string value counts as a
/// signature that can never verify.
fn take_signature(document: &mut Value) -> Option<String> {
    let value = document.as_object_mut()?.remove(SIGNATURE_KEY)?;
    Some(value.as_str().map(str::to_owned).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NewEntry;
    use crate::fs::MemoryFileSystem;
    use crate::keyring::test_key_ring;
    use serde_json::json;

    const ROOT: &str = "/sdcard";

    async fn setup(passphrase: &str) -> (Arc<MemoryFileSystem>, Arc<DiaryStore>, BackupManager) {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = Arc::new(DiaryStore::new(
            fs.clone(),
            "/data",
            "diary.uta",
            test_key_ring(passphrase).await,
        ));
        let manager = BackupManager::new(fs.clone(), store.clone(), BackupLayout::new(ROOT));
        (fs, store, manager)
    }

    fn backups_dir() -> PathBuf {
        PathBuf::from("/sdcard/UtaDiary/backups")
    }

    #[tokio::test]
    async fn listing_a_missing_directory_is_empty() {
        let (_fs, _store, manager) = setup("pw").await;
        assert!(manager.list_backup_files().await.is_empty());
    }

    #[tokio::test]
    async fn export_creates_directories_and_lists() {
        let (fs, store, manager) = setup("pw").await;
        store.create_entry(NewEntry::titled("Title"));

        let file = manager.export_file("one.json", false).await.unwrap();
        assert_eq!(file.path, backups_dir());

        let listed = manager.list_backup_files().await;
        assert_eq!(listed, vec![file]);

        let body: Value =
            serde_json::from_str(&fs.contents(&backups_dir(), "one.json").unwrap()).unwrap();
        assert_eq!(body["entries"][0]["title"], json!("Title"));
        assert!(body[SIGNATURE_KEY].is_string());
    }

    #[tokio::test]
    async fn export_respects_overwrite_flag() {
        let (_fs, _store, manager) = setup("pw").await;
        manager.export_file("b.json", false).await.unwrap();
        let err = manager.export_file("b.json", false).await.unwrap_err();
        assert!(matches!(err, DiaryError::FileExists(name) if name == "b.json"));

        manager.export_file("c.json", true).await.unwrap();
        manager.export_file("c.json", true).await.unwrap();
    }

    #[tokio::test]
    async fn import_restores_exported_snapshot() {
        let (_fs, store, manager) = setup("pw").await;
        store.create_entry(NewEntry::titled("Keep me"));
        manager.export_file("snap.json", false).await.unwrap();
        let exported = store.snapshot();

        store.create_entry(NewEntry::titled("Later"));
        manager.import_file(&backups_dir(), "snap.json").await.unwrap();
        assert_eq!(store.snapshot(), exported);
    }

    #[tokio::test]
    async fn tampered_backup_is_rejected() {
        let (fs, store, manager) = setup("pw").await;
        store.create_entry(NewEntry::titled("Original"));
        manager.export_file("t.json", false).await.unwrap();

        let edited = fs
            .contents(&backups_dir(), "t.json")
            .unwrap()
            .replace("Original", "Forged");
        fs.write_file(&backups_dir(), "t.json", &edited, true)
            .await
            .unwrap();

        let before = store.snapshot();
        let err = manager.import_file(&backups_dir(), "t.json").await.unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn foreign_signature_passes_when_checking_is_off() {
        let (fs, _store, manager) = setup("pw").await;
        manager.export_file("x.json", false).await.unwrap();

        let other = Arc::new(DiaryStore::new(
            fs.clone(),
            "/other",
            "diary.uta",
            test_key_ring("someone else").await,
        ));
        let strict = BackupManager::new(fs.clone(), other.clone(), BackupLayout::new(ROOT));
        assert!(strict
            .import_file(&backups_dir(), "x.json")
            .await
            .unwrap_err()
            .is_integrity());

        let lenient = strict.with_signature_check(false);
        lenient.import_file(&backups_dir(), "x.json").await.unwrap();
    }

    #[tokio::test]
    async fn unsigned_backup_needs_explicit_opt_in() {
        let (fs, store, manager) = setup("pw").await;
        let raw = json!({
            "entries": [{"id": 1, "date": 0, "title": "Hand written", "text": ""}],
            "chats": [],
            "lastMigration": {"id": 0},
            "version": 1
        });
        fs.write_file(Path::new("/tmp"), "hand.json", &raw.to_string(), false)
            .await
            .unwrap();

        let before = store.snapshot();
        let err = manager
            .import_file(Path::new("/tmp"), "hand.json")
            .await
            .unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(store.snapshot(), before);

        let unchecked = manager.with_signature_check(false);
        let err = unchecked
            .import_file(Path::new("/tmp"), "hand.json")
            .await
            .unwrap_err();
        assert!(err.is_integrity());

        let lenient = unchecked.with_signature_check(true).with_unsigned_allowed(true);
        lenient.import_file(Path::new("/tmp"), "hand.json").await.unwrap();
        assert_eq!(store.get("1").unwrap().title, "Hand written");
    }

    #[tokio::test]
    async fn stripped_signature_is_rejected() {
        let (fs, store, manager) = setup("pw").await;
        store.create_entry(NewEntry::titled("Original"));
        manager.export_file("s.json", false).await.unwrap();

        let mut body: Value =
            serde_json::from_str(&fs.contents(&backups_dir(), "s.json").unwrap()).unwrap();
        body.as_object_mut().unwrap().remove(SIGNATURE_KEY);
        body["entries"][0]["title"] = json!("Forged");
        fs.write_file(&backups_dir(), "s.json", &body.to_string(), true)
            .await
            .unwrap();

        let err = manager.import_file(&backups_dir(), "s.json").await.unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(store.all()[0].title, "Original");
    }

    #[tokio::test]
    async fn read_and_parse_failures_are_distinct() {
        let (fs, _store, manager) = setup("pw").await;
        let err = manager.import_file(&backups_dir(), "nope.json").await.unwrap_err();
        assert!(matches!(err, DiaryError::BackupRead { .. }));

        fs.write_file(&backups_dir(), "junk.json", "{not json", false)
            .await
            .unwrap();
        let err = manager.import_file(&backups_dir(), "junk.json").await.unwrap_err();
        assert!(matches!(err, DiaryError::BackupParse { .. }));
    }

    #[tokio::test]
    async fn invalid_backup_surfaces_store_error() {
        let (fs, _store, manager) = setup("pw").await;
        let manager = manager.with_unsigned_allowed(true);
        fs.write_file(&backups_dir(), "bad.json", r#"{"entries": []}"#, false)
            .await
            .unwrap();
        let err = manager.import_file(&backups_dir(), "bad.json").await.unwrap_err();
        assert!(matches!(err, DiaryError::InvalidDatabase(_)));
    }

    #[tokio::test]
    async fn delete_removes_and_reports_missing() {
        let (_fs, _store, manager) = setup("pw").await;
        manager.export_file("d.json", false).await.unwrap();
        manager.delete_file(&backups_dir(), "d.json").await.unwrap();
        assert!(manager.list_backup_files().await.is_empty());

        let err = manager.delete_file(&backups_dir(), "d.json").await.unwrap_err();
        assert!(matches!(err, DiaryError::Delete { .. }));
    }
}
