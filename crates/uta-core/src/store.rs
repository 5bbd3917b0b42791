//! The diary store: sole owner of the live [`DiaryDocument`].
//!
//! On disk the document is a single base64 text file holding the sealed
//! envelope produced by [`crate::crypto`]. Loading decrypts, validates and
//! migrates; committing snapshots, seals and writes through the
//! [`FileSystem`] capability. Commits are strictly queued behind one async
//! mutex so two writes to the primary file never overlap, and each commit
//! snapshots the document only after it holds that mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::DiaryConfig;
use crate::crypto;
use crate::document::{Chat, DiaryDocument, DiaryStats, Entry, MigrationRef, NewChat, NewEntry};
use crate::error::{DiaryError, Result};
use crate::fs::{FileSystem, FsError};
use crate::keyring::KeyRing;
use crate::migration::{self, Migrator};

pub struct DiaryStore {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    file_name: String,
    key_ring: RwLock<Option<Arc<KeyRing>>>,
    migrator: Migrator,
    document: RwLock<DiaryDocument>,
    commit_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<Value>>,
}

impl DiaryStore {
    /// A store over `dir/file_name` holding a fresh, empty document until
    /// [`load`](Self::load) is called.
    pub fn new(
        fs: Arc<dyn FileSystem>,
        dir: impl Into<PathBuf>,
        file_name: impl Into<String>,
        key_ring: KeyRing,
    ) -> Self {
        let migrator = Migrator::default();
        Self {
            fs,
            dir: dir.into(),
            file_name: file_name.into(),
            key_ring: RwLock::new(Some(Arc::new(key_ring))),
            document: RwLock::new(DiaryDocument::empty(migrator.latest())),
            migrator,
            commit_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
        }
    }

    pub fn with_migrator(mut self, migrator: Migrator) -> Self {
        *self.document.get_mut() = DiaryDocument::empty(migrator.latest());
        self.migrator = migrator;
        self
    }

    /// Resolve the data directory from `config`, make sure it exists, and
    /// load the database found there.
    pub async fn open(
        config: &DiaryConfig,
        fs: Arc<dyn FileSystem>,
        key_ring: KeyRing,
    ) -> Result<Self> {
        let dir = config.resolve_data_dir()?;
        if let (Some(parent), Some(name)) = (dir.parent(), dir.file_name()) {
            fs.create_dir(parent, &name.to_string_lossy(), true)
                .await
                .map_err(DiaryError::Load)?;
        }
        let store = Self::new(fs, dir, config.database_file.clone(), key_ring);
        store.load().await?;
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    // ── Key ring ────────────────────────────────────────────────────────────

    pub(crate) fn key_ring(&self) -> Result<Arc<KeyRing>> {
        self.key_ring.read().clone().ok_or(DiaryError::Locked)
    }

    pub fn is_locked(&self) -> bool {
        self.key_ring.read().is_none()
    }

    /// Drop the key ring and the decrypted document. Uncommitted changes are
    /// discarded; commit first to keep them.
    pub fn lock(&self) {
        *self.key_ring.write() = None;
        *self.document.write() = DiaryDocument::empty(self.migrator.latest());
        *self.pending.lock() = None;
        info!("diary locked");
    }

    /// Install a key ring after [`lock`](Self::lock). Call
    /// [`load`](Self::load) afterwards to bring the document back.
    pub fn unlock(&self, key_ring: KeyRing) {
        *self.key_ring.write() = Some(Arc::new(key_ring));
        debug!("diary unlocked");
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Read, decrypt, validate and migrate the primary file, then adopt the
    /// result as the live document. A missing file yields an empty document
    /// at the latest schema. If any migration ran, the upgraded document is
    /// committed straight away.
    ///
    /// The live document is untouched on every failure path.
    pub async fn load(&self) -> Result<()> {
        let key_ring = self.key_ring()?;
        let sealed = match self.fs.read_as_text(&self.dir, &self.file_name).await {
            Ok(sealed) => sealed,
            Err(FsError::NotFound(_)) => {
                info!(file = %self.file_name, "no database yet, starting empty");
                *self.document.write() = DiaryDocument::empty(self.migrator.latest());
                return Ok(());
            }
            Err(e) => return Err(DiaryError::Load(e)),
        };

        let plaintext = crypto::open_text(&sealed, &key_ring)?;
        let raw: Value = serde_json::from_slice(plaintext.as_slice())
            .map_err(|e| DiaryError::InvalidDatabase(format!("not JSON: {e}")))?;
        let (document, applied) = self.adopt_candidate(raw)?;
        let entries = document.entries.len();

        if applied == 0 {
            *self.document.write() = document;
        } else {
            let _guard = self.commit_lock.lock().await;
            let previous = std::mem::replace(&mut *self.document.write(), document);
            if let Err(e) = self.write_current().await {
                warn!("migrated diary not persisted, keeping previous document: {e}");
                *self.document.write() = previous;
                return Err(e);
            }
        }
        info!(entries, migrations = applied, "diary loaded");
        Ok(())
    }

    /// Persist the live document. Callers queue behind any commit already
    /// in flight; whichever runs last writes the newest state.
    pub async fn commit(&self) -> Result<()> {
        self.commit_snapshot().await.map(drop)
    }

    /// Like [`commit`](Self::commit), but returns the exact document that
    /// was written. Edits made while the write is in flight are not in it.
    pub async fn commit_snapshot(&self) -> Result<DiaryDocument> {
        let _guard = self.commit_lock.lock().await;
        self.write_current().await
    }

    /// Seal and write the current document. The caller must hold
    /// `commit_lock`.
    async fn write_current(&self) -> Result<DiaryDocument> {
        let key_ring = self.key_ring()?;
        let snapshot = self.document.read().clone();
        let plaintext = Zeroizing::new(serde_json::to_vec(&snapshot)?);
        let sealed = crypto::seal_text(&plaintext, &key_ring)?;
        self.fs
            .write_file(&self.dir, &self.file_name, &sealed, true)
            .await
            .map_err(DiaryError::Commit)?;
        debug!(bytes = sealed.len(), "diary committed");
        Ok(snapshot)
    }

    /// Validate and migrate an untrusted document, then type it.
    fn adopt_candidate(&self, mut raw: Value) -> Result<(DiaryDocument, usize)> {
        if !migration::validate(&raw) {
            return Err(DiaryError::InvalidDatabase(
                "missing or malformed entries, chats, lastMigration or version".into(),
            ));
        }
        let latest = self.migrator.latest();
        if let Some(id) = migration::last_migration_id(&raw).filter(|id| *id > latest.id) {
            return Err(DiaryError::InvalidDatabase(format!(
                "written by a newer version (migration {id}, newest known {})",
                latest.id
            )));
        }

        let applied = match self.migrator.migrate_up(&mut raw, latest.id) {
            Ok(applied) => applied,
            Err(e @ DiaryError::MigrationFailed { .. }) => {
                warn!("migration stopped early: {e}");
                *self.pending.lock() = Some(raw);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let document: DiaryDocument = serde_json::from_value(raw)
            .map_err(|e| DiaryError::InvalidDatabase(e.to_string()))?;
        *self.pending.lock() = None;
        Ok((document, applied))
    }

    /// Replace the live document with `raw` after validation and migration,
    /// then commit. If the commit fails the previous document is restored.
    pub async fn import_document(&self, raw: Value) -> Result<()> {
        let (document, applied) = self.adopt_candidate(raw)?;

        let _guard = self.commit_lock.lock().await;
        let previous = std::mem::replace(&mut *self.document.write(), document);
        if let Err(e) = self.write_current().await {
            warn!("import not persisted, restoring previous diary: {e}");
            *self.document.write() = previous;
            return Err(e);
        }
        info!(migrations = applied, "diary imported");
        Ok(())
    }

    /// The partially migrated document left behind by the last failed
    /// migration, if any. It is never persisted.
    pub fn pending_migration(&self) -> Option<Value> {
        self.pending.lock().clone()
    }

    // ── Entries ─────────────────────────────────────────────────────────────

    /// Append a new entry with a fresh id. Does not commit.
    pub fn create_entry(&self, fields: NewEntry) -> Entry {
        let entry = Entry::from_new(fields);
        self.document.write().entries.push(entry.clone());
        debug!(id = %entry.id, "entry created");
        entry
    }

    /// Remove the entry with `id`. Does not commit.
    pub fn remove_entry(&self, id: &str) -> Result<Entry> {
        let mut document = self.document.write();
        let index = document
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| DiaryError::NotFound(format!("entry {id}")))?;
        Ok(document.entries.remove(index))
    }

    /// Mutate the entry with `id` in place. Does not commit.
    pub fn update_entry<F>(&self, id: &str, f: F) -> Result<Entry>
    where
        F: FnOnce(&mut Entry),
    {
        let mut document = self.document.write();
        let entry = document
            .entry_mut(id)
            .ok_or_else(|| DiaryError::NotFound(format!("entry {id}")))?;
        f(entry);
        Ok(entry.clone())
    }

    pub fn get(&self, id: &str) -> Result<Entry> {
        self.document
            .read()
            .entry(id)
            .cloned()
            .ok_or_else(|| DiaryError::NotFound(format!("entry {id}")))
    }

    /// Entries in insertion order.
    pub fn all(&self) -> Vec<Entry> {
        self.document.read().entries.clone()
    }

    // ── Chats ───────────────────────────────────────────────────────────────

    pub fn create_chat(&self, fields: NewChat) -> Chat {
        let chat = Chat::from_new(fields);
        self.document.write().chats.push(chat.clone());
        chat
    }

    pub fn remove_chat(&self, id: &str) -> Result<Chat> {
        let mut document = self.document.write();
        let index = document
            .chats
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| DiaryError::NotFound(format!("chat {id}")))?;
        Ok(document.chats.remove(index))
    }

    pub fn get_chat(&self, id: &str) -> Result<Chat> {
        self.document
            .read()
            .chat(id)
            .cloned()
            .ok_or_else(|| DiaryError::NotFound(format!("chat {id}")))
    }

    pub fn chats(&self) -> Vec<Chat> {
        self.document.read().chats.clone()
    }

    // ── Whole document ──────────────────────────────────────────────────────

    pub fn snapshot(&self) -> DiaryDocument {
        self.document.read().clone()
    }

    pub fn stats(&self) -> DiaryStats {
        self.document.read().stats()
    }

    pub fn last_migration(&self) -> MigrationRef {
        self.document.read().last_migration.clone()
    }
}

impl std::fmt::Debug for DiaryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiaryStore")
            .field("dir", &self.dir)
            .field("file_name", &self.file_name)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use crate::keyring::test_key_ring;
    use serde_json::json;

    const DIR: &str = "/data";
    const FILE: &str = "diary.uta";

    async fn store_on(fs: &Arc<MemoryFileSystem>, passphrase: &str) -> DiaryStore {
        DiaryStore::new(fs.clone(), DIR, FILE, test_key_ring(passphrase).await)
    }

    async fn write_raw(fs: &MemoryFileSystem, passphrase: &str, raw: &Value) {
        let ring = test_key_ring(passphrase).await;
        let sealed = crypto::seal_text(&serde_json::to_vec(raw).unwrap(), &ring).unwrap();
        fs.write_file(Path::new(DIR), FILE, &sealed, true)
            .await
            .unwrap();
    }

    async fn read_raw(fs: &MemoryFileSystem, passphrase: &str) -> Value {
        let ring = test_key_ring(passphrase).await;
        let sealed = fs.contents(Path::new(DIR), FILE).unwrap();
        serde_json::from_slice(crypto::open_text(&sealed, &ring).unwrap().as_slice()).unwrap()
    }

    fn legacy_document() -> Value {
        json!({
            "entries": [{"id": 7, "date": 1433152800000u64, "title": "Old"}],
            "chats": [{"id": 1, "name": "Ren"}],
            "lastMigration": {"id": 0},
            "version": 1
        })
    }

    #[tokio::test]
    async fn missing_file_starts_empty_at_latest() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "pw").await;
        store.load().await.unwrap();

        assert!(store.all().is_empty());
        assert_eq!(store.last_migration(), Migrator::default().latest());
        assert_eq!(fs.write_count(), 0);
    }

    #[tokio::test]
    async fn committed_document_survives_reload() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "pw").await;
        store.load().await.unwrap();
        let entry = store.create_entry(NewEntry::titled("Title"));
        store.create_chat(NewChat {
            name: "Ren".into(),
            last_text: "hi".into(),
        });
        store.commit().await.unwrap();

        let reopened = store_on(&fs, "pw").await;
        reopened.load().await.unwrap();
        assert_eq!(reopened.snapshot(), store.snapshot());
        assert_eq!(reopened.get(&entry.id).unwrap().title, "Title");
    }

    #[tokio::test]
    async fn primary_file_is_not_plaintext() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "pw").await;
        store.create_entry(NewEntry {
            text: "my secret thoughts".into(),
            ..NewEntry::titled("Title")
        });
        store.commit().await.unwrap();

        let on_disk = fs.contents(Path::new(DIR), FILE).unwrap();
        assert!(!on_disk.contains("secret"));
        assert!(!on_disk.contains("entries"));
    }

    #[tokio::test]
    async fn wrong_passphrase_is_an_integrity_failure() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "right").await;
        store.create_entry(NewEntry::titled("Title"));
        store.commit().await.unwrap();

        let intruder = store_on(&fs, "wrong").await;
        let before = intruder.snapshot();
        let err = intruder.load().await.unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(intruder.snapshot(), before);
    }

    #[tokio::test]
    async fn legacy_database_is_migrated_and_persisted() {
        let fs = Arc::new(MemoryFileSystem::new());
        write_raw(&fs, "pw", &legacy_document()).await;
        let writes_before = fs.write_count();

        let store = store_on(&fs, "pw").await;
        store.load().await.unwrap();

        let entry = store.get("7").unwrap();
        assert_eq!(entry.title, "Old");
        assert_eq!(entry.text, "");
        assert_eq!(entry.date.to_rfc3339(), "2015-06-01T10:00:00+00:00");
        assert_eq!(store.get_chat("1").unwrap().last_text, "");
        assert_eq!(fs.write_count(), writes_before + 1);
        assert_eq!(read_raw(&fs, "pw").await["lastMigration"]["id"], json!(4));
    }

    #[tokio::test]
    async fn unpersisted_migration_keeps_previous_document() {
        let fs = Arc::new(MemoryFileSystem::new());
        write_raw(&fs, "pw", &legacy_document()).await;
        fs.set_read_only(true);

        let store = store_on(&fs, "pw").await;
        let before = store.snapshot();
        let err = store.load().await.unwrap_err();

        assert!(matches!(err, DiaryError::Commit(_)));
        assert_eq!(store.snapshot(), before);
        assert!(store.all().is_empty());
        assert_eq!(read_raw(&fs, "pw").await["lastMigration"]["id"], json!(0));

        fs.set_read_only(false);
        store.load().await.unwrap();
        assert_eq!(store.get("7").unwrap().title, "Old");
    }

    #[tokio::test]
    async fn commit_snapshot_returns_what_was_written() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "pw").await;
        let entry = store.create_entry(NewEntry::titled("Title"));

        let written = store.commit_snapshot().await.unwrap();
        store.update_entry(&entry.id, |e| e.text = "later".into()).unwrap();

        assert_eq!(written.entry(&entry.id).unwrap().text, "");
        assert_eq!(read_raw(&fs, "pw").await["entries"][0]["text"], json!(""));
    }

    #[tokio::test]
    async fn failed_migration_keeps_live_document_and_pending_copy() {
        let fs = Arc::new(MemoryFileSystem::new());
        let mut raw = legacy_document();
        raw["entries"][0]["date"] = json!("last tuesday");
        write_raw(&fs, "pw", &raw).await;
        let writes_before = fs.write_count();

        let store = store_on(&fs, "pw").await;
        let before = store.snapshot();
        let err = store.load().await.unwrap_err();

        assert!(matches!(
            err,
            DiaryError::MigrationFailed {
                at_migration_id: 3,
                ..
            }
        ));
        assert_eq!(store.snapshot(), before);
        assert_eq!(fs.write_count(), writes_before);
        let pending = store.pending_migration().unwrap();
        assert_eq!(pending["lastMigration"]["id"], json!(2));
        assert_eq!(pending["entries"][0]["id"], json!("7"));
    }

    #[tokio::test]
    async fn newer_database_is_rejected() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "pw").await;
        let err = store
            .import_document(json!({
                "entries": [], "chats": [],
                "lastMigration": {"id": 99, "version": "9.9.9"},
                "version": 1
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, DiaryError::InvalidDatabase(_)));
    }

    #[tokio::test]
    async fn failed_commit_leaves_document_in_memory() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "pw").await;
        store.create_entry(NewEntry::titled("Title"));
        fs.set_read_only(true);

        let err = store.commit().await.unwrap_err();
        assert!(matches!(err, DiaryError::Commit(_)));
        assert_eq!(store.all().len(), 1);
        assert!(fs.contents(Path::new(DIR), FILE).is_none());
    }

    #[tokio::test]
    async fn import_replaces_and_commits() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "pw").await;
        store.create_entry(NewEntry::titled("Mine"));

        store.import_document(legacy_document()).await.unwrap();
        let titles: Vec<_> = store.all().into_iter().map(|e| e.title).collect();
        assert_eq!(titles, vec!["Old"]);
        assert_eq!(read_raw(&fs, "pw").await["entries"][0]["title"], json!("Old"));
    }

    #[tokio::test]
    async fn invalid_import_changes_nothing() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "pw").await;
        store.create_entry(NewEntry::titled("Mine"));
        let before = store.snapshot();

        let err = store
            .import_document(json!({"entries": [], "chats": [], "version": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, DiaryError::InvalidDatabase(_)));
        assert_eq!(store.snapshot(), before);
        assert_eq!(fs.write_count(), 0);
    }

    #[tokio::test]
    async fn import_rolls_back_when_commit_fails() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "pw").await;
        store.create_entry(NewEntry::titled("Mine"));
        let before = store.snapshot();
        fs.set_read_only(true);

        let err = store.import_document(legacy_document()).await.unwrap_err();
        assert!(matches!(err, DiaryError::Commit(_)));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn entry_and_chat_accessors() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "pw").await;
        let a = store.create_entry(NewEntry::titled("a"));
        let b = store.create_entry(NewEntry::titled("b"));
        assert_ne!(a.id, b.id);

        let updated = store
            .update_entry(&a.id, |e| e.text = "new text".into())
            .unwrap();
        assert_eq!(updated.text, "new text");
        assert_eq!(store.stats().word_count, 2);

        assert_eq!(store.remove_entry(&a.id).unwrap().id, a.id);
        assert!(matches!(store.get(&a.id), Err(DiaryError::NotFound(_))));
        assert!(matches!(
            store.remove_entry(&a.id),
            Err(DiaryError::NotFound(_))
        ));
        assert!(matches!(
            store.update_entry("nope", |_| {}),
            Err(DiaryError::NotFound(_))
        ));
        assert_eq!(store.all().len(), 1);

        let chat = store.create_chat(NewChat {
            name: "Ren".into(),
            ..NewChat::default()
        });
        assert_eq!(store.chats().len(), 1);
        store.remove_chat(&chat.id).unwrap();
        assert!(matches!(
            store.get_chat(&chat.id),
            Err(DiaryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn locked_store_refuses_io_until_unlocked() {
        let fs = Arc::new(MemoryFileSystem::new());
        let store = store_on(&fs, "pw").await;
        store.create_entry(NewEntry::titled("Title"));
        store.commit().await.unwrap();

        store.lock();
        assert!(store.is_locked());
        assert!(store.all().is_empty());
        assert!(matches!(store.commit().await, Err(DiaryError::Locked)));
        assert!(matches!(store.load().await, Err(DiaryError::Locked)));

        store.unlock(test_key_ring("pw").await);
        store.load().await.unwrap();
        assert_eq!(store.all().len(), 1);
    }
}
