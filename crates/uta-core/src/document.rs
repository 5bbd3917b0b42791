use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Document format version written into every new database.
pub const DOCUMENT_VERSION: u32 = 1;

/// Pointer to the last migration applied to a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationRef {
    pub id: u32,
    #[serde(default)]
    pub version: String,
}

/// The diary database: the single root aggregate persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiaryDocument {
    pub entries: Vec<Entry>,
    pub chats: Vec<Chat>,
    pub last_migration: MigrationRef,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub date: DateTime<Utc>,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Fields written by newer or older app versions that this one does not
    /// model; carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub name: String,
    pub last_text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Fields for [`crate::store::DiaryStore::create_entry`].
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub date: Option<DateTime<Utc>>,
    pub title: String,
    pub text: String,
    pub tags: Vec<String>,
}

impl NewEntry {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewChat {
    pub name: String,
    pub last_text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiaryStats {
    pub entry_count: usize,
    pub chat_count: usize,
    pub word_count: usize,
    pub latest_entry: Option<DateTime<Utc>>,
}

impl Entry {
    pub(crate) fn from_new(fields: NewEntry) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            date: fields.date.unwrap_or_else(Utc::now),
            title: fields.title,
            text: fields.text,
            tags: fields.tags,
            extra: Map::new(),
        }
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

impl Chat {
    pub(crate) fn from_new(fields: NewChat) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: fields.name,
            last_text: fields.last_text,
            extra: Map::new(),
        }
    }
}

impl DiaryDocument {
    /// A fresh database already at `last_migration`.
    pub fn empty(last_migration: MigrationRef) -> Self {
        Self {
            entries: Vec::new(),
            chats: Vec::new(),
            last_migration,
            version: DOCUMENT_VERSION,
        }
    }

    pub fn entry(&self, id: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entry_mut(&mut self, id: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    pub fn chat(&self, id: &str) -> Option<&Chat> {
        self.chats.iter().find(|c| c.id == id)
    }

    pub fn stats(&self) -> DiaryStats {
        DiaryStats {
            entry_count: self.entries.len(),
            chat_count: self.chats.len(),
            word_count: self.entries.iter().map(Entry::word_count).sum(),
            latest_entry: self.entries.iter().map(|e| e.date).max(),
        }
    }
}
