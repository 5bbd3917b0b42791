//! Schema validation and the ordered migration chain.
//!
//! Migrations operate on the raw JSON document rather than on
//! [`crate::document::DiaryDocument`], because older databases do not
//! necessarily deserialize into the current types. The store validates the
//! raw value, migrates it to the latest id and only then converts it.

use std::fmt;

use anyhow::anyhow;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::document::MigrationRef;
use crate::error::{DiaryError, Result};

/// One schema step. Must accept exactly the documents produced by the
/// previous step.
pub type Transform = fn(&mut Value) -> anyhow::Result<()>;

#[derive(Clone, Copy)]
pub struct Migration {
    pub id: u32,
    pub version: &'static str,
    pub transform: Transform,
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish()
    }
}

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        version: "0.1.0",
        transform: fill_missing_text,
    },
    Migration {
        id: 2,
        version: "0.2.0",
        transform: stringify_ids,
    },
    Migration {
        id: 3,
        version: "0.3.0",
        transform: normalize_entry_dates,
    },
    Migration {
        id: 4,
        version: "0.4.0",
        transform: add_entry_tags,
    },
];

/// Structural check of a candidate database. Never panics; any shape
/// mismatch yields `false`.
pub fn validate(candidate: &Value) -> bool {
    let Some(root) = candidate.as_object() else {
        return false;
    };
    let records_ok = |key: &str| {
        root.get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().all(is_record))
            .unwrap_or(false)
    };
    let last_migration_ok = root
        .get("lastMigration")
        .and_then(Value::as_object)
        .and_then(|m| m.get("id"))
        .and_then(Value::as_u64)
        .map(|id| u32::try_from(id).is_ok())
        .unwrap_or(false);
    let version_ok = root
        .get("version")
        .map(|v| v.is_u64() || v.is_i64())
        .unwrap_or(false);

    records_ok("entries") && records_ok("chats") && last_migration_ok && version_ok
}

fn is_record(item: &Value) -> bool {
    item.as_object()
        .and_then(|o| o.get("id"))
        .map(|id| id.is_string() || id.is_number())
        .unwrap_or(false)
}

/// Reads `lastMigration.id` from a raw document.
pub fn last_migration_id(document: &Value) -> Option<u32> {
    document
        .get("lastMigration")?
        .get("id")?
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
}

#[derive(Debug, Clone)]
pub struct Migrator {
    chain: Vec<Migration>,
}

impl Default for Migrator {
    fn default() -> Self {
        Self {
            chain: MIGRATIONS.to_vec(),
        }
    }
}

impl Migrator {
    /// Build a migrator over `chain`, which must be strictly ascending by id.
    pub fn new(chain: Vec<Migration>) -> Result<Self> {
        if let Some(m) = chain.iter().find(|m| m.id == 0) {
            return Err(DiaryError::MigrationChain(format!(
                "migration {} uses reserved id 0",
                m.version
            )));
        }
        if let Some(pair) = chain.windows(2).find(|w| w[0].id >= w[1].id) {
            return Err(DiaryError::MigrationChain(format!(
                "migration ids not ascending: {} then {}",
                pair[0].id, pair[1].id
            )));
        }
        Ok(Self { chain })
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.chain
    }

    /// Reference to the newest migration, or id 0 for an empty chain.
    pub fn latest(&self) -> MigrationRef {
        self.chain
            .last()
            .map(|m| MigrationRef {
                id: m.id,
                version: m.version.to_string(),
            })
            .unwrap_or(MigrationRef {
                id: 0,
                version: String::new(),
            })
    }

    /// Apply every migration with `lastMigration.id < id <= target` in
    /// ascending order, returning how many ran.
    ///
    /// Each step runs on a copy; on failure `document` holds the result of
    /// the last successful step and the error names the failing id.
    pub fn migrate_up(&self, document: &mut Value, target: u32) -> Result<usize> {
        let current = last_migration_id(document).ok_or_else(|| {
            DiaryError::InvalidDatabase("lastMigration.id missing or not an integer".into())
        })?;
        if current >= target {
            debug!(current, target, "database is up-to-date");
            return Ok(0);
        }

        let mut applied = 0;
        for migration in self
            .chain
            .iter()
            .filter(|m| m.id > current && m.id <= target)
        {
            let mut next = document.clone();
            (migration.transform)(&mut next).map_err(|e| DiaryError::MigrationFailed {
                at_migration_id: migration.id,
                reason: format!("{e:#}"),
            })?;
            next["lastMigration"] = json!({
                "id": migration.id,
                "version": migration.version,
            });
            *document = next;
            applied += 1;
            info!(
                id = migration.id,
                version = migration.version,
                "applied database migration"
            );
        }
        Ok(applied)
    }

    pub fn migrate_to_latest(&self, document: &mut Value) -> Result<usize> {
        self.migrate_up(document, self.latest().id)
    }
}

// ── Transforms ──────────────────────────────────────────────────────────────

fn records_mut<'a>(
    document: &'a mut Value,
    key: &str,
) -> anyhow::Result<impl Iterator<Item = &'a mut Map<String, Value>>> {
    let items = document
        .get_mut(key)
        .and_then(Value::as_array_mut)
        .ok_or_else(|| anyhow!("{key} is not an array"))?;
    Ok(items.iter_mut().filter_map(Value::as_object_mut))
}

fn default_string(record: &mut Map<String, Value>, field: &str) {
    let missing = record.get(field).map(Value::is_null).unwrap_or(true);
    if missing {
        record.insert(field.to_string(), Value::String(String::new()));
    }
}

fn fill_missing_text(document: &mut Value) -> anyhow::Result<()> {
    for entry in records_mut(document, "entries")? {
        default_string(entry, "title");
        default_string(entry, "text");
    }
    for chat in records_mut(document, "chats")? {
        default_string(chat, "name");
        default_string(chat, "lastText");
    }
    Ok(())
}

fn stringify_ids(document: &mut Value) -> anyhow::Result<()> {
    for key in ["entries", "chats"] {
        for record in records_mut(document, key)? {
            if let Some(Value::Number(n)) = record.get("id") {
                let id = n.to_string();
                record.insert("id".into(), Value::String(id));
            }
        }
    }
    Ok(())
}

fn normalize_entry_dates(document: &mut Value) -> anyhow::Result<()> {
    for entry in records_mut(document, "entries")? {
        let normalized = match entry.get("date") {
            None | Some(Value::Null) => from_millis(0)?,
            Some(Value::Number(n)) => {
                let millis = n
                    .as_i64()
                    .ok_or_else(|| anyhow!("date {n} is not an integer timestamp"))?;
                from_millis(millis)?
            }
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map_err(|e| anyhow!("unparsable date {s:?}: {e}"))?
                .with_timezone(&Utc),
            Some(other) => return Err(anyhow!("unexpected date value {other}")),
        };
        entry.insert(
            "date".into(),
            Value::String(normalized.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
    Ok(())
}

fn from_millis(millis: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| anyhow!("timestamp {millis} out of range"))
}

fn add_entry_tags(document: &mut Value) -> anyhow::Result<()> {
    for entry in records_mut(document, "entries")? {
        let missing = entry.get("tags").map(Value::is_null).unwrap_or(true);
        if missing {
            entry.insert("tags".into(), json!([]));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn minimal() -> Value {
        json!({"entries": [], "chats": [], "lastMigration": {"id": 0}, "version": 1})
    }

    fn legacy() -> Value {
        json!({
            "entries": [
                {"id": 0, "date": 1433152800000i64, "title": "First"},
                {"id": "b", "date": "2015-06-02T08:30:00.000Z", "text": "words here", "title": null}
            ],
            "chats": [{"id": 7, "name": "Ben"}],
            "lastMigration": {"id": 0, "version": "0.0.0"},
            "version": 1
        })
    }

    fn failing(_: &mut Value) -> anyhow::Result<()> {
        Err(anyhow!("boom"))
    }

    fn mark(document: &mut Value) -> anyhow::Result<()> {
        document["marked"] = json!(true);
        Ok(())
    }

    #[test]
    fn validate_accepts_minimal_document() {
        assert!(validate(&minimal()));
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        let mut no_entries = minimal();
        no_entries.as_object_mut().unwrap().remove("entries");
        assert!(!validate(&no_entries));

        let mut no_migration = minimal();
        no_migration.as_object_mut().unwrap().remove("lastMigration");
        assert!(!validate(&no_migration));

        let mut migration_without_id = minimal();
        migration_without_id["lastMigration"] = json!({"version": "0.1.0"});
        assert!(!validate(&migration_without_id));

        let mut entry_without_id = minimal();
        entry_without_id["entries"] = json!([{"title": "x"}]);
        assert!(!validate(&entry_without_id));

        let mut chats_not_array = minimal();
        chats_not_array["chats"] = json!({});
        assert!(!validate(&chats_not_array));

        assert!(!validate(&json!([])));
        assert!(!validate(&json!("entries")));
    }

    #[test]
    fn full_chain_upgrades_legacy_document() {
        let mut doc = legacy();
        assert!(validate(&doc));
        let applied = Migrator::default().migrate_to_latest(&mut doc).unwrap();
        assert_eq!(applied, 4);
        assert_eq!(doc["lastMigration"], json!({"id": 4, "version": "0.4.0"}));
        assert_eq!(doc["entries"][0]["id"], json!("0"));
        assert_eq!(doc["entries"][0]["text"], json!(""));
        assert_eq!(doc["entries"][0]["date"], json!("2015-06-01T10:00:00.000Z"));
        assert_eq!(doc["entries"][1]["title"], json!(""));
        assert_eq!(doc["entries"][1]["tags"], json!([]));
        assert_eq!(doc["chats"][0]["id"], json!("7"));
        assert_eq!(doc["chats"][0]["lastText"], json!(""));

        let typed: crate::document::DiaryDocument = serde_json::from_value(doc).unwrap();
        assert_eq!(typed.entries.len(), 2);
    }

    #[test]
    fn migrating_at_tip_is_a_noop() {
        let migrator = Migrator::default();
        let mut doc = legacy();
        migrator.migrate_to_latest(&mut doc).unwrap();
        let before = doc.clone();
        assert_eq!(migrator.migrate_to_latest(&mut doc).unwrap(), 0);
        assert_eq!(doc, before);
    }

    #[test]
    fn failure_keeps_last_successful_step() {
        let migrator = Migrator::new(vec![
            Migration {
                id: 1,
                version: "1",
                transform: mark,
            },
            Migration {
                id: 2,
                version: "2",
                transform: failing,
            },
            Migration {
                id: 3,
                version: "3",
                transform: mark,
            },
        ])
        .unwrap();
        let mut doc = minimal();
        let err = migrator.migrate_to_latest(&mut doc).unwrap_err();
        match err {
            DiaryError::MigrationFailed {
                at_migration_id,
                reason,
            } => {
                assert_eq!(at_migration_id, 2);
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(last_migration_id(&doc), Some(1));
        assert_eq!(doc["marked"], json!(true));
    }

    #[test]
    fn bad_date_reports_failing_migration() {
        let mut doc = minimal();
        doc["entries"] = json!([{"id": "x", "date": "yesterday"}]);
        let err = Migrator::default().migrate_to_latest(&mut doc).unwrap_err();
        assert!(matches!(
            err,
            DiaryError::MigrationFailed {
                at_migration_id: 3,
                ..
            }
        ));
        assert_eq!(last_migration_id(&doc), Some(2));
    }

    #[test]
    fn chain_must_ascend() {
        let step = |id| Migration {
            id,
            version: "v",
            transform: mark,
        };
        assert!(Migrator::new(vec![step(1), step(1)]).is_err());
        assert!(Migrator::new(vec![step(2), step(1)]).is_err());
        assert!(Migrator::new(vec![step(0)]).is_err());
        assert!(Migrator::new(vec![]).unwrap().latest().id == 0);
    }

    #[test]
    fn static_chain_is_ascending() {
        assert!(Migrator::new(MIGRATIONS.to_vec()).is_ok());
    }

    fn arb_legacy() -> impl Strategy<Value = Value> {
        let entry = (
            any::<bool>(),
            0u32..1000,
            proptest::option::of(0i64..4_000_000_000_000),
            proptest::option::of("[a-z ]{0,12}"),
        )
            .prop_map(|(numeric, id, date, title)| {
                let mut e = Map::new();
                e.insert(
                    "id".into(),
                    if numeric { json!(id) } else { json!(format!("e{id}")) },
                );
                if let Some(ms) = date {
                    e.insert("date".into(), json!(ms));
                }
                if let Some(t) = title {
                    e.insert("title".into(), json!(t));
                }
                Value::Object(e)
            });
        proptest::collection::vec(entry, 0..6).prop_map(|entries| {
            json!({
                "entries": entries,
                "chats": [],
                "lastMigration": {"id": 0},
                "version": 1
            })
        })
    }

    proptest! {
        #[test]
        fn migrate_up_is_idempotent_at_target(doc in arb_legacy(), target in 0u32..=4) {
            let migrator = Migrator::default();
            let mut once = doc.clone();
            migrator.migrate_up(&mut once, target).unwrap();
            let mut twice = once.clone();
            migrator.migrate_up(&mut twice, target).unwrap();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn split_chain_matches_full_chain(doc in arb_legacy(), split in 0u32..=4) {
            let migrator = Migrator::default();
            let mut full = doc.clone();
            migrator.migrate_to_latest(&mut full).unwrap();
            let mut halves = doc.clone();
            migrator.migrate_up(&mut halves, split).unwrap();
            migrator.migrate_to_latest(&mut halves).unwrap();
            prop_assert_eq!(full, halves);
        }
    }
}
