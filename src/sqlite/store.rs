// ABOUTME: SQLite-backed local content store for mirrored articles
// ABOUTME: Enforces one entity per (entity_type, external_id) with a unique index

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::sync::clock::Timestamp;
use crate::sync::repository::{EntityId, EntityRepository, LocalEntity, NewEntity};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type   TEXT NOT NULL,
    external_id   TEXT NOT NULL,
    title         TEXT NOT NULL,
    body          TEXT NOT NULL DEFAULT '',
    revision      INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS entities_type_external_id
    ON entities(entity_type, external_id);
"#;

const ENTITY_COLUMNS: &str =
    "id, entity_type, external_id, title, body, revision, created_at, updated_at";

/// Local content store in a SQLite file.
pub struct SqliteEntityStore {
    path: Option<PathBuf>,
    conn: Connection,
}

impl SqliteEntityStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open content store {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for content store")?;
        if let Err(e) = conn.pragma_update(None, "synchronous", "normal") {
            tracing::warn!("Failed to set synchronous=normal on content store: {}", e);
        }

        let mut store = Self::init(conn)?;
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    /// Store that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialize content store schema")?;
        Ok(Self { path: None, conn })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of entities of `entity_type`.
    pub fn count(&self, entity_type: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM entities WHERE entity_type = ?1",
                [entity_type],
                |row| row.get(0),
            )
            .context("failed to count entities")?;
        Ok(count as u64)
    }
}

fn entity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LocalEntity> {
    let revision: i64 = row.get(5)?;
    Ok(LocalEntity {
        id: EntityId(row.get(0)?),
        entity_type: row.get(1)?,
        external_id: row.get(2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        revision: revision.max(0) as u64,
        created_at: row.get::<_, Timestamp>(6)?,
        updated_at: row.get::<_, Timestamp>(7)?,
    })
}

/// Map a repository field name onto its column.
fn field_column(field: &str) -> Result<&'static str> {
    match field {
        "id" => Ok("id"),
        "external_id" => Ok("external_id"),
        "title" => Ok("title"),
        "body" => Ok("body"),
        other => bail!("unknown entity field '{}'", other),
    }
}

impl EntityRepository for SqliteEntityStore {
    fn find_by_field(&self, entity_type: &str, field: &str, value: &str) -> Result<Vec<EntityId>> {
        let column = field_column(field)?;
        let query = format!(
            "SELECT id FROM entities WHERE entity_type = ?1 AND {} = ?2 ORDER BY id ASC",
            column
        );
        let mut stmt = self.conn.prepare(&query)?;
        let ids = stmt
            .query_map(params![entity_type, value], |row| row.get::<_, i64>(0))?
            .map(|id| id.map(EntityId))
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to look up {} by {}", entity_type, field))?;
        Ok(ids)
    }

    fn load(&self, id: EntityId) -> Result<Option<LocalEntity>> {
        self.conn
            .prepare(&format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS))?
            .query_row([id.0], entity_from_row)
            .optional()
            .with_context(|| format!("failed to load entity {}", id))
    }

    fn create(&self, fields: NewEntity) -> Result<LocalEntity> {
        let now = chrono::Utc::now();
        self.conn
            .execute(
                "INSERT INTO entities(entity_type, external_id, title, body, revision, created_at, updated_at)
                 VALUES (?1, ?2, ?3, '', 0, ?4, ?4)",
                params![fields.entity_type, fields.external_id, fields.title, now],
            )
            .with_context(|| {
                format!(
                    "failed to create {} for external id {}",
                    fields.entity_type, fields.external_id
                )
            })?;

        Ok(LocalEntity {
            id: EntityId(self.conn.last_insert_rowid()),
            entity_type: fields.entity_type,
            external_id: fields.external_id,
            title: fields.title,
            body: String::new(),
            revision: 0,
            created_at: now,
            updated_at: now,
        })
    }

    fn save(&self, entity: &mut LocalEntity) -> Result<bool> {
        let now = chrono::Utc::now();
        let updated = self
            .conn
            .execute(
                "UPDATE entities
                 SET title = ?1, body = ?2, revision = revision + 1, updated_at = ?3
                 WHERE id = ?4",
                params![entity.title, entity.body, now, entity.id.0],
            )
            .with_context(|| format!("failed to save entity {}", entity.id))?;

        if updated == 0 {
            return Ok(false);
        }
        entity.revision += 1;
        entity.updated_at = now;
        Ok(true)
    }

    fn list(&self, entity_type: &str, limit: Option<usize>) -> Result<Vec<LocalEntity>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM entities WHERE entity_type = ?1 ORDER BY id ASC LIMIT ?2",
            ENTITY_COLUMNS
        ))?;
        let entities = stmt
            .query_map(params![entity_type, limit], entity_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .with_context(|| format!("failed to list {} entities", entity_type))?;
        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::repository::EXTERNAL_ID_FIELD;
    use tempfile::tempdir;

    #[test]
    fn test_create_assigns_id_and_title() {
        let store = SqliteEntityStore::open_in_memory().unwrap();
        let entity = store.create(NewEntity::article("article", "A1")).unwrap();

        assert_eq!(entity.title, "A1");
        assert_eq!(entity.body, "");
        assert_eq!(entity.revision, 0);
        assert_eq!(store.load(entity.id).unwrap(), Some(entity));
    }

    #[test]
    fn test_unique_external_id_per_type() {
        let store = SqliteEntityStore::open_in_memory().unwrap();
        store.create(NewEntity::article("article", "A1")).unwrap();

        assert!(store.create(NewEntity::article("article", "A1")).is_err());
        // Same id under another type is a different entity
        assert!(store.create(NewEntity::article("page", "A1")).is_ok());
    }

    #[test]
    fn test_find_by_external_id() {
        let store = SqliteEntityStore::open_in_memory().unwrap();
        let a1 = store.create(NewEntity::article("article", "A1")).unwrap();
        store.create(NewEntity::article("article", "A2")).unwrap();

        let found = store
            .find_by_field("article", EXTERNAL_ID_FIELD, "A1")
            .unwrap();
        assert_eq!(found, vec![a1.id]);
        assert!(store
            .find_by_field("page", EXTERNAL_ID_FIELD, "A1")
            .unwrap()
            .is_empty());
        assert!(store.find_by_field("article", "nope", "A1").is_err());
    }

    #[test]
    fn test_save_bumps_revision_even_without_changes() {
        let store = SqliteEntityStore::open_in_memory().unwrap();
        let mut entity = store.create(NewEntity::article("article", "A1")).unwrap();

        entity.body = "hello".to_string();
        assert!(store.save(&mut entity).unwrap());
        assert!(store.save(&mut entity).unwrap());

        let loaded = store.load(entity.id).unwrap().unwrap();
        assert_eq!(loaded.body, "hello");
        assert_eq!(loaded.revision, 2);
        assert_eq!(entity.revision, 2);
    }

    #[test]
    fn test_save_of_missing_entity_is_rejected() {
        let store = SqliteEntityStore::open_in_memory().unwrap();
        let mut entity = store.create(NewEntity::article("article", "A1")).unwrap();
        store
            .conn
            .execute("DELETE FROM entities WHERE id = ?1", [entity.id.0])
            .unwrap();

        assert!(!store.save(&mut entity).unwrap());
        assert_eq!(store.load(entity.id).unwrap(), None);
    }

    #[test]
    fn test_list_and_count_persist_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store").join("content.db");
        {
            let store = SqliteEntityStore::open(&path).unwrap();
            store.create(NewEntity::article("article", "A1")).unwrap();
            store.create(NewEntity::article("article", "A2")).unwrap();
            store.create(NewEntity::article("article", "A3")).unwrap();
        }

        let store = SqliteEntityStore::open(&path).unwrap();
        assert_eq!(store.count("article").unwrap(), 3);
        let listed = store.list("article", Some(2)).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].external_id, "A1");
        assert_eq!(store.list("article", None).unwrap().len(), 3);
    }

    #[test]
    fn test_file_store_uses_wal_with_normal_sync() {
        let dir = tempdir().unwrap();
        let store = SqliteEntityStore::open(dir.path().join("content.db")).unwrap();

        let journal: String = store
            .conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        let synchronous: i64 = store
            .conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal, "wal");
        // NORMAL
        assert_eq!(synchronous, 1);
    }
}
