//! SQLite-backed local store.
//!
//! Persists entity records so the application keeps working while the
//! remote is unreachable.

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::store::LocalStore;
use dualstore_common::{Attributes, Error, ModelId, Record, Result, StoreGroup};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    store_group TEXT NOT NULL,
    id TEXT NOT NULL,
    temporary INTEGER NOT NULL,
    attributes TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0,
    UNIQUE(store_group, id)
);

CREATE INDEX IF NOT EXISTS idx_records_group ON records(store_group);
"#;

fn storage_err(context: &str, e: rusqlite::Error) -> Error {
    Error::LocalStorage(format!("{}: {}", context, e))
}

/// Local store persisted in a SQLite file.
///
/// The connection is opened lazily and released by [`LocalStore::close_all`].
pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            conn: Mutex::new(None),
        };
        // Fail early on an unusable path.
        store.connection()?;
        info!("Local store opened at {}", store.path.display());
        Ok(store)
    }

    fn connection(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| Error::LocalStorage("local store lock poisoned".to_string()))?;

        if guard.is_none() {
            let conn =
                Connection::open(&self.path).map_err(|e| storage_err("open local store", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| storage_err("init local store schema", e))?;
            *guard = Some(conn);
        }

        Ok(guard)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.connection()?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(Error::LocalStorage("local store is closed".to_string())),
        }
    }

    fn row_to_record(
        group: &StoreGroup,
        id: String,
        temporary: bool,
        attributes: String,
        deleted: bool,
    ) -> Result<Record> {
        let attributes: Attributes = serde_json::from_str(&attributes)?;
        Ok(Record {
            id: if temporary {
                ModelId::Temporary(id)
            } else {
                ModelId::Permanent(id)
            },
            store_group: group.clone(),
            attributes,
            deleted,
        })
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, group: &StoreGroup, id: &str) -> Result<Option<Record>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, temporary, attributes, deleted FROM records
                 WHERE store_group = ?1 AND id = ?2",
                params![group.as_str(), id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(|e| storage_err("get record", e))
        })?;

        row.map(|(id, temporary, attributes, deleted)| {
            Self::row_to_record(group, id, temporary, attributes, deleted)
        })
        .transpose()
    }

    async fn list(&self, group: &StoreGroup) -> Result<Vec<Record>> {
        let rows: Vec<(String, bool, String, bool)> = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, temporary, attributes, deleted FROM records
                     WHERE store_group = ?1 ORDER BY seq",
                )
                .map_err(|e| storage_err("list records", e))?;
            let rows = stmt
                .query_map([group.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .map_err(|e| storage_err("list records", e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| storage_err("list records", e))
        })?;

        rows.into_iter()
            .map(|(id, temporary, attributes, deleted)| {
                Self::row_to_record(group, id, temporary, attributes, deleted)
            })
            .collect()
    }

    async fn insert(&self, record: Record) -> Result<Record> {
        let attributes = serde_json::to_string(&record.attributes)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (store_group, id, temporary, attributes, deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.store_group.as_str(),
                    record.id.as_str(),
                    record.id.is_temporary(),
                    attributes,
                    record.deleted,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(ref f, _)
                    if f.code == ErrorCode::ConstraintViolation =>
                {
                    Error::AlreadyExists(format!(
                        "Record {} already exists in {}",
                        record.id, record.store_group
                    ))
                }
                other => storage_err("insert record", other),
            })
        })?;
        debug!("Inserted record {} in {}", record.id, record.store_group);
        Ok(record)
    }

    async fn put(&self, record: Record) -> Result<Record> {
        let attributes = serde_json::to_string(&record.attributes)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO records (store_group, id, temporary, attributes, deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(store_group, id) DO UPDATE SET
                    temporary = excluded.temporary,
                    attributes = excluded.attributes,
                    deleted = excluded.deleted",
                params![
                    record.store_group.as_str(),
                    record.id.as_str(),
                    record.id.is_temporary(),
                    attributes,
                    record.deleted,
                ],
            )
            .map_err(|e| storage_err("put record", e))
        })?;
        debug!("Stored record {} in {}", record.id, record.store_group);
        Ok(record)
    }

    async fn mark_deleted(&self, group: &StoreGroup, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE records SET deleted = 1 WHERE store_group = ?1 AND id = ?2",
                params![group.as_str(), id],
            )
            .map_err(|e| storage_err("flag record", e))
        })?;
        Ok(())
    }

    async fn delete(&self, group: &StoreGroup, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM records WHERE store_group = ?1 AND id = ?2",
                params![group.as_str(), id],
            )
            .map_err(|e| storage_err("delete record", e))
        })?;
        Ok(())
    }

    async fn close_all(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| Error::LocalStorage("local store lock poisoned".to_string()))?;
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, e)| storage_err("close local store", e))?;
            debug!("Local store connection closed");
        }
        Ok(())
    }
}
