//! Durable journal of local changes not yet reflected on the remote.
//!
//! Two disjoint journals are kept: `dirty` (local writes pending) and
//! `destroyed` (local deletions pending). Each holds at most one entry per
//! `(model_id, store_group)`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use dualstore_common::{Entity, Error, Result, StoreGroup};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dirty (
    id TEXT PRIMARY KEY,
    model_id TEXT NOT NULL,
    store_group TEXT NOT NULL,
    queued_at TEXT NOT NULL,
    UNIQUE(model_id, store_group)
);
CREATE INDEX IF NOT EXISTS idx_dirty_store_group ON dirty(store_group);

CREATE TABLE IF NOT EXISTS destroyed (
    id TEXT PRIMARY KEY,
    model_id TEXT NOT NULL,
    store_group TEXT NOT NULL,
    queued_at TEXT NOT NULL,
    UNIQUE(model_id, store_group)
);
CREATE INDEX IF NOT EXISTS idx_destroyed_store_group ON destroyed(store_group);
"#;

fn journal_err(context: &str, e: rusqlite::Error) -> Error {
    Error::LocalStorage(format!("journal {}: {}", context, e))
}

/// Which journal an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    /// Local writes not yet confirmed by the remote.
    Dirty,
    /// Local deletions not yet confirmed by the remote.
    Destroyed,
}

impl JournalKind {
    fn table(self) -> &'static str {
        match self {
            JournalKind::Dirty => "dirty",
            JournalKind::Destroyed => "destroyed",
        }
    }
}

impl std::fmt::Display for JournalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// A pending change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Locally generated entry identifier.
    pub id: String,
    /// Raw identifier of the entity.
    pub model_id: String,
    /// Group of the entity.
    pub store_group: StoreGroup,
    /// When the entry was first recorded.
    pub queued_at: DateTime<Utc>,
}

impl JournalEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    }

    fn parse(raw: (String, String, String, String)) -> Result<Self> {
        let (id, model_id, store_group, queued_at) = raw;
        let queued_at = DateTime::parse_from_rfc3339(&queued_at)
            .map_err(|e| Error::Serialization(format!("invalid queued_at {}: {}", queued_at, e)))?
            .with_timezone(&Utc);
        Ok(Self {
            id,
            model_id,
            store_group: StoreGroup::new(store_group)?,
            queued_at,
        })
    }
}

/// Where the journal database lives.
#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    // A private in-memory database, reachable only through this connection.
    Memory(Arc<Mutex<Connection>>),
}

impl Location {
    fn session(&self) -> Result<JournalSession<'_>> {
        let conn = match self {
            Location::File(path) => {
                let conn = Connection::open(path).map_err(|e| journal_err("open", e))?;
                conn.busy_timeout(Duration::from_secs(5))
                    .map_err(|e| journal_err("configure", e))?;
                SessionConn::Owned(conn)
            }
            Location::Memory(conn) => SessionConn::Shared(
                conn.lock()
                    .map_err(|_| Error::LocalStorage("journal lock poisoned".to_string()))?,
            ),
        };
        Ok(JournalSession { conn })
    }
}

enum SessionConn<'a> {
    Owned(Connection),
    Shared(MutexGuard<'a, Connection>),
}

impl Deref for SessionConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            SessionConn::Owned(conn) => conn,
            SessionConn::Shared(guard) => &**guard,
        }
    }
}

impl DerefMut for SessionConn<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        match self {
            SessionConn::Owned(conn) => conn,
            SessionConn::Shared(guard) => &mut **guard,
        }
    }
}

/// A scoped journal connection.
///
/// The connection (or, for an in-memory journal, exclusive use of it) is
/// released when the session is dropped, on every exit path. Every method
/// runs in its own transaction.
pub struct JournalSession<'a> {
    conn: SessionConn<'a>,
}

impl JournalSession<'_> {
    fn find_by_key(
        &self,
        kind: JournalKind,
        model_id: &str,
        group: &StoreGroup,
    ) -> Result<Option<JournalEntry>> {
        let sql = format!(
            "SELECT id, model_id, store_group, queued_at FROM {}
             WHERE model_id = ?1 AND store_group = ?2",
            kind.table()
        );
        self.conn
            .query_row(&sql, params![model_id, group.as_str()], JournalEntry::from_row)
            .optional()
            .map_err(|e| journal_err("find", e))?
            .map(JournalEntry::parse)
            .transpose()
    }

    /// Record a pending change, returning the entry identifier.
    ///
    /// Idempotent: an existing entry for `(model_id, group)` is returned
    /// unchanged.
    pub fn add(&mut self, kind: JournalKind, model_id: &str, group: &StoreGroup) -> Result<String> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| journal_err("begin", e))?;

        let inserted = tx
            .execute(
                &format!(
                    "INSERT INTO {} (id, model_id, store_group, queued_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(model_id, store_group) DO NOTHING",
                    kind.table()
                ),
                params![
                    Uuid::new_v4().to_string(),
                    model_id,
                    group.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| journal_err("insert", e))?;

        let id: String = tx
            .query_row(
                &format!(
                    "SELECT id FROM {} WHERE model_id = ?1 AND store_group = ?2",
                    kind.table()
                ),
                params![model_id, group.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| journal_err("lookup", e))?;

        tx.commit().map_err(|e| journal_err("commit", e))?;

        if inserted > 0 {
            debug!("Journaled {} {} in {} as {}", kind, model_id, group, id);
        }
        Ok(id)
    }

    /// Exact lookup by `(model_id, group)`.
    pub fn find(
        &self,
        kind: JournalKind,
        model_id: &str,
        group: &StoreGroup,
    ) -> Result<Option<JournalEntry>> {
        self.find_by_key(kind, model_id, group)
    }

    /// All entries of a group, in insertion order.
    pub fn find_all(&self, kind: JournalKind, group: &StoreGroup) -> Result<Vec<JournalEntry>> {
        let sql = format!(
            "SELECT id, model_id, store_group, queued_at FROM {}
             WHERE store_group = ?1 ORDER BY rowid",
            kind.table()
        );
        let mut stmt = self.conn.prepare(&sql).map_err(|e| journal_err("scan", e))?;
        let rows = stmt
            .query_map([group.as_str()], JournalEntry::from_row)
            .map_err(|e| journal_err("scan", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| journal_err("scan", e))?;
        rows.into_iter().map(JournalEntry::parse).collect()
    }

    /// Remove the entry for `(model_id, group)`. No-op if absent.
    pub fn remove(&mut self, kind: JournalKind, model_id: &str, group: &StoreGroup) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                &format!(
                    "DELETE FROM {} WHERE model_id = ?1 AND store_group = ?2",
                    kind.table()
                ),
                params![model_id, group.as_str()],
            )
            .map_err(|e| journal_err("remove", e))?;
        if removed > 0 {
            debug!("Removed {} entry for {} in {}", kind, model_id, group);
        }
        Ok(removed > 0)
    }

    /// Remove an entry by its entry identifier. No-op if absent.
    pub fn remove_entry(&mut self, kind: JournalKind, entry_id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                &format!("DELETE FROM {} WHERE id = ?1", kind.table()),
                [entry_id],
            )
            .map_err(|e| journal_err("remove", e))?;
        Ok(removed > 0)
    }

    /// Remove every dirty and destroyed entry of a group.
    pub fn reset(&mut self, group: &StoreGroup) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| journal_err("begin", e))?;
        let mut removed = 0;
        for kind in [JournalKind::Dirty, JournalKind::Destroyed] {
            removed += tx
                .execute(
                    &format!("DELETE FROM {} WHERE store_group = ?1", kind.table()),
                    [group.as_str()],
                )
                .map_err(|e| journal_err("reset", e))?;
        }
        tx.commit().map_err(|e| journal_err("commit", e))?;
        info!("Reset journal for {}: {} entries removed", group, removed);
        Ok(removed)
    }

    /// Number of entries of a kind, in one group or globally.
    pub fn count(&self, kind: JournalKind, group: Option<&StoreGroup>) -> Result<usize> {
        let count: i64 = match group {
            Some(group) => self.conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE store_group = ?1",
                    kind.table()
                ),
                [group.as_str()],
                |row| row.get(0),
            ),
            None => self.conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", kind.table()),
                [],
                |row| row.get(0),
            ),
        }
        .map_err(|e| journal_err("count", e))?;
        Ok(count as usize)
    }

    /// Whether either journal holds any entry, in one group or globally.
    pub fn has_any(&self, group: Option<&StoreGroup>) -> Result<bool> {
        Ok(self.count(JournalKind::Dirty, group)? > 0
            || self.count(JournalKind::Destroyed, group)? > 0)
    }

    /// Every group with at least one entry, sorted.
    pub fn groups(&self) -> Result<Vec<StoreGroup>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT store_group FROM dirty
                 UNION SELECT store_group FROM destroyed
                 ORDER BY store_group",
            )
            .map_err(|e| journal_err("groups", e))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| journal_err("groups", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| journal_err("groups", e))?;
        names.into_iter().map(StoreGroup::new).collect()
    }

    /// Empty both journals.
    pub fn clear(&mut self) -> Result<()> {
        self.conn
            .execute_batch("BEGIN; DELETE FROM dirty; DELETE FROM destroyed; COMMIT;")
            .map_err(|e| journal_err("clear", e))?;
        info!("Journal cleared");
        Ok(())
    }
}

/// Raw identifier of an entity, if it has one.
fn model_key(entity: &Entity) -> Option<String> {
    entity.id().map(|id| id.as_str().to_string())
}

/// Handle to the journal database.
///
/// Every async operation opens its own [`JournalSession`] on the blocking
/// pool and releases it before returning. Sessions on an in-memory journal
/// are serialized.
pub struct JournalStore {
    location: Location,
}

impl JournalStore {
    /// Open (or create) a journal at the given path.
    ///
    /// # Errors
    /// - Database creation or schema initialization failure
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let location = Location::File(path.as_ref().to_path_buf());
        location
            .session()?
            .conn
            .execute_batch(SCHEMA)
            .map_err(|e| journal_err("init schema", e))?;
        info!("Journal opened at {}", path.as_ref().display());
        Ok(Self { location })
    }

    /// Create a private in-memory journal.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| journal_err("open", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| journal_err("init schema", e))?;
        Ok(Self {
            location: Location::Memory(Arc::new(Mutex::new(conn))),
        })
    }

    /// Open a scoped session for synchronous use.
    pub fn session(&self) -> Result<JournalSession<'_>> {
        self.location.session()
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut JournalSession<'_>) -> Result<T> + Send + 'static,
    {
        let location = self.location.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = location.session()?;
            f(&mut session)
        })
        .await
        .map_err(|e| Error::LocalStorage(format!("journal task failed: {}", e)))?
    }

    async fn add(&self, kind: JournalKind, entity: &Entity) -> Result<String> {
        let model_id = model_key(entity).ok_or_else(|| {
            Error::Validation(format!("cannot journal an entity without identifier as {}", kind))
        })?;
        let group = entity.store_group().clone();
        self.run(move |s| s.add(kind, &model_id, &group)).await
    }

    async fn find(&self, kind: JournalKind, entity: &Entity) -> Result<Option<JournalEntry>> {
        let Some(model_id) = model_key(entity) else {
            return Ok(None);
        };
        let group = entity.store_group().clone();
        self.run(move |s| s.find(kind, &model_id, &group)).await
    }

    async fn remove(&self, kind: JournalKind, entity: &Entity) -> Result<()> {
        let Some(model_id) = model_key(entity) else {
            return Ok(());
        };
        let group = entity.store_group().clone();
        self.run(move |s| s.remove(kind, &model_id, &group).map(|_| ()))
            .await
    }

    /// Record that an entity has unconfirmed local writes.
    pub async fn add_dirty(&self, entity: &Entity) -> Result<String> {
        self.add(JournalKind::Dirty, entity).await
    }

    /// Record that an entity was deleted locally.
    pub async fn add_destroyed(&self, entity: &Entity) -> Result<String> {
        self.add(JournalKind::Destroyed, entity).await
    }

    /// Dirty entry of an entity; absent when it has no identifier.
    pub async fn find_dirty(&self, entity: &Entity) -> Result<Option<JournalEntry>> {
        self.find(JournalKind::Dirty, entity).await
    }

    /// Destroyed entry of an entity; absent when it has no identifier.
    pub async fn find_destroyed(&self, entity: &Entity) -> Result<Option<JournalEntry>> {
        self.find(JournalKind::Destroyed, entity).await
    }

    /// Dirty entries of a group, in insertion order.
    pub async fn find_all_dirty(&self, group: &StoreGroup) -> Result<Vec<JournalEntry>> {
        let group = group.clone();
        self.run(move |s| s.find_all(JournalKind::Dirty, &group))
            .await
    }

    /// Destroyed entries of a group, in insertion order.
    pub async fn find_all_destroyed(&self, group: &StoreGroup) -> Result<Vec<JournalEntry>> {
        let group = group.clone();
        self.run(move |s| s.find_all(JournalKind::Destroyed, &group))
            .await
    }

    /// Drop the dirty entry of an entity. No-op if absent.
    pub async fn remove_dirty(&self, entity: &Entity) -> Result<()> {
        self.remove(JournalKind::Dirty, entity).await
    }

    /// Drop the destroyed entry of an entity. No-op if absent.
    pub async fn remove_destroyed(&self, entity: &Entity) -> Result<()> {
        self.remove(JournalKind::Destroyed, entity).await
    }

    /// Drop an entry by its entry identifier. No-op if absent.
    pub async fn remove_entry(&self, kind: JournalKind, entry_id: &str) -> Result<bool> {
        let entry_id = entry_id.to_string();
        self.run(move |s| s.remove_entry(kind, &entry_id)).await
    }

    /// Remove all dirty and destroyed entries of one group.
    pub async fn reset(&self, group: &StoreGroup) -> Result<usize> {
        let group = group.clone();
        self.run(move |s| s.reset(&group)).await
    }

    /// Whether either journal holds any entry, in any group.
    pub async fn has_dirty_or_destroyed(&self) -> Result<bool> {
        self.run(|s| s.has_any(None)).await
    }

    /// Whether either journal holds any entry of one group.
    pub async fn has_dirty_or_destroyed_in(&self, group: &StoreGroup) -> Result<bool> {
        let group = group.clone();
        self.run(move |s| s.has_any(Some(&group))).await
    }

    /// Number of entries of a kind, in one group or globally.
    pub async fn count(&self, kind: JournalKind, group: Option<&StoreGroup>) -> Result<usize> {
        let group = group.cloned();
        self.run(move |s| s.count(kind, group.as_ref())).await
    }

    /// Every group with at least one entry.
    pub async fn groups(&self) -> Result<Vec<StoreGroup>> {
        self.run(|s| s.groups()).await
    }

    /// Empty both journals unconditionally.
    pub async fn clear(&self) -> Result<()> {
        self.run(|s| s.clear()).await
    }
}
