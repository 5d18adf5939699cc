//! Local store trait definition.

use async_trait::async_trait;

use dualstore_common::{Record, Result, StoreGroup};

/// Persistent local store for entity records.
///
/// Records are addressed by `(store_group, id)`. Implementations keep
/// records in insertion order within a group.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the store name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Get a record, including one flagged as deleted.
    async fn get(&self, group: &StoreGroup, id: &str) -> Result<Option<Record>>;

    /// List all records of a group, including flagged ones.
    async fn list(&self, group: &StoreGroup) -> Result<Vec<Record>>;

    /// Insert a new record.
    ///
    /// # Errors
    /// - A record with the same identifier already exists in the group
    async fn insert(&self, record: Record) -> Result<Record>;

    /// Insert or replace a record.
    ///
    /// # Postconditions
    /// - The stored record equals `record`, including its deleted flag
    async fn put(&self, record: Record) -> Result<Record>;

    /// Flag a record as locally deleted, pending remote deletion.
    ///
    /// No-op if the record does not exist.
    async fn mark_deleted(&self, group: &StoreGroup, id: &str) -> Result<()>;

    /// Remove a record. No-op if the record does not exist.
    async fn delete(&self, group: &StoreGroup, id: &str) -> Result<()>;

    /// Release every open connection. Later calls reopen as needed.
    async fn close_all(&self) -> Result<()>;

    /// List the records of a group that are not flagged as deleted.
    async fn list_live(&self, group: &StoreGroup) -> Result<Vec<Record>> {
        Ok(self
            .list(group)
            .await?
            .into_iter()
            .filter(|r| !r.deleted)
            .collect())
    }
}
