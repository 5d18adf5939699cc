//! In-memory local store for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::store::LocalStore;
use dualstore_common::{Error, Record, Result, StoreGroup};

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
pub struct MemoryStore {
    storage: Arc<RwLock<HashMap<String, Vec<Record>>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail with a local storage error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Total number of records across all groups.
    pub fn len(&self) -> usize {
        self.storage
            .read()
            .map(|s| s.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Vec<Record>>>> {
        self.storage
            .read()
            .map_err(|_| Error::LocalStorage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Vec<Record>>>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::LocalStorage("memory store is read-only".to_string()));
        }
        self.storage
            .write()
            .map_err(|_| Error::LocalStorage("memory store lock poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, group: &StoreGroup, id: &str) -> Result<Option<Record>> {
        let storage = self.read()?;
        Ok(storage
            .get(group.as_str())
            .and_then(|records| records.iter().find(|r| r.id.as_str() == id))
            .cloned())
    }

    async fn list(&self, group: &StoreGroup) -> Result<Vec<Record>> {
        let storage = self.read()?;
        Ok(storage.get(group.as_str()).cloned().unwrap_or_default())
    }

    async fn insert(&self, record: Record) -> Result<Record> {
        let mut storage = self.write()?;
        let records = storage
            .entry(record.store_group.as_str().to_string())
            .or_default();

        if records.iter().any(|r| r.id == record.id) {
            return Err(Error::AlreadyExists(format!(
                "Record {} already exists in {}",
                record.id, record.store_group
            )));
        }

        records.push(record.clone());
        Ok(record)
    }

    async fn put(&self, record: Record) -> Result<Record> {
        let mut storage = self.write()?;
        let records = storage
            .entry(record.store_group.as_str().to_string())
            .or_default();

        match records
            .iter_mut()
            .find(|r| r.id.as_str() == record.id.as_str())
        {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }

        Ok(record)
    }

    async fn mark_deleted(&self, group: &StoreGroup, id: &str) -> Result<()> {
        let mut storage = self.write()?;
        if let Some(record) = storage
            .get_mut(group.as_str())
            .and_then(|records| records.iter_mut().find(|r| r.id.as_str() == id))
        {
            record.deleted = true;
        }
        Ok(())
    }

    async fn delete(&self, group: &StoreGroup, id: &str) -> Result<()> {
        let mut storage = self.write()?;
        if let Some(records) = storage.get_mut(group.as_str()) {
            records.retain(|r| r.id.as_str() != id);
        }
        Ok(())
    }

    async fn close_all(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dualstore_common::{Attributes, ModelId};

    fn record(group: &str, id: &str) -> Record {
        Record {
            id: ModelId::Permanent(id.to_string()),
            store_group: StoreGroup::new(group).unwrap(),
            attributes: Attributes::new(),
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_insert_get() {
        let store = MemoryStore::new();
        let group = StoreGroup::new("customers").unwrap();

        store.insert(record("customers", "a")).await.unwrap();

        assert!(store.get(&group, "a").await.unwrap().is_some());
        assert!(store.get(&group, "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_duplicate_fails() {
        let store = MemoryStore::new();
        store.insert(record("customers", "a")).await.unwrap();

        let result = store.insert(record("customers", "a")).await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_put_replaces_in_place() {
        let store = MemoryStore::new();
        let group = StoreGroup::new("customers").unwrap();
        store.insert(record("customers", "a")).await.unwrap();
        store.insert(record("customers", "b")).await.unwrap();

        let mut updated = record("customers", "a");
        updated
            .attributes
            .insert("name".to_string(), serde_json::json!("Tom"));
        store.put(updated).await.unwrap();

        let records = store.list(&group).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.as_str(), "a");
        assert_eq!(records[0].attributes["name"], "Tom");
    }

    #[tokio::test]
    async fn test_mark_deleted_hides_from_live_listing() {
        let store = MemoryStore::new();
        let group = StoreGroup::new("customers").unwrap();
        store.insert(record("customers", "a")).await.unwrap();
        store.insert(record("customers", "b")).await.unwrap();

        store.mark_deleted(&group, "a").await.unwrap();

        assert_eq!(store.list(&group).await.unwrap().len(), 2);
        let live = store.list_live(&group).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id.as_str(), "b");
    }

    #[tokio::test]
    async fn test_delete_absent_is_noop() {
        let store = MemoryStore::new();
        let group = StoreGroup::new("customers").unwrap();
        store.delete(&group, "missing").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);

        let result = store.insert(record("customers", "a")).await;
        assert!(matches!(result, Err(Error::LocalStorage(_))));
    }
}
