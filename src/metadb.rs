use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::{Error, Result};

fn hash_key(lookup_key: &str) -> String {
    format!("meta:{}", lookup_key)
}

/// Raw metadata transport, keyed by `(lookup_key, metadata_key)`.
/// Values pass through untouched; existence semantics live in
/// [`MetaDb`].
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, lookup_key: &str, key: &str) -> Result<Option<String>>;
    async fn keys(&self, lookup_key: &str) -> Result<Vec<String>>;
    async fn set(&self, lookup_key: &str, key: &str, value: &str) -> Result<()>;
    /// Returns whether the pair existed.
    async fn delete(&self, lookup_key: &str, key: &str) -> Result<bool>;
}

/// Redis-backed metadata: one hash per lookup key (`meta:<lookup_key>`),
/// fields are metadata keys.
pub struct RedisMetaStore {
    conn: MultiplexedConnection,
}

impl RedisMetaStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl MetadataStore for RedisMetaStore {
    async fn get(&self, lookup_key: &str, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(hash_key(lookup_key), key).await?;
        Ok(value)
    }

    async fn keys(&self, lookup_key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.hkeys(hash_key(lookup_key)).await?;
        Ok(keys)
    }

    async fn set(&self, lookup_key: &str, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hset(hash_key(lookup_key), key, value).await?;
        Ok(())
    }

    async fn delete(&self, lookup_key: &str, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(hash_key(lookup_key), key).await?;
        Ok(removed > 0)
    }
}

/// In-process metadata tables for memory mode and tests.
#[derive(Default)]
pub struct MemoryMetaStore {
    tables: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetaStore {
    async fn get(&self, lookup_key: &str, key: &str) -> Result<Option<String>> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| Error::Store("metadata table lock poisoned".to_string()))?;
        Ok(tables
            .get(lookup_key)
            .and_then(|table| table.get(key).cloned()))
    }

    async fn keys(&self, lookup_key: &str) -> Result<Vec<String>> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| Error::Store("metadata table lock poisoned".to_string()))?;
        Ok(tables
            .get(lookup_key)
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn set(&self, lookup_key: &str, key: &str, value: &str) -> Result<()> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| Error::Store("metadata table lock poisoned".to_string()))?;
        tables
            .entry(lookup_key.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, lookup_key: &str, key: &str) -> Result<bool> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| Error::Store("metadata table lock poisoned".to_string()))?;
        Ok(tables
            .get_mut(lookup_key)
            .map(|table| table.remove(key).is_some())
            .unwrap_or(false))
    }
}

/// Metadata access over a [`MetadataStore`]: read/list plus the write
/// operations with their existence rules (create refuses to overwrite,
/// update and remove refuse to invent).
pub struct MetaDb {
    store: Arc<dyn MetadataStore>,
}

impl MetaDb {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub async fn read(&self, lookup_key: &str, key: &str) -> Result<String> {
        self.store
            .get(lookup_key, key)
            .await?
            .ok_or_else(|| missing(lookup_key, key))
    }

    pub async fn keys(&self, lookup_key: &str) -> Result<Vec<String>> {
        let mut keys = self.store.keys(lookup_key).await?;
        keys.sort();
        Ok(keys)
    }

    pub async fn create(&self, lookup_key: &str, key: &str, value: &str) -> Result<()> {
        if self.store.get(lookup_key, key).await?.is_some() {
            return Err(Error::AlreadyExists(format!(
                "metadata key '{}' already exists under '{}'",
                key, lookup_key
            )));
        }
        self.store.set(lookup_key, key, value).await
    }

    pub async fn update(&self, lookup_key: &str, key: &str, value: &str) -> Result<()> {
        if self.store.get(lookup_key, key).await?.is_none() {
            return Err(missing(lookup_key, key));
        }
        self.store.set(lookup_key, key, value).await
    }

    pub async fn remove(&self, lookup_key: &str, key: &str) -> Result<()> {
        if !self.store.delete(lookup_key, key).await? {
            return Err(missing(lookup_key, key));
        }
        Ok(())
    }
}

fn missing(lookup_key: &str, key: &str) -> Error {
    Error::NotFound(format!(
        "no metadata key '{}' under '{}'",
        key, lookup_key
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> MetaDb {
        MetaDb::new(Arc::new(MemoryMetaStore::new()))
    }

    #[tokio::test]
    async fn create_then_read_round_trips() {
        let db = db();
        db.create("col1&exp1", "owner", "team neuro").await.unwrap();
        assert_eq!(db.read("col1&exp1", "owner").await.unwrap(), "team neuro");
    }

    #[tokio::test]
    async fn create_refuses_to_overwrite() {
        let db = db();
        db.create("col1", "owner", "a").await.unwrap();
        let err = db.create("col1", "owner", "b").await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        // the stored value is untouched
        assert_eq!(db.read("col1", "owner").await.unwrap(), "a");
    }

    #[tokio::test]
    async fn update_requires_an_existing_pair() {
        let db = db();
        assert!(matches!(
            db.update("col1", "owner", "x").await.unwrap_err(),
            Error::NotFound(_)
        ));

        db.create("col1", "owner", "a").await.unwrap();
        db.update("col1", "owner", "b").await.unwrap();
        assert_eq!(db.read("col1", "owner").await.unwrap(), "b");
    }

    #[tokio::test]
    async fn remove_reports_missing_pairs() {
        let db = db();
        db.create("col1", "owner", "a").await.unwrap();
        db.remove("col1", "owner").await.unwrap();
        assert!(matches!(
            db.remove("col1", "owner").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            db.read("col1", "owner").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn keys_are_sorted_and_scoped_to_the_lookup_key() {
        let db = db();
        db.create("col1", "zeta", "1").await.unwrap();
        db.create("col1", "alpha", "2").await.unwrap();
        db.create("col1&exp1", "other", "3").await.unwrap();

        assert_eq!(db.keys("col1").await.unwrap(), vec!["alpha", "zeta"]);
        assert_eq!(db.keys("col1&exp1").await.unwrap(), vec!["other"]);
        assert!(db.keys("col2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn values_pass_through_untouched() {
        let db = db();
        let value = "  {\"nested\": \"json\"} \u{1F52C}  ";
        db.create("col1", "blob", value).await.unwrap();
        assert_eq!(db.read("col1", "blob").await.unwrap(), value);
    }
}
