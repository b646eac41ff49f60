use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Represents errors that can occur during cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache connection error: {0}")]
    Connection(String),

    #[error("Cache command error: {0}")]
    Command(String),
}

/// Defines the behavior of the key/value cache the coordinator writes to.
///
/// Plain keys hold serialized records and item etags; hash-map keys hold the
/// projection and item-list etag namespaces.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError>;

    async fn hash_delete_many(&self, key: &str, fields: &[String]) -> Result<(), CacheError>;
}

#[derive(Debug, Clone)]
enum CacheEntry {
    Plain(String),
    Hash(HashMap<String, String>),
}

/// In-process cache used by tests and embedded deployments. Safe for
/// concurrent use by any number of in-flight operations.
#[derive(Default, Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), CacheEntry::Plain(value.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.entries.read().await.get(key) {
            Some(CacheEntry::Plain(value)) => Ok(Some(value.clone())),
            Some(CacheEntry::Hash(_)) => Err(CacheError::Command(format!(
                "wrong entry kind for key {key}"
            ))),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry::Hash(HashMap::new()));
        match entry {
            CacheEntry::Hash(map) => {
                map.insert(field.to_string(), value.to_string());
                Ok(())
            }
            CacheEntry::Plain(_) => Err(CacheError::Command(format!(
                "wrong entry kind for key {key}"
            ))),
        }
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        match self.entries.read().await.get(key) {
            Some(CacheEntry::Hash(map)) => Ok(map.clone()),
            Some(CacheEntry::Plain(_)) => Err(CacheError::Command(format!(
                "wrong entry kind for key {key}"
            ))),
            None => Ok(HashMap::new()),
        }
    }

    async fn hash_delete_many(&self, key: &str, fields: &[String]) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        if let Some(CacheEntry::Hash(map)) = entries.get_mut(key) {
            for field in fields {
                map.remove(field);
            }
            if map.is_empty() {
                entries.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_delete_roundtrip() {
        let cache = MemoryCache::new();
        cache.set("k", "v").await.expect("set");
        assert_eq!(cache.get("k").await.expect("get"), Some("v".to_string()));

        cache.delete("k").await.expect("delete");
        assert_eq!(cache.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn hash_operations() {
        let cache = MemoryCache::new();
        cache.hash_set("h", "f1", "v1").await.expect("hset");
        cache.hash_set("h", "f2", "v2").await.expect("hset");

        let all = cache.hash_get_all("h").await.expect("hgetall");
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("f1").map(String::as_str), Some("v1"));

        cache
            .hash_delete_many("h", &["f1".to_string(), "f2".to_string()])
            .await
            .expect("hdel");
        assert!(cache.hash_get_all("h").await.expect("hgetall").is_empty());
    }

    #[tokio::test]
    async fn hash_get_all_of_missing_key_is_empty() {
        let cache = MemoryCache::new();
        assert!(cache
            .hash_get_all("missing")
            .await
            .expect("hgetall")
            .is_empty());
    }

    #[tokio::test]
    async fn plain_and_hash_namespaces_do_not_mix() {
        let cache = MemoryCache::new();
        cache.set("k", "v").await.expect("set");
        assert!(cache.hash_set("k", "f", "v").await.is_err());
    }
}
