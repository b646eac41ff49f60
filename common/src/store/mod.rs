use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::record::RecordKey;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Conditional check failed for {0}")]
    ConditionFailed(String),
}

/// Condition attached to a put or delete. The core does not enforce
/// optimistic concurrency beyond existence checks; concurrent writers to the
/// same record race and the last successful write wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteCondition {
    #[default]
    None,
    MustNotExist,
    MustExist,
}

/// One page of a key-ordered scan. `last_key` is set when the scan stopped at
/// the page boundary and more documents may follow.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub documents: Vec<(RecordKey, Value)>,
    pub last_key: Option<RecordKey>,
}

/// Key/range-addressable primary store. Documents are JSON values keyed by a
/// composite key; connections are safe for concurrent use by multiple
/// in-flight operations.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn get(&self, collection: &str, key: &RecordKey) -> Result<Option<Value>, StoreError>;

    /// Fetches each key independently. The result preserves the input order;
    /// missing documents come back as `None`.
    async fn batch_get(
        &self,
        collection: &str,
        keys: &[RecordKey],
    ) -> Result<Vec<Option<Value>>, StoreError>;

    async fn put(
        &self,
        collection: &str,
        key: &RecordKey,
        document: Value,
        condition: WriteCondition,
    ) -> Result<(), StoreError>;

    async fn delete(
        &self,
        collection: &str,
        key: &RecordKey,
        condition: WriteCondition,
    ) -> Result<(), StoreError>;

    /// Key-ordered scan resuming after `start_after`, bounded by `limit`.
    async fn scan(
        &self,
        collection: &str,
        start_after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<ScanPage, StoreError>;
}

/// In-memory primary store backing tests and embedded use. Collections are
/// key-ordered maps, so scans are deterministic and resumable.
#[derive(Default, Clone)]
pub struct MemoryStore {
    collections: Arc<RwLock<HashMap<String, BTreeMap<RecordKey, Value>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PrimaryStore for MemoryStore {
    async fn get(&self, collection: &str, key: &RecordKey) -> Result<Option<Value>, StoreError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .and_then(|items| items.get(key))
            .cloned())
    }

    async fn batch_get(
        &self,
        collection: &str,
        keys: &[RecordKey],
    ) -> Result<Vec<Option<Value>>, StoreError> {
        let collections = self.collections.read().await;
        let items = collections.get(collection);
        Ok(keys
            .iter()
            .map(|key| items.and_then(|items| items.get(key)).cloned())
            .collect())
    }

    async fn put(
        &self,
        collection: &str,
        key: &RecordKey,
        document: Value,
        condition: WriteCondition,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let items = collections.entry(collection.to_string()).or_default();
        let exists = items.contains_key(key);
        match condition {
            WriteCondition::MustNotExist if exists => {
                return Err(StoreError::ConditionFailed(key.to_string()))
            }
            WriteCondition::MustExist if !exists => {
                return Err(StoreError::ConditionFailed(key.to_string()))
            }
            _ => {}
        }
        items.insert(key.clone(), document);
        Ok(())
    }

    async fn delete(
        &self,
        collection: &str,
        key: &RecordKey,
        condition: WriteCondition,
    ) -> Result<(), StoreError> {
        let mut collections = self.collections.write().await;
        let items = collections.entry(collection.to_string()).or_default();
        let removed = items.remove(key);
        if removed.is_none() && condition == WriteCondition::MustExist {
            return Err(StoreError::ConditionFailed(key.to_string()));
        }
        Ok(())
    }

    async fn scan(
        &self,
        collection: &str,
        start_after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<ScanPage, StoreError> {
        let collections = self.collections.read().await;
        let Some(items) = collections.get(collection) else {
            return Ok(ScanPage::default());
        };

        let mut documents: Vec<(RecordKey, Value)> = Vec::new();
        let mut truncated = false;
        for (key, document) in items {
            if let Some(after) = start_after {
                if key <= after {
                    continue;
                }
            }
            if documents.len() == limit {
                truncated = true;
                break;
            }
            documents.push((key.clone(), document.clone()));
        }

        let last_key = if truncated {
            documents.last().map(|(key, _)| key.clone())
        } else {
            None
        };

        Ok(ScanPage {
            documents,
            last_key,
        })
    }
}
