//! Key-value store abstraction and the persisted key layout.
//!
//! The node persists channel state, pending tickets and replay tags under
//! byte-string keys with documented prefixes, so that independent
//! implementations can interoperate on the same database. The engine behind
//! the trait is external; [`MemoryStore`] backs the test suites.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod keys;

/// A write operation inside a batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
}

/// Store error type.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("key not found")]
    NotFound,

    #[error("backend failure: {0}")]
    Backend(String),
}

/// Byte-keyed store with ordered range scans.
///
/// All operations are serialized per key by the backend. `get` on a missing
/// key returns [`StoreError::NotFound`]; every other error is transient.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError>;

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    async fn del(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Apply a batch of writes atomically.
    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// All entries with `gte <= key <= lte`, in ascending key order.
    async fn range(&self, gte: &[u8], lte: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

/// In-memory store over a sorted map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .write()
            .await
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn del(&self, key: &[u8]) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    entries.insert(key, value);
                }
                BatchOp::Del(key) => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn range(&self, gte: &[u8], lte: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .range::<[u8], _>((Bound::Included(gte), Bound::Included(lte)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
