//! In-memory document store for testing.
//!
//! This backend keeps every namespace in a `BTreeMap` behind a `RwLock`. It
//! is not persistent; all data is lost when the process exits. Use it for
//! unit tests, integration tests, and dry runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::RwLock;

use crate::{DocumentStore, Namespace, StorageError};

/// An in-memory document store.
///
/// Thread-safe and async-compatible. Clones share state, so a test can keep
/// one handle for assertions while the code under test writes through another.
///
/// # Examples
///
/// ```
/// # use tenantvault_storage::{DocumentStore, MemoryStore, Namespace};
/// # #[tokio::main]
/// # async fn main() {
/// let store = MemoryStore::new();
/// let ns = Namespace::new("atlas_mappings", "cluster_users").unwrap();
/// store.insert_many(&ns, &[serde_json::json!({"username": "app"})]).await.unwrap();
/// assert_eq!(store.find_all(&ns).await.unwrap().len(), 1);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<Namespace, Vec<Value>>>>,
    batches: Arc<AtomicU64>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-empty batches written so far.
    #[must_use]
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_many(
        &self,
        namespace: &Namespace,
        documents: &[Value],
    ) -> Result<u64, StorageError> {
        if documents.is_empty() {
            return Ok(0);
        }
        let mut data = self.data.write().await;
        data.entry(namespace.clone())
            .or_default()
            .extend(documents.iter().cloned());
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(documents.len() as u64)
    }

    async fn find_all(&self, namespace: &Namespace) -> Result<Vec<Value>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(namespace).cloned().unwrap_or_default())
    }
}
