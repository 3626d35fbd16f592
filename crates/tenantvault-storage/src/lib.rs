//! Document store abstraction for `TenantVault`.
//!
//! This crate defines the [`DocumentStore`] trait, a minimal batch-insert
//! document interface that knows nothing about credentials or encryption.
//! The credential recorder in `tenantvault-core` encrypts sensitive fields
//! before documents ever reach this layer.
//!
//! Three implementations are provided:
//!
//! - [`PostgresStore`]: production default, JSONB rows in PostgreSQL (feature `postgres-backend`)
//! - [`JsonLinesStore`]: append-only JSON-lines files, one per namespace
//! - [`MemoryStore`]: in-memory, for testing and dry runs

mod error;
mod file_backend;
mod memory;
#[cfg(feature = "postgres-backend")]
mod postgres_backend;

use std::fmt;

use serde_json::Value;

pub use error::StorageError;
pub use file_backend::JsonLinesStore;
pub use memory::MemoryStore;
#[cfg(feature = "postgres-backend")]
pub use postgres_backend::PostgresStore;

/// A fixed `database.collection` pair that documents are written into.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    /// Build a namespace from its two parts.
    ///
    /// Both parts must be non-empty and must not contain `.`, `/`, or
    /// whitespace, since backends use them as file names and SQL identifiers.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidNamespace`] if either part is invalid.
    pub fn new(database: &str, collection: &str) -> Result<Self, StorageError> {
        for (what, part) in [("database", database), ("collection", collection)] {
            if part.is_empty() {
                return Err(StorageError::InvalidNamespace {
                    reason: format!("{what} name is empty"),
                });
            }
            if let Some(bad) = part
                .chars()
                .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
            {
                return Err(StorageError::InvalidNamespace {
                    reason: format!("{what} name '{part}' contains invalid character '{bad}'"),
                });
            }
        }
        Ok(Self {
            database: database.to_owned(),
            collection: collection.to_owned(),
        })
    }

    /// The database part.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The collection part.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// A pluggable document store.
///
/// Documents are JSON objects. Writes happen in batches: a batch is either
/// stored in full or not at all. Implementations must be safe to share
/// across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Insert every document in `documents` into `namespace` as one atomic batch.
    ///
    /// Returns the number of documents written. An empty batch is a no-op
    /// that performs no I/O and returns `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the batch could not be stored. On
    /// error, no document from the batch is considered durable.
    async fn insert_many(
        &self,
        namespace: &Namespace,
        documents: &[Value],
    ) -> Result<u64, StorageError>;

    /// Return every document in `namespace`, in insertion order. A namespace
    /// that has never been written reads as empty, not as an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn find_all(&self, namespace: &Namespace) -> Result<Vec<Value>, StorageError>;
}
