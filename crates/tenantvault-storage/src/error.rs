//! Storage error types.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger. Document contents are never included, since they
//! may hold credentials.

/// Errors that can occur during document store operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open or connect to the store.
    #[error("failed to open document store at '{location}': {reason}")]
    Open { location: String, reason: String },

    /// Failed to write a batch of documents.
    #[error("failed to write {count} document(s) to '{namespace}': {reason}")]
    Write {
        namespace: String,
        count: usize,
        reason: String,
    },

    /// Failed to read documents back.
    #[error("failed to read documents from '{namespace}': {reason}")]
    Read { namespace: String, reason: String },

    /// A document could not be encoded or decoded.
    #[error("document serialization failed: {reason}")]
    Serialization { reason: String },

    /// The database or collection name is unusable.
    #[error("invalid namespace: {reason}")]
    InvalidNamespace { reason: String },
}
