//! JSON-lines document store.
//!
//! Each namespace maps to `<root>/<database>/<collection>.jsonl`. A batch is
//! serialized up front and appended with a single write. If the write or
//! flush fails the file is truncated back to its previous length, so a batch
//! is never left half-written.
//!
//! # Thread safety
//!
//! A `tokio::sync::Mutex` serializes writers within a process. Concurrent
//! processes writing the same root are not supported.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::{DocumentStore, Namespace, StorageError};

/// Append-only document store writing JSON-lines files.
pub struct JsonLinesStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesStore {
    /// Create a store rooted at `root`.
    ///
    /// Directories and files are created lazily on the first write.
    #[must_use]
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn file_for(&self, namespace: &Namespace) -> PathBuf {
        self.root
            .join(namespace.database())
            .join(format!("{}.jsonl", namespace.collection()))
    }
}

#[async_trait::async_trait]
impl DocumentStore for JsonLinesStore {
    async fn insert_many(
        &self,
        namespace: &Namespace,
        documents: &[Value],
    ) -> Result<u64, StorageError> {
        if documents.is_empty() {
            return Ok(0);
        }

        let write_err = |reason: String| StorageError::Write {
            namespace: namespace.to_string(),
            count: documents.len(),
            reason,
        };

        let mut buf = Vec::new();
        for doc in documents {
            serde_json::to_writer(&mut buf, doc).map_err(|e| StorageError::Serialization {
                reason: e.to_string(),
            })?;
            buf.push(b'\n');
        }

        let path = self.file_for(namespace);
        let _guard = self.write_lock.lock().await;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| write_err(format!("failed to create '{}': {e}", dir.display())))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| write_err(format!("failed to open '{}': {e}", path.display())))?;

        let previous_len = file
            .metadata()
            .await
            .map_err(|e| write_err(format!("failed to stat '{}': {e}", path.display())))?
            .len();

        let written = async {
            file.write_all(&buf).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        if let Err(e) = written {
            if let Err(rollback) = file.set_len(previous_len).await {
                tracing::error!(
                    path = %path.display(),
                    error = %rollback,
                    "failed to roll back partial batch"
                );
            }
            return Err(write_err(format!("write failed: {e}")));
        }

        tracing::debug!(
            namespace = %namespace,
            count = documents.len(),
            path = %path.display(),
            "appended document batch"
        );
        Ok(documents.len() as u64)
    }

    async fn find_all(&self, namespace: &Namespace) -> Result<Vec<Value>, StorageError> {
        let path = self.file_for(namespace);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::Read {
                    namespace: namespace.to_string(),
                    reason: format!("failed to read '{}': {e}", path.display()),
                });
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| StorageError::Read {
                    namespace: namespace.to_string(),
                    reason: format!("line {}: {e}", i.saturating_add(1)),
                })
            })
            .collect()
    }
}

impl std::fmt::Debug for JsonLinesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
