//! Credential recorder.
//!
//! Turns a [`ProvisioningResult`] into [`CredentialRecord`]s, encrypts each
//! password with the run's [`EncryptionContext`], and writes the whole batch
//! with a single [`DocumentStore::insert_many`] call.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tenantvault_storage::{DocumentStore, Namespace};
use tracing::{info, warn};

use crate::error::{RecorderError, VaultError};
use crate::provisioning::{ProvisionedUser, ProvisioningResult};
use crate::vault::{EncryptedValue, EncryptionContext};

/// A password as it is held in a record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredPassword {
    /// Deterministically encrypted.
    Encrypted(EncryptedValue),
    /// Plaintext. Only persisted under [`PlaintextFallback::Allow`] or when empty.
    Plain(String),
}

impl StoredPassword {
    /// Whether this password is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }
}

impl fmt::Debug for StoredPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encrypted(v) => f.debug_tuple("Encrypted").field(v).finish(),
            Self::Plain(_) => f.write_str("Plain([REDACTED])"),
        }
    }
}

/// One provisioned user's credentials, as stored in the mapping collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Cluster connection string.
    #[serde(rename = "cluster_connection_string")]
    pub connection_string: String,
    /// Database username.
    pub username: String,
    /// Database password, encrypted before persistence.
    pub password: StoredPassword,
    /// When the record was built.
    pub created_at: DateTime<Utc>,
}

impl CredentialRecord {
    fn from_user(connection_string: &str, user: ProvisionedUser, created_at: DateTime<Utc>) -> Self {
        Self {
            connection_string: connection_string.to_owned(),
            username: user.username,
            password: StoredPassword::Plain(user.password),
            created_at,
        }
    }

    /// Decrypt the stored password.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError`] if the ciphertext does not authenticate under
    /// `ctx`'s master key.
    pub fn reveal_password(&self, ctx: &EncryptionContext) -> Result<String, VaultError> {
        match &self.password {
            StoredPassword::Encrypted(value) => ctx.decrypt(value),
            StoredPassword::Plain(p) => Ok(p.clone()),
        }
    }
}

/// Build one record per provisioned user, all stamped with the same time.
///
/// A new-project result yields one record per user sharing the project's
/// connection string. An existing-project result yields exactly one.
#[must_use]
pub fn build_records(result: ProvisioningResult) -> Vec<CredentialRecord> {
    let now = Utc::now();
    match result {
        ProvisioningResult::NewProject {
            connection_string,
            users,
        } => users
            .into_iter()
            .map(|u| CredentialRecord::from_user(&connection_string, u, now))
            .collect(),
        ProvisioningResult::ExistingProject {
            connection_string,
            user,
        } => vec![CredentialRecord::from_user(&connection_string, user, now)],
    }
}

/// What to do when a password cannot be encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaintextFallback {
    /// Fail the batch. Nothing is written.
    #[default]
    Refuse,
    /// Store the plaintext and log a warning.
    Allow,
}

impl PlaintextFallback {
    /// Map an operator flag to a policy.
    #[must_use]
    pub fn from_flag(allow: bool) -> Self {
        if allow { Self::Allow } else { Self::Refuse }
    }
}

/// Outcome of a persisted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchReport {
    /// Records written.
    pub inserted: u64,
    /// Passwords stored encrypted.
    pub encrypted: u64,
    /// Non-empty passwords stored in plaintext under the fallback policy.
    pub plaintext: u64,
}

/// Encrypts and persists credential batches.
pub struct CredentialRecorder {
    store: Arc<dyn DocumentStore>,
    namespace: Namespace,
    fallback: PlaintextFallback,
}

impl CredentialRecorder {
    /// Create a recorder writing into `namespace`.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>, namespace: Namespace, fallback: PlaintextFallback) -> Self {
        Self {
            store,
            namespace,
            fallback,
        }
    }

    /// The target namespace.
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The plaintext fallback policy.
    #[must_use]
    pub fn fallback(&self) -> PlaintextFallback {
        self.fallback
    }

    /// Encrypt every non-empty password and write the batch in one insert.
    ///
    /// An empty batch performs no I/O. `ctx` is `None` when the run has no
    /// usable encryption context.
    ///
    /// # Errors
    ///
    /// - [`RecorderError::VaultUnavailable`] or [`RecorderError::Encryption`]
    ///   when a password cannot be encrypted and the fallback is
    ///   [`PlaintextFallback::Refuse`]. Nothing is written.
    /// - [`RecorderError::Serialization`] if a record cannot be encoded.
    /// - [`RecorderError::Persistence`] if the batch write fails; no record
    ///   from the batch is durable.
    pub async fn persist(
        &self,
        mut records: Vec<CredentialRecord>,
        ctx: Option<&EncryptionContext>,
    ) -> Result<BatchReport, RecorderError> {
        if records.is_empty() {
            return Ok(BatchReport::default());
        }

        let mut report = BatchReport::default();
        for record in &mut records {
            let StoredPassword::Plain(password) = &record.password else {
                report.encrypted += 1;
                continue;
            };
            if password.is_empty() {
                continue;
            }

            let sealed = match ctx {
                Some(ctx) => ctx.encrypt(password).map_err(|source| RecorderError::Encryption {
                    username: record.username.clone(),
                    source,
                }),
                None => Err(RecorderError::VaultUnavailable),
            };
            match (sealed, self.fallback) {
                (Ok(value), _) => {
                    record.password = StoredPassword::Encrypted(value);
                    report.encrypted += 1;
                }
                (Err(e), PlaintextFallback::Allow) => {
                    warn!(
                        username = %record.username,
                        error = %e,
                        "storing password in plaintext under fallback policy"
                    );
                    report.plaintext += 1;
                }
                (Err(e), PlaintextFallback::Refuse) => return Err(e),
            }
        }

        let documents = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RecorderError::Serialization {
                reason: e.to_string(),
            })?;

        report.inserted = self.store.insert_many(&self.namespace, &documents).await?;
        info!(
            namespace = %self.namespace,
            inserted = report.inserted,
            encrypted = report.encrypted,
            plaintext = report.plaintext,
            "credential batch persisted"
        );
        Ok(report)
    }

    /// Read every record in the namespace, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`RecorderError::Persistence`] if the store cannot be read, or
    /// [`RecorderError::Serialization`] if a document is not a credential record.
    pub async fn load(&self) -> Result<Vec<CredentialRecord>, RecorderError> {
        self.store
            .find_all(&self.namespace)
            .await?
            .into_iter()
            .map(|doc| {
                serde_json::from_value(doc).map_err(|e| RecorderError::Serialization {
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

impl fmt::Debug for CredentialRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecorder")
            .field("namespace", &self.namespace)
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tenantvault_storage::MemoryStore;

    use super::*;
    use crate::vault::MasterKey;

    fn user(name: &str, password: &str) -> ProvisionedUser {
        ProvisionedUser {
            username: name.to_owned(),
            password: password.to_owned(),
        }
    }

    fn namespace() -> Namespace {
        Namespace::new("atlas_mappings", "cluster_users").unwrap()
    }

    fn context() -> EncryptionContext {
        EncryptionContext::from_master_key(&MasterKey::generate()).unwrap()
    }

    fn recorder(store: &MemoryStore, fallback: PlaintextFallback) -> CredentialRecorder {
        CredentialRecorder::new(Arc::new(store.clone()), namespace(), fallback)
    }

    #[test]
    fn new_project_yields_record_per_user_with_shared_connection_string() {
        let records = build_records(ProvisioningResult::NewProject {
            connection_string: "mongodb+srv://new".to_owned(),
            users: vec![user("a", "1"), user("b", "2"), user("c", "3")],
        });
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.connection_string == "mongodb+srv://new"));
        assert!(records.iter().all(|r| r.created_at == records[0].created_at));
        assert_eq!(records[1].username, "b");
    }

    #[test]
    fn existing_project_yields_one_record() {
        let records = build_records(ProvisioningResult::ExistingProject {
            connection_string: "mongodb+srv://shared".to_owned(),
            user: user("solo", "pw"),
        });
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].password, StoredPassword::Plain("pw".to_owned()));
    }

    #[test]
    fn new_project_without_users_yields_nothing() {
        let records = build_records(ProvisioningResult::NewProject {
            connection_string: "c".to_owned(),
            users: Vec::new(),
        });
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn empty_batch_performs_no_writes() {
        let store = MemoryStore::new();
        let report = recorder(&store, PlaintextFallback::Refuse)
            .persist(Vec::new(), None)
            .await
            .unwrap();
        assert_eq!(report, BatchReport::default());
        assert_eq!(store.batch_count(), 0);
    }

    #[tokio::test]
    async fn passwords_are_encrypted_before_write() {
        let store = MemoryStore::new();
        let rec = recorder(&store, PlaintextFallback::Refuse);
        let ctx = context();
        let records = build_records(ProvisioningResult::NewProject {
            connection_string: "c".to_owned(),
            users: vec![user("a", "secret-a"), user("b", "secret-b")],
        });

        let report = rec.persist(records, Some(&ctx)).await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.encrypted, 2);
        assert_eq!(store.batch_count(), 1);

        let raw = store.find_all(&namespace()).await.unwrap();
        let text = serde_json::to_string(&raw).unwrap();
        assert!(!text.contains("secret-a"));
        assert!(text.contains("\"subType\":\"06\""));
        assert!(text.contains("cluster_connection_string"));

        let loaded = rec.load().await.unwrap();
        assert!(loaded.iter().all(|r| r.password.is_encrypted()));
        assert_eq!(loaded[0].reveal_password(&ctx).unwrap(), "secret-a");
        assert_eq!(loaded[1].reveal_password(&ctx).unwrap(), "secret-b");
    }

    #[tokio::test]
    async fn empty_password_is_not_encrypted() {
        let store = MemoryStore::new();
        let records = build_records(ProvisioningResult::ExistingProject {
            connection_string: "c".to_owned(),
            user: user("a", ""),
        });
        let report = recorder(&store, PlaintextFallback::Refuse)
            .persist(records, Some(&context()))
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.encrypted, 0);
        assert_eq!(report.plaintext, 0);
    }

    #[tokio::test]
    async fn missing_vault_is_refused_by_default() {
        let store = MemoryStore::new();
        let records = build_records(ProvisioningResult::ExistingProject {
            connection_string: "c".to_owned(),
            user: user("a", "pw"),
        });
        let err = recorder(&store, PlaintextFallback::Refuse)
            .persist(records, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RecorderError::VaultUnavailable));
        assert_eq!(store.batch_count(), 0);
    }

    #[tokio::test]
    async fn missing_vault_stores_plaintext_when_allowed() {
        let store = MemoryStore::new();
        let rec = recorder(&store, PlaintextFallback::Allow);
        let records = build_records(ProvisioningResult::ExistingProject {
            connection_string: "c".to_owned(),
            user: user("a", "pw"),
        });
        let report = rec.persist(records, None).await.unwrap();
        assert_eq!(report.plaintext, 1);
        let loaded = rec.load().await.unwrap();
        assert_eq!(loaded[0].password, StoredPassword::Plain("pw".to_owned()));
    }

    #[tokio::test]
    async fn load_rejects_foreign_documents() {
        let store = MemoryStore::new();
        store
            .insert_many(&namespace(), &[serde_json::json!({"unrelated": true})])
            .await
            .unwrap();
        let err = recorder(&store, PlaintextFallback::Refuse).load().await.unwrap_err();
        assert!(matches!(err, RecorderError::Serialization { .. }));
    }

    #[test]
    fn plaintext_is_redacted_in_debug() {
        let debug = format!("{:?}", StoredPassword::Plain("hunter2".to_owned()));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn fallback_from_flag() {
        assert_eq!(PlaintextFallback::from_flag(true), PlaintextFallback::Allow);
        assert_eq!(PlaintextFallback::from_flag(false), PlaintextFallback::Refuse);
        assert_eq!(PlaintextFallback::default(), PlaintextFallback::Refuse);
    }
}
