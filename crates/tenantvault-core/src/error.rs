//! Error types for `tenantvault-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Errors never include key material, API private keys, or
//! provisioned passwords, only identifiers and operation descriptions.

use std::time::Duration;

use tenantvault_storage::StorageError;

/// Errors from the encryption vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The master key could not be decoded or has the wrong length.
    #[error("invalid master key material: {reason}")]
    KeyMaterial { reason: String },

    /// Key derivation from the master key failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// The AEAD transform failed while encrypting a field.
    #[error("field encryption failed: {reason}")]
    Encryption { reason: String },

    /// The AEAD transform rejected a ciphertext (wrong key or tampered data).
    #[error("field decryption failed: {reason}")]
    Decryption { reason: String },

    /// The ciphertext envelope is truncated or carries an unknown header.
    #[error("malformed ciphertext: {reason}")]
    MalformedCiphertext { reason: String },
}

/// Errors from the management API client.
#[derive(Debug, thiserror::Error)]
pub enum AtlasError {
    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {reason}")]
    Client { reason: String },

    /// The request could not be sent or the response could not be read.
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    /// The API rejected the key pair or the digest challenge could not be answered.
    #[error("authentication against {url} failed: {reason}")]
    Unauthorized { url: String, reason: String },

    /// The API answered with a non-success status.
    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    /// The response body was not the expected JSON shape.
    #[error("unexpected response from {url}: {reason}")]
    Parse { url: String, reason: String },
}

/// Errors from the capacity gate.
#[derive(Debug, thiserror::Error)]
pub enum CapacityError {
    /// The management API query for the user count failed.
    #[error("user count query for project '{project_id}' failed: {source}")]
    Query {
        project_id: String,
        #[source]
        source: AtlasError,
    },

    /// A user directory other than the management API failed.
    #[error("user directory for project '{project_id}' failed: {reason}")]
    Directory { project_id: String, reason: String },
}

/// Errors from driving the infrastructure tool.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    /// A required parameter is empty.
    #[error("invalid provisioning parameters: {reason}")]
    InvalidParameters { reason: String },

    /// The tool binary could not be started.
    #[error("failed to start '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// The tool did not finish within the configured timeout.
    #[error("'{action}' did not finish within {limit:?} and was killed")]
    Timeout { action: String, limit: Duration },

    /// The tool exited unsuccessfully.
    #[error(
        "'{action}' exited with {}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}",
        describe_exit(.exit_code)
    )]
    Invocation {
        action: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// An expected output key is missing or has the wrong shape.
    #[error("malformed tool output at '{field}': {reason}")]
    MalformedOutput { field: String, reason: String },
}

#[allow(clippy::ref_option)]
fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(
        || "no exit code (killed by signal)".to_owned(),
        |c| format!("code {c}"),
    )
}

/// Errors from the credential recorder.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    /// A password could not be encrypted and plaintext storage is not allowed.
    #[error("refusing to store plaintext password for user '{username}': {source}")]
    Encryption {
        username: String,
        #[source]
        source: VaultError,
    },

    /// No encryption context is available and plaintext storage is not allowed.
    #[error("no encryption context available and plaintext fallback is disabled")]
    VaultUnavailable,

    /// A stored document does not have the credential record shape.
    #[error("stored credential record is malformed: {reason}")]
    Serialization { reason: String },

    /// The batch write failed; no record from the batch is durable.
    #[error("credential batch was not persisted: {0}")]
    Persistence(#[from] StorageError),
}

/// Errors from the provisioning pipeline, tagged by the stage that failed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The encryption context could not be built from the master key.
    #[error("encryption setup failed: {0}")]
    KeyMaterial(#[source] VaultError),

    /// The capacity query failed.
    #[error("capacity check failed: {0}")]
    Capacity(#[from] CapacityError),

    /// The infrastructure tool failed or produced unusable output.
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// The credential batch could not be encrypted or persisted.
    #[error("recording credentials failed: {0}")]
    Recording(#[from] RecorderError),
}

impl PipelineError {
    /// Short name of the stage that failed, for operator diagnostics.
    #[must_use]
    pub fn stage(&self) -> &'static str {
        match self {
            Self::KeyMaterial(_) => "encryption-setup",
            Self::Capacity(_) => "capacity-check",
            Self::Provisioning(_) => "provisioning",
            Self::Recording(_) => "recording",
        }
    }
}
