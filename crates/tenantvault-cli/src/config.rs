//! Provisioner configuration.
//!
//! Loaded once from environment variables at process start and passed by
//! reference to everything that needs it. [`ProvisionerConfig::from_lookup`]
//! takes any key lookup so tests never touch the process environment.

use std::path::PathBuf;
use std::time::Duration;

use tenantvault_core::atlas::{ApiKeyPair, DEFAULT_BASE_URL};
use tenantvault_core::capacity::DEFAULT_USER_THRESHOLD;
use tenantvault_core::provisioning::parse_whitelist;

const DEFAULT_WHITELIST: &str = "10.8.0.10/32,10.8.0.11/32";
const DEFAULT_TERRAFORM_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAPPING_DB: &str = "atlas_mappings";
const DEFAULT_MAPPING_COLLECTION: &str = "cluster_users";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// One or more required variables are unset or empty.
    #[error("missing required environment variable(s): {}", .vars.join(", "))]
    Missing { vars: Vec<&'static str> },

    /// A variable is set but cannot be parsed.
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Management API access.
#[derive(Debug, Clone)]
pub struct AtlasSettings {
    /// API base URL.
    pub base_url: String,
    /// Public/private key pair.
    pub credentials: ApiKeyPair,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,
    /// Project whose users are counted.
    pub source_project_id: String,
}

/// Terraform invocation.
#[derive(Debug, Clone)]
pub struct TerraformSettings {
    /// Terraform binary.
    pub binary: PathBuf,
    /// Directory holding the Terraform configuration.
    pub working_dir: PathBuf,
    /// Per-invocation timeout; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

/// Mapping store backend.
#[derive(Clone, PartialEq, Eq)]
pub enum MappingStoreType {
    /// In-memory, lost at exit.
    Memory,
    /// JSON-lines files under a root directory.
    File { path: PathBuf },
    /// PostgreSQL.
    Postgres { url: String },
}

impl std::fmt::Debug for MappingStoreType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::File { path } => f.debug_struct("File").field("path", path).finish(),
            Self::Postgres { .. } => f.write_str("Postgres { url: [REDACTED] }"),
        }
    }
}

/// Where credential records are written.
#[derive(Debug, Clone)]
pub struct MappingSettings {
    /// Backend.
    pub store: MappingStoreType,
    /// Database (schema) name.
    pub database: String,
    /// Collection (table) name.
    pub collection: String,
}

/// Field encryption.
#[derive(Clone)]
pub struct EncryptionSettings {
    /// Base64 master key, if configured.
    pub master_key: Option<String>,
    /// Store plaintext passwords when encryption is unavailable.
    pub allow_plaintext_fallback: bool,
}

impl std::fmt::Debug for EncryptionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionSettings")
            .field("master_key", &self.master_key.as_ref().map(|_| "[REDACTED]"))
            .field("allow_plaintext_fallback", &self.allow_plaintext_fallback)
            .finish()
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Human-readable lines.
    Text,
}

/// Logging bootstrap settings.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl LogSettings {
    /// Read `TENANTVAULT_LOG_LEVEL` and `TENANTVAULT_LOG_FORMAT`. Never fails.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup("TENANTVAULT_LOG_LEVEL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "info".to_owned());
        let format = match lookup("TENANTVAULT_LOG_FORMAT").as_deref().map(str::trim) {
            Some("text" | "pretty") => LogFormat::Text,
            _ => LogFormat::Json,
        };
        Self { level, format }
    }
}

/// Full provisioner configuration.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Management API access.
    pub atlas: AtlasSettings,
    /// Organization id.
    pub org_id: String,
    /// Target cloud project.
    pub gcp_project_id: String,
    /// Capacity gate threshold.
    pub user_threshold: u64,
    /// CIDR ranges allowed to reach provisioned clusters.
    pub ip_whitelist: Vec<String>,
    /// Terraform invocation.
    pub terraform: TerraformSettings,
    /// Field encryption.
    pub encryption: EncryptionSettings,
    /// Credential record destination.
    pub mapping: MappingSettings,
}

impl ProvisionerConfig {
    /// Load configuration from the process environment.
    ///
    /// Environment variables:
    /// - `ATLAS_PUBLIC_KEY`, `ATLAS_PRIVATE_KEY`: management API key pair (required)
    /// - `ATLAS_ORG_ID`: organization id (required)
    /// - `ATLAS_SOURCE_PROJECT_ID`: project whose users are counted (required)
    /// - `GCP_PROJECT_ID`: target cloud project (required)
    /// - `ATLAS_API_BASE_URL`: API base (default: public endpoint)
    /// - `ATLAS_HTTP_TIMEOUT_SECS`: per-request timeout (default: `30`)
    /// - `USER_COUNT_THRESHOLD`: capacity threshold (default: `80`)
    /// - `PRIVATE_IP_WHITELIST`: comma-separated CIDRs
    /// - `TERRAFORM_BIN`, `TERRAFORM_DIR`: tool and working directory (default: `terraform`, `.`)
    /// - `TERRAFORM_TIMEOUT_SECS`: per-invocation timeout, `0` for none (default: `1800`)
    /// - `CSFLE_MASTER_KEY`: base64 96-byte master key (generated when unset)
    /// - `ALLOW_PLAINTEXT_FALLBACK`: store plaintext when encryption fails (default: `false`)
    /// - `MAPPING_STORE`: `memory`, `file` or `postgres`
    /// - `MAPPING_DB_CONNECTION_STRING`: PostgreSQL URL
    /// - `MAPPING_STORE_PATH`: file store root (default: `./data`)
    /// - `MAPPING_DB_NAME`, `MAPPING_COLLECTION_NAME`: target namespace
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if required variables are missing or values
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    /// Load configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut env = Env::new(&lookup);

        let public_key = env.required("ATLAS_PUBLIC_KEY");
        let private_key = env.required("ATLAS_PRIVATE_KEY");
        let org_id = env.required("ATLAS_ORG_ID");
        let source_project_id = env.required("ATLAS_SOURCE_PROJECT_ID");
        let gcp_project_id = env.required("GCP_PROJECT_ID");
        env.finish()?;

        let atlas = AtlasSettings {
            base_url: env.optional("ATLAS_API_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()),
            credentials: ApiKeyPair::new(public_key, private_key),
            http_timeout: Duration::from_secs(env.number("ATLAS_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?),
            source_project_id,
        };

        let timeout_secs = env.number("TERRAFORM_TIMEOUT_SECS", DEFAULT_TERRAFORM_TIMEOUT_SECS)?;
        let terraform = TerraformSettings {
            binary: env.optional("TERRAFORM_BIN").map_or_else(|| PathBuf::from("terraform"), PathBuf::from),
            working_dir: env.optional("TERRAFORM_DIR").map_or_else(|| PathBuf::from("."), PathBuf::from),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        };

        Ok(Self {
            atlas,
            org_id,
            gcp_project_id,
            user_threshold: env.number("USER_COUNT_THRESHOLD", DEFAULT_USER_THRESHOLD)?,
            ip_whitelist: parse_whitelist(
                &lookup("PRIVATE_IP_WHITELIST").unwrap_or_else(|| DEFAULT_WHITELIST.to_owned()),
            ),
            terraform,
            encryption: EncryptionSettings::from_lookup(&lookup)?,
            mapping: MappingSettings::from_lookup(&lookup)?,
        })
    }
}

impl AtlasSettings {
    /// Load only what the management API client needs.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the key pair or source project is missing,
    /// or the timeout cannot be parsed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut env = Env::new(&lookup);
        let public_key = env.required("ATLAS_PUBLIC_KEY");
        let private_key = env.required("ATLAS_PRIVATE_KEY");
        let source_project_id = env.required("ATLAS_SOURCE_PROJECT_ID");
        env.finish()?;
        Ok(Self {
            base_url: env.optional("ATLAS_API_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()),
            credentials: ApiKeyPair::new(public_key, private_key),
            http_timeout: Duration::from_secs(env.number("ATLAS_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?),
            source_project_id,
        })
    }
}

impl EncryptionSettings {
    /// Load the master key and fallback policy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `ALLOW_PLAINTEXT_FALLBACK` is not a boolean.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env::new(&lookup);
        Ok(Self {
            master_key: env.optional("CSFLE_MASTER_KEY"),
            allow_plaintext_fallback: env.flag("ALLOW_PLAINTEXT_FALLBACK", false)?,
        })
    }
}

impl MappingSettings {
    /// Load the mapping store selection and namespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an unknown store type, or `postgres`
    /// without a connection string.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env::new(&lookup);
        let url = env.optional("MAPPING_DB_CONNECTION_STRING");
        let path = env
            .optional("MAPPING_STORE_PATH")
            .map_or_else(|| PathBuf::from("./data"), PathBuf::from);

        let kind = env.optional("MAPPING_STORE").map(|v| v.to_lowercase());
        let store = match (kind.as_deref(), url) {
            (Some("memory"), _) => MappingStoreType::Memory,
            (Some("file"), _) | (None, None) => MappingStoreType::File { path },
            (Some("postgres" | "postgresql") | None, Some(url)) => MappingStoreType::Postgres { url },
            (Some("postgres" | "postgresql"), None) => {
                return Err(ConfigError::Missing {
                    vars: vec!["MAPPING_DB_CONNECTION_STRING"],
                });
            }
            (Some(other), _) => {
                return Err(ConfigError::Invalid {
                    var: "MAPPING_STORE",
                    reason: format!("unknown store '{other}', expected memory, file or postgres"),
                });
            }
        };

        Ok(Self {
            store,
            database: env
                .optional("MAPPING_DB_NAME")
                .unwrap_or_else(|| DEFAULT_MAPPING_DB.to_owned()),
            collection: env
                .optional("MAPPING_COLLECTION_NAME")
                .unwrap_or_else(|| DEFAULT_MAPPING_COLLECTION.to_owned()),
        })
    }
}

/// Read a variable from the process environment.
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Lookup wrapper that collects every missing required variable.
struct Env<'a, F> {
    lookup: &'a F,
    missing: Vec<&'static str>,
}

impl<'a, F: Fn(&str) -> Option<String>> Env<'a, F> {
    fn new(lookup: &'a F) -> Self {
        Self {
            lookup,
            missing: Vec::new(),
        }
    }

    /// Trimmed value, `None` when unset or blank.
    fn optional(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    }

    fn required(&mut self, var: &'static str) -> String {
        self.optional(var).unwrap_or_else(|| {
            self.missing.push(var);
            String::new()
        })
    }

    fn finish(&mut self) -> Result<(), ConfigError> {
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Missing {
                vars: std::mem::take(&mut self.missing),
            })
        }
    }

    fn number(&self, var: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.optional(var) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|e| ConfigError::Invalid {
                var,
                reason: format!("'{v}' is not a non-negative integer: {e}"),
            }),
        }
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(var).map(|v| v.to_lowercase()).as_deref() {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::Invalid {
                var,
                reason: format!("'{other}' is not a boolean"),
            }),
        }
    }
}
