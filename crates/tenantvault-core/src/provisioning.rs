//! Provisioning through Terraform.
//!
//! Provisioning is a two-step protocol against the infrastructure tool:
//!
//! 1. `apply` converges real infrastructure to the requested mode. Only a
//!    successful apply yields an [`ApplyReceipt`].
//! 2. `fetch_output` requires that receipt, so outputs can never be read
//!    without a successful apply first.
//!
//! The receipt carries the `create_new` flag forward, and
//! [`parse_output`] uses it to select the expected output shape rather than
//! guessing from which keys happen to be present.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::atlas::ApiKeyPair;
use crate::error::ProvisioningError;

/// Raw `terraform output -json` document: output name to `{ "value": ... }`.
pub type RawOutput = Map<String, Value>;

/// Output key holding the new project's connection string.
pub const NEW_PROJECT_CONNECTION_STRING: &str = "new_project_connection_string";
/// Output key holding the new project's users.
pub const NEW_PROJECT_USERS: &str = "new_project_users";
/// Output key holding the single reused-project user.
pub const SINGLE_USER_DETAILS: &str = "single_user_details";

/// Parse a comma-separated CIDR whitelist, trimming entries and dropping empty ones.
#[must_use]
pub fn parse_whitelist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Fixed provisioning target for every run of one deployment.
#[derive(Debug, Clone)]
pub struct ProvisioningTarget {
    /// Management API key pair passed to the tool.
    pub credentials: ApiKeyPair,
    /// Organization identifier.
    pub org_id: String,
    /// Project whose users are counted and which is reused below the threshold.
    pub source_project_id: String,
    /// Target cloud project.
    pub gcp_project_id: String,
    /// CIDR ranges allowed to reach the cluster.
    pub ip_whitelist: Vec<String>,
}

/// The full, validated input of one apply.
#[derive(Debug, Clone)]
pub struct ProvisioningParameters {
    credentials: ApiKeyPair,
    org_id: String,
    source_project_id: String,
    gcp_project_id: String,
    create_new: bool,
    ip_whitelist: Vec<String>,
}

impl ProvisioningParameters {
    /// Validate `target` and bind it to a provisioning mode.
    ///
    /// Whitelist entries are trimmed and empty entries dropped; the
    /// whitelist itself may end up empty.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::InvalidParameters`] naming every empty
    /// required field.
    pub fn new(target: &ProvisioningTarget, create_new: bool) -> Result<Self, ProvisioningError> {
        let required = [
            ("public key", target.credentials.public_key()),
            ("private key", target.credentials.private_key()),
            ("organization id", target.org_id.as_str()),
            ("source project id", target.source_project_id.as_str()),
            ("cloud project id", target.gcp_project_id.as_str()),
        ];
        let empty: Vec<&str> = required
            .iter()
            .filter(|(_, v)| v.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if !empty.is_empty() {
            return Err(ProvisioningError::InvalidParameters {
                reason: format!("empty: {}", empty.join(", ")),
            });
        }

        Ok(Self {
            credentials: ApiKeyPair::new(
                target.credentials.public_key().trim(),
                target.credentials.private_key().trim(),
            ),
            org_id: target.org_id.trim().to_owned(),
            source_project_id: target.source_project_id.trim().to_owned(),
            gcp_project_id: target.gcp_project_id.trim().to_owned(),
            create_new,
            ip_whitelist: target
                .ip_whitelist
                .iter()
                .map(|ip| ip.trim())
                .filter(|ip| !ip.is_empty())
                .map(str::to_owned)
                .collect(),
        })
    }

    /// The provisioning mode.
    #[must_use]
    pub fn create_new(&self) -> bool {
        self.create_new
    }

    /// The normalized whitelist.
    #[must_use]
    pub fn ip_whitelist(&self) -> &[String] {
        &self.ip_whitelist
    }

    /// Tool variables as `(name, value)` pairs, in a fixed order.
    fn variables(&self) -> Result<Vec<(&'static str, String)>, ProvisioningError> {
        let whitelist = serde_json::to_string(&self.ip_whitelist).map_err(|e| {
            ProvisioningError::InvalidParameters {
                reason: format!("whitelist is not encodable: {e}"),
            }
        })?;
        Ok(vec![
            ("atlas_public_key", self.credentials.public_key().to_owned()),
            ("atlas_private_key", self.credentials.private_key().to_owned()),
            ("atlas_org_id", self.org_id.clone()),
            ("source_project_id", self.source_project_id.clone()),
            ("gcp_project_id", self.gcp_project_id.clone()),
            ("create_new_project", self.create_new.to_string()),
            ("private_ip_whitelist", whitelist),
        ])
    }

    /// `-var=name=value` arguments for the tool.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::InvalidParameters`] if the whitelist
    /// cannot be JSON-encoded.
    pub fn var_args(&self) -> Result<Vec<String>, ProvisioningError> {
        Ok(self
            .variables()?
            .into_iter()
            .map(|(name, value)| format!("-var={name}={value}"))
            .collect())
    }

    /// Same as [`var_args`](Self::var_args) with the private key masked, for logs.
    fn redacted_var_args(&self) -> Result<Vec<String>, ProvisioningError> {
        Ok(self
            .variables()?
            .into_iter()
            .map(|(name, value)| {
                if name == "atlas_private_key" {
                    format!("-var={name}=[REDACTED]")
                } else {
                    format!("-var={name}={value}")
                }
            })
            .collect())
    }
}

/// Resource counts from the tool's `change_summary` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct ChangeSummary {
    /// Resources created.
    pub add: u64,
    /// Resources updated in place.
    pub change: u64,
    /// Resources destroyed.
    pub remove: u64,
}

/// Proof that an apply completed successfully.
///
/// Only obtainable from a successful [`ProvisioningTool::apply`].
#[derive(Debug, Clone)]
pub struct ApplyReceipt {
    create_new: bool,
    changes: Option<ChangeSummary>,
}

impl ApplyReceipt {
    pub(crate) fn new(create_new: bool, changes: Option<ChangeSummary>) -> Self {
        Self {
            create_new,
            changes,
        }
    }

    /// The mode the apply ran in.
    #[must_use]
    pub fn create_new(&self) -> bool {
        self.create_new
    }

    /// Change counts reported by the apply, if it reported any.
    #[must_use]
    pub fn changes(&self) -> Option<ChangeSummary> {
        self.changes
    }
}

/// The infrastructure tool seam.
#[async_trait::async_trait]
pub trait ProvisioningTool: Send + Sync {
    /// Converge infrastructure to `params`. Blocks until the tool exits.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Invocation`] with the tool's full stdout
    /// and stderr on a non-zero exit. No partial recovery is attempted.
    async fn apply(&self, params: &ProvisioningParameters) -> Result<ApplyReceipt, ProvisioningError>;

    /// Read the declared outputs after a successful apply.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisioningError::Invocation`] on a non-zero exit, or
    /// [`ProvisioningError::MalformedOutput`] if stdout is not a JSON object.
    async fn fetch_output(&self, receipt: &ApplyReceipt) -> Result<RawOutput, ProvisioningError>;
}

/// Drives a Terraform working directory.
#[derive(Debug, Clone)]
pub struct Terraform {
    binary: PathBuf,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl Terraform {
    /// Create a driver for the configuration in `working_dir`.
    ///
    /// `timeout` bounds each invocation; `None` waits indefinitely.
    #[must_use]
    pub fn new(
        binary: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            binary: binary.into(),
            working_dir: working_dir.into(),
            timeout,
        }
    }

    async fn invoke(&self, action: &str, args: &[String]) -> Result<String, ProvisioningError> {
        let program = self.binary.display().to_string();
        let child = tokio::process::Command::new(&self.binary)
            .args(args)
            .current_dir(&self.working_dir)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvisioningError::Spawn {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        let waited = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ProvisioningError::Timeout {
                    action: action.to_owned(),
                    limit,
                })?,
            None => child.wait_with_output().await,
        };
        let output = waited.map_err(|e| ProvisioningError::Spawn {
            program,
            reason: format!("failed to wait for '{action}': {e}"),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(ProvisioningError::Invocation {
                action: action.to_owned(),
                exit_code: output.status.code(),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(stdout)
    }
}

#[async_trait::async_trait]
impl ProvisioningTool for Terraform {
    async fn apply(&self, params: &ProvisioningParameters) -> Result<ApplyReceipt, ProvisioningError> {
        let mut args: Vec<String> = ["apply", "-auto-approve", "-input=false", "-json"]
            .into_iter()
            .map(str::to_owned)
            .collect();
        args.extend(params.var_args()?);

        info!(
            create_new = params.create_new(),
            whitelist_entries = params.ip_whitelist().len(),
            working_dir = %self.working_dir.display(),
            "running terraform apply"
        );
        debug!(args = ?params.redacted_var_args()?, "terraform apply variables");

        let stdout = self.invoke("terraform apply", &args).await?;
        let changes = last_change_summary(&stdout);
        if let Some(c) = changes {
            info!(add = c.add, change = c.change, remove = c.remove, "terraform apply complete");
        } else {
            info!("terraform apply complete");
        }
        Ok(ApplyReceipt::new(params.create_new(), changes))
    }

    async fn fetch_output(&self, receipt: &ApplyReceipt) -> Result<RawOutput, ProvisioningError> {
        debug!(create_new = receipt.create_new(), "reading terraform outputs");
        let args = ["output".to_owned(), "-json".to_owned()];
        let stdout = self.invoke("terraform output", &args).await?;
        match serde_json::from_str::<Value>(&stdout) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(ProvisioningError::MalformedOutput {
                field: "<document>".to_owned(),
                reason: format!("expected a JSON object, got {}", json_type(&other)),
            }),
            Err(e) => Err(ProvisioningError::MalformedOutput {
                field: "<document>".to_owned(),
                reason: format!("not valid JSON: {e}"),
            }),
        }
    }
}

/// Find the last `change_summary` event in a `-json` apply stream.
fn last_change_summary(stream: &str) -> Option<ChangeSummary> {
    #[derive(Deserialize)]
    struct Event {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        changes: Option<ChangeSummary>,
    }

    stream
        .lines()
        .filter_map(|line| serde_json::from_str::<Event>(line).ok())
        .filter(|e| e.kind == "change_summary")
        .filter_map(|e| e.changes)
        .last()
}

/// A provisioned database user.
#[derive(Clone, PartialEq, Eq)]
pub struct ProvisionedUser {
    /// Database username.
    pub username: String,
    /// Database password in plaintext.
    pub password: String,
}

impl fmt::Debug for ProvisionedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionedUser")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Structured provisioning outcome, one variant per mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningResult {
    /// A new project and cluster were created with these users.
    NewProject {
        /// Connection string shared by all users.
        connection_string: String,
        /// Users created in the new project.
        users: Vec<ProvisionedUser>,
    },
    /// One user was added to the existing project.
    ExistingProject {
        /// Connection string of the existing cluster.
        connection_string: String,
        /// The user created.
        user: ProvisionedUser,
    },
}

/// Extract the result for the given mode from raw tool outputs.
///
/// # Errors
///
/// Returns [`ProvisioningError::MalformedOutput`] naming the first missing or
/// mistyped field, e.g. `new_project_users[1].password`.
pub fn parse_output(raw: &RawOutput, create_new: bool) -> Result<ProvisioningResult, ProvisioningError> {
    if create_new {
        let connection_string =
            as_string(output_value(raw, NEW_PROJECT_CONNECTION_STRING)?, NEW_PROJECT_CONNECTION_STRING)?;
        let users = output_value(raw, NEW_PROJECT_USERS)?
            .as_array()
            .ok_or_else(|| malformed(NEW_PROJECT_USERS, "expected a list of users"))?
            .iter()
            .enumerate()
            .map(|(i, entry)| parse_user(entry, &format!("{NEW_PROJECT_USERS}[{i}]")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProvisioningResult::NewProject {
            connection_string,
            users,
        })
    } else {
        let details = output_value(raw, SINGLE_USER_DETAILS)?;
        let connection_string = as_string(
            field(details, "connection_string", SINGLE_USER_DETAILS)?,
            &format!("{SINGLE_USER_DETAILS}.connection_string"),
        )?;
        let user = parse_user(details, SINGLE_USER_DETAILS)?;
        Ok(ProvisioningResult::ExistingProject {
            connection_string,
            user,
        })
    }
}

/// `raw[key].value`.
fn output_value<'a>(raw: &'a RawOutput, key: &str) -> Result<&'a Value, ProvisioningError> {
    let wrapper = raw
        .get(key)
        .ok_or_else(|| malformed(key, "output is missing"))?;
    wrapper
        .get("value")
        .ok_or_else(|| malformed(&format!("{key}.value"), "output has no value"))
}

fn field<'a>(obj: &'a Value, name: &str, path: &str) -> Result<&'a Value, ProvisioningError> {
    if !obj.is_object() {
        return Err(malformed(path, &format!("expected an object, got {}", json_type(obj))));
    }
    obj.get(name)
        .ok_or_else(|| malformed(&format!("{path}.{name}"), "field is missing"))
}

fn as_string(value: &Value, path: &str) -> Result<String, ProvisioningError> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| malformed(path, &format!("expected a string, got {}", json_type(value))))
}

fn parse_user(entry: &Value, path: &str) -> Result<ProvisionedUser, ProvisioningError> {
    Ok(ProvisionedUser {
        username: as_string(field(entry, "username", path)?, &format!("{path}.username"))?,
        password: as_string(field(entry, "password", path)?, &format!("{path}.password"))?,
    })
}

fn malformed(field: &str, reason: &str) -> ProvisioningError {
    ProvisioningError::MalformedOutput {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Runs the two-step protocol and parses the result.
pub struct ProvisioningInvoker {
    tool: Arc<dyn ProvisioningTool>,
}

impl ProvisioningInvoker {
    /// Create an invoker over `tool`.
    #[must_use]
    pub fn new(tool: Arc<dyn ProvisioningTool>) -> Self {
        Self { tool }
    }

    /// Apply, then (only on success) fetch and parse outputs.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProvisioningError`] from apply, output retrieval,
    /// or parsing.
    pub async fn provision(
        &self,
        params: &ProvisioningParameters,
    ) -> Result<(ApplyReceipt, ProvisioningResult), ProvisioningError> {
        let receipt = self.tool.apply(params).await?;
        let raw = self.tool.fetch_output(&receipt).await?;
        let result = parse_output(&raw, receipt.create_new())?;
        Ok((receipt, result))
    }
}

impl fmt::Debug for ProvisioningInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningInvoker").finish_non_exhaustive()
    }
}
