//! Management API client.
//!
//! A thin `reqwest` client for the two management API calls this crate
//! needs: listing a project's database users (for the capacity gate) and
//! patching a cluster's size. Every request is authenticated with HTTP
//! digest auth using the organization's public/private API key pair: the
//! request is sent once, and if the API answers `401` with a digest
//! challenge it is re-sent with an `Authorization` header answering it.

use std::fmt;
use std::time::Duration;

use digest_auth::{AuthContext, HttpMethod};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capacity::UserDirectory;
use crate::error::{AtlasError, CapacityError};

/// Default management API base URL.
pub const DEFAULT_BASE_URL: &str = "https://cloud.mongodb.com/api/atlas/v1.0";

/// Maximum number of response body characters carried in an error.
const MAX_ERROR_BODY: usize = 2_000;

/// A public/private API key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKeyPair {
    public_key: String,
    private_key: String,
}

impl ApiKeyPair {
    /// Create a key pair.
    #[must_use]
    pub fn new(public_key: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            private_key: private_key.into(),
        }
    }

    /// The public half, safe to log.
    #[must_use]
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// The private half. Never log this.
    #[must_use]
    pub fn private_key(&self) -> &str {
        &self.private_key
    }
}

impl fmt::Debug for ApiKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// First page of a project's database user listing.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseUserPage {
    /// The users on this page.
    pub results: Vec<Value>,
    /// Total number of users across all pages, when reported.
    #[serde(rename = "totalCount", default)]
    pub total_count: Option<u64>,
}

/// Provider settings of a cluster resize request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    /// Cloud provider, e.g. `GCP`.
    pub provider_name: String,
    /// Instance size, e.g. `M30`.
    pub instance_size_name: String,
    /// Provisioned disk IOPS, where the provider supports it.
    #[serde(rename = "diskIOPS", skip_serializing_if = "Option::is_none")]
    pub disk_iops: Option<u32>,
}

/// Body of a cluster resize request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterScaleRequest {
    /// Provider-specific settings.
    pub provider_settings: ProviderSettings,
    /// Disk size in GB.
    #[serde(rename = "diskSizeGB", skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
}

/// Digest-authenticated management API client.
#[derive(Clone)]
pub struct AtlasClient {
    http: reqwest::Client,
    base_url: String,
    credentials: ApiKeyPair,
}

impl AtlasClient {
    /// Build a client for `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`AtlasError::Client`] if the HTTP client cannot be built.
    pub fn new(
        base_url: &str,
        credentials: ApiKeyPair,
        timeout: Duration,
    ) -> Result<Self, AtlasError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tenantvault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AtlasError::Client {
                reason: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            credentials,
        })
    }

    /// The base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the first page of database users in `group_id`.
    ///
    /// Later pages are not followed.
    ///
    /// # Errors
    ///
    /// Returns [`AtlasError`] on transport, authentication, status, or shape
    /// failures. A body without a `results` array is an
    /// [`AtlasError::Parse`], never an empty page.
    pub async fn list_database_users(&self, group_id: &str) -> Result<DatabaseUserPage, AtlasError> {
        let path = format!("/groups/{group_id}/databaseUsers");
        let (url, body) = self.send(Method::GET, &path, None).await?;
        serde_json::from_value(body).map_err(|e| AtlasError::Parse {
            url,
            reason: e.to_string(),
        })
    }

    /// Resize `cluster_name` in `group_id`.
    ///
    /// Returns the updated cluster description.
    ///
    /// # Errors
    ///
    /// Returns [`AtlasError`] on transport, authentication, or status failures.
    pub async fn scale_cluster(
        &self,
        group_id: &str,
        cluster_name: &str,
        request: &ClusterScaleRequest,
    ) -> Result<Value, AtlasError> {
        let path = format!("/groups/{group_id}/clusters/{cluster_name}");
        let body = serde_json::to_value(request).map_err(|e| AtlasError::Parse {
            url: path.clone(),
            reason: format!("failed to encode request: {e}"),
        })?;
        info!(
            group_id,
            cluster_name,
            instance_size = %request.provider_settings.instance_size_name,
            "requesting cluster resize"
        );
        let (_, updated) = self.send(Method::PATCH, &path, Some(&body)).await?;
        Ok(updated)
    }

    /// Send a request, answering a digest challenge if one is issued.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(String, Value), AtlasError> {
        let url = format!("{}{path}", self.base_url);
        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| AtlasError::Parse {
                url: url.clone(),
                reason: format!("failed to encode request: {e}"),
            })?;

        let first = self
            .build(&method, &url, body.as_deref(), None)
            .send()
            .await
            .map_err(|e| request_error(&url, &e))?;

        let response = if first.status() == StatusCode::UNAUTHORIZED {
            let challenge = first
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| AtlasError::Unauthorized {
                    url: url.clone(),
                    reason: "401 without a WWW-Authenticate challenge".to_owned(),
                })?
                .to_owned();
            debug!(url = %url, "answering digest challenge");
            let authorization = self.answer_challenge(&method, &url, &challenge, body.as_deref())?;

            let second = self
                .build(&method, &url, body.as_deref(), Some(&authorization))
                .send()
                .await
                .map_err(|e| request_error(&url, &e))?;
            if second.status() == StatusCode::UNAUTHORIZED {
                return Err(AtlasError::Unauthorized {
                    url,
                    reason: format!(
                        "API key pair for public key '{}' was rejected",
                        self.credentials.public_key()
                    ),
                });
            }
            second
        } else {
            first
        };

        let value = read_json(&url, response).await?;
        Ok((url, value))
    }

    fn build(
        &self,
        method: &Method,
        url: &str,
        body: Option<&[u8]>,
        authorization: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .request(method.clone(), url)
            .header(ACCEPT, "application/json");
        if let Some(bytes) = body {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .body(bytes.to_vec());
        }
        if let Some(auth) = authorization {
            req = req.header(AUTHORIZATION, auth);
        }
        req
    }

    fn answer_challenge(
        &self,
        method: &Method,
        url: &str,
        challenge: &str,
        body: Option<&[u8]>,
    ) -> Result<String, AtlasError> {
        let unauthorized = |reason: String| AtlasError::Unauthorized {
            url: url.to_owned(),
            reason,
        };

        let parsed = reqwest::Url::parse(url).map_err(|e| unauthorized(format!("invalid URL: {e}")))?;
        let uri = match parsed.query() {
            Some(q) => format!("{}?{q}", parsed.path()),
            None => parsed.path().to_owned(),
        };
        let digest_method = HttpMethod::from(method.as_str());

        let mut prompt = digest_auth::parse(challenge)
            .map_err(|e| unauthorized(format!("unparseable digest challenge: {e}")))?;
        let context = AuthContext::new_with_method(
            self.credentials.public_key(),
            self.credentials.private_key(),
            uri.as_str(),
            body,
            digest_method,
        );
        let answer = prompt
            .respond(&context)
            .map_err(|e| unauthorized(format!("cannot answer digest challenge: {e}")))?;
        Ok(answer.to_header_string())
    }
}

impl fmt::Debug for AtlasClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtlasClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl UserDirectory for AtlasClient {
    async fn count_users(&self, project_id: &str) -> Result<u64, CapacityError> {
        let page = self
            .list_database_users(project_id)
            .await
            .map_err(|source| CapacityError::Query {
                project_id: project_id.to_owned(),
                source,
            })?;
        let count = page.results.len() as u64;
        if let Some(total) = page.total_count.filter(|t| *t > count) {
            warn!(
                project_id,
                first_page = count,
                total_count = total,
                "user listing is paginated; only the first page is counted"
            );
        }
        info!(project_id, count, "counted database users");
        Ok(count)
    }
}

fn request_error(url: &str, e: &reqwest::Error) -> AtlasError {
    AtlasError::Request {
        url: url.to_owned(),
        reason: e.to_string(),
    }
}

async fn read_json(url: &str, response: reqwest::Response) -> Result<Value, AtlasError> {
    let status = response.status();
    let body = response.text().await.map_err(|e| request_error(url, &e))?;
    if !status.is_success() {
        return Err(AtlasError::Status {
            url: url.to_owned(),
            status: status.as_u16(),
            body: truncate(&body, MAX_ERROR_BODY),
        });
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).map_err(|e| AtlasError::Parse {
        url: url.to_owned(),
        reason: e.to_string(),
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_owned()
    } else {
        let mut out: String = s.chars().take(max_chars).collect();
        out.push_str("... (truncated)");
        out
    }
}
