//! Google Cloud Storage object store.
//!
//! Writes objects through the JSON API multipart upload endpoint, which carries the object
//! resource (name, content type, custom metadata) and the media in a single request.
//!
//! Credentials come from `GCS_ACCESS_TOKEN` when set (local runs, emulators), otherwise from
//! the instance metadata server available on Cloud Run and Cloud Functions.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::optional_env;
use crate::contract::{NewObject, ObjectStore, StoreError, StoredObject};

pub const ENDPOINT_ENV: &str = "GCS_ENDPOINT";
pub const ACCESS_TOKEN_ENV: &str = "GCS_ACCESS_TOKEN";
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum GcsError {
    #[error("request to Cloud Storage failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Cloud Storage returned HTTP {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to obtain access token: {0}")]
    Token(String),
    #[error("failed to encode object resource: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where bearer tokens come from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// A fixed token, used as-is.
    Static(String),
    /// The instance metadata server at the given host.
    Metadata { host: String },
}

impl TokenSource {
    pub fn from_env() -> Self {
        match optional_env(ACCESS_TOKEN_ENV) {
            Some(token) => TokenSource::Static(token),
            None => TokenSource::Metadata {
                host: optional_env(METADATA_HOST_ENV)
                    .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string()),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ObjectResource<'a> {
    name: &'a str,
    content_type: &'a str,
    metadata: &'a std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct UploadedResource {
    name: String,
    bucket: String,
}

pub struct GcsStore {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
    tokens: TokenSource,
    cached: Mutex<Option<CachedToken>>,
}

impl GcsStore {
    pub fn new(bucket: impl Into<String>, tokens: TokenSource) -> Result<Self, GcsError> {
        Self::with_endpoint(DEFAULT_ENDPOINT, bucket, tokens)
    }

    pub fn with_endpoint(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        tokens: TokenSource,
    ) -> Result<Self, GcsError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            tokens,
            cached: Mutex::new(None),
        })
    }

    /// Store for `bucket` configured from `GCS_ENDPOINT` and the token environment.
    pub fn from_env(bucket: impl Into<String>) -> Result<Self, GcsError> {
        let endpoint = optional_env(ENDPOINT_ENV).unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        Self::with_endpoint(endpoint, bucket, TokenSource::from_env())
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn access_token(&self) -> Result<String, GcsError> {
        let host = match &self.tokens {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata { host } => host,
        };

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let url = format!("http://{host}{TOKEN_PATH}");
        tracing::debug!(%url, "Requesting access token from metadata server");
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| GcsError::Token(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GcsError::Token(format!(
                "metadata server returned HTTP {}",
                response.status()
            )));
        }
        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| GcsError::Token(e.to_string()))?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    /// Upload `object`, returning typed errors.
    pub async fn upload(&self, object: &NewObject) -> Result<StoredObject, GcsError> {
        let token = self.access_token().await?;
        let boundary = format!("etf-ingest-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_related_body(&boundary, object)?;
        let url = format!("{}/upload/storage/v1/b/{}/o", self.endpoint, self.bucket);

        tracing::info!(bucket = %self.bucket, object = %object.name, bytes = object.content.len(), "Uploading object to Cloud Storage");

        let response = self
            .http
            .post(&url)
            .query(&[("uploadType", "multipart")])
            .bearer_auth(token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={boundary}"),
            )
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(%status, body = %body, object = %object.name, "Cloud Storage upload failed");
            return Err(GcsError::Status { status, body });
        }

        let stored = match response.json::<UploadedResource>().await {
            Ok(resource) => StoredObject {
                bucket: resource.bucket,
                name: resource.name,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Upload response did not describe the object, using request values");
                StoredObject {
                    bucket: self.bucket.clone(),
                    name: object.name.clone(),
                }
            }
        };
        tracing::info!(uri = %stored.gs_uri(), "Object stored");
        Ok(stored)
    }
}

/// Builds a `multipart/related` upload body: the JSON object resource, then the media.
pub fn multipart_related_body(boundary: &str, object: &NewObject) -> Result<Vec<u8>, GcsError> {
    let resource = serde_json::to_vec(&ObjectResource {
        name: &object.name,
        content_type: &object.content_type,
        metadata: &object.metadata,
    })?;

    let mut body = Vec::with_capacity(resource.len() + object.content.len() + 256);
    body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(&resource);
    body.extend_from_slice(format!("\r\n--{boundary}\r\n").as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", object.content_type).as_bytes());
    body.extend_from_slice(&object.content);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
    Ok(body)
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn put_object(&self, object: NewObject) -> Result<StoredObject, StoreError> {
        self.upload(&object).await.map_err(Into::into)
    }
}
