use serde::Serialize;
use tracing::{debug, info};

pub const API_KEY_ENV: &str = "ALPHA_VANTAGE_API_KEY";
pub const BUCKET_ENV: &str = "GCS_BUCKET_NAME";
pub const PROJECT_ENV: &str = "GCP_PROJECT_ID";
pub const BASE_URL_ENV: &str = "ALPHA_VANTAGE_BASE_URL";

pub const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co/query";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingEnv(&'static str),
}

/// Runtime configuration of the ingestion function.
#[derive(Clone, Serialize)]
pub struct IngestConfig {
    #[serde(skip)]
    pub api_key: String,
    pub bucket_name: String,
    pub base_url: String,
}

impl std::fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestConfig")
            .field("api_key", &"***")
            .field("bucket_name", &self.bucket_name)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl IngestConfig {
    /// Reads the configuration from the process environment.
    ///
    /// The API key is checked before the bucket name, so a caller missing both
    /// sees the API key diagnostic first.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = require_env(API_KEY_ENV)?;
        let bucket_name = require_env(BUCKET_ENV)?;
        let base_url = optional_env(BASE_URL_ENV).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            api_key,
            bucket_name,
            base_url,
        })
    }

    pub fn trace_loaded(&self) {
        info!(
            bucket_name = %self.bucket_name,
            base_url = %self.base_url,
            api_key_len = self.api_key.len(),
            "Loaded IngestConfig"
        );
        debug!(?self, "IngestConfig loaded (full debug)");
    }
}

/// Returns the trimmed value of `name`, or `MissingEnv` when unset or blank.
pub fn require_env(name: &'static str) -> Result<String, ConfigError> {
    optional_env(name).ok_or(ConfigError::MissingEnv(name))
}

pub fn optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
