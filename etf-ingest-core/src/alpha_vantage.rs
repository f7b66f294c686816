//! Alpha Vantage query API client.
//!
//! Implements [`EtfDataSource`] on top of the `ETF_PROFILE` and `ETF_HOLDINGS` query
//! functions. Alpha Vantage reports most failures with a 200 status and a JSON body, so the
//! body is inspected for the provider's `"Error Message"` key before it is handed back.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::IngestConfig;
use crate::contract::{DataKind, EtfDataSource, SourceError};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum AlphaVantageError {
    #[error("request to Alpha Vantage failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Alpha Vantage returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("failed to parse Alpha Vantage response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Alpha Vantage API error: {0}")]
    Api(String),
}

pub struct AlphaVantageClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AlphaVantageClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, AlphaVantageError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self, AlphaVantageError> {
        Self::new(config.base_url.clone(), config.api_key.clone())
    }

    /// Fetch the raw payload for `kind`, returning typed errors.
    pub async fn query(&self, kind: DataKind, symbol: &str) -> Result<Value, AlphaVantageError> {
        tracing::info!(symbol, function = kind.api_function(), "Fetching ETF {} data", kind);

        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("function", kind.api_function()),
                ("symbol", symbol),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, symbol, "Request to Alpha Vantage failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(%status, symbol, "Alpha Vantage returned non-success status");
            return Err(AlphaVantageError::Status(status));
        }

        let body = response.bytes().await?;
        let data: Value = serde_json::from_slice(&body).map_err(|e| {
            tracing::error!(error = %e, symbol, "Failed to parse Alpha Vantage response");
            e
        })?;

        check_payload(&data)?;
        Ok(data)
    }
}

/// Rejects payloads carrying a provider error; logs advisory notes.
pub fn check_payload(data: &Value) -> Result<(), AlphaVantageError> {
    if let Some(message) = data.get("Error Message") {
        let message = message
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| message.to_string());
        return Err(AlphaVantageError::Api(message));
    }
    for key in ["Note", "Information"] {
        if let Some(note) = data.get(key) {
            tracing::warn!(note = %note, "Alpha Vantage API notice");
        }
    }
    Ok(())
}

#[async_trait]
impl EtfDataSource for AlphaVantageClient {
    async fn fetch(&self, kind: DataKind, symbol: &str) -> Result<Value, SourceError> {
        self.query(kind, symbol).await.map_err(Into::into)
    }
}
