//! Invocation payloads accepted by the two function entry points.

use std::sync::OnceLock;

use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Invalid ETF symbol: {0:?}")]
    InvalidSymbol(String),
    #[error("Request body must be valid JSON")]
    InvalidJson,
    #[error("Pub/Sub message data is not valid base64")]
    InvalidEnvelope,
}

fn symbol_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Z0-9][A-Z0-9.\-]{0,14}$").expect("symbol pattern is a valid regex")
    })
}

/// Trims and upper-cases `raw`, rejecting anything that is not a plausible ticker.
///
/// Symbols end up in object names, so separators and whitespace are never let through.
pub fn normalize_symbol(raw: &str) -> Result<String, RequestError> {
    let symbol = raw.trim().to_ascii_uppercase();
    if symbol_pattern().is_match(&symbol) {
        Ok(symbol)
    } else {
        Err(RequestError::InvalidSymbol(raw.to_string()))
    }
}

fn default_include_holdings() -> bool {
    true
}

/// An explicit `null` turns holdings off; an absent field keeps the default.
fn null_as_false<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Body of an on-demand `etf_data_ingest` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(
        default = "default_include_holdings",
        deserialize_with = "null_as_false"
    )]
    pub include_holdings: bool,
}

/// Body of a scheduled `etf_data_ingest_scheduled` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledRequest {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub symbols: Vec<String>,
    #[serde(
        default = "default_include_holdings",
        deserialize_with = "null_as_false"
    )]
    pub include_holdings: bool,
}

#[derive(Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Deserialize)]
struct PushMessage {
    #[serde(default)]
    data: Option<String>,
}

impl ScheduledRequest {
    /// Parses either a plain JSON body or a Pub/Sub push envelope whose
    /// `message.data` holds the base64-encoded JSON body.
    pub fn from_body(body: &[u8]) -> Result<Self, RequestError> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|_| RequestError::InvalidJson)?;

        if value.get("message").is_some() {
            let envelope: PushEnvelope =
                serde_json::from_value(value).map_err(|_| RequestError::InvalidJson)?;
            let Some(data) = envelope.message.data else {
                return Ok(Self::empty());
            };
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(data.trim())
                .map_err(|_| RequestError::InvalidEnvelope)?;
            tracing::debug!(bytes = decoded.len(), "Decoded Pub/Sub push message");
            return serde_json::from_slice(&decoded).map_err(|_| RequestError::InvalidJson);
        }

        serde_json::from_value(value).map_err(|_| RequestError::InvalidJson)
    }

    fn empty() -> Self {
        Self {
            symbols: Vec::new(),
            include_holdings: true,
        }
    }
}
