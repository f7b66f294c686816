//! High-level pipeline: fetch ETF data for a symbol and store every payload as an object.
//!
//! For each symbol the pipeline:
//!   - Fetches the profile through an [`EtfDataSource`] and stores it via an [`ObjectStore`]
//!   - Optionally fetches and stores the holdings the same way
//!   - Reports the `gs://` URI of every object it wrote
//!
//! # Error Handling
//! The pipeline never returns `Err`. A failure at any step stops work on that symbol and is
//! reported in the [`IngestResult`] (`status = error`), keeping the objects already written.
//! Batches ([`ingest_many`]) carry on with the next symbol.
//!
//! # Object Layout
//! `etf_data/{kind}/{SYMBOL}/{YYYY}/{MM}/{DD}/{SYMBOL}_{kind}_{YYYYMMDD_HHMMSS}.json`, UTC.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::contract::{DataKind, EtfDataSource, NewObject, ObjectStore};
use crate::request::normalize_symbol;

pub const OBJECT_PREFIX: &str = "etf_data";
pub const SOURCE_NAME: &str = "alphavantage";
pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Success,
    Error,
}

/// Outcome of ingesting one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    pub symbol: String,
    pub timestamp: String,
    pub files_created: Vec<String>,
    pub status: IngestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl IngestResult {
    pub fn is_success(&self) -> bool {
        self.status == IngestStatus::Success
    }
}

fn ingestion_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// Object name for a payload of `kind` for `symbol` ingested at `at`.
pub fn object_name(symbol: &str, kind: DataKind, at: DateTime<Utc>) -> String {
    format!(
        "{OBJECT_PREFIX}/{kind}/{symbol}/{date}/{symbol}_{kind}_{ts}.json",
        date = at.format("%Y/%m/%d"),
        ts = ingestion_timestamp(at),
    )
}

/// Custom metadata attached to every stored payload.
pub fn object_metadata(
    symbol: &str,
    kind: DataKind,
    at: DateTime<Utc>,
    content: &[u8],
) -> BTreeMap<String, String> {
    let mut hasher = Sha256::new();
    hasher.update(content);
    BTreeMap::from([
        ("symbol".to_string(), symbol.to_string()),
        ("data_type".to_string(), kind.as_str().to_string()),
        ("ingestion_timestamp".to_string(), ingestion_timestamp(at)),
        ("source".to_string(), SOURCE_NAME.to_string()),
        ("content_sha256".to_string(), format!("{:x}", hasher.finalize())),
    ])
}

/// Serializes `data` and builds the object to write for it.
pub fn build_object(
    data: &serde_json::Value,
    symbol: &str,
    kind: DataKind,
    at: DateTime<Utc>,
) -> Result<NewObject, serde_json::Error> {
    let content = serde_json::to_vec_pretty(data)?;
    Ok(NewObject {
        name: object_name(symbol, kind, at),
        metadata: object_metadata(symbol, kind, at, &content),
        content,
        content_type: JSON_CONTENT_TYPE.to_string(),
    })
}

async fn fetch_and_store<S, O>(
    source: &S,
    store: &O,
    symbol: &str,
    kind: DataKind,
) -> Result<String, String>
where
    S: EtfDataSource + ?Sized,
    O: ObjectStore + ?Sized,
{
    let data = source
        .fetch(kind, symbol)
        .await
        .map_err(|e| e.to_string())?;

    let object = build_object(&data, symbol, kind, Utc::now())
        .map_err(|e| format!("failed to serialize {kind} data: {e}"))?;
    info!(symbol, object = %object.name, "Storing ETF {} data", kind);

    let stored = store.put_object(object).await.map_err(|e| {
        error!(symbol, error = %e, "Failed to store ETF {} data", kind);
        format!("failed to store {kind} data: {e}")
    })?;
    Ok(stored.gs_uri())
}

/// Fetch and store the profile (and holdings when requested) for one symbol.
pub async fn ingest_etf_data<S, O>(
    source: &S,
    store: &O,
    symbol: &str,
    include_holdings: bool,
) -> IngestResult
where
    S: EtfDataSource + ?Sized,
    O: ObjectStore + ?Sized,
{
    let mut result = IngestResult {
        symbol: symbol.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        files_created: Vec::new(),
        status: IngestStatus::Success,
        error_message: None,
    };

    info!(symbol, include_holdings, "[INGEST] Starting ETF data ingestion");

    let mut kinds = vec![DataKind::Profile];
    if include_holdings {
        kinds.push(DataKind::Holdings);
    }

    for kind in kinds {
        match fetch_and_store(source, store, symbol, kind).await {
            Ok(uri) => result.files_created.push(uri),
            Err(message) => {
                error!(symbol, %kind, error = %message, "[INGEST][ERROR] ETF data ingestion failed");
                result.status = IngestStatus::Error;
                result.error_message = Some(message);
                return result;
            }
        }
    }

    info!(
        symbol,
        files = result.files_created.len(),
        "[INGEST] ETF data ingestion complete"
    );
    result
}

/// Result for a symbol rejected before any fetch.
pub fn rejected(symbol: &str, message: impl Into<String>) -> IngestResult {
    IngestResult {
        symbol: symbol.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        files_created: Vec::new(),
        status: IngestStatus::Error,
        error_message: Some(message.into()),
    }
}

/// Normalize and ingest every symbol in order, one result per symbol.
///
/// Invalid symbols yield an error result without contacting the data source.
pub async fn ingest_many<S, O>(
    source: &S,
    store: &O,
    symbols: &[String],
    include_holdings: bool,
) -> Vec<IngestResult>
where
    S: EtfDataSource + ?Sized,
    O: ObjectStore + ?Sized,
{
    let mut results = Vec::with_capacity(symbols.len());
    for raw in symbols {
        let result = match normalize_symbol(raw) {
            Ok(symbol) => {
                info!(symbol = %symbol, "[INGEST] Processing scheduled ETF");
                ingest_etf_data(source, store, &symbol, include_holdings).await
            }
            Err(e) => {
                error!(symbol = %raw, error = %e, "[INGEST][ERROR] Skipping invalid symbol");
                rejected(raw, e.to_string())
            }
        };
        results.push(result);
    }
    let failed = results.iter().filter(|r| !r.is_success()).count();
    info!(count = symbols.len(), failed, "[INGEST] Batch complete");
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap()
    }

    #[test]
    fn object_name_layout() {
        assert_eq!(
            object_name("QQQ", DataKind::Holdings, at()),
            "etf_data/holdings/QQQ/2024/03/07/QQQ_holdings_20240307_140509.json"
        );
    }

    #[test]
    fn metadata_records_origin() {
        let meta = object_metadata("SPY", DataKind::Profile, at(), b"{}");
        assert_eq!(meta["symbol"], "SPY");
        assert_eq!(meta["data_type"], "profile");
        assert_eq!(meta["ingestion_timestamp"], "20240307_140509");
        assert_eq!(meta["source"], "alphavantage");
        assert_eq!(meta["content_sha256"].len(), 64);
    }

    #[test]
    fn payload_is_pretty_and_keeps_unicode() {
        let data = serde_json::json!({"name": "Amundi Société Générale"});
        let object = build_object(&data, "QQQ", DataKind::Profile, at()).unwrap();
        let text = String::from_utf8(object.content).unwrap();
        assert_eq!(text, "{\n  \"name\": \"Amundi Société Générale\"\n}");
        assert_eq!(object.content_type, "application/json");
    }

    #[test]
    fn error_message_is_omitted_on_success() {
        let result = IngestResult {
            symbol: "QQQ".into(),
            timestamp: "t".into(),
            files_created: vec![],
            status: IngestStatus::Success,
            error_message: None,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "success");
        assert!(json.get("error_message").is_none());
    }
}
