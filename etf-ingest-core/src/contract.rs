#![allow(unused)]

//! # contract: interfaces between the ingestion pipeline and the outside world
//!
//! This module defines the three seams the rest of the crate is written against:
//!
//! - [`EtfDataSource`]: fetches raw ETF payloads (profile, holdings) for a symbol.
//! - [`ObjectStore`]: persists a serialized payload as a named object in a bucket.
//! - [`CommandRunner`]: executes one external CLI invocation during deployment.
//!
//! ## Mocking & Testing
//! - Every trait is annotated for `mockall`, so pipelines and deployment plans can be
//!   exercised without network access or a `gcloud` binary.
//! - Mocks are exported behind the `test-export-mocks` feature for use by the binary crate tests.
//!
//! ## Adding New Backends
//! - Implement the relevant trait for your backend.
//! - Convert upstream errors into a boxed error; callers only format and log them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use mockall::{automock, predicate::*};
use serde::{Deserialize, Serialize};

/// Boxed error returned across the data source seam.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed error returned across the object store seam.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Kind of ETF data fetched and stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Profile,
    Holdings,
}

impl DataKind {
    /// Name of the Alpha Vantage query function serving this kind.
    pub fn api_function(self) -> &'static str {
        match self {
            DataKind::Profile => "ETF_PROFILE",
            DataKind::Holdings => "ETF_HOLDINGS",
        }
    }

    /// Path segment and metadata value used when storing this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Profile => "profile",
            DataKind::Holdings => "holdings",
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An object to be written to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObject {
    /// Object name inside the bucket (slash separated).
    pub name: String,
    /// Raw object bytes.
    pub content: Vec<u8>,
    pub content_type: String,
    /// Custom metadata attached to the object.
    pub metadata: BTreeMap<String, String>,
}

/// A successfully written object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub name: String,
}

impl StoredObject {
    /// `gs://bucket/name` URI of the object.
    pub fn gs_uri(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.name)
    }
}

/// Trait for fetching ETF payloads from an upstream data provider.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait EtfDataSource: Send + Sync {
    /// Fetch the payload of the given kind for `symbol`.
    ///
    /// Implementors return an error for transport failures, undecodable bodies and
    /// provider-reported errors. Advisory notes are logged, not returned as errors.
    async fn fetch(&self, kind: DataKind, symbol: &str) -> Result<serde_json::Value, SourceError>;
}

/// Trait for persisting objects in a bucket.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write a new object, returning where it was stored.
    async fn put_object(&self, object: NewObject) -> Result<StoredObject, StoreError>;
}

/// One external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Error launching a command (the command never ran).
pub type RunError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for running external CLI commands.
/// Implemented by the real process runner and by mocks in testing.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion and capture its output.
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, RunError>;
}
