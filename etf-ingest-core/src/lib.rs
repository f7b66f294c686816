#![doc = "etf-ingest-core: core logic library for etf-ingest."]

//! This crate contains the data models, client implementations and pipelines for etf-ingest.
//! HTTP serving, CLI glue and process spawning live in the `etf-ingest` binary crate.
//!
//! # Usage
//! Add this as a dependency for all shared ingestion, storage, config and deployment code.

pub mod alpha_vantage;
pub mod config;
pub mod contract;
pub mod deploy;
pub mod gcs;
pub mod ingest;
pub mod request;
