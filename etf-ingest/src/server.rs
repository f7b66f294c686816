//! HTTP function server.
//!
//! Serves both ingestion entry points on their own paths and the one named by
//! `FUNCTION_TARGET` on `/`, so a single image can be deployed as either function.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use chrono::Utc;
use etf_ingest_core::alpha_vantage::AlphaVantageClient;
use etf_ingest_core::config::IngestConfig;
use etf_ingest_core::contract::{EtfDataSource, ObjectStore};
use etf_ingest_core::deploy::{HTTP_FUNCTION, SCHEDULED_FUNCTION};
use etf_ingest_core::gcs::GcsStore;
use etf_ingest_core::ingest::{ingest_etf_data, ingest_many};
use etf_ingest_core::request::{normalize_symbol, IngestRequest, RequestError, ScheduledRequest};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

/// Data source and store shared by requests.
#[derive(Clone)]
pub struct Clients {
    pub source: Arc<dyn EtfDataSource>,
    pub store: Arc<dyn ObjectStore>,
}

/// Supplies clients to handlers; failures are reported to the caller as a 500.
pub trait ClientProvider: Send + Sync {
    fn clients(&self) -> Result<Clients, String>;
}

/// Builds clients from the environment on first use and keeps them once built.
#[derive(Default)]
pub struct EnvClientProvider {
    built: Mutex<Option<Clients>>,
}

impl EnvClientProvider {
    fn build() -> Result<Clients, String> {
        let config = IngestConfig::from_env().map_err(|e| e.to_string())?;
        config.trace_loaded();
        let source = AlphaVantageClient::from_config(&config).map_err(|e| e.to_string())?;
        let store = GcsStore::from_env(config.bucket_name.clone()).map_err(|e| e.to_string())?;
        Ok(Clients {
            source: Arc::new(source),
            store: Arc::new(store),
        })
    }
}

impl ClientProvider for EnvClientProvider {
    fn clients(&self) -> Result<Clients, String> {
        let mut built = self.built.lock().map_err(|_| "client cache poisoned".to_string())?;
        if let Some(clients) = built.as_ref() {
            return Ok(clients.clone());
        }
        let clients = Self::build()?;
        *built = Some(clients.clone());
        Ok(clients)
    }
}

/// Entry point served on `/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionTarget {
    Ingest,
    Scheduled,
}

impl std::str::FromStr for FunctionTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            HTTP_FUNCTION | "" => Ok(FunctionTarget::Ingest),
            SCHEDULED_FUNCTION => Ok(FunctionTarget::Scheduled),
            other => Err(format!(
                "unknown function target {other:?}, expected {HTTP_FUNCTION} or {SCHEDULED_FUNCTION}"
            )),
        }
    }
}

pub struct AppState {
    pub clients: Arc<dyn ClientProvider>,
    pub target: FunctionTarget,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", any(root))
        .route(&format!("/{HTTP_FUNCTION}"), any(etf_data_ingest))
        .route(&format!("/{SCHEDULED_FUNCTION}"), any(etf_data_ingest_scheduled))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn failure_body(message: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "status": "error",
            "error_message": message.into(),
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

async fn root(state: State<Arc<AppState>>, method: Method, body: Bytes) -> Response {
    match state.target {
        FunctionTarget::Ingest => etf_data_ingest(state, method, body).await,
        FunctionTarget::Scheduled => etf_data_ingest_scheduled(state, method, body).await,
    }
}

/// On-demand ingestion of a single symbol.
///
/// Expects `{"symbol": "QQQ", "include_holdings": true}`.
pub async fn etf_data_ingest(
    State(state): State<Arc<AppState>>,
    method: Method,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return error_body(StatusCode::METHOD_NOT_ALLOWED, "Only POST requests are supported");
    }

    let value = match serde_json::from_slice::<Value>(&body) {
        Ok(v) if v.as_object().is_some_and(|o| !o.is_empty()) => v,
        _ => return error_body(StatusCode::BAD_REQUEST, RequestError::InvalidJson.to_string()),
    };
    let request: IngestRequest = match serde_json::from_value(value) {
        Ok(req) => req,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, format!("Invalid request: {e}")),
    };
    let Some(raw_symbol) = request.symbol.filter(|s| !s.trim().is_empty()) else {
        return error_body(StatusCode::BAD_REQUEST, "Parameter 'symbol' is required");
    };
    let symbol = match normalize_symbol(&raw_symbol) {
        Ok(symbol) => symbol,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let clients = match state.clients.clients() {
        Ok(clients) => clients,
        Err(e) => {
            tracing::error!(error = %e, "Function execution failed");
            return failure_body(e);
        }
    };

    let result = ingest_etf_data(
        clients.source.as_ref(),
        clients.store.as_ref(),
        &symbol,
        request.include_holdings,
    )
    .await;
    let status = if result.is_success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(result)).into_response()
}

/// Scheduled ingestion of a batch of symbols.
///
/// Accepts `{"symbols": [...], "include_holdings": true}` directly or inside a Pub/Sub push
/// envelope. An empty batch is logged and acknowledged with 204 so the message is not redelivered.
pub async fn etf_data_ingest_scheduled(
    State(state): State<Arc<AppState>>,
    method: Method,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return error_body(StatusCode::METHOD_NOT_ALLOWED, "Only POST requests are supported");
    }

    let request = match ScheduledRequest::from_body(&body) {
        Ok(req) => req,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
    };
    if request.symbols.is_empty() {
        tracing::error!("No ETF symbols provided");
        return StatusCode::NO_CONTENT.into_response();
    }

    let clients = match state.clients.clients() {
        Ok(clients) => clients,
        Err(e) => {
            tracing::error!(error = %e, "Scheduled function execution failed");
            return failure_body(e);
        }
    };

    let results = ingest_many(
        clients.source.as_ref(),
        clients.store.as_ref(),
        &request.symbols,
        request.include_holdings,
    )
    .await;
    tracing::info!(count = results.len(), "Scheduled run complete");
    (StatusCode::OK, Json(results)).into_response()
}

/// Binds `0.0.0.0:port` and serves until Ctrl-C / SIGTERM.
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {addr}: {e}"))?;
    tracing::info!(%addr, function_target = ?state.target, "Function server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("Function server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            futures::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                futures::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = futures::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
