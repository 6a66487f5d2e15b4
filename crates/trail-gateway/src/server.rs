use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use trail_core::config::GatewayConfig;
use trail_core::wire::{IngestResponse, IngestStatus, Rejection};
use trail_core::BatchId;

use crate::error::GatewayError;
use crate::ingest::{validate_batch, BatchError};
use crate::spool::Spool;

const BODY_LIMIT: usize = 32 * 1024 * 1024;

/// Gateway configuration.
#[derive(Clone, Debug)]
pub struct GatewayOptions {
    pub host: String,
    pub port: u16,
    pub endpoint: String,
    pub request_timeout: Duration,
    pub max_batch: usize,
    /// Log root; received records go to `<root>/gateway/`.
    pub root: PathBuf,
}

impl GatewayOptions {
    pub fn from_config(config: &GatewayConfig, root: PathBuf) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            endpoint: config.endpoint.clone(),
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            max_batch: config.max_batch.max(1),
            root,
        }
    }
}

#[derive(Clone)]
struct AppState {
    spool: Arc<Spool>,
    max_batch: usize,
}

/// Build the Axum router with all routes.
pub fn build_router(options: &GatewayOptions) -> Router {
    let state = AppState {
        spool: Arc::new(Spool::new(&options.root)),
        max_batch: options.max_batch,
    };
    Router::new()
        .route(&options.endpoint, post(ingest_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(TimeoutLayer::new(options.request_timeout))
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve in the background.
pub async fn start(options: GatewayOptions) -> Result<GatewayHandle, GatewayError> {
    let router = build_router(&options);
    let addr = format!("{}:{}", options.host, options.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| GatewayError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr().map_err(|source| GatewayError::Bind { addr, source })?;

    info!(
        addr = %local_addr,
        endpoint = %options.endpoint,
        spool = %options.root.join("gateway").display(),
        "gateway started"
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            error!(error = %e, "gateway server stopped with error");
        }
    });

    Ok(GatewayHandle {
        port: local_addr.port(),
        addr: local_addr,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct GatewayHandle {
    pub port: u16,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl GatewayHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) -> Result<(), GatewayError> {
        self.shutdown.cancel();
        self.wait().await
    }

    /// Wait until the server exits (after the token is cancelled).
    pub async fn wait(self) -> Result<(), GatewayError> {
        self.server.await.map_err(|e| GatewayError::Task(e.to_string()))
    }
}

fn refused(batch_id: BatchId, reason: String) -> IngestResponse {
    IngestResponse {
        status: IngestStatus::Rejected,
        batch_id,
        accepted: 0,
        rejected: vec![Rejection {
            index: 0,
            key: None,
            reason,
        }],
        keys: Vec::new(),
    }
}

async fn ingest_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let batch_id = BatchId::new();
    let validated = match validate_batch(&body, state.max_batch) {
        Ok(v) => v,
        Err(err) => {
            warn!(%batch_id, error = %err, "batch refused");
            let code = match err {
                BatchError::Malformed(_) => StatusCode::BAD_REQUEST,
                BatchError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            };
            return (code, Json(refused(batch_id, err.to_string()))).into_response();
        }
    };

    let keys: Vec<String> = validated.accepted.iter().map(|r| r.key()).collect();
    if !validated.accepted.is_empty() {
        let spool = Arc::clone(&state.spool);
        let id = batch_id.clone();
        let source = validated.source.clone();
        let records = validated.accepted;
        let written = tokio::task::spawn_blocking(move || spool.append(&id, &source, &records)).await;
        let failure = match written {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        if let Some(detail) = failure {
            error!(%batch_id, error = %detail, "failed to store batch");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": detail, "batch_id": batch_id })),
            )
                .into_response();
        }
    }

    let (status, code) = match (keys.is_empty(), validated.rejected.is_empty()) {
        (_, true) => (IngestStatus::Ok, StatusCode::OK),
        (true, false) => (IngestStatus::Rejected, StatusCode::BAD_REQUEST),
        (false, false) => (IngestStatus::Partial, StatusCode::MULTI_STATUS),
    };
    info!(
        %batch_id,
        source = %validated.source,
        accepted = keys.len(),
        rejected = validated.rejected.len(),
        "batch ingested"
    );
    let response = IngestResponse {
        status,
        batch_id,
        accepted: keys.len(),
        rejected: validated.rejected,
        keys,
    };
    (code, Json(response)).into_response()
}

/// Health check HTTP endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}
