//! HTTP surface of the attestation service
//!
//! - GET  /health - store liveness and uptime
//! - GET  /stats - attestation counts by status
//! - GET  /metrics - Prometheus metrics
//! - GET  /attestation/{sourceChainId}/{nonce} - one attestation, backfilled if unseen
//! - GET  /attestations/ready - ready queue, oldest first
//! - POST /attestation/{sourceChainId}/{nonce}/signatures - push a watchtower signature

use std::net::SocketAddr;
use std::sync::Arc;

use alloy::primitives::Bytes;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::BridgeError;
use crate::service::{AttestationService, Health, Stats};
use crate::types::{Attestation, AttestationKey, ChainId};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AttestationService>,
}

/// Attestation as served over HTTP
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestationResponse {
    #[serde(flatten)]
    pub attestation: Attestation,
    pub signature_count: usize,
}

impl From<Attestation> for AttestationResponse {
    fn from(attestation: Attestation) -> Self {
        Self {
            signature_count: attestation.signature_count(),
            attestation,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitSignatureRequest {
    pub watchtower_id: String,
    pub signature: Bytes,
}

/// [`BridgeError`] rendered as a JSON error body with a matching status code
pub struct ApiError(BridgeError);

impl From<BridgeError> for ApiError {
    fn from(e: BridgeError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BridgeError::NotFound | BridgeError::UnknownChain(_) => StatusCode::NOT_FOUND,
            BridgeError::InvalidSignature { .. }
            | BridgeError::UnknownWatchtower(_)
            | BridgeError::InvalidAttestation(_)
            | BridgeError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            BridgeError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<Health>) {
    let health = state.service.get_health().await;
    let code = if health.status == "healthy" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(health))
}

async fn stats(State(state): State<AppState>) -> Result<Json<Stats>, ApiError> {
    Ok(Json(state.service.get_stats().await?))
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn get_attestation(
    State(state): State<AppState>,
    Path((source_chain_id, nonce)): Path<(u32, u64)>,
) -> Result<Json<AttestationResponse>, ApiError> {
    let key = AttestationKey::new(ChainId(source_chain_id), nonce);
    let attestation = match state.service.get_or_backfill(key).await {
        // Source chain not configured here: nothing to backfill from
        Err(BridgeError::UnknownChain(_)) => return Err(BridgeError::NotFound.into()),
        other => other?,
    };
    Ok(Json(attestation.into()))
}

async fn list_ready(
    State(state): State<AppState>,
) -> Result<Json<Vec<AttestationResponse>>, ApiError> {
    let ready = state.service.store().list_ready().await?;
    Ok(Json(ready.into_iter().map(Into::into).collect()))
}

async fn submit_signature(
    State(state): State<AppState>,
    Path((source_chain_id, nonce)): Path<(u32, u64)>,
    Json(request): Json<SubmitSignatureRequest>,
) -> Result<Json<AttestationResponse>, ApiError> {
    let key = AttestationKey::new(ChainId(source_chain_id), nonce);
    let attestation = state
        .service
        .submit_signature(key, &request.watchtower_id, request.signature)
        .await
        .inspect_err(|e| {
            warn!(key = %key, watchtower = %request.watchtower_id, error = %e, "Signature submission rejected")
        })?;
    Ok(Json(attestation.into()))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        .route("/attestations/ready", get(list_ready))
        .route("/attestation/{source_chain_id}/{nonce}", get(get_attestation))
        .route(
            "/attestation/{source_chain_id}/{nonce}/signatures",
            post(submit_signature),
        )
        .with_state(state)
}

/// Serve the API until a shutdown signal arrives
pub async fn start_server(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: mpsc::Receiver<()>,
) -> eyre::Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await;
            info!("Shutdown signal received, stopping API server");
        })
        .await?;

    Ok(())
}
