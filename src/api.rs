//! Read-only status HTTP server.
//!
//! Out of the critical path: every endpoint reads the store or in-memory
//! counters, never the chains. Amounts are serialized as decimal strings.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::db::Store;
use crate::gossip::GossipService;
use crate::types::{ChainId, TransferStatus};

/// Shared application state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub gossip: Arc<GossipService>,
    pub validator_b: String,
    pub validator_a: Option<String>,
    pub start_time: Instant,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    uptime_seconds: u64,
    validator_b: String,
    validator_a: Option<String>,
    watermark_a: Option<u64>,
    watermark_b: Option<u64>,
    overlay_peers: usize,
    transfers: crate::db::StoreStats,
}

#[derive(Serialize)]
struct TransferSummary {
    transfer_id: String,
    source: ChainId,
    destination: ChainId,
    status: TransferStatus,
    amount: String,
    attestations: usize,
    relay_attempts: u32,
    last_error: Option<String>,
}

/// Start the status server.
pub async fn start_status_server(addr: SocketAddr, state: AppState) -> Result<()> {
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/stats", get(stats_handler))
        .route("/transfers/pending", get(pending_handler))
        .route("/transfers/:id", get(transfer_handler))
        .route("/transfers/:id/attestations", get(attestations_handler))
        .route("/validators", get(validators_handler))
        .with_state(state);

    tracing::info!(%addr, "Status HTTP server started");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], buffer).into_response()
}

async fn status_handler(State(state): State<AppState>) -> Response {
    let transfers = match state.store.get_stats() {
        Ok(stats) => stats,
        Err(e) => return store_error(e),
    };

    let response = StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        validator_b: state.validator_b.clone(),
        validator_a: state.validator_a.clone(),
        watermark_a: state.store.get_watermark(ChainId::A).unwrap_or(None),
        watermark_b: state.store.get_watermark(ChainId::B).unwrap_or(None),
        overlay_peers: state.gossip.peer_count().await,
        transfers,
    };
    Json(response).into_response()
}

async fn stats_handler(State(state): State<AppState>) -> Response {
    match state.store.get_stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_error(e),
    }
}

async fn pending_handler(State(state): State<AppState>) -> Response {
    match state.store.list_open_transfers() {
        Ok(open) => {
            let summaries: Vec<TransferSummary> = open
                .into_iter()
                .map(|record| TransferSummary {
                    transfer_id: record.event.transfer_id.clone(),
                    source: record.event.source,
                    destination: record.event.destination,
                    status: record.status,
                    amount: record.event.amount.to_string(),
                    attestations: record.attestation_count(),
                    relay_attempts: record.relay_attempts,
                    last_error: record.last_error,
                })
                .collect();
            Json(summaries).into_response()
        }
        Err(e) => store_error(e),
    }
}

async fn transfer_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get_transfer(&id) {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => store_error(e),
    }
}

async fn attestations_handler(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.list_attestations(&id) {
        Ok(attestations) => Json(attestations).into_response(),
        Err(e) => store_error(e),
    }
}

async fn validators_handler(State(state): State<AppState>) -> Response {
    match state.store.list_validator_stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => store_error(e),
    }
}

fn store_error(e: eyre::Report) -> Response {
    tracing::error!(error = %e, "Store read failed in status handler");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
