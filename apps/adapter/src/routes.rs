//! HTTP route handlers.
//!
//! ## Surface
//! ```text
//! POST /receipts                    Phase 1 fiscalization (201 / 200 dedup)
//! GET  /receipts/{id}               Receipt status lookup
//! GET  /buffer/status               Occupancy and per-state counts
//! GET  /health                      Liveness (503 when the buffer is down)
//! GET  /dead-letters                Quarantined receipts (?unresolved=true)
//! POST /dead-letters/{id}/resolve   Mark a dead letter handled
//! POST /sync/trigger                Request an immediate sync cycle (202)
//! ```

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use kassa_core::{CreateReceiptRequest, DeadLetterEntry, Receipt};

use crate::error::ApiError;
use crate::state::SharedState;

/// Builds the adapter router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/receipts", post(create_receipt))
        .route("/receipts/{id}", get(get_receipt))
        .route("/buffer/status", get(buffer_status))
        .route("/health", get(health))
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/{id}/resolve", post(resolve_dead_letter))
        .route("/sync/trigger", post(trigger_sync))
        .with_state(state)
}

// =============================================================================
// Receipts
// =============================================================================

#[derive(Debug, Serialize)]
struct ReceiptResponse {
    receipt: Receipt,
    deduplicated: bool,
}

/// POST /receipts — Phase 1 fiscalization.
///
/// 201 for a new receipt, 200 when the idempotency key matched a previous
/// submission. 409 signals backpressure (buffer full), 422 a malformed
/// payload.
async fn create_receipt(
    State(state): State<SharedState>,
    Json(request): Json<CreateReceiptRequest>,
) -> Result<Response, ApiError> {
    let outcome = state.orchestrator.process(request).await?;

    let status = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };

    Ok((
        status,
        Json(ReceiptResponse {
            receipt: outcome.receipt,
            deduplicated: outcome.deduplicated,
        }),
    )
        .into_response())
}

/// GET /receipts/{id}
async fn get_receipt(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Receipt>, ApiError> {
    let receipt = state.orchestrator.get_receipt(&id).await?;
    Ok(Json(receipt))
}

// =============================================================================
// Buffer
// =============================================================================

/// GET /buffer/status — occupancy, per-state counts, circuit state.
async fn buffer_status(
    State(state): State<SharedState>,
) -> Result<Json<kassa_sync::BufferStatusReport>, ApiError> {
    let status = state.orchestrator.buffer_status().await?;
    Ok(Json(status))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    buffer: bool,
    circuit: String,
    buffered: Option<u32>,
    last_cycle_at: Option<chrono::DateTime<chrono::Utc>>,
    pos_id: String,
}

/// GET /health
///
/// A service that cannot reach its buffer must not accept receipts, so
/// buffer failure is a 503. An open circuit is reported but NOT a health
/// failure: the adapter is doing its offline-first job.
async fn health(State(state): State<SharedState>) -> Response {
    let health = state.orchestrator.phase2_health().await;

    let body = HealthResponse {
        status: if health.buffer_ok { "ok" } else { "unavailable" },
        buffer: health.buffer_ok,
        circuit: health.circuit.to_string(),
        buffered: health.buffered,
        last_cycle_at: health.last_cycle.and_then(|c| c.finished_at),
        pos_id: state.config.pos_id.clone(),
    };

    let status = if health.buffer_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(body)).into_response()
}

// =============================================================================
// Dead Letters
// =============================================================================

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    #[serde(default)]
    unresolved: bool,
}

/// GET /dead-letters
async fn list_dead_letters(
    State(state): State<SharedState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetterEntry>>, ApiError> {
    let repo = state.buffer.dead_letters();

    let entries = if query.unresolved {
        repo.list_unresolved().await?
    } else {
        repo.list().await?
    };

    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    resolved_by: String,
}

#[derive(Debug, Serialize)]
struct ResolveResponse {
    entry: DeadLetterEntry,
}

/// POST /dead-letters/{id}/resolve
async fn resolve_dead_letter(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ResolveResponse>, ApiError> {
    if request.resolved_by.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "validation_failed",
            "resolved_by must not be empty",
        ));
    }

    let repo = state.buffer.dead_letters();
    repo.resolve(&id, request.resolved_by.trim()).await?;
    let entry = repo.get(&id).await?;

    Ok(Json(ResolveResponse { entry }))
}

// =============================================================================
// Sync
// =============================================================================

#[derive(Debug, Serialize)]
struct TriggerResponse {
    triggered: bool,
}

/// POST /sync/trigger — request an immediate cycle.
///
/// Returns 202: the cycle runs in the daemon, not in this request.
async fn trigger_sync(State(state): State<SharedState>) -> Response {
    state.daemon.trigger();
    (StatusCode::ACCEPTED, Json(TriggerResponse { triggered: true })).into_response()
}
