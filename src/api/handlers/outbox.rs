//! Outbox enqueue endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use crate::api::dto::{EnqueueRequest, EnqueueResponse};
use crate::app_state::AppState;
use crate::domain::OutboxStatus;
use crate::error::{ErrorResponse, LedgerError};

/// `POST /outbox`: Queue a chat message for delivery.
///
/// # Errors
///
/// Returns [`LedgerError::InvalidRequest`] for an empty destination.
#[utoipa::path(
    post,
    path = "/api/v1/outbox",
    tag = "Outbox",
    summary = "Enqueue chat message",
    request_body = EnqueueRequest,
    responses(
        (status = 202, description = "Message queued", body = EnqueueResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
    )
)]
pub async fn enqueue(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, LedgerError> {
    let id = state
        .outbox
        .enqueue(req.platform, req.channel_id, &req.destination, req.payload)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            id,
            status: OutboxStatus::Pending,
        }),
    ))
}

/// Outbox routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/outbox", post(enqueue))
}
