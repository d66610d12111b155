//! System endpoints: health check.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::app_state::AppState;
use crate::resilience::circuit_breaker::BreakerSnapshot;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
    instance_id: String,
    /// Lost wallet-creation races since start.
    wallet_race_conflicts: u64,
    /// Realtime subscribers on this instance.
    realtime_subscribers: usize,
    /// Updates dropped for slow realtime subscribers since start.
    realtime_missed_updates: u64,
    #[schema(value_type = Vec<Object>)]
    breakers: Vec<BreakerSnapshot>,
}

/// `GET /health`: Service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns service health, version, instance identity, the wallet race counter and breaker states.",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            instance_id: state.relay.instance_id().to_string(),
            wallet_race_conflicts: state.ledger.race_conflicts(),
            realtime_subscribers: state.relay.event_bus().receiver_count(),
            realtime_missed_updates: state.relay.event_bus().missed_updates(),
            breakers: state.breakers.snapshots(),
        }),
    )
}

/// System routes mounted at the root level (not under /api/v1).
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::api::test_support::call;
    use crate::app_state::testing::app;

    #[tokio::test]
    async fn health_reports_instance_and_breakers() {
        let test = app(None);
        let _ = test.state.breakers.get("chat:twitch");
        let router = crate::api::build_router().with_state(test.state);

        let (status, body) = call(router, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["instance_id"], "test-instance");
        assert_eq!(body["wallet_race_conflicts"], 0);
        assert_eq!(body["realtime_missed_updates"], 0);
        assert_eq!(body["breakers"][0]["service"], "chat:twitch");
        assert_eq!(body["breakers"][0]["state"], "closed");
    }
}
