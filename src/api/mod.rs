//! REST API layer: route handlers, DTOs, and router composition.
//!
//! Public endpoints live under `/api/v1`; `/health` and the peer relay
//! receiver sit at the root.

pub mod dto;
pub mod handlers;

use axum::Router;

use crate::app_state::AppState;

/// Builds the complete API router with all REST endpoints.
pub fn build_router() -> Router<AppState> {
    Router::new()
        .nest("/api/v1", handlers::routes())
        .merge(handlers::system::routes())
        .merge(handlers::internal::routes())
}

#[cfg(test)]
#[allow(clippy::panic)]
pub(crate) mod test_support {
    //! Request helpers for handler tests.

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    /// Sends one request and returns the status plus the JSON body
    /// (`Null` for empty bodies).
    pub(crate) async fn call(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        };
        let Ok(request) = request else {
            panic!("bad request");
        };
        send(router, request).await
    }

    /// Sends a prebuilt request.
    pub(crate) async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let Ok(response) = router.oneshot(request).await else {
            panic!("router failed");
        };
        let status = response.status();
        let Ok(bytes) = axum::body::to_bytes(response.into_body(), usize::MAX).await else {
            panic!("body read failed");
        };
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }
}
