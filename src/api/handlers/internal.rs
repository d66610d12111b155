//! Peer relay receiver.
//!
//! Only reachable from loopback callers presenting the shared secret;
//! everything else gets a plain 404 so the route stays invisible.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use crate::app_state::AppState;
use crate::domain::WalletUpdateEvent;
use crate::service::balance_relay::{RELAY_PATH, RELAY_SECRET_HEADER};

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or_else(|| v6.is_loopback(), |v4| v4.is_loopback()),
    }
}

/// `POST /internal/wallet-updated`: Re-emit a wallet update relayed by a
/// peer instance on the local bus.
#[utoipa::path(
    post,
    path = "/internal/wallet-updated",
    tag = "Internal",
    summary = "Peer wallet update relay",
    request_body = serde_json::Value,
    responses(
        (status = 202, description = "Event re-emitted locally"),
        (status = 204, description = "Event originated here; ignored"),
        (status = 404, description = "Caller not allowed"),
    )
)]
pub async fn wallet_updated(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(event): Json<WalletUpdateEvent>,
) -> impl IntoResponse {
    let presented = headers
        .get(RELAY_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());
    if !is_loopback(peer.ip()) || !state.relay.verify_secret(presented) {
        tracing::debug!(%peer, "relay request refused");
        return StatusCode::NOT_FOUND;
    }
    if state.relay.accept_remote(event) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NO_CONTENT
    }
}

/// Internal routes mounted at the root level.
pub fn routes() -> Router<AppState> {
    Router::new().route(RELAY_PATH, post(wallet_updated))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use chrono::Utc;

    use super::*;
    use crate::api::test_support::send;
    use crate::app_state::testing::app;
    use crate::domain::{ChannelId, UserId, WalletUpdateReason};

    fn event(origin: &str) -> WalletUpdateEvent {
        WalletUpdateEvent {
            user_id: UserId::new(),
            channel_id: ChannelId::new(),
            channel_slug: None,
            balance: 12,
            delta: 2,
            reason: WalletUpdateReason::Spend,
            origin_instance: origin.to_string(),
            timestamp: Utc::now(),
        }
    }

    fn request(secret: Option<&str>, event: &WalletUpdateEvent) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(RELAY_PATH)
            .header("content-type", "application/json");
        if let Some(secret) = secret {
            builder = builder.header(RELAY_SECRET_HEADER, secret);
        }
        let Ok(body) = serde_json::to_vec(event) else {
            panic!("event did not serialize");
        };
        let Ok(request) = builder.body(Body::from(body)) else {
            panic!("bad request");
        };
        request
    }

    fn router(state: AppState, from: [u8; 4]) -> axum::Router {
        crate::api::build_router()
            .with_state(state)
            .layer(MockConnectInfo(SocketAddr::from((from, 40000))))
    }

    #[tokio::test]
    async fn loopback_peer_with_secret_is_reemitted() {
        let test = app(Some("s3cret"));
        let mut feed = test.state.relay.event_bus().feed();
        let remote = event("peer-b");

        let (status, _) = send(
            router(test.state.clone(), [127, 0, 0, 1]),
            request(Some("s3cret"), &remote),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let Some(received) = feed.recv_for(remote.user_id, remote.channel_id).await else {
            panic!("event not re-emitted");
        };
        assert_eq!(received, remote);
    }

    #[tokio::test]
    async fn own_events_are_ignored() {
        let test = app(Some("s3cret"));
        let (status, _) = send(
            router(test.state, [127, 0, 0, 1]),
            request(Some("s3cret"), &event("test-instance")),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn bad_secret_or_remote_caller_gets_404() {
        let test = app(Some("s3cret"));
        let (status, _) = send(
            router(test.state.clone(), [127, 0, 0, 1]),
            request(Some("wrong"), &event("peer-b")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            router(test.state.clone(), [10, 0, 0, 7]),
            request(Some("s3cret"), &event("peer-b")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            router(test.state, [127, 0, 0, 1]),
            request(None, &event("peer-b")),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn mapped_loopback_counts_as_loopback() {
        let Ok(mapped) = "::ffff:127.0.0.1".parse::<IpAddr>() else {
            panic!("bad address");
        };
        assert!(is_loopback(mapped));
        let Ok(v6) = "::1".parse::<IpAddr>() else {
            panic!("bad address");
        };
        assert!(is_loopback(v6));
    }
}
