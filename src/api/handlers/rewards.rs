//! Reward delivery ingestion.

use axum::body::Bytes;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};

use crate::api::dto::{DeliveryAck, DeliveryEnvelope};
use crate::app_state::AppState;
use crate::error::{ErrorResponse, LedgerError};

/// `POST /rewards/deliveries`: Record a provider delivery and claim
/// eligible events.
///
/// Unusable envelopes are acknowledged with `accepted: false` and a 200 so
/// that upstream webhooks do not redeliver them forever. Malformed events
/// inside a usable envelope are recorded as ignored.
///
/// # Errors
///
/// Returns [`LedgerError::Store`] when persistence fails; the upstream
/// should redeliver.
#[utoipa::path(
    post,
    path = "/api/v1/rewards/deliveries",
    tag = "Rewards",
    summary = "Ingest a reward delivery",
    request_body = DeliveryEnvelope,
    responses(
        (status = 200, description = "Delivery acknowledged", body = DeliveryAck),
        (status = 500, description = "Storage failure; retry the delivery", body = ErrorResponse),
    )
)]
pub async fn ingest_delivery(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, LedgerError> {
    let envelope = match serde_json::from_slice::<DeliveryEnvelope>(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(error = %e, "malformed reward delivery envelope acknowledged");
            return Ok(Json(DeliveryAck::rejected("malformed_envelope")));
        }
    };
    if envelope.delivery_id.trim().is_empty() {
        tracing::warn!(provider = %envelope.provider, "reward delivery without id acknowledged");
        return Ok(Json(DeliveryAck::rejected("missing_delivery_id")));
    }

    let delivery = envelope.into_delivery();
    let outcome = state.recorder.record_and_maybe_claim(&delivery).await?;
    Ok(Json(DeliveryAck::recorded(outcome)))
}

/// Reward routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/rewards/deliveries", post(ingest_delivery))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use axum::http::StatusCode;
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::api::test_support::call;
    use crate::app_state::testing::app;
    use crate::domain::{
        ChannelId, ChannelSettings, EconomySettings, LiveRequirement, Provider, RewardRule, UserId,
    };

    async fn cheer_channel(test: &crate::app_state::testing::TestApp) -> ChannelId {
        let channel = ChannelId::new();
        test.channels
            .insert(
                channel,
                ChannelSettings {
                    slug: "streamer".to_string(),
                    reward_rules: vec![RewardRule {
                        provider: Provider::Twitch,
                        event_type: "cheer".to_string(),
                        enabled: true,
                        live_requirement: LiveRequirement::Any,
                        units_per_coin: 100,
                        coins_per_unit: 0,
                        base_coins: 0,
                        min_units: 0,
                        reward_id: None,
                    }],
                    economy: EconomySettings {
                        start_bonus_coins: 0,
                        ..EconomySettings::default()
                    },
                },
            )
            .await;
        channel
    }

    #[tokio::test]
    async fn delivery_is_claimed_and_replay_is_duplicate() {
        let test = app(None);
        let channel = cheer_channel(&test).await;
        test.identities
            .link(Provider::Twitch, "tw-9", UserId::new())
            .await;
        let router = crate::api::build_router().with_state(test.state);
        let body = json!({
            "provider": "twitch",
            "delivery_id": "msg-1",
            "channel_id": channel,
            "channel_slug": "streamer",
            "events": [{
                "provider_event_id": "evt-1",
                "provider_account_id": "tw-9",
                "event_at": Utc::now(),
                "kind": {"type": "cheer", "bits": 500}
            }]
        });

        let (status, ack) = call(
            router.clone(),
            "POST",
            "/api/v1/rewards/deliveries",
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["accepted"], true);
        assert_eq!(ack["outcome"]["duplicate"], false);
        assert_eq!(ack["outcome"]["events"][0]["status"], "claimed");
        assert_eq!(ack["outcome"]["events"][0]["coins_granted"], 5);

        let (status, ack) = call(router, "POST", "/api/v1/rewards/deliveries", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["outcome"]["duplicate"], true);
    }

    #[tokio::test]
    async fn malformed_envelope_is_acknowledged() {
        let test = app(None);
        let router = crate::api::build_router().with_state(test.state);
        let (status, ack) = call(
            router,
            "POST",
            "/api/v1/rewards/deliveries",
            Some(json!({"provider": "myspace"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["accepted"], false);
        assert_eq!(ack["reason"], "malformed_envelope");
        assert_eq!(test.store.delivery_count().await, 0);
    }

    #[tokio::test]
    async fn malformed_event_is_recorded_as_ignored() {
        let test = app(None);
        let channel = cheer_channel(&test).await;
        let router = crate::api::build_router().with_state(test.state);
        let (status, ack) = call(
            router,
            "POST",
            "/api/v1/rewards/deliveries",
            Some(json!({
                "provider": "twitch",
                "delivery_id": "msg-2",
                "channel_id": channel,
                "events": [{"kind": {"type": "cheer"}}]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["accepted"], true);
        assert_eq!(ack["outcome"]["events"][0]["status"], "ignored");
        assert_eq!(ack["outcome"]["events"][0]["reason"], "malformed_payload");
        assert_eq!(test.store.reward_event_count().await, 1);
    }
}
