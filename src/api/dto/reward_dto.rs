//! Reward delivery envelope and acknowledgement.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::domain::{ChannelId, IncomingReward, Provider, RewardDelivery};
use crate::service::RecordOutcome;

/// Body of `POST /api/v1/rewards/deliveries`.
///
/// Events are kept as raw JSON here; each is parsed separately so that one
/// bad event cannot hide the others.
#[derive(Debug, Deserialize, ToSchema)]
pub struct DeliveryEnvelope {
    /// Source platform.
    #[schema(value_type = String, example = "twitch")]
    pub provider: Provider,
    /// Transport message id.
    pub delivery_id: String,
    /// Target channel.
    #[schema(value_type = uuid::Uuid)]
    pub channel_id: ChannelId,
    /// Channel slug for realtime routing.
    #[serde(default)]
    pub channel_slug: String,
    /// Provider events.
    #[schema(value_type = Vec<Object>)]
    pub events: Vec<serde_json::Value>,
}

impl DeliveryEnvelope {
    /// Parses every event and builds the delivery.
    #[must_use]
    pub fn into_delivery(self) -> RewardDelivery {
        let provider = self.provider;
        RewardDelivery {
            provider,
            delivery_id: self.delivery_id,
            channel_id: self.channel_id,
            channel_slug: self.channel_slug,
            events: self
                .events
                .into_iter()
                .map(|value| IncomingReward::from_value(provider, value))
                .collect(),
        }
    }
}

/// Response of the delivery endpoint; always sent with 200.
#[derive(Debug, Serialize, ToSchema)]
pub struct DeliveryAck {
    /// `false` when the envelope itself was unusable.
    pub accepted: bool,
    /// Why the envelope was not accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Recorder result for accepted envelopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub outcome: Option<RecordOutcome>,
}

impl DeliveryAck {
    /// Acknowledges an envelope that could not be used.
    #[must_use]
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
            outcome: None,
        }
    }

    /// Acknowledges a recorded delivery.
    #[must_use]
    pub fn recorded(outcome: RecordOutcome) -> Self {
        Self {
            accepted: true,
            reason: None,
            outcome: Some(outcome),
        }
    }
}
