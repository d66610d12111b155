//! Outbox enqueue DTOs.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::domain::{ChannelId, OutboxStatus, Provider};

/// Request body for `POST /api/v1/outbox`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct EnqueueRequest {
    /// Target platform.
    #[schema(value_type = String, example = "kick")]
    pub platform: Provider,
    /// Channel that produced the message.
    #[schema(value_type = uuid::Uuid)]
    pub channel_id: ChannelId,
    /// Chat room or login on the platform.
    pub destination: String,
    /// Message body forwarded to the chat bridge.
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
}

/// Response body for `POST /api/v1/outbox` (202 Accepted).
#[derive(Debug, Serialize, ToSchema)]
pub struct EnqueueResponse {
    /// Outbox row id.
    pub id: Uuid,
    /// Initial status.
    #[schema(value_type = String, example = "pending")]
    pub status: OutboxStatus,
}
