//! Database models for reward events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ChannelId, Provider, RewardStatus, UserId};

/// A row of the `external_reward_events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardEventRecord {
    /// Row id.
    pub id: Uuid,
    /// Source platform.
    pub provider: Provider,
    /// Platform-supplied or fallback event key.
    pub provider_event_id: String,
    /// Channel the event belongs to.
    pub channel_id: ChannelId,
    /// Viewer's platform account.
    pub provider_account_id: Option<String>,
    /// Resolved internal user, if linked.
    pub linked_user_id: Option<UserId>,
    /// Normalized event type.
    pub event_type: String,
    /// Provider unit of `amount`.
    pub currency: String,
    /// Raw amount in provider units.
    pub amount: i64,
    /// Coins computed from the channel's rules.
    pub coins_to_grant: i64,
    /// Lifecycle status.
    pub status: RewardStatus,
    /// Ignore reason code, when ignored.
    pub reason: Option<String>,
    /// Event time reported by the platform.
    pub event_at: DateTime<Utc>,
    /// Payload retained for audit and replay.
    pub raw_payload: serde_json::Value,
    /// Insert time.
    pub created_at: DateTime<Utc>,
    /// Set when the grant happened.
    pub claimed_at: Option<DateTime<Utc>>,
}
