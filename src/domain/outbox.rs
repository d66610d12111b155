//! Durable outbound chat messages.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ChannelId, Provider};

/// Delivery state of an outbox row.
///
/// `Pending → Processing → {Sent | Pending (retry) | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Delivered.
    Sent,
    /// Gave up after too many attempts.
    Failed,
}

impl OutboxStatus {
    /// Returns the status as stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// One outbound message row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    /// Row id.
    pub id: Uuid,
    /// Target platform.
    pub platform: Provider,
    /// Channel that produced the message.
    pub channel_id: ChannelId,
    /// Chat room or login on the platform.
    pub destination: String,
    /// Message body as sent to the platform bridge.
    pub payload: serde_json::Value,
    /// Delivery state.
    pub status: OutboxStatus,
    /// Completed delivery attempts.
    pub attempts: i32,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Set when a worker claims the row.
    pub processing_at: Option<DateTime<Utc>>,
    /// Set when delivered.
    pub sent_at: Option<DateTime<Utc>>,
    /// Set when permanently failed.
    pub failed_at: Option<DateTime<Utc>>,
    /// Last delivery error.
    pub last_error: Option<String>,
}

impl OutboxMessage {
    /// Builds a fresh pending message.
    #[must_use]
    pub fn pending(
        platform: Provider,
        channel_id: ChannelId,
        destination: String,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            platform,
            channel_id,
            destination,
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            processing_at: None,
            sent_at: None,
            failed_at: None,
            last_error: None,
        }
    }

    /// Returns `true` if a worker may try to claim this row now.
    ///
    /// Pending rows are always claimable; processing rows only once their
    /// claim is older than `stale_before`.
    #[must_use]
    pub fn is_claimable(&self, stale_before: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => true,
            OutboxStatus::Processing => self.processing_at.is_some_and(|at| at < stale_before),
            OutboxStatus::Sent | OutboxStatus::Failed => false,
        }
    }
}
