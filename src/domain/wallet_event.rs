//! Balance-change notifications for realtime clients.
//!
//! Every committed wallet mutation produces a [`WalletUpdateEvent`]. Events
//! are staged in a [`crate::service::TxEventBuffer`] while the transaction
//! is open and only reach the [`super::EventBus`] after commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChannelId, UserId, WalletKey};

/// Why a balance changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletUpdateReason {
    /// One-time welcome grant for a new (user, channel) pair.
    StartBonus,
    /// Provider reward event claimed.
    Reward,
    /// Daily bonus claimed.
    DailyBonus,
    /// Watch bonus claimed.
    WatchBonus,
    /// Coins spent (e.g. meme activation).
    Spend,
    /// Manual balance override or adjustment.
    AdminAdjustment,
}

/// Notification that a wallet balance changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletUpdateEvent {
    /// Wallet owner.
    pub user_id: UserId,
    /// Channel of the wallet.
    pub channel_id: ChannelId,
    /// Channel slug for clients that route by slug.
    #[serde(default)]
    pub channel_slug: Option<String>,
    /// Balance after the change.
    pub balance: i64,
    /// Signed change applied.
    pub delta: i64,
    /// Why the balance changed.
    pub reason: WalletUpdateReason,
    /// Instance that performed the mutation.
    pub origin_instance: String,
    /// When the mutation was staged.
    pub timestamp: DateTime<Utc>,
}

impl WalletUpdateEvent {
    /// Returns the wallet key this event refers to.
    #[must_use]
    pub const fn key(&self) -> WalletKey {
        WalletKey::new(self.user_id, self.channel_id)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn serializes_reason_in_snake_case() {
        let event = WalletUpdateEvent {
            user_id: UserId::new(),
            channel_id: ChannelId::new(),
            channel_slug: Some("streamer".to_string()),
            balance: 110,
            delta: 10,
            reason: WalletUpdateReason::DailyBonus,
            origin_instance: "a".to_string(),
            timestamp: Utc::now(),
        };
        let Ok(json) = serde_json::to_string(&event) else {
            panic!("serialization failed");
        };
        assert!(json.contains("\"daily_bonus\""));
        assert!(json.contains("\"balance\":110"));
    }
}
