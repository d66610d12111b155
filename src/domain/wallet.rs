//! Wallet balances and per-wallet bonus bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChannelId, UserId, WalletKey};

/// Coin balance of one user in one channel.
///
/// Balances are whole coins and never negative in any committed state.
/// Rows are created lazily and never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    /// Wallet owner.
    pub user_id: UserId,
    /// Channel the coins belong to.
    pub channel_id: ChannelId,
    /// Current balance in coins.
    pub balance: i64,
    /// Timestamp of the last balance mutation.
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Zero-balance placeholder for display paths that must not create rows.
    #[must_use]
    pub fn empty(key: WalletKey) -> Self {
        Self {
            user_id: key.user_id,
            channel_id: key.channel_id,
            balance: 0,
            updated_at: Utc::now(),
        }
    }

    /// Returns the composite key of this wallet.
    #[must_use]
    pub const fn key(&self) -> WalletKey {
        WalletKey::new(self.user_id, self.channel_id)
    }
}

/// Claim history used by the economy policy for one wallet.
///
/// Read and written only after the wallet row lock is held, so the wallet
/// lock serializes every bonus decision for the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusState {
    /// Wallet this state belongs to.
    pub key: WalletKey,
    /// Whether the one-time start bonus has been paid out.
    pub start_bonus_granted: bool,
    /// Last successful daily bonus claim.
    pub last_daily_claim_at: Option<DateTime<Utc>>,
    /// Consecutive qualifying days, including the last claim.
    pub daily_streak: u32,
    /// Last successful watch bonus claim.
    pub last_watch_claim_at: Option<DateTime<Utc>>,
    /// Stream session the watch counter is bound to.
    pub watch_session_id: Option<String>,
    /// Watch bonus claims made in `watch_session_id`.
    pub watch_claims_in_session: u32,
}

impl BonusState {
    /// Fresh state for a wallet that has never claimed anything.
    #[must_use]
    pub const fn new(key: WalletKey) -> Self {
        Self {
            key,
            start_bonus_granted: false,
            last_daily_claim_at: None,
            daily_streak: 0,
            last_watch_claim_at: None,
            watch_session_id: None,
            watch_claims_in_session: 0,
        }
    }
}
