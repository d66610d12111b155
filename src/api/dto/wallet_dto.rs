//! Wallet DTOs: balance reads, claims, spending and admin overrides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::domain::Wallet;

/// Wallet view returned by every wallet endpoint.
#[derive(Debug, Serialize, ToSchema)]
pub struct WalletResponse {
    /// Wallet owner.
    pub user_id: Uuid,
    /// Channel of the wallet.
    pub channel_id: Uuid,
    /// Balance in coins.
    pub balance: i64,
    /// Last mutation time (creation time for untouched wallets).
    pub updated_at: DateTime<Utc>,
}

impl From<Wallet> for WalletResponse {
    fn from(wallet: Wallet) -> Self {
        Self {
            user_id: wallet.user_id.into(),
            channel_id: wallet.channel_id.into(),
            balance: wallet.balance,
            updated_at: wallet.updated_at,
        }
    }
}

/// Request body for `POST …/spend`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SpendRequest {
    /// Coins to spend; must be positive.
    pub cost: i64,
}

/// How an admin adjustment applies its amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentMode {
    /// Add `amount` (may be negative) to the balance.
    Delta,
    /// Overwrite the balance with `amount`.
    Set,
}

/// Request body for `POST …/adjustments`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct AdjustmentRequest {
    /// Delta or absolute value.
    pub mode: AdjustmentMode,
    /// Coins.
    pub amount: i64,
}
