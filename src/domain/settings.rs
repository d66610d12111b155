//! Per-channel reward and economy configuration, plus the stream-status
//! snapshot the policies are evaluated against.

use serde::{Deserialize, Serialize};

use super::{NormalizedReward, Provider};

/// Whether a reward may only be granted while the stream is live (or not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveRequirement {
    /// Granted regardless of stream state.
    #[default]
    Any,
    /// Granted only while the stream is online.
    OnlineOnly,
    /// Granted only while the stream is offline.
    OfflineOnly,
}

impl LiveRequirement {
    /// Returns `true` if the requirement holds for the given stream state.
    #[must_use]
    pub const fn is_met(&self, status: StreamState) -> bool {
        match self {
            Self::Any => true,
            Self::OnlineOnly => matches!(status, StreamState::Online),
            Self::OfflineOnly => matches!(status, StreamState::Offline),
        }
    }
}

/// Conversion rule from a provider event type to coins.
///
/// `coins = base_coins + amount * coins_per_unit + amount / units_per_coin`
/// (integer division; the last term only when `units_per_coin > 0`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardRule {
    /// Provider the rule applies to.
    pub provider: Provider,
    /// Normalized event type, e.g. `"cheer"`.
    pub event_type: String,
    /// Master switch.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Stream-state gate.
    #[serde(default)]
    pub live_requirement: LiveRequirement,
    /// Provider units per coin (e.g. bits per coin).
    #[serde(default)]
    pub units_per_coin: i64,
    /// Coins per provider unit (e.g. coins per gifted sub).
    #[serde(default)]
    pub coins_per_unit: i64,
    /// Flat coins per event.
    #[serde(default)]
    pub base_coins: i64,
    /// Events below this amount are ignored.
    #[serde(default)]
    pub min_units: i64,
    /// Only this channel-point reward id is honoured, if set.
    #[serde(default)]
    pub reward_id: Option<String>,
}

fn default_true() -> bool {
    true
}

impl RewardRule {
    /// Returns `true` if this rule covers the given normalized event.
    #[must_use]
    pub fn applies_to(&self, reward: &NormalizedReward) -> bool {
        self.provider == reward.provider && self.event_type == reward.event_type
    }

    /// Converts a provider amount into coins. Never negative.
    #[must_use]
    pub fn coins_for(&self, amount: i64) -> i64 {
        let amount = amount.max(0);
        let per_unit = amount.saturating_mul(self.coins_per_unit.max(0));
        let ratio = if self.units_per_coin > 0 {
            amount / self.units_per_coin
        } else {
            0
        };
        self.base_coins
            .max(0)
            .saturating_add(per_unit)
            .saturating_add(ratio)
    }
}

/// Coin amounts, cooldowns and limits of the channel's bonus economy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconomySettings {
    /// One-time grant on first wallet-touching action.
    pub start_bonus_coins: i64,
    /// Daily bonus before stream-hour scaling.
    pub daily_bonus_base_coins: i64,
    /// Extra daily coins per recent stream hour.
    pub daily_bonus_coins_per_stream_hour: i64,
    /// Upper bound of the daily amount before the streak multiplier.
    pub daily_bonus_max_coins: i64,
    /// Seconds between daily claims.
    pub daily_bonus_cooldown_secs: i64,
    /// Multiplier growth per streak day, in basis points.
    pub streak_step_bps: i64,
    /// Multiplier cap, in basis points.
    pub streak_max_multiplier_bps: i64,
    /// Extra seconds after the cooldown during which the streak survives.
    pub streak_grace_secs: i64,
    /// Coins per watch bonus claim.
    pub watch_bonus_coins: i64,
    /// Seconds between watch claims.
    pub watch_bonus_cooldown_secs: i64,
    /// Watch claims allowed per stream session.
    pub max_watch_claims_per_stream: u32,
}

impl Default for EconomySettings {
    fn default() -> Self {
        Self {
            start_bonus_coins: 100,
            daily_bonus_base_coins: 50,
            daily_bonus_coins_per_stream_hour: 5,
            daily_bonus_max_coins: 250,
            daily_bonus_cooldown_secs: 86_400,
            streak_step_bps: 1_000,
            streak_max_multiplier_bps: 20_000,
            streak_grace_secs: 86_400,
            watch_bonus_coins: 10,
            watch_bonus_cooldown_secs: 600,
            max_watch_claims_per_stream: 6,
        }
    }
}

/// Reward and economy configuration of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Public channel slug.
    pub slug: String,
    /// Conversion rules per provider event type.
    #[serde(default)]
    pub reward_rules: Vec<RewardRule>,
    /// Bonus economy settings.
    #[serde(default)]
    pub economy: EconomySettings,
}

impl ChannelSettings {
    /// Finds the rule for a normalized event.
    #[must_use]
    pub fn rule_for(&self, reward: &NormalizedReward) -> Option<&RewardRule> {
        self.reward_rules.iter().find(|r| r.applies_to(reward))
    }
}

/// Stream liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    /// Live.
    Online,
    /// Not live.
    #[default]
    Offline,
}

/// Eventually consistent view of a channel's stream.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamSnapshot {
    /// Liveness.
    pub status: StreamState,
    /// Current stream session id while online.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Minutes streamed recently, used to scale the daily bonus.
    #[serde(default)]
    pub recent_stream_minutes: i64,
}
