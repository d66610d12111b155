//! Provider-sourced reward events.
//!
//! Upstream webhook and polling adapters hand the ledger one
//! [`RewardDelivery`] per transport-level call. Each delivery carries one or
//! more [`IncomingReward`]s: either a parsed, provider-specific
//! [`RewardEventInput`] or the raw payload of something that failed to parse.
//! The recorder only ever consumes the normalized view ([`NormalizedReward`]).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::ChannelId;

/// Streaming platform a reward (or an outbound chat message) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Twitch (EventSub).
    Twitch,
    /// YouTube Live.
    Youtube,
    /// Kick.
    Kick,
    /// Trovo.
    Trovo,
    /// VK Video Live.
    Vkvideo,
}

impl Provider {
    /// All supported providers, in a stable order.
    pub const ALL: [Self; 5] = [
        Self::Twitch,
        Self::Youtube,
        Self::Kick,
        Self::Trovo,
        Self::Vkvideo,
    ];

    /// Returns the provider as a static string slice.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Twitch => "twitch",
            Self::Youtube => "youtube",
            Self::Kick => "kick",
            Self::Trovo => "trovo",
            Self::Vkvideo => "vkvideo",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown provider: {s}"))
    }
}

/// Lifecycle of a recorded reward event.
///
/// `Eligible → Claimed` happens at most once; `Ignored` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    /// May grant coins.
    Eligible,
    /// Coins were granted.
    Claimed,
    /// Recorded for audit only.
    Ignored,
}

impl RewardStatus {
    /// Returns the status as stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Eligible => "eligible",
            Self::Claimed => "claimed",
            Self::Ignored => "ignored",
        }
    }
}

impl FromStr for RewardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "eligible" => Ok(Self::Eligible),
            "claimed" => Ok(Self::Claimed),
            "ignored" => Ok(Self::Ignored),
            other => Err(format!("unknown reward status: {other}")),
        }
    }
}

/// Machine-readable reason attached to ignored reward events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// No rule configured for this event type, or the rule is disabled.
    RewardDisabled,
    /// The rule's online/offline requirement was not met.
    LiveRestriction,
    /// The provider amount is below the rule's minimum.
    BelowMinimum,
    /// The conversion produced zero coins.
    ZeroCoins,
    /// The platform account is not linked to an internal user.
    IdentityUnresolved,
    /// The payload did not name a platform account.
    AccountMissing,
    /// Channel-point redemption for a different reward than configured.
    RewardIdMismatch,
    /// The redemption was canceled on the platform side.
    RedemptionNotFulfilled,
    /// The payload could not be parsed.
    MalformedPayload,
}

impl IgnoreReason {
    /// Returns the reason code as stored in the database.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RewardDisabled => "reward_disabled",
            Self::LiveRestriction => "live_restriction",
            Self::BelowMinimum => "below_minimum",
            Self::ZeroCoins => "zero_coins",
            Self::IdentityUnresolved => "identity_unresolved",
            Self::AccountMissing => "account_missing",
            Self::RewardIdMismatch => "reward_id_mismatch",
            Self::RedemptionNotFulfilled => "redemption_not_fulfilled",
            Self::MalformedPayload => "malformed_payload",
        }
    }
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields shared by every provider's reward payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardCommon {
    /// Event id supplied by the platform, if any.
    #[serde(default)]
    pub provider_event_id: Option<String>,
    /// Platform account of the viewer who triggered the reward.
    #[serde(default)]
    pub provider_account_id: Option<String>,
    /// When the platform says the event happened.
    pub event_at: DateTime<Utc>,
    /// Original payload retained for audit and replay.
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

/// Twitch reward kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TwitchKind {
    /// Bits cheer.
    Cheer {
        /// Bits cheered.
        bits: i64,
    },
    /// New or resubscription.
    Subscription {
        /// Tier string (`"1000"`, `"2000"`, `"3000"`).
        tier: String,
    },
    /// Community gift subscriptions.
    GiftSubscriptions {
        /// Tier string.
        tier: String,
        /// Number of subscriptions gifted.
        count: i64,
    },
    /// Incoming raid.
    Raid {
        /// Viewers brought by the raid.
        viewers: i64,
    },
    /// Channel-point redemption.
    ChannelPoints {
        /// Custom reward id.
        reward_id: String,
        /// Points spent.
        cost: i64,
        /// Redemption status reported by the platform.
        #[serde(default)]
        status: Option<String>,
    },
}

/// YouTube reward kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum YoutubeKind {
    /// Paid chat message.
    SuperChat {
        /// Amount in micros of `currency`.
        amount_micros: i64,
        /// ISO currency code.
        currency: String,
    },
    /// New channel membership.
    Membership {
        /// Membership level name.
        #[serde(default)]
        level: Option<String>,
    },
}

/// Kick reward kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KickKind {
    /// Kicks gifted to the streamer.
    KicksGifted {
        /// Kicks amount.
        amount: i64,
    },
    /// New subscription.
    Subscription,
    /// Gifted subscriptions.
    GiftSubscriptions {
        /// Number of subscriptions gifted.
        count: i64,
    },
    /// Channel reward redemption.
    RewardRedemption {
        /// Reward id.
        reward_id: String,
        /// Points spent.
        cost: i64,
        /// Redemption status reported by the platform.
        #[serde(default)]
        status: Option<String>,
    },
}

/// Trovo reward kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrovoKind {
    /// Spell cast with mana or elixir.
    Spell {
        /// Spell value.
        value: i64,
        /// `"mana"` or `"elixir"`.
        currency: String,
    },
    /// Subscription.
    Subscription {
        /// Tier string.
        #[serde(default)]
        tier: Option<String>,
    },
    /// Incoming raid.
    Raid {
        /// Viewers brought by the raid.
        viewers: i64,
    },
}

/// VK Video reward kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VkVideoKind {
    /// Channel-point redemption.
    ChannelPoints {
        /// Reward id.
        reward_id: String,
        /// Points spent.
        cost: i64,
        /// Redemption status reported by the platform.
        #[serde(default)]
        status: Option<String>,
    },
}

/// A provider event with its provider-specific kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent<K> {
    /// Shared envelope fields.
    #[serde(flatten)]
    pub common: RewardCommon,
    /// Provider-specific kind.
    pub kind: K,
}

/// Parsed reward event, one variant per provider.
#[derive(Debug, Clone, PartialEq)]
pub enum RewardEventInput {
    /// Twitch event.
    Twitch(ProviderEvent<TwitchKind>),
    /// YouTube event.
    Youtube(ProviderEvent<YoutubeKind>),
    /// Kick event.
    Kick(ProviderEvent<KickKind>),
    /// Trovo event.
    Trovo(ProviderEvent<TrovoKind>),
    /// VK Video event.
    Vkvideo(ProviderEvent<VkVideoKind>),
}

/// Provider-independent view of a reward event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedReward {
    /// Source platform.
    pub provider: Provider,
    /// Event type, e.g. `"cheer"` or `"channel_points"`.
    pub event_type: &'static str,
    /// Provider unit of `amount`, e.g. `"bits"` or `"points"`.
    pub currency: String,
    /// Raw amount in provider units.
    pub amount: i64,
    /// Channel-point reward id, when applicable.
    pub reward_id: Option<String>,
    /// Redemption status, when applicable.
    pub status: Option<String>,
}

impl RewardEventInput {
    /// Parses a JSON event for the given provider.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the payload does not match the
    /// provider's schema.
    pub fn from_value(
        provider: Provider,
        value: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(match provider {
            Provider::Twitch => Self::Twitch(serde_json::from_value(value)?),
            Provider::Youtube => Self::Youtube(serde_json::from_value(value)?),
            Provider::Kick => Self::Kick(serde_json::from_value(value)?),
            Provider::Trovo => Self::Trovo(serde_json::from_value(value)?),
            Provider::Vkvideo => Self::Vkvideo(serde_json::from_value(value)?),
        })
    }

    /// Returns the provider this event came from.
    #[must_use]
    pub const fn provider(&self) -> Provider {
        match self {
            Self::Twitch(_) => Provider::Twitch,
            Self::Youtube(_) => Provider::Youtube,
            Self::Kick(_) => Provider::Kick,
            Self::Trovo(_) => Provider::Trovo,
            Self::Vkvideo(_) => Provider::Vkvideo,
        }
    }

    /// Returns the shared envelope fields.
    #[must_use]
    pub const fn common(&self) -> &RewardCommon {
        match self {
            Self::Twitch(e) => &e.common,
            Self::Youtube(e) => &e.common,
            Self::Kick(e) => &e.common,
            Self::Trovo(e) => &e.common,
            Self::Vkvideo(e) => &e.common,
        }
    }

    /// Collapses the provider-specific kind into a [`NormalizedReward`].
    #[must_use]
    pub fn normalize(&self) -> NormalizedReward {
        let provider = self.provider();
        let (event_type, currency, amount, reward_id, status) = match self {
            Self::Twitch(e) => match &e.kind {
                TwitchKind::Cheer { bits } => ("cheer", "bits".to_string(), *bits, None, None),
                TwitchKind::Subscription { .. } => {
                    ("subscription", "subs".to_string(), 1, None, None)
                }
                TwitchKind::GiftSubscriptions { count, .. } => {
                    ("gift_subscriptions", "subs".to_string(), *count, None, None)
                }
                TwitchKind::Raid { viewers } => ("raid", "viewers".to_string(), *viewers, None, None),
                TwitchKind::ChannelPoints {
                    reward_id,
                    cost,
                    status,
                } => (
                    "channel_points",
                    "points".to_string(),
                    *cost,
                    Some(reward_id.clone()),
                    status.clone(),
                ),
            },
            Self::Youtube(e) => match &e.kind {
                YoutubeKind::SuperChat {
                    amount_micros,
                    currency,
                } => ("super_chat", currency.clone(), *amount_micros, None, None),
                YoutubeKind::Membership { .. } => {
                    ("membership", "members".to_string(), 1, None, None)
                }
            },
            Self::Kick(e) => match &e.kind {
                KickKind::KicksGifted { amount } => {
                    ("kicks_gifted", "kicks".to_string(), *amount, None, None)
                }
                KickKind::Subscription => ("subscription", "subs".to_string(), 1, None, None),
                KickKind::GiftSubscriptions { count } => {
                    ("gift_subscriptions", "subs".to_string(), *count, None, None)
                }
                KickKind::RewardRedemption {
                    reward_id,
                    cost,
                    status,
                } => (
                    "channel_points",
                    "points".to_string(),
                    *cost,
                    Some(reward_id.clone()),
                    status.clone(),
                ),
            },
            Self::Trovo(e) => match &e.kind {
                TrovoKind::Spell { value, currency } => ("spell", currency.clone(), *value, None, None),
                TrovoKind::Subscription { .. } => {
                    ("subscription", "subs".to_string(), 1, None, None)
                }
                TrovoKind::Raid { viewers } => ("raid", "viewers".to_string(), *viewers, None, None),
            },
            Self::Vkvideo(e) => match &e.kind {
                VkVideoKind::ChannelPoints {
                    reward_id,
                    cost,
                    status,
                } => (
                    "channel_points",
                    "points".to_string(),
                    *cost,
                    Some(reward_id.clone()),
                    status.clone(),
                ),
            },
        };
        NormalizedReward {
            provider,
            event_type,
            currency,
            amount,
            reward_id,
            status,
        }
    }

    /// Returns the stable business key of this event.
    ///
    /// Uses the platform-supplied id when present, otherwise a fallback
    /// hash over the payload and disambiguating fields.
    #[must_use]
    pub fn event_key(&self, channel_id: ChannelId) -> String {
        let common = self.common();
        if let Some(id) = common.provider_event_id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let normalized = self.normalize();
        fallback_event_id(&FallbackKeyParts {
            provider: normalized.provider,
            channel_id,
            account_id: common.provider_account_id.as_deref(),
            reward_id: normalized.reward_id.as_deref(),
            amount: normalized.amount,
            status: normalized.status.as_deref(),
            raw_payload: &common.raw_payload,
        })
    }
}

/// One event inside a delivery: parsed, or kept raw when parsing failed.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingReward {
    /// Successfully parsed event.
    Parsed(RewardEventInput),
    /// Payload the adapter could not parse.
    Malformed {
        /// Payload as received.
        raw_payload: serde_json::Value,
        /// Parser error message.
        detail: String,
    },
}

impl IncomingReward {
    /// Parses a raw JSON event, keeping it as [`IncomingReward::Malformed`]
    /// on failure instead of raising.
    #[must_use]
    pub fn from_value(provider: Provider, value: serde_json::Value) -> Self {
        match RewardEventInput::from_value(provider, value.clone()) {
            Ok(event) => Self::Parsed(event),
            Err(e) => Self::Malformed {
                raw_payload: value,
                detail: e.to_string(),
            },
        }
    }
}

/// A single transport-level delivery (one webhook call or poll result).
#[derive(Debug, Clone, PartialEq)]
pub struct RewardDelivery {
    /// Source platform.
    pub provider: Provider,
    /// Transport-level message id used for delivery dedup.
    pub delivery_id: String,
    /// Channel the delivery was addressed to.
    pub channel_id: ChannelId,
    /// Public slug of the channel, used for realtime routing.
    pub channel_slug: String,
    /// Events carried by the delivery.
    pub events: Vec<IncomingReward>,
}

/// Inputs to the fallback event key.
#[derive(Debug, Clone, Copy)]
pub struct FallbackKeyParts<'a> {
    /// Source platform.
    pub provider: Provider,
    /// Channel the event belongs to.
    pub channel_id: ChannelId,
    /// Platform account, if known.
    pub account_id: Option<&'a str>,
    /// Reward id, if any.
    pub reward_id: Option<&'a str>,
    /// Raw amount.
    pub amount: i64,
    /// Redemption status, if any.
    pub status: Option<&'a str>,
    /// Event payload (envelope ids excluded).
    pub raw_payload: &'a serde_json::Value,
}

/// Derives a deterministic event key from the payload and disambiguating
/// fields.
///
/// The canonical form is a JSON object with sorted keys, so the same
/// physical event always hashes to the same key regardless of field order.
#[must_use]
pub fn fallback_event_id(parts: &FallbackKeyParts<'_>) -> String {
    let canonical = serde_json::json!({
        "provider": parts.provider.as_str(),
        "channel_id": parts.channel_id.to_string(),
        "account_id": parts.account_id,
        "reward_id": parts.reward_id,
        "amount": parts.amount,
        "status": parts.status,
        "payload": parts.raw_payload,
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    format!("fb_{}", hex::encode(digest))
}
