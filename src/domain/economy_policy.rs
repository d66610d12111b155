//! Bonus eligibility rules: pure functions over [`BonusState`],
//! [`EconomySettings`] and a [`StreamSnapshot`].
//!
//! Nothing here touches storage. The economy service evaluates these
//! decisions inside the same serializable transaction that holds the
//! wallet row lock and then persists the updated [`BonusState`].

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::{BonusState, EconomySettings, StreamSnapshot, StreamState};

/// Neutral multiplier in basis points.
pub const BPS_ONE: i64 = 10_000;

/// Typed, non-retriable rejection of a bonus claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ClaimRejection {
    /// The previous claim is too recent.
    CooldownActive {
        /// Whole seconds until the next claim is allowed (always > 0).
        retry_after_seconds: i64,
    },
    /// The per-stream-session claim cap is exhausted.
    LimitReached {
        /// Configured cap.
        limit: u32,
    },
    /// The bonus cannot be claimed right now (e.g. stream offline).
    Unavailable {
        /// Short machine-readable detail.
        detail: String,
    },
}

/// Outcome of a successful daily bonus evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyDecision {
    /// Coins to grant.
    pub coins: i64,
    /// Streak length including this claim.
    pub streak: u32,
    /// Multiplier applied, in basis points.
    pub multiplier_bps: i64,
}

/// Outcome of a successful watch bonus evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchDecision {
    /// Coins to grant.
    pub coins: i64,
    /// Session the claim is counted against.
    pub session_id: String,
    /// Claims in the session including this one.
    pub claims_in_session: u32,
}

/// Seconds left on a cooldown, or `None` when the cooldown has elapsed.
#[must_use]
pub fn cooldown_remaining(
    last_claim_at: Option<DateTime<Utc>>,
    cooldown_secs: i64,
    now: DateTime<Utc>,
) -> Option<i64> {
    let last = last_claim_at?;
    let cooldown_secs = cooldown_secs.max(0);
    // Out-of-range cooldowns never elapse.
    let Some(ready_at) =
        Duration::try_seconds(cooldown_secs).and_then(|d| last.checked_add_signed(d))
    else {
        return Some(cooldown_secs);
    };
    if now >= ready_at {
        return None;
    }
    let millis = (ready_at - now).num_milliseconds();
    // Round up so a client retrying after exactly this many seconds succeeds.
    Some(((millis + 999) / 1000).max(1))
}

/// Daily amount before the streak multiplier.
#[must_use]
pub fn daily_bonus_base(settings: &EconomySettings, recent_stream_minutes: i64) -> i64 {
    let hours = recent_stream_minutes.max(0) / 60;
    settings
        .daily_bonus_base_coins
        .saturating_add(hours.saturating_mul(settings.daily_bonus_coins_per_stream_hour))
        .min(settings.daily_bonus_max_coins)
        .max(0)
}

/// Streak length after a claim at `now`.
#[must_use]
pub fn next_streak(
    settings: &EconomySettings,
    last_claim_at: Option<DateTime<Utc>>,
    previous_streak: u32,
    now: DateTime<Utc>,
) -> u32 {
    let window = Duration::try_seconds(
        settings
            .daily_bonus_cooldown_secs
            .saturating_add(settings.streak_grace_secs),
    );
    match last_claim_at {
        Some(last) if window.is_none_or(|w| now - last <= w) => previous_streak.saturating_add(1),
        _ => 1,
    }
}

/// Capped multiplier for a streak, in basis points.
#[must_use]
pub fn streak_multiplier_bps(settings: &EconomySettings, streak: u32) -> i64 {
    let steps = i64::from(streak.saturating_sub(1));
    BPS_ONE
        .saturating_add(settings.streak_step_bps.saturating_mul(steps))
        .min(settings.streak_max_multiplier_bps.max(BPS_ONE))
}

/// Evaluates a daily bonus claim.
///
/// # Errors
///
/// Returns [`ClaimRejection::CooldownActive`] while the cooldown runs.
pub fn evaluate_daily(
    settings: &EconomySettings,
    state: &BonusState,
    snapshot: &StreamSnapshot,
    now: DateTime<Utc>,
) -> Result<DailyDecision, ClaimRejection> {
    if let Some(retry_after_seconds) =
        cooldown_remaining(state.last_daily_claim_at, settings.daily_bonus_cooldown_secs, now)
    {
        return Err(ClaimRejection::CooldownActive {
            retry_after_seconds,
        });
    }
    let streak = next_streak(settings, state.last_daily_claim_at, state.daily_streak, now);
    let multiplier_bps = streak_multiplier_bps(settings, streak);
    let base = daily_bonus_base(settings, snapshot.recent_stream_minutes);
    let coins = base.saturating_mul(multiplier_bps) / BPS_ONE;
    Ok(DailyDecision {
        coins,
        streak,
        multiplier_bps,
    })
}

/// Records an accepted daily claim in the state.
pub fn apply_daily(state: &mut BonusState, decision: &DailyDecision, now: DateTime<Utc>) {
    state.last_daily_claim_at = Some(now);
    state.daily_streak = decision.streak;
}

/// Evaluates a watch bonus claim.
///
/// # Errors
///
/// Returns [`ClaimRejection::Unavailable`] when the stream is offline,
/// [`ClaimRejection::LimitReached`] when the session cap is exhausted and
/// [`ClaimRejection::CooldownActive`] while the cooldown runs.
pub fn evaluate_watch(
    settings: &EconomySettings,
    state: &BonusState,
    snapshot: &StreamSnapshot,
    now: DateTime<Utc>,
) -> Result<WatchDecision, ClaimRejection> {
    let session_id = match (snapshot.status, snapshot.session_id.as_deref()) {
        (StreamState::Online, Some(id)) if !id.is_empty() => id,
        _ => {
            return Err(ClaimRejection::Unavailable {
                detail: "stream_offline".to_string(),
            });
        }
    };

    let claims_so_far = if state.watch_session_id.as_deref() == Some(session_id) {
        state.watch_claims_in_session
    } else {
        0
    };
    if claims_so_far >= settings.max_watch_claims_per_stream {
        return Err(ClaimRejection::LimitReached {
            limit: settings.max_watch_claims_per_stream,
        });
    }
    if let Some(retry_after_seconds) =
        cooldown_remaining(state.last_watch_claim_at, settings.watch_bonus_cooldown_secs, now)
    {
        return Err(ClaimRejection::CooldownActive {
            retry_after_seconds,
        });
    }

    Ok(WatchDecision {
        coins: settings.watch_bonus_coins.max(0),
        session_id: session_id.to_string(),
        claims_in_session: claims_so_far.saturating_add(1),
    })
}

/// Records an accepted watch claim in the state.
pub fn apply_watch(state: &mut BonusState, decision: &WatchDecision, now: DateTime<Utc>) {
    state.last_watch_claim_at = Some(now);
    state.watch_session_id = Some(decision.session_id.clone());
    state.watch_claims_in_session = decision.claims_in_session;
}
