//! Reward event recorder: the single entry point for provider deliveries.
//!
//! Rule evaluation and identity lookups happen before the transaction.
//! The transaction itself, retried on conflict, does:
//!
//! 1. delivery dedup by `(provider, delivery_id)`; a duplicate delivery
//!    short-circuits with no further writes
//! 2. conflict-ignoring insert of each event by `(provider, provider_event_id)`;
//!    an event seen before reports its stored state and grants nothing
//! 3. for new eligible events: wallet lock, increment, `claimed` mark and a
//!    staged wallet event
//! 4. new ignored events are stored with their reason
//!
//! Staged events are published only once the commit succeeded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::reward::{FallbackKeyParts, fallback_event_id};
use crate::domain::{
    ChannelSettings, IgnoreReason, IncomingReward, NormalizedReward, RewardDelivery,
    RewardEventInput, RewardStatus, StreamSnapshot, UserId, WalletKey, WalletUpdateEvent,
    WalletUpdateReason,
};
use crate::error::LedgerError;
use crate::persistence::RewardEventRecord;
use crate::resilience::{RetryPolicy, with_retry};
use crate::service::balance_relay::BalanceRelay;
use crate::service::collaborators::{
    ChannelSettingsSource, IdentityResolver, StreamStatusSource,
};
use crate::service::economy::lock_with_start_bonus;
use crate::service::tx_events::{CommittedEvents, EventStamp, TxEventBuffer};
use crate::service::wallet_ledger::WalletLedger;

/// What happened to one event of a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedEvent {
    /// Business key the event was stored under.
    pub provider_event_id: String,
    /// Stored status.
    pub status: RewardStatus,
    /// Ignore reason, when ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Coins granted by this delivery (zero for replays).
    pub coins_granted: i64,
    /// `true` if the event had already been recorded by an earlier delivery.
    pub already_recorded: bool,
}

/// Result of recording one delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordOutcome {
    /// `true` if the delivery id had been seen before; nothing was written.
    pub duplicate: bool,
    /// Per-event results, in delivery order.
    pub events: Vec<RecordedEvent>,
    /// Wallet events the delivery committed.
    pub claimed_wallet_events: Vec<WalletUpdateEvent>,
}

/// An event evaluated against channel rules, ready to insert.
#[derive(Debug, Clone)]
struct PreparedEvent {
    record: RewardEventRecord,
}

/// Evaluates a normalized event against the channel's rules.
///
/// Returns the recipient and the coins to grant, or the first failing
/// check in a fixed order so the same event always reports the same
/// reason.
fn evaluate(
    settings: &ChannelSettings,
    snapshot: &StreamSnapshot,
    reward: &NormalizedReward,
    account_id: Option<&str>,
    user: Option<UserId>,
) -> Result<(UserId, i64), IgnoreReason> {
    let Some(rule) = settings.rule_for(reward).filter(|r| r.enabled) else {
        return Err(IgnoreReason::RewardDisabled);
    };
    if rule
        .reward_id
        .as_deref()
        .is_some_and(|expected| reward.reward_id.as_deref() != Some(expected))
    {
        return Err(IgnoreReason::RewardIdMismatch);
    }
    if reward
        .status
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("canceled"))
    {
        return Err(IgnoreReason::RedemptionNotFulfilled);
    }
    if !rule.live_requirement.is_met(snapshot.status) {
        return Err(IgnoreReason::LiveRestriction);
    }
    if reward.amount < rule.min_units {
        return Err(IgnoreReason::BelowMinimum);
    }
    let coins = rule.coins_for(reward.amount);
    if coins <= 0 {
        return Err(IgnoreReason::ZeroCoins);
    }
    if account_id.is_none() {
        return Err(IgnoreReason::AccountMissing);
    }
    let user = user.ok_or(IgnoreReason::IdentityUnresolved)?;
    Ok((user, coins))
}

/// Records provider deliveries and grants coins exactly once per event.
#[derive(Debug, Clone)]
pub struct RewardRecorder {
    ledger: Arc<WalletLedger>,
    identities: Arc<dyn IdentityResolver>,
    streams: Arc<dyn StreamStatusSource>,
    channels: Arc<dyn ChannelSettingsSource>,
    relay: BalanceRelay,
    retry: RetryPolicy,
}

impl RewardRecorder {
    /// Creates the recorder.
    #[must_use]
    pub fn new(
        ledger: Arc<WalletLedger>,
        identities: Arc<dyn IdentityResolver>,
        streams: Arc<dyn StreamStatusSource>,
        channels: Arc<dyn ChannelSettingsSource>,
        relay: BalanceRelay,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            identities,
            streams,
            channels,
            relay,
            retry,
        }
    }

    /// Records a delivery and claims every eligible event in it.
    ///
    /// Malformed events never fail the call; they are stored as ignored
    /// with reason `malformed_payload`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidRequest`] for an empty delivery id and
    /// [`LedgerError::Store`] when persistence fails (after conflict
    /// retries). Nothing is published in either case.
    pub async fn record_and_maybe_claim(
        &self,
        delivery: &RewardDelivery,
    ) -> Result<RecordOutcome, LedgerError> {
        if delivery.delivery_id.trim().is_empty() {
            return Err(LedgerError::InvalidRequest(
                "delivery_id must not be empty".to_string(),
            ));
        }
        let settings = self
            .channels
            .channel_settings(delivery.channel_id)
            .await?
            .unwrap_or_else(|| ChannelSettings {
                slug: delivery.channel_slug.clone(),
                ..ChannelSettings::default()
            });
        let snapshot = self.streams.stream_status(&delivery.channel_slug).await?;
        let now = Utc::now();

        let mut prepared = Vec::with_capacity(delivery.events.len());
        for incoming in &delivery.events {
            prepared.push(self.prepare(delivery, &settings, &snapshot, incoming, now).await?);
        }

        let (prepared_ref, settings_ref) = (&prepared, &settings);
        let (mut outcome, committed) = with_retry(&self.retry, move |_| {
            self.attempt(delivery, settings_ref, prepared_ref, now)
        })
        .await?;

        outcome.claimed_wallet_events = committed.events().to_vec();
        tracing::info!(
            provider = %delivery.provider,
            delivery_id = %delivery.delivery_id,
            channel = %delivery.channel_id,
            duplicate = outcome.duplicate,
            events = outcome.events.len(),
            claimed = outcome.events.iter().filter(|e| e.coins_granted > 0).count(),
            "reward delivery recorded"
        );
        self.relay.publish(committed);
        Ok(outcome)
    }

    async fn prepare(
        &self,
        delivery: &RewardDelivery,
        settings: &ChannelSettings,
        snapshot: &StreamSnapshot,
        incoming: &IncomingReward,
        now: DateTime<Utc>,
    ) -> Result<PreparedEvent, LedgerError> {
        let event = match incoming {
            IncomingReward::Parsed(event) => event,
            IncomingReward::Malformed {
                raw_payload,
                detail,
            } => {
                tracing::warn!(
                    provider = %delivery.provider,
                    delivery_id = %delivery.delivery_id,
                    %detail,
                    "malformed reward payload recorded as ignored"
                );
                return Ok(malformed_event(delivery, raw_payload, now));
            }
        };

        let reward = event.normalize();
        let common = event.common();
        let account_id = common
            .provider_account_id
            .as_deref()
            .filter(|a| !a.is_empty());
        let user = match account_id {
            Some(account) => {
                self.identities
                    .resolve_internal_user_id(reward.provider, account)
                    .await?
            }
            None => None,
        };
        // Ignored rows record zero coins.
        let (status, coins, reason) = match evaluate(settings, snapshot, &reward, account_id, user) {
            Ok((_, coins)) => (RewardStatus::Eligible, coins, None),
            Err(reason) => (RewardStatus::Ignored, 0, Some(reason.as_str().to_string())),
        };

        Ok(PreparedEvent {
            record: build_record(delivery, event, &reward, user, coins, status, reason, now),
        })
    }

    async fn attempt(
        &self,
        delivery: &RewardDelivery,
        settings: &ChannelSettings,
        prepared: &[PreparedEvent],
        now: DateTime<Utc>,
    ) -> Result<(RecordOutcome, CommittedEvents), LedgerError> {
        let mut tx = self.ledger.store().begin().await?;
        let mut buffer = TxEventBuffer::new();

        if tx
            .insert_delivery(delivery.provider, &delivery.delivery_id, now)
            .await?
            == 0
        {
            tx.rollback().await?;
            tracing::debug!(
                provider = %delivery.provider,
                delivery_id = %delivery.delivery_id,
                "duplicate delivery ignored"
            );
            let outcome = RecordOutcome {
                duplicate: true,
                ..RecordOutcome::default()
            };
            return Ok((outcome, CommittedEvents::default()));
        }

        let stamp = EventStamp {
            channel_slug: Some(delivery.channel_slug.as_str()).filter(|s| !s.is_empty()),
            origin_instance: self.relay.instance_id(),
        };
        let mut outcome = RecordOutcome::default();
        let mut linked = false;

        for PreparedEvent { record } in prepared {
            if tx.insert_reward_event(record).await? == 0 {
                let existing = tx
                    .find_reward_event(record.provider, &record.provider_event_id)
                    .await?;
                let (status, reason, id) = existing.map_or(
                    (record.status, record.reason.clone(), record.id),
                    |e| (e.status, e.reason, e.id),
                );
                if !linked {
                    tx.link_delivery_event(delivery.provider, &delivery.delivery_id, id)
                        .await?;
                    linked = true;
                }
                tracing::debug!(
                    provider_event_id = %record.provider_event_id,
                    status = status.as_str(),
                    "reward event already recorded"
                );
                outcome.events.push(RecordedEvent {
                    provider_event_id: record.provider_event_id.clone(),
                    status,
                    reason,
                    coins_granted: 0,
                    already_recorded: true,
                });
                continue;
            }
            if !linked {
                tx.link_delivery_event(delivery.provider, &delivery.delivery_id, record.id)
                    .await?;
                linked = true;
            }

            let granted = match (record.status, record.linked_user_id) {
                (RewardStatus::Eligible, Some(user_id)) if record.coins_to_grant > 0 => {
                    let key = WalletKey::new(user_id, record.channel_id);
                    let locked = lock_with_start_bonus(
                        &self.ledger,
                        tx.as_mut(),
                        key,
                        &settings.economy,
                        stamp,
                        &mut buffer,
                    )
                    .await?;
                    let coins = record.coins_to_grant;
                    if let Some(wallet) = self
                        .ledger
                        .increment_balance(tx.as_mut(), key, coins, Some(&locked.wallet))
                        .await?
                    {
                        buffer.stage(stamp.event(&wallet, coins, WalletUpdateReason::Reward));
                    }
                    tx.mark_reward_claimed(record.id, now).await?;
                    coins
                }
                _ => 0,
            };

            outcome.events.push(RecordedEvent {
                provider_event_id: record.provider_event_id.clone(),
                status: if granted > 0 {
                    RewardStatus::Claimed
                } else {
                    record.status
                },
                reason: record.reason.clone(),
                coins_granted: granted,
                already_recorded: false,
            });
        }

        let committed = buffer.commit(tx).await?;
        Ok((outcome, committed))
    }
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    delivery: &RewardDelivery,
    event: &RewardEventInput,
    reward: &NormalizedReward,
    user: Option<UserId>,
    coins: i64,
    status: RewardStatus,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> RewardEventRecord {
    let common = event.common();
    RewardEventRecord {
        id: Uuid::new_v4(),
        provider: reward.provider,
        provider_event_id: event.event_key(delivery.channel_id),
        channel_id: delivery.channel_id,
        provider_account_id: common.provider_account_id.clone(),
        linked_user_id: user,
        event_type: reward.event_type.to_string(),
        currency: reward.currency.clone(),
        amount: reward.amount,
        coins_to_grant: coins,
        status,
        reason,
        event_at: common.event_at,
        raw_payload: common.raw_payload.clone(),
        created_at: now,
        claimed_at: None,
    }
}

fn malformed_event(
    delivery: &RewardDelivery,
    raw_payload: &serde_json::Value,
    now: DateTime<Utc>,
) -> PreparedEvent {
    let key = fallback_event_id(&FallbackKeyParts {
        provider: delivery.provider,
        channel_id: delivery.channel_id,
        account_id: None,
        reward_id: None,
        amount: 0,
        status: None,
        raw_payload,
    });
    PreparedEvent {
        record: RewardEventRecord {
            id: Uuid::new_v4(),
            provider: delivery.provider,
            provider_event_id: key,
            channel_id: delivery.channel_id,
            provider_account_id: None,
            linked_user_id: None,
            event_type: "unknown".to_string(),
            currency: String::new(),
            amount: 0,
            coins_to_grant: 0,
            status: RewardStatus::Ignored,
            reason: Some(IgnoreReason::MalformedPayload.as_str().to_string()),
            event_at: now,
            raw_payload: raw_payload.clone(),
            created_at: now,
            claimed_at: None,
        },
    }
}
