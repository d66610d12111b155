//! Economy service: daily and watch bonus claims, spending and admin
//! balance overrides.
//!
//! Every operation runs one serializable transaction under the retry
//! executor: lock the wallet, grant the start bonus if it is still owed,
//! evaluate the claim rules against the locked [`BonusState`], write, and
//! commit. Wallet events reach the relay only after the commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::economy_policy::{self, ClaimRejection};
use crate::domain::{
    BonusState, ChannelId, ChannelSettings, EconomySettings, StreamSnapshot, Wallet, WalletKey,
    WalletUpdateReason,
};
use crate::error::LedgerError;
use crate::persistence::LedgerTx;
use crate::resilience::{RetryPolicy, with_retry};
use crate::service::balance_relay::BalanceRelay;
use crate::service::collaborators::{ChannelSettingsSource, StreamStatusSource};
use crate::service::tx_events::{CommittedEvents, EventStamp, TxEventBuffer};
use crate::service::wallet_ledger::WalletLedger;

/// Result of a successful bonus claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimReceipt {
    /// Coins granted by this claim.
    pub coins: i64,
    /// Balance after the claim (start bonus included).
    pub balance: i64,
    /// Daily streak after the claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streak: Option<u32>,
    /// Streak multiplier applied, in basis points.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier_bps: Option<i64>,
    /// Watch claims in the current stream session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims_in_session: Option<u32>,
}

/// Outcome of a bonus claim: granted, or a typed business rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// Coins were granted.
    Granted(ClaimReceipt),
    /// The claim rules refused the claim.
    Rejected(ClaimRejection),
}

/// Wallet locked inside an open transaction, with its bonus state.
#[derive(Debug, Clone)]
pub(crate) struct LockedWallet {
    pub(crate) wallet: Wallet,
    pub(crate) bonus: BonusState,
}

/// Locks the wallet and pays the one-time start bonus if it is still owed.
///
/// The bonus state is persisted when the bonus is granted, so the grant
/// commits with the enclosing transaction even if the caller's own claim
/// is later rejected.
pub(crate) async fn lock_with_start_bonus(
    ledger: &WalletLedger,
    tx: &mut dyn LedgerTx,
    key: WalletKey,
    economy: &EconomySettings,
    stamp: EventStamp<'_>,
    buffer: &mut TxEventBuffer,
) -> Result<LockedWallet, LedgerError> {
    let wallet = ledger.lock_for_update(tx, key).await?;
    let mut bonus = tx
        .find_bonus_state(key)
        .await?
        .unwrap_or_else(|| BonusState::new(key));
    if bonus.start_bonus_granted {
        return Ok(LockedWallet { wallet, bonus });
    }

    bonus.start_bonus_granted = true;
    tx.save_bonus_state(&bonus).await?;
    let coins = economy.start_bonus_coins;
    let wallet = match ledger
        .increment_balance(tx, key, coins, Some(&wallet))
        .await?
    {
        Some(updated) => {
            tracing::info!(wallet = %key, coins, "start bonus granted");
            buffer.stage(stamp.event(&updated, coins, WalletUpdateReason::StartBonus));
            updated
        }
        None => wallet,
    };
    Ok(LockedWallet { wallet, bonus })
}

/// Bonus claims, spending and admin overrides.
#[derive(Debug, Clone)]
pub struct EconomyService {
    ledger: Arc<WalletLedger>,
    channels: Arc<dyn ChannelSettingsSource>,
    streams: Arc<dyn StreamStatusSource>,
    relay: BalanceRelay,
    retry: RetryPolicy,
}

impl EconomyService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        ledger: Arc<WalletLedger>,
        channels: Arc<dyn ChannelSettingsSource>,
        streams: Arc<dyn StreamStatusSource>,
        relay: BalanceRelay,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            channels,
            streams,
            relay,
            retry,
        }
    }

    async fn channel(&self, channel_id: ChannelId) -> Result<ChannelSettings, LedgerError> {
        Ok(self
            .channels
            .channel_settings(channel_id)
            .await?
            .unwrap_or_default())
    }

    fn stamp<'a>(&'a self, settings: &'a ChannelSettings) -> EventStamp<'a> {
        EventStamp {
            channel_slug: Some(settings.slug.as_str()).filter(|s| !s.is_empty()),
            origin_instance: self.relay.instance_id(),
        }
    }

    /// Claims the daily bonus now.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on persistence failure (after
    /// conflict retries). Rule violations are [`ClaimOutcome::Rejected`].
    pub async fn claim_daily_bonus(&self, key: WalletKey) -> Result<ClaimOutcome, LedgerError> {
        self.claim_daily_bonus_at(key, Utc::now()).await
    }

    /// Claims the daily bonus as of `now`.
    ///
    /// # Errors
    ///
    /// Same as [`EconomyService::claim_daily_bonus`].
    pub async fn claim_daily_bonus_at(
        &self,
        key: WalletKey,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, LedgerError> {
        let settings = self.channel(key.channel_id).await?;
        let snapshot = self.streams.stream_status(&settings.slug).await?;
        let (settings_ref, snapshot_ref) = (&settings, &snapshot);
        let (outcome, committed) = with_retry(&self.retry, move |_| {
            self.daily_attempt(key, settings_ref, snapshot_ref, now)
        })
        .await?;
        self.finish(key, "daily", &outcome, committed);
        Ok(outcome)
    }

    async fn daily_attempt(
        &self,
        key: WalletKey,
        settings: &ChannelSettings,
        snapshot: &StreamSnapshot,
        now: DateTime<Utc>,
    ) -> Result<(ClaimOutcome, CommittedEvents), LedgerError> {
        let stamp = self.stamp(settings);
        let mut tx = self.ledger.store().begin().await?;
        let mut buffer = TxEventBuffer::new();
        let mut locked = lock_with_start_bonus(
            &self.ledger,
            tx.as_mut(),
            key,
            &settings.economy,
            stamp,
            &mut buffer,
        )
        .await?;

        let outcome =
            match economy_policy::evaluate_daily(&settings.economy, &locked.bonus, snapshot, now) {
                Err(rejection) => ClaimOutcome::Rejected(rejection),
                Ok(decision) => {
                    economy_policy::apply_daily(&mut locked.bonus, &decision, now);
                    tx.save_bonus_state(&locked.bonus).await?;
                    let wallet = self
                        .grant(
                            tx.as_mut(),
                            &locked.wallet,
                            decision.coins,
                            WalletUpdateReason::DailyBonus,
                            stamp,
                            &mut buffer,
                        )
                        .await?;
                    ClaimOutcome::Granted(ClaimReceipt {
                        coins: decision.coins,
                        balance: wallet.balance,
                        streak: Some(decision.streak),
                        multiplier_bps: Some(decision.multiplier_bps),
                        claims_in_session: None,
                    })
                }
            };
        let committed = buffer.commit(tx).await?;
        Ok((outcome, committed))
    }

    /// Claims the watch bonus now.
    ///
    /// # Errors
    ///
    /// Same as [`EconomyService::claim_daily_bonus`].
    pub async fn claim_watch_bonus(&self, key: WalletKey) -> Result<ClaimOutcome, LedgerError> {
        self.claim_watch_bonus_at(key, Utc::now()).await
    }

    /// Claims the watch bonus as of `now`.
    ///
    /// # Errors
    ///
    /// Same as [`EconomyService::claim_daily_bonus`].
    pub async fn claim_watch_bonus_at(
        &self,
        key: WalletKey,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, LedgerError> {
        let settings = self.channel(key.channel_id).await?;
        let snapshot = self.streams.stream_status(&settings.slug).await?;
        let (settings_ref, snapshot_ref) = (&settings, &snapshot);
        let (outcome, committed) = with_retry(&self.retry, move |_| {
            self.watch_attempt(key, settings_ref, snapshot_ref, now)
        })
        .await?;
        self.finish(key, "watch", &outcome, committed);
        Ok(outcome)
    }

    async fn watch_attempt(
        &self,
        key: WalletKey,
        settings: &ChannelSettings,
        snapshot: &StreamSnapshot,
        now: DateTime<Utc>,
    ) -> Result<(ClaimOutcome, CommittedEvents), LedgerError> {
        let stamp = self.stamp(settings);
        let mut tx = self.ledger.store().begin().await?;
        let mut buffer = TxEventBuffer::new();
        let mut locked = lock_with_start_bonus(
            &self.ledger,
            tx.as_mut(),
            key,
            &settings.economy,
            stamp,
            &mut buffer,
        )
        .await?;

        let outcome =
            match economy_policy::evaluate_watch(&settings.economy, &locked.bonus, snapshot, now) {
                Err(rejection) => ClaimOutcome::Rejected(rejection),
                Ok(decision) => {
                    economy_policy::apply_watch(&mut locked.bonus, &decision, now);
                    tx.save_bonus_state(&locked.bonus).await?;
                    let wallet = self
                        .grant(
                            tx.as_mut(),
                            &locked.wallet,
                            decision.coins,
                            WalletUpdateReason::WatchBonus,
                            stamp,
                            &mut buffer,
                        )
                        .await?;
                    ClaimOutcome::Granted(ClaimReceipt {
                        coins: decision.coins,
                        balance: wallet.balance,
                        streak: None,
                        multiplier_bps: None,
                        claims_in_session: Some(decision.claims_in_session),
                    })
                }
            };
        let committed = buffer.commit(tx).await?;
        Ok((outcome, committed))
    }

    async fn grant(
        &self,
        tx: &mut dyn LedgerTx,
        wallet: &Wallet,
        coins: i64,
        reason: WalletUpdateReason,
        stamp: EventStamp<'_>,
        buffer: &mut TxEventBuffer,
    ) -> Result<Wallet, LedgerError> {
        match self
            .ledger
            .increment_balance(tx, wallet.key(), coins, Some(wallet))
            .await?
        {
            Some(updated) => {
                buffer.stage(stamp.event(&updated, coins, reason));
                Ok(updated)
            }
            None => Ok(wallet.clone()),
        }
    }

    fn finish(
        &self,
        key: WalletKey,
        bonus: &str,
        outcome: &ClaimOutcome,
        committed: CommittedEvents,
    ) {
        match outcome {
            ClaimOutcome::Granted(receipt) => tracing::info!(
                wallet = %key,
                bonus,
                coins = receipt.coins,
                balance = receipt.balance,
                "bonus claimed"
            ),
            ClaimOutcome::Rejected(rejection) => {
                tracing::debug!(wallet = %key, bonus, ?rejection, "bonus claim rejected");
            }
        }
        self.relay.publish(committed);
    }

    /// Spends `cost` coins (e.g. a meme activation), checking the balance
    /// and decrementing under the same row lock.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] for a non-positive cost,
    /// [`LedgerError::InsufficientBalance`] when the balance is short and
    /// [`LedgerError::Store`] on persistence failure.
    pub async fn spend(&self, key: WalletKey, cost: i64) -> Result<Wallet, LedgerError> {
        if cost <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "cost must be positive, got {cost}"
            )));
        }
        self.adjust(key, BalanceChange::Spend(cost)).await
    }

    /// Adds (positive) or removes (negative) coins on behalf of an admin.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientBalance`] if a removal exceeds
    /// the balance, [`LedgerError::Store`] on persistence failure.
    pub async fn admin_adjust(&self, key: WalletKey, delta: i64) -> Result<Wallet, LedgerError> {
        self.adjust(key, BalanceChange::Adjust(delta)).await
    }

    /// Overwrites the balance on behalf of an admin.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] for a negative value,
    /// [`LedgerError::Store`] on persistence failure.
    pub async fn admin_set(&self, key: WalletKey, value: i64) -> Result<Wallet, LedgerError> {
        if value < 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "balance must be non-negative, got {value}"
            )));
        }
        self.adjust(key, BalanceChange::Set(value)).await
    }

    async fn adjust(&self, key: WalletKey, change: BalanceChange) -> Result<Wallet, LedgerError> {
        let settings = self.channel(key.channel_id).await?;
        let settings_ref = &settings;
        let (wallet, committed) = with_retry(&self.retry, move |_| {
            self.adjust_attempt(key, settings_ref, change)
        })
        .await?;
        tracing::info!(wallet = %key, ?change, balance = wallet.balance, "balance adjusted");
        self.relay.publish(committed);
        Ok(wallet)
    }

    async fn adjust_attempt(
        &self,
        key: WalletKey,
        settings: &ChannelSettings,
        change: BalanceChange,
    ) -> Result<(Wallet, CommittedEvents), LedgerError> {
        let stamp = self.stamp(settings);
        let mut tx = self.ledger.store().begin().await?;
        let mut buffer = TxEventBuffer::new();
        let locked = lock_with_start_bonus(
            &self.ledger,
            tx.as_mut(),
            key,
            &settings.economy,
            stamp,
            &mut buffer,
        )
        .await?;
        let before = locked.wallet.balance;

        let (updated, reason) = match change {
            BalanceChange::Spend(cost) => (
                self.ledger
                    .decrement_balance(tx.as_mut(), key, cost, Some(&locked.wallet))
                    .await?,
                WalletUpdateReason::Spend,
            ),
            BalanceChange::Adjust(delta) if delta < 0 => (
                self.ledger
                    .decrement_balance(
                        tx.as_mut(),
                        key,
                        delta.saturating_neg(),
                        Some(&locked.wallet),
                    )
                    .await?,
                WalletUpdateReason::AdminAdjustment,
            ),
            BalanceChange::Adjust(delta) => (
                self.ledger
                    .increment_balance(tx.as_mut(), key, delta, Some(&locked.wallet))
                    .await?,
                WalletUpdateReason::AdminAdjustment,
            ),
            BalanceChange::Set(value) => (
                Some(
                    self.ledger
                        .set_balance(tx.as_mut(), key, value, Some(&locked.wallet))
                        .await?,
                ),
                WalletUpdateReason::AdminAdjustment,
            ),
        };

        let wallet = match updated {
            Some(w) if w.balance != before => {
                buffer.stage(stamp.event(&w, w.balance - before, reason));
                w
            }
            Some(w) => w,
            None => locked.wallet,
        };
        let committed = buffer.commit(tx).await?;
        Ok((wallet, committed))
    }
}

#[derive(Debug, Clone, Copy)]
enum BalanceChange {
    Spend(i64),
    Adjust(i64),
    Set(i64),
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::domain::{EventBus, StreamState, UserId};
    use crate::persistence::LedgerStore;
    use crate::persistence::memory::MemoryStore;
    use crate::resilience::{BreakerConfig, CircuitBreakerRegistry};
    use crate::service::balance_relay::RelaySettings;
    use crate::service::collaborators::{InMemoryChannelSettings, InMemoryStreamStatus};

    struct Harness {
        store: Arc<MemoryStore>,
        streams: Arc<InMemoryStreamStatus>,
        service: EconomyService,
        bus: EventBus,
        channel_id: ChannelId,
    }

    async fn harness(economy: EconomySettings) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(WalletLedger::new(Arc::clone(&store) as Arc<dyn LedgerStore>));
        let channels = Arc::new(InMemoryChannelSettings::new());
        let channel_id = ChannelId::new();
        channels
            .insert(
                channel_id,
                ChannelSettings {
                    slug: "streamer".to_string(),
                    reward_rules: Vec::new(),
                    economy,
                },
            )
            .await;
        let streams = Arc::new(InMemoryStreamStatus::new());
        let bus = EventBus::new(64);
        let Ok(relay) = BalanceRelay::new(
            bus.clone(),
            RelaySettings {
                instance_id: "test".to_string(),
                peers: Vec::new(),
                secret: None,
                timeout: std::time::Duration::from_millis(100),
            },
            Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
        ) else {
            panic!("relay construction failed");
        };
        let service = EconomyService::new(
            ledger,
            channels,
            Arc::clone(&streams) as Arc<dyn StreamStatusSource>,
            relay,
            RetryPolicy::new(5, 1),
        );
        Harness {
            store,
            streams,
            service,
            bus,
            channel_id,
        }
    }

    fn no_start_bonus() -> EconomySettings {
        EconomySettings {
            start_bonus_coins: 0,
            ..EconomySettings::default()
        }
    }

    fn online(session: &str) -> StreamSnapshot {
        StreamSnapshot {
            status: StreamState::Online,
            session_id: Some(session.to_string()),
            recent_stream_minutes: 0,
        }
    }

    #[tokio::test]
    async fn daily_bonus_respects_cooldown() {
        let h = harness(no_start_bonus()).await;
        let key = WalletKey::new(UserId::new(), h.channel_id);
        let cooldown = EconomySettings::default().daily_bonus_cooldown_secs;
        let t = Utc::now();

        let Ok(ClaimOutcome::Granted(first)) = h.service.claim_daily_bonus_at(key, t).await else {
            panic!("first claim should be granted");
        };
        assert_eq!(first.coins, 50);
        assert_eq!(first.streak, Some(1));

        let half = t + Duration::seconds(cooldown / 2);
        let Ok(ClaimOutcome::Rejected(ClaimRejection::CooldownActive {
            retry_after_seconds,
        })) = h.service.claim_daily_bonus_at(key, half).await
        else {
            panic!("claim within cooldown should be rejected");
        };
        assert!(retry_after_seconds > 0);

        let later = t + Duration::seconds(cooldown + 1);
        let Ok(ClaimOutcome::Granted(second)) = h.service.claim_daily_bonus_at(key, later).await
        else {
            panic!("claim after cooldown should be granted");
        };
        assert_eq!(second.streak, Some(2));
        assert_eq!(second.coins, 55);
        assert_eq!(second.balance, 105);
    }

    #[tokio::test]
    async fn watch_bonus_is_capped_per_session() {
        let h = harness(EconomySettings {
            start_bonus_coins: 0,
            watch_bonus_cooldown_secs: 0,
            max_watch_claims_per_stream: 2,
            ..EconomySettings::default()
        })
        .await;
        h.streams.set("streamer", online("s1")).await;
        let key = WalletKey::new(UserId::new(), h.channel_id);
        let now = Utc::now();

        for expected in 1..=2 {
            let Ok(ClaimOutcome::Granted(receipt)) = h.service.claim_watch_bonus_at(key, now).await
            else {
                panic!("claim {expected} should be granted");
            };
            assert_eq!(receipt.claims_in_session, Some(expected));
        }
        let Ok(ClaimOutcome::Rejected(ClaimRejection::LimitReached { limit })) =
            h.service.claim_watch_bonus_at(key, now).await
        else {
            panic!("third claim should hit the limit");
        };
        assert_eq!(limit, 2);

        h.streams.set("streamer", online("s2")).await;
        let Ok(ClaimOutcome::Granted(receipt)) = h.service.claim_watch_bonus_at(key, now).await
        else {
            panic!("new session should reset the counter");
        };
        assert_eq!(receipt.claims_in_session, Some(1));
        assert_eq!(receipt.balance, 30);
    }

    #[tokio::test]
    async fn watch_bonus_requires_live_stream() {
        let h = harness(no_start_bonus()).await;
        let key = WalletKey::new(UserId::new(), h.channel_id);
        let Ok(ClaimOutcome::Rejected(ClaimRejection::Unavailable { detail })) =
            h.service.claim_watch_bonus(key).await
        else {
            panic!("offline claim should be unavailable");
        };
        assert_eq!(detail, "stream_offline");
    }

    #[tokio::test]
    async fn start_bonus_commits_even_when_claim_is_rejected() {
        let h = harness(EconomySettings::default()).await;
        let key = WalletKey::new(UserId::new(), h.channel_id);
        let mut rx = h.bus.subscribe();

        let Ok(ClaimOutcome::Rejected(_)) = h.service.claim_watch_bonus(key).await else {
            panic!("offline claim should be rejected");
        };
        let Ok(event) = rx.recv().await else {
            panic!("start bonus event missing");
        };
        assert_eq!(event.reason, WalletUpdateReason::StartBonus);
        assert_eq!(event.balance, 100);

        let Some(state) = h.store.bonus_state(key).await else {
            panic!("bonus state missing");
        };
        assert!(state.start_bonus_granted);

        let Ok(ClaimOutcome::Granted(receipt)) = h.service.claim_daily_bonus(key).await else {
            panic!("daily claim should be granted");
        };
        assert_eq!(receipt.balance, 150);
    }

    #[tokio::test]
    async fn conflicts_are_retried_without_leaking_events() {
        let h = harness(no_start_bonus()).await;
        let key = WalletKey::new(UserId::new(), h.channel_id);
        let mut rx = h.bus.subscribe();
        h.store.inject_commit_conflicts(2);

        let Ok(ClaimOutcome::Granted(receipt)) = h.service.claim_daily_bonus(key).await else {
            panic!("claim should succeed after retries");
        };
        assert_eq!(receipt.balance, 50);

        let Ok(event) = rx.recv().await else {
            panic!("event missing");
        };
        assert_eq!(event.reason, WalletUpdateReason::DailyBonus);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn spend_checks_balance_under_lock() {
        let h = harness(no_start_bonus()).await;
        let key = WalletKey::new(UserId::new(), h.channel_id);
        let Ok(wallet) = h.service.admin_adjust(key, 30).await else {
            panic!("adjust failed");
        };
        assert_eq!(wallet.balance, 30);

        let Ok(wallet) = h.service.spend(key, 20).await else {
            panic!("spend failed");
        };
        assert_eq!(wallet.balance, 10);

        let Err(LedgerError::InsufficientBalance { balance, requested }) =
            h.service.spend(key, 11).await
        else {
            panic!("overdraft should be rejected");
        };
        assert_eq!((balance, requested), (10, 11));
        assert!(matches!(
            h.service.spend(key, 0).await,
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn admin_set_overrides_and_reports_delta() {
        let h = harness(no_start_bonus()).await;
        let key = WalletKey::new(UserId::new(), h.channel_id);
        let mut rx = h.bus.subscribe();

        let Ok(wallet) = h.service.admin_set(key, 75).await else {
            panic!("set failed");
        };
        assert_eq!(wallet.balance, 75);
        let Ok(event) = rx.recv().await else {
            panic!("event missing");
        };
        assert_eq!((event.delta, event.reason), (75, WalletUpdateReason::AdminAdjustment));

        let Ok(wallet) = h.service.admin_adjust(key, -25).await else {
            panic!("adjust failed");
        };
        assert_eq!(wallet.balance, 50);
        assert!(matches!(
            h.service.admin_set(key, -1).await,
            Err(LedgerError::InvalidAmount(_))
        ));
    }
}
