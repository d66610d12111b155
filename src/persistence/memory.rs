//! In-process implementation of the persistence traits.
//!
//! Transactions take the ledger mutex for their whole lifetime and work on
//! a private copy of the state, so concurrent transactions run one after
//! another and a dropped or rolled-back transaction leaves no trace. The
//! outbox sits behind its own mutex and is never touched by transactions.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{LedgerStore, LedgerTx, RewardEventRecord, StoreError, StoreResult};
use crate::domain::{
    BonusState, OutboxMessage, OutboxStatus, Provider, RewardStatus, Wallet, WalletKey,
};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    wallets: HashMap<WalletKey, Wallet>,
    deliveries: HashMap<(Provider, String), Option<Uuid>>,
    reward_events: HashMap<(Provider, String), RewardEventRecord>,
    bonus_states: HashMap<WalletKey, BonusState>,
}

#[derive(Debug, Default)]
struct Faults {
    commit_conflicts: AtomicU32,
    wallet_races: AtomicU32,
}

impl Faults {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Memory-backed [`LedgerStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: Arc<Mutex<LedgerState>>,
    outbox: Mutex<HashMap<Uuid, OutboxMessage>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` commits fail with a serialization conflict.
    #[cfg(test)]
    pub(crate) fn inject_commit_conflicts(&self, n: u32) {
        self.faults.commit_conflicts.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` wallet inserts behave as if a concurrent
    /// transaction created the row first.
    #[cfg(test)]
    pub(crate) fn inject_wallet_races(&self, n: u32) {
        self.faults.wallet_races.store(n, Ordering::SeqCst);
    }

    /// Number of recorded deliveries.
    #[cfg(test)]
    pub(crate) async fn delivery_count(&self) -> usize {
        self.ledger.lock().await.deliveries.len()
    }

    /// Number of stored reward events.
    #[cfg(test)]
    pub(crate) async fn reward_event_count(&self) -> usize {
        self.ledger.lock().await.reward_events.len()
    }

    /// Number of wallet rows.
    #[cfg(test)]
    pub(crate) async fn wallet_count(&self) -> usize {
        self.ledger.lock().await.wallets.len()
    }

    /// Bonus state of one wallet, outside any transaction.
    #[cfg(test)]
    pub(crate) async fn bonus_state(&self, key: WalletKey) -> Option<BonusState> {
        self.ledger.lock().await.bonus_states.get(&key).cloned()
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<LedgerState>,
    work: LedgerState,
    faults: Arc<Faults>,
}

fn new_wallet(key: WalletKey, now: DateTime<Utc>) -> Wallet {
    Wallet {
        user_id: key.user_id,
        channel_id: key.channel_id,
        balance: 0,
        updated_at: now,
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn find_wallet_for_update(&mut self, key: WalletKey) -> StoreResult<Option<Wallet>> {
        Ok(self.work.wallets.get(&key).cloned())
    }

    async fn insert_wallet_if_absent(
        &mut self,
        key: WalletKey,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        if Faults::take(&self.faults.wallet_races) {
            // The rival transaction's row is visible once we fall back to the lock.
            self.work.wallets.entry(key).or_insert_with(|| new_wallet(key, now));
            return Ok(0);
        }
        if self.work.wallets.contains_key(&key) {
            return Ok(0);
        }
        self.work.wallets.insert(key, new_wallet(key, now));
        Ok(1)
    }

    async fn write_balance(
        &mut self,
        key: WalletKey,
        balance: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Wallet> {
        let wallet = self
            .work
            .wallets
            .get_mut(&key)
            .ok_or_else(|| StoreError::Database(format!("wallet {key} not found")))?;
        wallet.balance = balance;
        wallet.updated_at = now;
        Ok(wallet.clone())
    }

    async fn insert_delivery(
        &mut self,
        provider: Provider,
        delivery_id: &str,
        _now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let key = (provider, delivery_id.to_string());
        if self.work.deliveries.contains_key(&key) {
            return Ok(0);
        }
        self.work.deliveries.insert(key, None);
        Ok(1)
    }

    async fn link_delivery_event(
        &mut self,
        provider: Provider,
        delivery_id: &str,
        event_id: Uuid,
    ) -> StoreResult<()> {
        if let Some(slot) = self
            .work
            .deliveries
            .get_mut(&(provider, delivery_id.to_string()))
        {
            *slot = Some(event_id);
        }
        Ok(())
    }

    async fn insert_reward_event(&mut self, event: &RewardEventRecord) -> StoreResult<u64> {
        let key = (event.provider, event.provider_event_id.clone());
        if self.work.reward_events.contains_key(&key) {
            return Ok(0);
        }
        self.work.reward_events.insert(key, event.clone());
        Ok(1)
    }

    async fn find_reward_event(
        &mut self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<RewardEventRecord>> {
        Ok(self
            .work
            .reward_events
            .get(&(provider, provider_event_id.to_string()))
            .cloned())
    }

    async fn mark_reward_claimed(&mut self, id: Uuid, now: DateTime<Utc>) -> StoreResult<u64> {
        let Some(event) = self
            .work
            .reward_events
            .values_mut()
            .find(|e| e.id == id && e.status == RewardStatus::Eligible)
        else {
            return Ok(0);
        };
        event.status = RewardStatus::Claimed;
        event.claimed_at = Some(now);
        Ok(1)
    }

    async fn find_bonus_state(&mut self, key: WalletKey) -> StoreResult<Option<BonusState>> {
        Ok(self.work.bonus_states.get(&key).cloned())
    }

    async fn save_bonus_state(&mut self, state: &BonusState) -> StoreResult<()> {
        self.work.bonus_states.insert(state.key, state.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryTx {
            mut guard,
            work,
            faults,
        } = *self;
        if Faults::take(&faults.commit_conflicts) {
            return Err(StoreError::Conflict(
                "could not serialize access due to read/write dependencies".to_string(),
            ));
        }
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>> {
        let guard = Arc::clone(&self.ledger).lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            work,
            faults: Arc::clone(&self.faults),
        }))
    }

    async fn find_wallet(&self, key: WalletKey) -> StoreResult<Option<Wallet>> {
        Ok(self.ledger.lock().await.wallets.get(&key).cloned())
    }

    async fn get_or_create_wallet(
        &self,
        key: WalletKey,
        now: DateTime<Utc>,
    ) -> StoreResult<Wallet> {
        let mut state = self.ledger.lock().await;
        Ok(state
            .wallets
            .entry(key)
            .or_insert_with(|| new_wallet(key, now))
            .clone())
    }

    async fn reward_event(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<RewardEventRecord>> {
        Ok(self
            .ledger
            .lock()
            .await
            .reward_events
            .get(&(provider, provider_event_id.to_string()))
            .cloned())
    }

    async fn insert_outbox(&self, message: &OutboxMessage) -> StoreResult<()> {
        let mut outbox = self.outbox.lock().await;
        if outbox.contains_key(&message.id) {
            return Err(StoreError::UniqueViolation(format!(
                "outbox message {} already exists",
                message.id
            )));
        }
        outbox.insert(message.id, message.clone());
        Ok(())
    }

    async fn outbox_candidates(
        &self,
        platform: Provider,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<OutboxMessage>> {
        let outbox = self.outbox.lock().await;
        let mut rows: Vec<OutboxMessage> = outbox
            .values()
            .filter(|m| m.platform == platform && m.is_claimable(stale_before))
            .cloned()
            .collect();
        rows.sort_by_key(|m| m.created_at);
        rows.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(rows)
    }

    async fn claim_outbox(
        &self,
        id: Uuid,
        observed_status: OutboxStatus,
        observed_processing_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut outbox = self.outbox.lock().await;
        let Some(row) = outbox.get_mut(&id) else {
            return Ok(false);
        };
        if row.status != observed_status || row.processing_at != observed_processing_at {
            return Ok(false);
        }
        row.status = OutboxStatus::Processing;
        row.processing_at = Some(now);
        Ok(true)
    }

    async fn mark_outbox_sent(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut outbox = self.outbox.lock().await;
        let Some(row) = claimed_row(&mut outbox, id, claimed_at) else {
            return Ok(false);
        };
        row.status = OutboxStatus::Sent;
        row.sent_at = Some(now);
        row.attempts += 1;
        row.last_error = None;
        Ok(true)
    }

    async fn release_outbox(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool> {
        let mut outbox = self.outbox.lock().await;
        let Some(row) = claimed_row(&mut outbox, id, claimed_at) else {
            return Ok(false);
        };
        row.status = OutboxStatus::Pending;
        row.processing_at = None;
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        Ok(true)
    }

    async fn unclaim_outbox(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool> {
        let mut outbox = self.outbox.lock().await;
        let Some(row) = claimed_row(&mut outbox, id, claimed_at) else {
            return Ok(false);
        };
        row.status = OutboxStatus::Pending;
        row.processing_at = None;
        row.last_error = Some(error.to_string());
        Ok(true)
    }

    async fn fail_outbox(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut outbox = self.outbox.lock().await;
        let Some(row) = claimed_row(&mut outbox, id, claimed_at) else {
            return Ok(false);
        };
        row.status = OutboxStatus::Failed;
        row.failed_at = Some(now);
        row.attempts += 1;
        row.last_error = Some(error.to_string());
        Ok(true)
    }

    async fn find_outbox(&self, id: Uuid) -> StoreResult<Option<OutboxMessage>> {
        Ok(self.outbox.lock().await.get(&id).cloned())
    }
}

fn claimed_row(
    outbox: &mut HashMap<Uuid, OutboxMessage>,
    id: Uuid,
    claimed_at: DateTime<Utc>,
) -> Option<&mut OutboxMessage> {
    outbox.get_mut(&id).filter(|row| {
        row.status == OutboxStatus::Processing && row.processing_at == Some(claimed_at)
    })
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{ChannelId, UserId};

    fn key() -> WalletKey {
        WalletKey::new(UserId::new(), ChannelId::new())
    }

    #[tokio::test]
    async fn uncommitted_writes_are_discarded() {
        let store = MemoryStore::new();
        let k = key();
        let Ok(mut tx) = store.begin().await else {
            panic!("begin failed");
        };
        let Ok(1) = tx.insert_wallet_if_absent(k, Utc::now()).await else {
            panic!("expected insert");
        };
        drop(tx);
        let Ok(found) = store.find_wallet(k).await else {
            panic!("read failed");
        };
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn committed_writes_are_visible() {
        let store = MemoryStore::new();
        let k = key();
        let Ok(mut tx) = store.begin().await else {
            panic!("begin failed");
        };
        assert!(matches!(tx.insert_wallet_if_absent(k, Utc::now()).await, Ok(1)));
        assert!(matches!(tx.insert_wallet_if_absent(k, Utc::now()).await, Ok(0)));
        let Ok(wallet) = tx.write_balance(k, 42, Utc::now()).await else {
            panic!("write failed");
        };
        assert_eq!(wallet.balance, 42);
        assert!(tx.commit().await.is_ok());

        let Ok(Some(found)) = store.find_wallet(k).await else {
            panic!("wallet missing");
        };
        assert_eq!(found.balance, 42);
    }

    #[tokio::test]
    async fn injected_conflict_fails_commit_once() {
        let store = MemoryStore::new();
        store.inject_commit_conflicts(1);
        let k = key();

        let Ok(mut tx) = store.begin().await else {
            panic!("begin failed");
        };
        let _ = tx.insert_wallet_if_absent(k, Utc::now()).await;
        assert!(matches!(tx.commit().await, Err(StoreError::Conflict(_))));
        assert_eq!(store.wallet_count().await, 0);

        let Ok(mut tx) = store.begin().await else {
            panic!("begin failed");
        };
        let _ = tx.insert_wallet_if_absent(k, Utc::now()).await;
        assert!(tx.commit().await.is_ok());
        assert_eq!(store.wallet_count().await, 1);
    }

    #[tokio::test]
    async fn outbox_claim_requires_observed_state() {
        let store = MemoryStore::new();
        let msg = OutboxMessage::pending(
            Provider::Kick,
            ChannelId::new(),
            "room".to_string(),
            serde_json::json!({"text": "hello"}),
        );
        assert!(store.insert_outbox(&msg).await.is_ok());
        assert!(matches!(
            store.insert_outbox(&msg).await,
            Err(StoreError::UniqueViolation(_))
        ));

        let now = Utc::now();
        assert!(matches!(
            store.claim_outbox(msg.id, OutboxStatus::Pending, None, now).await,
            Ok(true)
        ));
        assert!(matches!(
            store.claim_outbox(msg.id, OutboxStatus::Pending, None, now).await,
            Ok(false)
        ));

        let stale_claim = now - chrono::Duration::seconds(1);
        assert!(matches!(
            store.mark_outbox_sent(msg.id, stale_claim, now).await,
            Ok(false)
        ));
        assert!(matches!(store.mark_outbox_sent(msg.id, now, now).await, Ok(true)));

        let Ok(Some(row)) = store.find_outbox(msg.id).await else {
            panic!("row missing");
        };
        assert_eq!(row.status, OutboxStatus::Sent);
        assert_eq!(row.attempts, 1);
    }
}
