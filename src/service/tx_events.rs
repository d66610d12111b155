//! Per-transaction staging of wallet events.
//!
//! A [`TxEventBuffer`] is created next to each transaction attempt and
//! collects the [`WalletUpdateEvent`]s that attempt produces. The only way
//! to obtain something the relay will accept is [`TxEventBuffer::commit`],
//! which commits the transaction first; dropping the buffer (rollback,
//! conflict retry, error) discards the events with the attempt.

use chrono::Utc;

use crate::domain::{Wallet, WalletUpdateEvent, WalletUpdateReason};
use crate::persistence::{LedgerTx, StoreResult};

/// Routing fields stamped on every event a transaction stages.
#[derive(Debug, Clone, Copy)]
pub struct EventStamp<'a> {
    /// Channel slug for clients that route by slug.
    pub channel_slug: Option<&'a str>,
    /// Instance performing the mutation.
    pub origin_instance: &'a str,
}

impl EventStamp<'_> {
    /// Builds the event for a wallet that just changed by `delta`.
    #[must_use]
    pub fn event(
        &self,
        wallet: &Wallet,
        delta: i64,
        reason: WalletUpdateReason,
    ) -> WalletUpdateEvent {
        WalletUpdateEvent {
            user_id: wallet.user_id,
            channel_id: wallet.channel_id,
            channel_slug: self.channel_slug.map(str::to_string),
            balance: wallet.balance,
            delta,
            reason,
            origin_instance: self.origin_instance.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Events staged by one open transaction.
#[derive(Debug, Default)]
pub struct TxEventBuffer {
    staged: Vec<WalletUpdateEvent>,
}

impl TxEventBuffer {
    /// Creates an empty buffer for a new transaction attempt.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages an event for emission after commit.
    pub fn stage(&mut self, event: WalletUpdateEvent) {
        self.staged.push(event);
    }

    /// Returns the staged events.
    #[must_use]
    pub fn staged(&self) -> &[WalletUpdateEvent] {
        &self.staged
    }

    /// Commits `tx` and releases the staged events.
    ///
    /// # Errors
    ///
    /// Returns the commit error; the staged events are dropped with it.
    pub async fn commit(self, tx: Box<dyn LedgerTx>) -> StoreResult<CommittedEvents> {
        tx.commit().await?;
        Ok(CommittedEvents(self.staged))
    }
}

/// Wallet events of a transaction that is known to have committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommittedEvents(Vec<WalletUpdateEvent>);

impl CommittedEvents {
    /// Returns the events in staging order.
    #[must_use]
    pub fn events(&self) -> &[WalletUpdateEvent] {
        &self.0
    }

    /// Returns `true` if the transaction changed no balance.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the batch.
    #[must_use]
    pub fn into_events(self) -> Vec<WalletUpdateEvent> {
        self.0
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::{ChannelId, UserId, WalletKey};
    use crate::persistence::LedgerStore;
    use crate::persistence::memory::MemoryStore;

    fn event(balance: i64) -> WalletUpdateEvent {
        WalletUpdateEvent {
            user_id: UserId::new(),
            channel_id: ChannelId::new(),
            channel_slug: None,
            balance,
            delta: balance,
            reason: WalletUpdateReason::Reward,
            origin_instance: "test".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn commit_releases_staged_events() {
        let store = MemoryStore::new();
        let Ok(tx) = store.begin().await else {
            panic!("begin failed");
        };
        let mut buffer = TxEventBuffer::new();
        buffer.stage(event(5));
        buffer.stage(event(7));
        assert_eq!(buffer.staged().len(), 2);

        let Ok(committed) = buffer.commit(tx).await else {
            panic!("commit failed");
        };
        let balances: Vec<i64> = committed.events().iter().map(|e| e.balance).collect();
        assert_eq!(balances, vec![5, 7]);
    }

    #[tokio::test]
    async fn failed_commit_yields_no_events() {
        let store = MemoryStore::new();
        store.inject_commit_conflicts(1);
        let Ok(mut tx) = store.begin().await else {
            panic!("begin failed");
        };
        let key = WalletKey::new(UserId::new(), ChannelId::new());
        let _ = tx.insert_wallet_if_absent(key, Utc::now()).await;

        let mut buffer = TxEventBuffer::new();
        buffer.stage(event(1));
        assert!(buffer.commit(tx).await.is_err());
        assert_eq!(store.wallet_count().await, 0);
    }
}
