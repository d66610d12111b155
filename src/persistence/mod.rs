//! Persistence layer: wallets, reward events, delivery dedup, bonus state
//! and the outbox.
//!
//! [`LedgerStore`] is the object-safe entry point; [`LedgerStore::begin`]
//! opens a [`LedgerTx`] running under serializable isolation. Two
//! implementations exist:
//!
//! - [`postgres::PostgresStore`]: `sqlx::PgPool`, row locks via
//!   `SELECT … FOR UPDATE`, conflict-ignoring inserts reporting rows
//!   affected.
//! - [`memory::MemoryStore`]: single-process store used when persistence
//!   is disabled and by the test suite.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{BonusState, OutboxMessage, OutboxStatus, Provider, Wallet, WalletKey};
use crate::resilience::Retryable;

pub use models::RewardEventRecord;

/// Persistence failure, classified for the retry executor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Serialization failure or deadlock; safe to retry the transaction.
    #[error("transaction conflict: {0}")]
    Conflict(String),
    /// Unique-key violation outside the expected conflict-ignoring paths.
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Decode(String),
    /// Any other database failure.
    #[error("database error: {0}")]
    Database(String),
}

impl Retryable for StoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Result alias for persistence operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// An open serializable transaction.
///
/// Dropping a transaction without calling [`LedgerTx::commit`] rolls it
/// back.
#[async_trait]
pub trait LedgerTx: Send {
    /// Reads a wallet and holds its row lock until the transaction ends.
    async fn find_wallet_for_update(&mut self, key: WalletKey) -> StoreResult<Option<Wallet>>;

    /// Inserts a zero-balance wallet unless one exists. Returns rows
    /// affected (0 when another transaction created it first).
    async fn insert_wallet_if_absent(
        &mut self,
        key: WalletKey,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Overwrites the balance of a locked wallet.
    async fn write_balance(
        &mut self,
        key: WalletKey,
        balance: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<Wallet>;

    /// Records a delivery id. Returns rows affected (0 for a duplicate).
    async fn insert_delivery(
        &mut self,
        provider: Provider,
        delivery_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;

    /// Attaches the resulting reward event to a recorded delivery.
    async fn link_delivery_event(
        &mut self,
        provider: Provider,
        delivery_id: &str,
        event_id: Uuid,
    ) -> StoreResult<()>;

    /// Inserts a reward event unless its `(provider, provider_event_id)`
    /// key exists. Returns rows affected.
    async fn insert_reward_event(&mut self, event: &RewardEventRecord) -> StoreResult<u64>;

    /// Loads a reward event by its business key.
    async fn find_reward_event(
        &mut self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<RewardEventRecord>>;

    /// Moves an event from `eligible` to `claimed`. Returns rows affected.
    async fn mark_reward_claimed(&mut self, id: Uuid, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Loads the bonus state of a wallet.
    async fn find_bonus_state(&mut self, key: WalletKey) -> StoreResult<Option<BonusState>>;

    /// Inserts or replaces the bonus state of a wallet.
    async fn save_bonus_state(&mut self, state: &BonusState) -> StoreResult<()>;

    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Rolls the transaction back.
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// Storage backend of the ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync + std::fmt::Debug {
    /// Opens a serializable transaction.
    async fn begin(&self) -> StoreResult<Box<dyn LedgerTx>>;

    /// Reads a wallet without locking.
    async fn find_wallet(&self, key: WalletKey) -> StoreResult<Option<Wallet>>;

    /// Idempotently creates a wallet and returns the stored row.
    async fn get_or_create_wallet(&self, key: WalletKey, now: DateTime<Utc>)
    -> StoreResult<Wallet>;

    /// Loads a reward event by its business key, outside any transaction.
    async fn reward_event(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> StoreResult<Option<RewardEventRecord>>;

    /// Inserts a new outbox row.
    async fn insert_outbox(&self, message: &OutboxMessage) -> StoreResult<()>;

    /// Lists claimable rows of a platform, oldest first: pending rows plus
    /// processing rows whose claim is older than `stale_before`.
    async fn outbox_candidates(
        &self,
        platform: Provider,
        stale_before: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<OutboxMessage>>;

    /// Compare-and-swap claim: sets `processing` only if the row still has
    /// the status and claim timestamp observed during selection.
    async fn claim_outbox(
        &self,
        id: Uuid,
        observed_status: OutboxStatus,
        observed_processing_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Marks a claimed row as sent. `false` if the claim was lost.
    async fn mark_outbox_sent(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Returns a claimed row to `pending` after a failed attempt.
    async fn release_outbox(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool>;

    /// Returns a claimed row to `pending` without counting an attempt;
    /// used when the message never reached the platform.
    async fn unclaim_outbox(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool>;

    /// Marks a claimed row as permanently failed.
    async fn fail_outbox(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Loads one outbox row.
    async fn find_outbox(&self, id: Uuid) -> StoreResult<Option<OutboxMessage>>;
}
