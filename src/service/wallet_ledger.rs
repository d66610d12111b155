//! Wallet ledger: balance reads plus the locking and creation protocol
//! every balance mutation goes through.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::domain::{Wallet, WalletKey};
use crate::error::LedgerError;
use crate::persistence::{LedgerStore, LedgerTx, StoreError};

/// Balance store of `(user, channel)` wallets.
///
/// Mutations take an open [`LedgerTx`] so callers can keep invariant checks
/// and the write under the same row lock. Positive and negative changes go
/// through separate operations; a non-positive delta passed to either is
/// a no-op.
#[derive(Debug)]
pub struct WalletLedger {
    store: Arc<dyn LedgerStore>,
    race_conflicts: AtomicU64,
}

impl WalletLedger {
    /// Creates a ledger over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self {
            store,
            race_conflicts: AtomicU64::new(0),
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Number of wallet creation races lost since startup.
    #[must_use]
    pub fn race_conflicts(&self) -> u64 {
        self.race_conflicts.load(Ordering::Relaxed)
    }

    /// Reads a wallet without locking.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on persistence failure.
    pub async fn get(&self, key: WalletKey) -> Result<Option<Wallet>, LedgerError> {
        Ok(self.store.find_wallet(key).await?)
    }

    /// Reads a wallet, falling back to an unpersisted zero-balance wallet.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on persistence failure.
    pub async fn get_or_default(&self, key: WalletKey) -> Result<Wallet, LedgerError> {
        Ok(self.get(key).await?.unwrap_or_else(|| Wallet::empty(key)))
    }

    /// Returns the wallet, creating it if needed. Safe under concurrent
    /// first access.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on persistence failure.
    pub async fn get_or_create(&self, key: WalletKey) -> Result<Wallet, LedgerError> {
        Ok(self.store.get_or_create_wallet(key, Utc::now()).await?)
    }

    /// Locks the wallet row inside `tx`, creating the wallet first if absent.
    ///
    /// A lost creation race (insert affected no rows) is not an error: the
    /// row another transaction created is re-read and locked instead.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] on persistence failure, including a
    /// conflict the caller should retry.
    pub async fn lock_for_update(
        &self,
        tx: &mut dyn LedgerTx,
        key: WalletKey,
    ) -> Result<Wallet, LedgerError> {
        if let Some(wallet) = tx.find_wallet_for_update(key).await? {
            return Ok(wallet);
        }
        if tx.insert_wallet_if_absent(key, Utc::now()).await? == 0 {
            let total = self.race_conflicts.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::info!(wallet = %key, total, "wallet creation race lost; locking existing row");
        }
        let wallet = tx.find_wallet_for_update(key).await?.ok_or_else(|| {
            StoreError::Database(format!("wallet {key} missing after insert"))
        })?;
        Ok(wallet)
    }

    async fn locked(
        &self,
        tx: &mut dyn LedgerTx,
        key: WalletKey,
        locked: Option<&Wallet>,
    ) -> Result<Wallet, LedgerError> {
        match locked {
            Some(wallet) if wallet.key() == key => Ok(wallet.clone()),
            _ => self.lock_for_update(tx, key).await,
        }
    }

    /// Adds `delta` coins. Returns `None` without touching the wallet when
    /// `delta <= 0`.
    ///
    /// `locked` lets a caller that already holds the row lock pass the wallet
    /// it read, avoiding a second lock round trip.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] on overflow and
    /// [`LedgerError::Store`] on persistence failure.
    pub async fn increment_balance(
        &self,
        tx: &mut dyn LedgerTx,
        key: WalletKey,
        delta: i64,
        locked: Option<&Wallet>,
    ) -> Result<Option<Wallet>, LedgerError> {
        if delta <= 0 {
            return Ok(None);
        }
        let wallet = self.locked(tx, key, locked).await?;
        let balance = wallet
            .balance
            .checked_add(delta)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("balance overflow on {key}")))?;
        Ok(Some(tx.write_balance(key, balance, Utc::now()).await?))
    }

    /// Removes `delta` coins. Returns `None` without touching the wallet
    /// when `delta <= 0`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientBalance`] if the balance would go
    /// negative, [`LedgerError::Store`] on persistence failure.
    pub async fn decrement_balance(
        &self,
        tx: &mut dyn LedgerTx,
        key: WalletKey,
        delta: i64,
        locked: Option<&Wallet>,
    ) -> Result<Option<Wallet>, LedgerError> {
        if delta <= 0 {
            return Ok(None);
        }
        let wallet = self.locked(tx, key, locked).await?;
        if wallet.balance < delta {
            return Err(LedgerError::InsufficientBalance {
                balance: wallet.balance,
                requested: delta,
            });
        }
        Ok(Some(
            tx.write_balance(key, wallet.balance - delta, Utc::now())
                .await?,
        ))
    }

    /// Overwrites the balance.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] for a negative value,
    /// [`LedgerError::Store`] on persistence failure.
    pub async fn set_balance(
        &self,
        tx: &mut dyn LedgerTx,
        key: WalletKey,
        value: i64,
        locked: Option<&Wallet>,
    ) -> Result<Wallet, LedgerError> {
        if value < 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "balance must be non-negative, got {value}"
            )));
        }
        self.locked(tx, key, locked).await?;
        Ok(tx.write_balance(key, value, Utc::now()).await?)
    }
}
