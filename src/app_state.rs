//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::persistence::LedgerStore;
use crate::resilience::{CircuitBreakerRegistry, RetryPolicy};
use crate::service::{
    BalanceRelay, ChannelSettingsSource, EconomyService, IdentityResolver, OutboxQueue,
    RewardRecorder, StreamStatusSource, WalletLedger,
};

/// External collaborators the ledger consults but does not own.
#[derive(Debug, Clone)]
pub struct Collaborators {
    /// Platform account to internal user mapping.
    pub identities: Arc<dyn IdentityResolver>,
    /// Live status per channel.
    pub streams: Arc<dyn StreamStatusSource>,
    /// Reward rules and economy settings per channel.
    pub channels: Arc<dyn ChannelSettingsSource>,
}

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Wallet reads and the race counter.
    pub ledger: Arc<WalletLedger>,
    /// Reward delivery ingestion.
    pub recorder: Arc<RewardRecorder>,
    /// Bonus claims, spending and admin overrides.
    pub economy: Arc<EconomyService>,
    /// Outbound chat queue.
    pub outbox: OutboxQueue,
    /// Local bus plus peer relay.
    pub relay: BalanceRelay,
    /// Breakers of all outbound dependencies.
    pub breakers: Arc<CircuitBreakerRegistry>,
}

impl AppState {
    /// Wires the services over one store.
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        collaborators: Collaborators,
        relay: BalanceRelay,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryPolicy,
    ) -> Self {
        let ledger = Arc::new(WalletLedger::new(Arc::clone(&store)));
        let recorder = RewardRecorder::new(
            Arc::clone(&ledger),
            collaborators.identities,
            Arc::clone(&collaborators.streams),
            Arc::clone(&collaborators.channels),
            relay.clone(),
            retry,
        );
        let economy = EconomyService::new(
            Arc::clone(&ledger),
            collaborators.channels,
            collaborators.streams,
            relay.clone(),
            retry,
        );
        Self {
            ledger,
            recorder: Arc::new(recorder),
            economy: Arc::new(economy),
            outbox: OutboxQueue::new(store),
            relay,
            breakers,
        }
    }
}
