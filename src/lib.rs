//! # memalerts-ledger
//!
//! Economy and reward ledger engine for a streamer coin economy.
//!
//! Provider reward deliveries (cheers, subscriptions, channel points, …)
//! are recorded exactly once and converted into per-channel wallet coins;
//! viewers claim daily and watch bonuses and spend coins on meme
//! activations. Every balance change commits inside one serializable
//! transaction and is then pushed to realtime clients on this and peer
//! instances. Outbound chat messages leave through a transactional outbox.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP, WebSocket)         Peer instances
//!     │                                  │
//!     ├── REST Handlers (api/)  ◄────────┤ /internal/wallet-updated
//!     ├── WS Handler (ws/)               │
//!     │                                  │
//!     ├── RewardRecorder / EconomyService (service/)
//!     ├── WalletLedger + TxEventBuffer (service/)
//!     ├── BalanceRelay ──► EventBus (domain/) ──► peers
//!     ├── OutboxDispatcher ──► chat bridges
//!     │
//!     ├── CircuitBreaker / with_retry (resilience/)
//!     └── PostgreSQL or in-memory store (persistence/)
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod resilience;
pub mod service;
pub mod ws;
