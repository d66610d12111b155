//! Domain layer: identifiers, wallets, reward events, outbox rows,
//! channel settings, economy rules and the wallet event bus.
//!
//! Everything in here is storage-agnostic; persistence lives in
//! [`crate::persistence`] and orchestration in [`crate::service`].

pub mod economy_policy;
pub mod event_bus;
pub mod ids;
pub mod outbox;
pub mod reward;
pub mod settings;
pub mod wallet;
pub mod wallet_event;

pub use economy_policy::ClaimRejection;
pub use event_bus::{EventBus, WalletFeed};
pub use ids::{ChannelId, UserId, WalletKey};
pub use outbox::{OutboxMessage, OutboxStatus};
pub use reward::{
    IgnoreReason, IncomingReward, NormalizedReward, Provider, RewardDelivery, RewardEventInput,
    RewardStatus,
};
pub use settings::{
    ChannelSettings, EconomySettings, LiveRequirement, RewardRule, StreamSnapshot, StreamState,
};
pub use wallet::{BonusState, Wallet};
pub use wallet_event::{WalletUpdateEvent, WalletUpdateReason};
