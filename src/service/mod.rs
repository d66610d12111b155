//! Service layer: ledger operations and their side channels.
//!
//! Every wallet mutation runs inside one store transaction through the
//! [`WalletLedger`] primitives, stages its [`WalletUpdateEvent`]s in a
//! [`TxEventBuffer`], and hands the committed batch to the
//! [`BalanceRelay`].
//!
//! [`WalletUpdateEvent`]: crate::domain::WalletUpdateEvent

pub mod balance_relay;
pub mod collaborators;
pub mod economy;
pub mod outbox;
pub mod reward_recorder;
pub mod tx_events;
pub mod wallet_ledger;

pub use balance_relay::{BalanceRelay, RelaySettings};
pub use collaborators::{
    ChannelSettingsSource, IdentityResolver, InMemoryChannelSettings, InMemoryIdentityResolver,
    InMemoryStreamStatus, StreamStatusSource,
};
pub use economy::{ClaimOutcome, ClaimReceipt, EconomyService};
pub use outbox::{
    ChatSender, DispatchReport, DispatcherSettings, HttpChatSender, OutboxDispatcher, OutboxQueue,
    SendError,
};
pub use reward_recorder::{RecordOutcome, RecordedEvent, RewardRecorder};
pub use tx_events::{CommittedEvents, EventStamp, TxEventBuffer};
pub use wallet_ledger::WalletLedger;
