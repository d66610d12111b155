//! Local fan-out of committed wallet updates.
//!
//! [`EventBus`] publishes each [`WalletUpdateEvent`] once. Consumers take a
//! [`WalletFeed`], which hides broadcast lag behind a plain `recv` and
//! records how many updates the consumer missed. The misses are also summed
//! on the bus so `/health` can report them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;

use super::{ChannelId, UserId, WalletUpdateEvent};

/// Broadcast bus for [`WalletUpdateEvent`]s.
///
/// When a consumer falls more than `capacity` events behind, its oldest
/// pending updates are dropped; a later balance event for the same wallet
/// supersedes them.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WalletUpdateEvent>,
    missed: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events (at least 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            missed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publishes an update and returns how many consumers got it.
    pub fn publish(&self, event: WalletUpdateEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Raw receiver of all future updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<WalletUpdateEvent> {
        self.sender.subscribe()
    }

    /// Lag-tolerant stream of all future updates.
    #[must_use]
    pub fn feed(&self) -> WalletFeed {
        WalletFeed {
            rx: self.sender.subscribe(),
            missed: 0,
            bus_missed: Arc::clone(&self.missed),
        }
    }

    /// Active consumers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Updates dropped for lagging feeds since start.
    #[must_use]
    pub fn missed_updates(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }
}

/// One consumer's view of the bus.
#[derive(Debug)]
pub struct WalletFeed {
    rx: broadcast::Receiver<WalletUpdateEvent>,
    missed: u64,
    bus_missed: Arc<AtomicU64>,
}

impl WalletFeed {
    /// Next update, skipping over any gap caused by lag. `None` once the
    /// bus is gone.
    pub async fn recv(&mut self) -> Option<WalletUpdateEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.missed = self.missed.saturating_add(n);
                    self.bus_missed.fetch_add(n, Ordering::Relaxed);
                    tracing::warn!(missed = n, "wallet feed lagged behind event bus");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next update touching `user_id` in `channel_id`.
    pub async fn recv_for(
        &mut self,
        user_id: UserId,
        channel_id: ChannelId,
    ) -> Option<WalletUpdateEvent> {
        loop {
            let event = self.recv().await?;
            if event.user_id == user_id && event.channel_id == channel_id {
                return Some(event);
            }
        }
    }

    /// Updates this feed has missed.
    #[must_use]
    pub fn missed(&self) -> u64 {
        self.missed
    }
}
