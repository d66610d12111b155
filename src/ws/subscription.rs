//! Per-connection subscription filter.

use std::collections::HashSet;

use crate::domain::{ChannelId, UserId, WalletUpdateEvent};

/// Users and channels a single WebSocket client follows.
///
/// An event matches if either its user or its channel is followed.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    user_ids: HashSet<UserId>,
    channel_ids: HashSet<ChannelId>,
}

impl SubscriptionManager {
    /// Creates an empty filter that matches nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Follows the given users and channels.
    pub fn subscribe(&mut self, users: &[UserId], channels: &[ChannelId]) {
        self.user_ids.extend(users.iter().copied());
        self.channel_ids.extend(channels.iter().copied());
    }

    /// Stops following the given users and channels.
    pub fn unsubscribe(&mut self, users: &[UserId], channels: &[ChannelId]) {
        for user in users {
            self.user_ids.remove(user);
        }
        for channel in channels {
            self.channel_ids.remove(channel);
        }
    }

    /// Returns `true` if the event should be forwarded to this client.
    #[must_use]
    pub fn matches(&self, event: &WalletUpdateEvent) -> bool {
        self.user_ids.contains(&event.user_id) || self.channel_ids.contains(&event.channel_id)
    }

    /// Number of followed users and channels.
    #[must_use]
    pub fn count(&self) -> usize {
        self.user_ids.len() + self.channel_ids.len()
    }
}
