//! Contracts of the read-only collaborators the ledger consults:
//! identity links, stream status and channel settings.
//!
//! The in-memory implementations back `PERSISTENCE_ENABLED=false` and the
//! tests; [`crate::persistence::postgres::PostgresStore`] implements all
//! three against the shared database.

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::{ChannelId, ChannelSettings, Provider, StreamSnapshot, UserId};
use crate::persistence::StoreResult;

/// Maps a platform account to an internal user.
///
/// Safe to call inside or outside a ledger transaction.
#[async_trait]
pub trait IdentityResolver: Send + Sync + Debug {
    /// Returns the linked user, or `None` when the account is not linked.
    async fn resolve_internal_user_id(
        &self,
        provider: Provider,
        platform_account_id: &str,
    ) -> StoreResult<Option<UserId>>;
}

/// Eventually consistent stream liveness per channel.
#[async_trait]
pub trait StreamStatusSource: Send + Sync + Debug {
    /// Returns the last known snapshot; unknown channels are offline.
    async fn stream_status(&self, channel_slug: &str) -> StoreResult<StreamSnapshot>;
}

/// Per-channel reward and economy configuration.
#[async_trait]
pub trait ChannelSettingsSource: Send + Sync + Debug {
    /// Returns the channel's settings, or `None` for unknown channels.
    async fn channel_settings(&self, channel_id: ChannelId)
    -> StoreResult<Option<ChannelSettings>>;
}

/// [`IdentityResolver`] over a map of explicit links.
#[derive(Debug, Default)]
pub struct InMemoryIdentityResolver {
    links: RwLock<HashMap<(Provider, String), UserId>>,
}

impl InMemoryIdentityResolver {
    /// Creates a resolver with no links.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Links a platform account to a user, replacing any previous link.
    pub async fn link(&self, provider: Provider, platform_account_id: &str, user_id: UserId) {
        self.links
            .write()
            .await
            .insert((provider, platform_account_id.to_string()), user_id);
    }
}

#[async_trait]
impl IdentityResolver for InMemoryIdentityResolver {
    async fn resolve_internal_user_id(
        &self,
        provider: Provider,
        platform_account_id: &str,
    ) -> StoreResult<Option<UserId>> {
        Ok(self
            .links
            .read()
            .await
            .get(&(provider, platform_account_id.to_string()))
            .copied())
    }
}

/// [`StreamStatusSource`] fed by explicit updates.
#[derive(Debug, Default)]
pub struct InMemoryStreamStatus {
    snapshots: RwLock<HashMap<String, StreamSnapshot>>,
}

impl InMemoryStreamStatus {
    /// Creates a source where every channel is offline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the snapshot of a channel.
    pub async fn set(&self, channel_slug: &str, snapshot: StreamSnapshot) {
        self.snapshots
            .write()
            .await
            .insert(channel_slug.to_string(), snapshot);
    }
}

#[async_trait]
impl StreamStatusSource for InMemoryStreamStatus {
    async fn stream_status(&self, channel_slug: &str) -> StoreResult<StreamSnapshot> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(channel_slug)
            .cloned()
            .unwrap_or_default())
    }
}

/// [`ChannelSettingsSource`] over a map of channels.
#[derive(Debug, Default)]
pub struct InMemoryChannelSettings {
    channels: RwLock<HashMap<ChannelId, ChannelSettings>>,
}

impl InMemoryChannelSettings {
    /// Creates an empty settings store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a channel's settings.
    pub async fn insert(&self, channel_id: ChannelId, settings: ChannelSettings) {
        self.channels.write().await.insert(channel_id, settings);
    }
}

#[async_trait]
impl ChannelSettingsSource for InMemoryChannelSettings {
    async fn channel_settings(
        &self,
        channel_id: ChannelId,
    ) -> StoreResult<Option<ChannelSettings>> {
        Ok(self.channels.read().await.get(&channel_id).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::StreamState;

    #[tokio::test]
    async fn unlinked_accounts_resolve_to_none() {
        let resolver = InMemoryIdentityResolver::new();
        let user = UserId::new();
        resolver.link(Provider::Twitch, "acct-1", user).await;

        let Ok(found) = resolver
            .resolve_internal_user_id(Provider::Twitch, "acct-1")
            .await
        else {
            panic!("lookup failed");
        };
        assert_eq!(found, Some(user));

        let Ok(other) = resolver
            .resolve_internal_user_id(Provider::Kick, "acct-1")
            .await
        else {
            panic!("lookup failed");
        };
        assert_eq!(other, None);
    }

    #[tokio::test]
    async fn unknown_channels_are_offline() {
        let status = InMemoryStreamStatus::new();
        let Ok(snapshot) = status.stream_status("nobody").await else {
            panic!("lookup failed");
        };
        assert_eq!(snapshot.status, StreamState::Offline);
        assert!(snapshot.session_id.is_none());
    }
}
