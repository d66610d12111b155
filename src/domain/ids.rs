//! Type-safe user, channel and wallet identifiers.
//!
//! [`UserId`] and [`ChannelId`] are newtype wrappers around [`uuid::Uuid`]
//! so that the two halves of a wallet key can never be swapped by accident.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Creates a new random identifier (UUID v4).
            #[must_use]
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Wraps an existing [`uuid::Uuid`].
            #[must_use]
            pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the inner [`uuid::Uuid`].
            #[must_use]
            pub const fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for uuid::Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_newtype!(
    /// Internal (platform-independent) user identity.
    UserId
);

uuid_newtype!(
    /// Streamer channel that owns a set of wallets and reward rules.
    ChannelId
);

/// Composite wallet identity: one wallet per `(user, channel)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalletKey {
    /// Wallet owner.
    pub user_id: UserId,
    /// Channel whose coins the wallet holds.
    pub channel_id: ChannelId,
}

impl WalletKey {
    /// Builds a wallet key.
    #[must_use]
    pub const fn new(user_id: UserId, channel_id: ChannelId) -> Self {
        Self {
            user_id,
            channel_id,
        }
    }
}

impl fmt::Display for WalletKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.channel_id)
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn new_generates_unique_ids() {
        assert_ne!(UserId::new(), UserId::new());
        assert_ne!(ChannelId::new(), ChannelId::new());
    }

    #[test]
    fn serde_is_transparent() {
        let uuid = uuid::Uuid::new_v4();
        let id = UserId::from_uuid(uuid);
        let Ok(json) = serde_json::to_string(&id) else {
            panic!("serialization failed");
        };
        assert_eq!(json, format!("\"{uuid}\""));
    }

    #[test]
    fn wallet_key_display_joins_both_halves() {
        let user = UserId::new();
        let channel = ChannelId::new();
        let key = WalletKey::new(user, channel);
        assert_eq!(key.to_string(), format!("{user}@{channel}"));
    }

    #[test]
    fn wallet_key_works_in_hashmap() {
        use std::collections::HashMap;
        let key = WalletKey::new(UserId::new(), ChannelId::new());
        let mut map = HashMap::new();
        map.insert(key, 5_i64);
        assert_eq!(map.get(&key), Some(&5));
    }
}
