//! WebSocket message types: server envelope and client commands.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, UserId};

/// Envelope of every server-to-client frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsMessage {
    /// Echoed request id for responses; server-generated for events.
    pub id: String,
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub msg_type: WsMessageType,
    /// Server time.
    pub timestamp: DateTime<Utc>,
    /// Variant-specific payload.
    pub payload: serde_json::Value,
}

impl WsMessage {
    /// Builds a frame stamped with the current time.
    #[must_use]
    pub fn new(id: String, msg_type: WsMessageType, payload: serde_json::Value) -> Self {
        Self {
            id,
            msg_type,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Builds an error frame.
    #[must_use]
    pub fn error(id: String, code: u16, message: &str) -> Self {
        Self::new(
            id,
            WsMessageType::Error,
            serde_json::json!({ "code": code, "message": message }),
        )
    }
}

/// Discriminator for server frames.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WsMessageType {
    /// Reply to a client command.
    Response,
    /// Wallet update pushed by the server.
    Event,
    /// Command rejected.
    Error,
}

/// A client frame: an optional correlation id plus the command.
#[derive(Debug, Clone, Deserialize)]
pub struct WsRequest {
    /// Correlation id echoed in the response.
    #[serde(default)]
    pub id: Option<String>,
    /// The command itself.
    #[serde(flatten)]
    pub command: WsCommand,
}

/// Commands a client can send.
///
/// ```json
/// {"command":"subscribe","user_ids":["…"],"channel_ids":["…"]}
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WsCommand {
    /// Start receiving wallet updates for these users and channels.
    Subscribe {
        /// Users whose wallets (in any channel) to follow.
        #[serde(default)]
        user_ids: Vec<UserId>,
        /// Channels whose wallets (of any user) to follow.
        #[serde(default)]
        channel_ids: Vec<ChannelId>,
    },
    /// Stop receiving updates for these users and channels.
    Unsubscribe {
        /// Users to drop.
        #[serde(default)]
        user_ids: Vec<UserId>,
        /// Channels to drop.
        #[serde(default)]
        channel_ids: Vec<ChannelId>,
    },
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscribe_with_missing_lists() {
        let user = UserId::new();
        let text = format!(r#"{{"id":"1","command":"subscribe","user_ids":["{user}"]}}"#);
        let Ok(request) = serde_json::from_str::<WsRequest>(&text) else {
            panic!("subscribe did not parse");
        };
        assert_eq!(request.id.as_deref(), Some("1"));
        assert_eq!(
            request.command,
            WsCommand::Subscribe {
                user_ids: vec![user],
                channel_ids: Vec::new(),
            }
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(serde_json::from_str::<WsRequest>(r#"{"command":"teleport"}"#).is_err());
    }
}
