//! Read/write loop of a single WebSocket connection.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

use super::messages::{WsCommand, WsMessage, WsMessageType, WsRequest};
use super::subscription::SubscriptionManager;
use crate::domain::{WalletFeed, WalletUpdateEvent};

/// Runs the connection until the client leaves or the bus closes.
///
/// Client commands update the subscription filter; matching wallet
/// updates from `feed` are forwarded as `event` frames.
pub async fn run_connection(socket: WebSocket, mut feed: WalletFeed) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut subs = SubscriptionManager::new();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_text_message(&text, &mut subs);
                        let Ok(json) = serde_json::to_string(&reply) else {
                            continue;
                        };
                        if ws_tx.send(Message::text(json)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
            event = feed.recv() => {
                let Some(event) = event else {
                    break;
                };
                if !subs.matches(&event) {
                    continue;
                }
                let Some(json) = event_frame(&event) else {
                    continue;
                };
                if ws_tx.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("ws connection closed");
}

fn event_frame(event: &WalletUpdateEvent) -> Option<String> {
    let payload = serde_json::to_value(event).ok()?;
    let msg = WsMessage::new(uuid::Uuid::new_v4().to_string(), WsMessageType::Event, payload);
    serde_json::to_string(&msg).ok()
}

/// Applies one client frame to `subs` and builds the reply.
fn handle_text_message(text: &str, subs: &mut SubscriptionManager) -> WsMessage {
    let request = match serde_json::from_str::<WsRequest>(text) {
        Ok(request) => request,
        Err(e) => {
            return WsMessage::error(String::new(), 400, &format!("invalid command: {e}"));
        }
    };
    let id = request.id.unwrap_or_default();
    match request.command {
        WsCommand::Subscribe {
            user_ids,
            channel_ids,
        } => {
            subs.subscribe(&user_ids, &channel_ids);
            WsMessage::new(
                id,
                WsMessageType::Response,
                serde_json::json!({
                    "subscribed": { "user_ids": user_ids, "channel_ids": channel_ids },
                    "count": subs.count(),
                }),
            )
        }
        WsCommand::Unsubscribe {
            user_ids,
            channel_ids,
        } => {
            subs.unsubscribe(&user_ids, &channel_ids);
            WsMessage::new(
                id,
                WsMessageType::Response,
                serde_json::json!({
                    "unsubscribed": { "user_ids": user_ids, "channel_ids": channel_ids },
                    "remaining_count": subs.count(),
                }),
            )
        }
    }
}
