//! Realtime balance relay.
//!
//! Committed wallet events are published on the local [`EventBus`] and
//! forwarded to every configured peer instance with a best-effort HTTP
//! POST. Peer failures are logged and dropped: the ledger write has
//! already committed and realtime delivery is at most once.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::{EventBus, WalletUpdateEvent};
use crate::error::LedgerError;
use crate::resilience::{BreakerError, CircuitBreakerRegistry};
use crate::service::tx_events::CommittedEvents;

/// Header carrying the shared relay secret.
pub const RELAY_SECRET_HEADER: &str = "x-internal-relay-secret";

/// Path of the peer relay receiver.
pub const RELAY_PATH: &str = "/internal/wallet-updated";

/// Peer relay settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Identity stamped on events produced by this instance.
    pub instance_id: String,
    /// Base URLs of peer instances.
    pub peers: Vec<String>,
    /// Shared secret for the internal endpoint; `None` disables relaying
    /// in both directions.
    pub secret: Option<String>,
    /// Timeout of one peer POST.
    pub timeout: Duration,
}

/// Fans committed wallet events out to local subscribers and peers.
#[derive(Debug, Clone)]
pub struct BalanceRelay {
    event_bus: EventBus,
    settings: Arc<RelaySettings>,
    client: reqwest::Client,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl BalanceRelay {
    /// Creates a relay.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Internal`] if the HTTP client cannot be built.
    pub fn new(
        event_bus: EventBus,
        settings: RelaySettings,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| LedgerError::Internal(format!("relay http client: {e}")))?;
        Ok(Self {
            event_bus,
            settings: Arc::new(settings),
            client,
            breakers,
        })
    }

    /// Identity of this instance.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.settings.instance_id
    }

    /// Returns the local event bus.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Emits committed events locally and schedules the peer relay.
    ///
    /// Returns immediately; each peer gets its own background task that
    /// posts the events in order.
    pub fn publish(&self, committed: CommittedEvents) {
        if committed.is_empty() {
            return;
        }
        let events = committed.into_events();
        for event in &events {
            let receivers = self.event_bus.publish(event.clone());
            tracing::debug!(
                wallet = %event.key(),
                balance = event.balance,
                receivers,
                "wallet update emitted"
            );
        }

        let Some(secret) = self.settings.secret.clone() else {
            return;
        };
        if self.settings.peers.is_empty() {
            return;
        }
        // Per-peer tasks; each keeps its events in order.
        let events = Arc::new(events);
        for peer in &self.settings.peers {
            let relay = self.clone();
            let peer = peer.clone();
            let secret = secret.clone();
            let events = Arc::clone(&events);
            tokio::spawn(async move {
                for event in events.iter() {
                    relay.post_to_peer(&peer, &secret, event).await;
                }
            });
        }
    }

    async fn post_to_peer(&self, peer: &str, secret: &str, event: &WalletUpdateEvent) {
        let breaker = self.breakers.get(&format!("peer:{peer}"));
        let url = format!("{}{RELAY_PATH}", peer.trim_end_matches('/'));
        let result = breaker
            .execute(|| async {
                self.client
                    .post(&url)
                    .header(RELAY_SECRET_HEADER, secret)
                    .json(event)
                    .send()
                    .await?
                    .error_for_status()
            })
            .await;
        match result {
            Ok(_) => tracing::debug!(peer, wallet = %event.key(), "wallet update relayed"),
            Err(BreakerError::Open { .. }) => {
                tracing::debug!(peer, "peer breaker open; relay skipped");
            }
            Err(BreakerError::Inner(e)) => {
                tracing::warn!(peer, error = %e, "peer relay failed");
            }
        }
    }

    /// Checks the shared secret presented by a peer.
    #[must_use]
    pub fn verify_secret(&self, presented: Option<&str>) -> bool {
        match (self.settings.secret.as_deref(), presented) {
            (Some(expected), Some(given)) => {
                expected.len() == given.len()
                    && expected
                        .bytes()
                        .zip(given.bytes())
                        .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
                        == 0
            }
            _ => false,
        }
    }

    /// Re-emits an event received from a peer on the local bus only.
    ///
    /// Returns `false` for events this instance produced itself.
    pub fn accept_remote(&self, event: WalletUpdateEvent) -> bool {
        if event.origin_instance == self.settings.instance_id {
            return false;
        }
        let _ = self.event_bus.publish(event);
        true
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use axum::Router;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use chrono::Utc;
    use tokio::sync::mpsc;

    use super::*;
    use crate::domain::{ChannelId, UserId, WalletKey, WalletUpdateReason};
    use crate::persistence::LedgerStore;
    use crate::persistence::memory::MemoryStore;
    use crate::resilience::BreakerConfig;
    use crate::service::tx_events::TxEventBuffer;

    fn settings(instance: &str, peers: Vec<String>, secret: Option<&str>) -> RelaySettings {
        RelaySettings {
            instance_id: instance.to_string(),
            peers,
            secret: secret.map(str::to_string),
            timeout: Duration::from_millis(500),
        }
    }

    fn relay(instance: &str, peers: Vec<String>, secret: Option<&str>) -> BalanceRelay {
        let Ok(relay) = BalanceRelay::new(
            EventBus::new(16),
            settings(instance, peers, secret),
            Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
        ) else {
            panic!("relay construction failed");
        };
        relay
    }

    fn event(origin: &str) -> WalletUpdateEvent {
        WalletUpdateEvent {
            user_id: UserId::new(),
            channel_id: ChannelId::new(),
            channel_slug: Some("streamer".to_string()),
            balance: 30,
            delta: 10,
            reason: WalletUpdateReason::Reward,
            origin_instance: origin.to_string(),
            timestamp: Utc::now(),
        }
    }

    async fn committed(events: Vec<WalletUpdateEvent>) -> CommittedEvents {
        let store = MemoryStore::new();
        let Ok(tx) = store.begin().await else {
            panic!("begin failed");
        };
        let mut buffer = TxEventBuffer::new();
        for e in events {
            buffer.stage(e);
        }
        let Ok(done) = buffer.commit(tx).await else {
            panic!("commit failed");
        };
        done
    }

    #[tokio::test]
    async fn publish_emits_locally() {
        let relay = relay("a", Vec::new(), None);
        let mut rx = relay.event_bus().subscribe();
        let e = event("a");
        relay.publish(committed(vec![e.clone()]).await);
        let Ok(received) = rx.recv().await else {
            panic!("no event");
        };
        assert_eq!(received, e);
    }

    #[tokio::test]
    async fn remote_events_from_self_are_ignored() {
        let relay = relay("a", Vec::new(), Some("s3cret"));
        let mut rx = relay.event_bus().subscribe();
        assert!(!relay.accept_remote(event("a")));
        assert!(relay.accept_remote(event("b")));
        let Ok(received) = rx.recv().await else {
            panic!("no event");
        };
        assert_eq!(received.origin_instance, "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn secret_must_match_exactly() {
        let with_secret = relay("a", Vec::new(), Some("s3cret"));
        assert!(with_secret.verify_secret(Some("s3cret")));
        assert!(!with_secret.verify_secret(Some("s3cre")));
        assert!(!with_secret.verify_secret(Some("s3cret!")));
        assert!(!with_secret.verify_secret(None));

        let without = relay("a", Vec::new(), None);
        assert!(!without.verify_secret(Some("")));
    }

    #[tokio::test]
    async fn peers_receive_relayed_events_with_secret() {
        let (tx, mut rx) = mpsc::channel::<(Option<String>, WalletUpdateEvent)>(4);
        let app = Router::new()
            .route(
                RELAY_PATH,
                post(
                    |State(tx): State<mpsc::Sender<(Option<String>, WalletUpdateEvent)>>,
                     headers: HeaderMap,
                     axum::Json(event): axum::Json<WalletUpdateEvent>| async move {
                        let secret = headers
                            .get(RELAY_SECRET_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let _ = tx.send((secret, event)).await;
                    },
                ),
            )
            .with_state(tx);
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let relay = relay("a", vec![format!("http://{addr}/")], Some("s3cret"));
        let e = event("a");
        relay.publish(committed(vec![e.clone()]).await);

        let Ok(Some((secret, received))) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await
        else {
            panic!("peer received nothing");
        };
        assert_eq!(secret.as_deref(), Some("s3cret"));
        assert_eq!(received, e);
    }

    #[tokio::test]
    async fn unreachable_peer_is_swallowed() {
        let relay = relay("a", vec!["http://127.0.0.1:9".to_string()], Some("s3cret"));
        let mut rx = relay.event_bus().subscribe();
        let key = WalletKey::new(UserId::new(), ChannelId::new());
        let mut e = event("a");
        e.user_id = key.user_id;
        e.channel_id = key.channel_id;
        relay.publish(committed(vec![e]).await);
        let Ok(received) = rx.recv().await else {
            panic!("local emission lost");
        };
        assert_eq!(received.key(), key);
    }

    async fn recording_peer(delay: Duration) -> (String, mpsc::Receiver<WalletUpdateEvent>) {
        let (tx, rx) = mpsc::channel::<WalletUpdateEvent>(8);
        let app = Router::new()
            .route(
                RELAY_PATH,
                post(
                    move |State(tx): State<mpsc::Sender<WalletUpdateEvent>>,
                          axum::Json(event): axum::Json<WalletUpdateEvent>| async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(event).await;
                    },
                ),
            )
            .with_state(tx);
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}"), rx)
    }

    #[tokio::test]
    async fn slow_peer_does_not_hold_back_others() {
        let (slow_url, _slow_rx) = recording_peer(Duration::from_millis(450)).await;
        let (fast_url, mut fast_rx) = recording_peer(Duration::ZERO).await;
        let relay = relay("a", vec![slow_url, fast_url], Some("s3cret"));
        let first = event("a");
        let second = event("a");
        relay.publish(committed(vec![first.clone(), second.clone()]).await);

        let received = tokio::time::timeout(Duration::from_millis(400), async {
            let a = fast_rx.recv().await;
            let b = fast_rx.recv().await;
            (a, b)
        })
        .await;
        let Ok((Some(a), Some(b))) = received else {
            panic!("fast peer was held back");
        };
        assert_eq!((a, b), (first, second));
    }
}
