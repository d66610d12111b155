//! Transactional outbox for outbound chat messages.
//!
//! [`OutboxQueue`] writes rows; one [`OutboxDispatcher`] per platform polls
//! them. Workers coordinate only through the conditional claim update, so
//! any number of dispatcher processes can poll the same table.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::{ChannelId, OutboxMessage, Provider};
use crate::error::LedgerError;
use crate::persistence::LedgerStore;
use crate::resilience::{BreakerError, BreakerFailure, CircuitBreaker, CircuitBreakerRegistry};

/// Outbound delivery failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct SendError {
    /// HTTP status returned by the platform, if any.
    pub status: Option<u16>,
    /// Whether the call timed out.
    pub timeout: bool,
    /// Description for `last_error`.
    pub message: String,
}

impl BreakerFailure for SendError {
    fn is_breaker_failure(&self) -> bool {
        self.timeout || self.status.is_none_or(|s| s >= 500)
    }
}

impl From<reqwest::Error> for SendError {
    fn from(e: reqwest::Error) -> Self {
        Self {
            status: e.status().map(|s| s.as_u16()),
            timeout: e.is_timeout(),
            message: e.to_string(),
        }
    }
}

/// Platform capability to post chat messages.
#[async_trait]
pub trait ChatSender: Send + Sync + Debug {
    /// Returns `true` once the bot has joined `destination`.
    async fn is_destination_ready(&self, destination: &str) -> Result<bool, SendError>;

    /// Delivers one message.
    async fn send(&self, message: &OutboxMessage) -> Result<(), SendError>;
}

#[derive(Debug, Deserialize)]
struct RoomStatus {
    joined: bool,
}

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    id: Uuid,
    channel_id: ChannelId,
    destination: &'a str,
    payload: &'a serde_json::Value,
}

/// [`ChatSender`] backed by a platform chat bridge service.
///
/// `GET {base}/rooms/{destination}` answers `{"joined": bool}`;
/// `POST {base}/messages` delivers.
#[derive(Debug, Clone)]
pub struct HttpChatSender {
    base_url: String,
    client: reqwest::Client,
}

impl HttpChatSender {
    /// Creates a sender for the bridge at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Internal`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Internal(format!("chat http client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl ChatSender for HttpChatSender {
    async fn is_destination_ready(&self, destination: &str) -> Result<bool, SendError> {
        let response = self
            .client
            .get(format!("{}/rooms/{destination}", self.base_url))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let status: RoomStatus = response.error_for_status()?.json().await?;
        Ok(status.joined)
    }

    async fn send(&self, message: &OutboxMessage) -> Result<(), SendError> {
        self.client
            .post(format!("{}/messages", self.base_url))
            .json(&OutboundMessage {
                id: message.id,
                channel_id: message.channel_id,
                destination: &message.destination,
                payload: &message.payload,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Writes new outbox rows.
#[derive(Debug, Clone)]
pub struct OutboxQueue {
    store: Arc<dyn LedgerStore>,
}

impl OutboxQueue {
    /// Creates a queue over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Enqueues a message and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidRequest`] for an empty destination and
    /// [`LedgerError::Store`] on persistence failure.
    pub async fn enqueue(
        &self,
        platform: Provider,
        channel_id: ChannelId,
        destination: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, LedgerError> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(LedgerError::InvalidRequest(
                "destination must not be empty".to_string(),
            ));
        }
        let message = OutboxMessage::pending(platform, channel_id, destination.to_string(), payload);
        self.store.insert_outbox(&message).await?;
        tracing::debug!(id = %message.id, %platform, destination, "outbox message enqueued");
        Ok(message.id)
    }
}

/// Polling parameters of a dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    /// Sleep between polls.
    pub poll_interval: Duration,
    /// Candidate rows per poll.
    pub batch_size: i64,
    /// Attempts after which a row is marked failed.
    pub max_attempts: i32,
    /// Age after which a `processing` claim is considered abandoned.
    pub stale_after: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 25,
            max_attempts: 5,
            stale_after: Duration::from_secs(60),
        }
    }
}

/// Counters of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Rows this worker claimed.
    pub claimed: usize,
    /// Rows delivered.
    pub sent: usize,
    /// Rows returned to `pending` after a failed attempt.
    pub retried: usize,
    /// Rows marked permanently failed.
    pub failed: usize,
    /// Rows left untouched because their destination is not ready.
    pub skipped_not_ready: usize,
    /// Rows left `pending` because the platform breaker is open.
    pub skipped_breaker_open: usize,
    /// Claims lost to another worker.
    pub lost_claims: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    NotReady,
    BreakerOpen,
}

/// Claim-based delivery worker for one platform.
#[derive(Debug)]
pub struct OutboxDispatcher {
    platform: Provider,
    store: Arc<dyn LedgerStore>,
    sender: Arc<dyn ChatSender>,
    breaker: Arc<CircuitBreaker>,
    settings: DispatcherSettings,
}

impl OutboxDispatcher {
    /// Creates a dispatcher; its sends go through the `chat:<platform>`
    /// breaker of `breakers`.
    #[must_use]
    pub fn new(
        platform: Provider,
        store: Arc<dyn LedgerStore>,
        sender: Arc<dyn ChatSender>,
        breakers: &CircuitBreakerRegistry,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            platform,
            store,
            sender,
            breaker: breakers.get(&format!("chat:{platform}")),
            settings,
        }
    }

    /// Runs one poll cycle.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] if the store fails; rows claimed
    /// before the failure are recovered through the staleness window.
    pub async fn poll_once(&self) -> Result<DispatchReport, LedgerError> {
        let stale_after = chrono::Duration::from_std(self.settings.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = Utc::now();
        let stale_before = now
            .checked_sub_signed(stale_after)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let candidates = self
            .store
            .outbox_candidates(self.platform, stale_before, self.settings.batch_size)
            .await?;

        let mut report = DispatchReport::default();
        let mut readiness: HashMap<String, Readiness> = HashMap::new();

        for row in candidates {
            match self.destination_ready(&row.destination, &mut readiness).await {
                Readiness::Ready => {}
                Readiness::NotReady => {
                    report.skipped_not_ready += 1;
                    continue;
                }
                Readiness::BreakerOpen => {
                    report.skipped_breaker_open += 1;
                    continue;
                }
            }

            let claimed_at = Utc::now();
            if !self
                .store
                .claim_outbox(row.id, row.status, row.processing_at, claimed_at)
                .await?
            {
                report.lost_claims += 1;
                continue;
            }
            report.claimed += 1;

            let result = self.breaker.execute(|| self.sender.send(&row)).await;
            let now = Utc::now();
            match result {
                Ok(()) => {
                    if self.store.mark_outbox_sent(row.id, claimed_at, now).await? {
                        report.sent += 1;
                        tracing::debug!(id = %row.id, platform = %self.platform, "outbox message sent");
                    } else {
                        report.lost_claims += 1;
                    }
                }
                Err(BreakerError::Open { service, .. }) => {
                    let error = format!("circuit breaker {service} open");
                    if self.store.unclaim_outbox(row.id, claimed_at, &error).await? {
                        report.skipped_breaker_open += 1;
                    } else {
                        report.lost_claims += 1;
                    }
                }
                Err(BreakerError::Inner(inner)) => {
                    let error = inner.to_string();
                    if row.attempts.saturating_add(1) >= self.settings.max_attempts {
                        if self.store.fail_outbox(row.id, claimed_at, &error, now).await? {
                            report.failed += 1;
                            tracing::warn!(
                                id = %row.id,
                                platform = %self.platform,
                                attempts = row.attempts + 1,
                                %error,
                                "outbox message failed permanently"
                            );
                        } else {
                            report.lost_claims += 1;
                        }
                    } else if self.store.release_outbox(row.id, claimed_at, &error).await? {
                        report.retried += 1;
                        tracing::debug!(id = %row.id, %error, "outbox send failed; will retry");
                    } else {
                        report.lost_claims += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Readiness checks run through the platform breaker too.
    async fn destination_ready(
        &self,
        destination: &str,
        cache: &mut HashMap<String, Readiness>,
    ) -> Readiness {
        if let Some(ready) = cache.get(destination) {
            return *ready;
        }
        let ready = match self
            .breaker
            .execute(|| self.sender.is_destination_ready(destination))
            .await
        {
            Ok(true) => Readiness::Ready,
            Ok(false) => Readiness::NotReady,
            Err(BreakerError::Open { .. }) => Readiness::BreakerOpen,
            Err(BreakerError::Inner(e)) => {
                tracing::debug!(platform = %self.platform, destination, error = %e, "readiness check failed");
                Readiness::NotReady
            }
        };
        cache.insert(destination.to_string(), ready);
        ready
    }

    /// Polls until `shutdown` flips to `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(platform = %self.platform, "outbox dispatcher started");
        let mut ticker =
            tokio::time::interval(self.settings.poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(report) if report != DispatchReport::default() => {
                            tracing::info!(platform = %self.platform, ?report, "outbox poll");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(platform = %self.platform, error = %e, "outbox poll failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(platform = %self.platform, "outbox dispatcher stopped");
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use axum::Router;
    use axum::extract::Path;
    use axum::routing::{get, post};
    use serde_json::json;

    use super::*;
    use crate::domain::OutboxStatus;
    use crate::persistence::memory::MemoryStore;
    use crate::resilience::{BreakerConfig, BreakerState};

    #[derive(Debug, Default)]
    struct FakeSender {
        not_ready: HashSet<String>,
        fail_status: Option<u16>,
        ready_fail_status: Option<u16>,
        sent: Mutex<Vec<Uuid>>,
        send_calls: Mutex<usize>,
        ready_calls: Mutex<usize>,
    }

    impl FakeSender {
        fn sent(&self) -> Vec<Uuid> {
            self.sent.lock().map(|v| v.clone()).unwrap_or_default()
        }

        fn calls(&self) -> usize {
            self.send_calls.lock().map(|v| *v).unwrap_or_default()
        }

        fn ready_calls(&self) -> usize {
            self.ready_calls.lock().map(|v| *v).unwrap_or_default()
        }
    }

    #[async_trait]
    impl ChatSender for FakeSender {
        async fn is_destination_ready(&self, destination: &str) -> Result<bool, SendError> {
            if let Ok(mut calls) = self.ready_calls.lock() {
                *calls += 1;
            }
            if let Some(status) = self.ready_fail_status {
                return Err(SendError {
                    status: Some(status),
                    timeout: false,
                    message: format!("bridge answered {status}"),
                });
            }
            Ok(!self.not_ready.contains(destination))
        }

        async fn send(&self, message: &OutboxMessage) -> Result<(), SendError> {
            if let Ok(mut calls) = self.send_calls.lock() {
                *calls += 1;
            }
            if let Some(status) = self.fail_status {
                return Err(SendError {
                    status: Some(status),
                    timeout: false,
                    message: format!("bridge answered {status}"),
                });
            }
            if let Ok(mut sent) = self.sent.lock() {
                sent.push(message.id);
            }
            Ok(())
        }
    }

    fn dispatcher(
        store: &Arc<MemoryStore>,
        sender: &Arc<FakeSender>,
        breakers: &CircuitBreakerRegistry,
        max_attempts: i32,
    ) -> OutboxDispatcher {
        OutboxDispatcher::new(
            Provider::Twitch,
            Arc::clone(store) as Arc<dyn LedgerStore>,
            Arc::clone(sender) as Arc<dyn ChatSender>,
            breakers,
            DispatcherSettings {
                max_attempts,
                ..DispatcherSettings::default()
            },
        )
    }

    async fn enqueue(store: &Arc<MemoryStore>, destination: &str) -> Uuid {
        let queue = OutboxQueue::new(Arc::clone(store) as Arc<dyn LedgerStore>);
        let Ok(id) = queue
            .enqueue(Provider::Twitch, ChannelId::new(), destination, json!({"text": "hi"}))
            .await
        else {
            panic!("enqueue failed");
        };
        id
    }

    async fn row(store: &MemoryStore, id: Uuid) -> OutboxMessage {
        let Ok(Some(row)) = store.find_outbox(id).await else {
            panic!("row {id} missing");
        };
        row
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_destination() {
        let store = Arc::new(MemoryStore::new());
        let queue = OutboxQueue::new(store as Arc<dyn LedgerStore>);
        assert!(matches!(
            queue
                .enqueue(Provider::Kick, ChannelId::new(), "  ", json!({}))
                .await,
            Err(LedgerError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn pending_message_is_sent() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(FakeSender::default());
        let breakers = CircuitBreakerRegistry::new(BreakerConfig::default());
        let id = enqueue(&store, "room").await;

        let Ok(report) = dispatcher(&store, &sender, &breakers, 5).poll_once().await else {
            panic!("poll failed");
        };
        assert_eq!((report.claimed, report.sent), (1, 1));
        let sent = row(&store, id).await;
        assert_eq!(sent.status, OutboxStatus::Sent);
        assert_eq!(sent.attempts, 1);
        assert!(sent.sent_at.is_some());
        assert_eq!(sender.sent(), vec![id]);
    }

    #[tokio::test]
    async fn unready_destination_is_left_pending() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(FakeSender {
            not_ready: HashSet::from(["closed".to_string()]),
            ..FakeSender::default()
        });
        let breakers = CircuitBreakerRegistry::new(BreakerConfig::default());
        let id = enqueue(&store, "closed").await;

        let Ok(report) = dispatcher(&store, &sender, &breakers, 5).poll_once().await else {
            panic!("poll failed");
        };
        assert_eq!(report.skipped_not_ready, 1);
        assert_eq!(report.claimed, 0);
        let pending = row(&store, id).await;
        assert_eq!(pending.status, OutboxStatus::Pending);
        assert_eq!(pending.attempts, 0);
    }

    #[tokio::test]
    async fn failures_retry_until_max_attempts() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(FakeSender {
            fail_status: Some(400),
            ..FakeSender::default()
        });
        let breakers = CircuitBreakerRegistry::new(BreakerConfig::default());
        let worker = dispatcher(&store, &sender, &breakers, 2);
        let id = enqueue(&store, "room").await;

        let Ok(first) = worker.poll_once().await else {
            panic!("poll failed");
        };
        assert_eq!(first.retried, 1);
        let retried = row(&store, id).await;
        assert_eq!((retried.status, retried.attempts), (OutboxStatus::Pending, 1));
        assert!(retried.processing_at.is_none());
        assert!(retried.last_error.is_some());

        let Ok(second) = worker.poll_once().await else {
            panic!("poll failed");
        };
        assert_eq!(second.failed, 1);
        let failed = row(&store, id).await;
        assert_eq!((failed.status, failed.attempts), (OutboxStatus::Failed, 2));
        assert!(failed.failed_at.is_some());
    }

    #[tokio::test]
    async fn open_breaker_leaves_rows_pending_without_attempts() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(FakeSender {
            fail_status: Some(503),
            ..FakeSender::default()
        });
        let breakers = CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        });
        let worker = dispatcher(&store, &sender, &breakers, 5);
        let first = enqueue(&store, "room").await;
        let second = enqueue(&store, "room").await;

        // The first send trips the breaker; the second row shares the cached
        // readiness, gets claimed and is handed back untouched.
        let Ok(report) = worker.poll_once().await else {
            panic!("poll failed");
        };
        assert_eq!(sender.calls(), 1);
        assert_eq!((report.retried, report.skipped_breaker_open), (1, 1));

        for _ in 0..5 {
            let Ok(report) = worker.poll_once().await else {
                panic!("poll failed");
            };
            assert_eq!(report.skipped_breaker_open, 2);
            assert_eq!(report.claimed, 0);
        }
        assert_eq!(sender.calls(), 1);

        let rows = [row(&store, first).await, row(&store, second).await];
        assert!(rows.iter().all(|r| r.status == OutboxStatus::Pending));
        assert!(rows.iter().all(|r| r.processing_at.is_none()));
        assert_eq!(rows.iter().map(|r| r.attempts).sum::<i32>(), 1);
        assert!(rows.iter().any(|r| {
            r.attempts == 0
                && r.last_error
                    .as_deref()
                    .is_some_and(|e| e.contains("chat:twitch"))
        }));
    }

    #[tokio::test]
    async fn readiness_failures_trip_the_breaker() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(FakeSender {
            ready_fail_status: Some(502),
            ..FakeSender::default()
        });
        let breakers = CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            ..BreakerConfig::default()
        });
        let worker = dispatcher(&store, &sender, &breakers, 5);
        let a = enqueue(&store, "room-a").await;
        let b = enqueue(&store, "room-b").await;

        let Ok(report) = worker.poll_once().await else {
            panic!("poll failed");
        };
        assert_eq!(report.skipped_not_ready, 2);
        assert_eq!(sender.ready_calls(), 2);
        assert_eq!(breakers.get("chat:twitch").state(), BreakerState::Open);

        let Ok(report) = worker.poll_once().await else {
            panic!("poll failed");
        };
        assert_eq!(report.skipped_breaker_open, 2);
        assert_eq!(sender.ready_calls(), 2);
        assert_eq!(sender.calls(), 0);
        assert_eq!(row(&store, a).await.attempts, 0);
        assert_eq!(row(&store, b).await.attempts, 0);
    }

    #[tokio::test]
    async fn stale_processing_rows_are_reclaimed() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(FakeSender::default());
        let breakers = CircuitBreakerRegistry::new(BreakerConfig::default());
        let mut abandoned = OutboxMessage::pending(
            Provider::Twitch,
            ChannelId::new(),
            "room".to_string(),
            json!({"text": "late"}),
        );
        abandoned.status = OutboxStatus::Processing;
        abandoned.processing_at = Some(Utc::now() - chrono::Duration::minutes(10));
        assert!(store.insert_outbox(&abandoned).await.is_ok());

        let mut fresh = abandoned.clone();
        fresh.id = Uuid::new_v4();
        fresh.processing_at = Some(Utc::now());
        assert!(store.insert_outbox(&fresh).await.is_ok());

        let Ok(report) = dispatcher(&store, &sender, &breakers, 5).poll_once().await else {
            panic!("poll failed");
        };
        assert_eq!(report.sent, 1);
        assert_eq!(sender.sent(), vec![abandoned.id]);
        assert_eq!(row(&store, fresh.id).await.status, OutboxStatus::Processing);
    }

    #[tokio::test]
    async fn concurrent_workers_never_claim_the_same_row() {
        let store = Arc::new(MemoryStore::new());
        let sender = Arc::new(FakeSender::default());
        let breakers = CircuitBreakerRegistry::new(BreakerConfig::default());
        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(enqueue(&store, &format!("room-{}", i % 3)).await);
        }

        let a = dispatcher(&store, &sender, &breakers, 5);
        let b = dispatcher(&store, &sender, &breakers, 5);
        let (ra, rb) = tokio::join!(a.poll_once(), b.poll_once());
        let (Ok(ra), Ok(rb)) = (ra, rb) else {
            panic!("poll failed");
        };
        assert_eq!(ra.claimed + rb.claimed, 20);
        assert_eq!(ra.sent + rb.sent, 20);

        let mut sent = sender.sent();
        sent.sort();
        sent.dedup();
        assert_eq!(sent.len(), 20);
    }

    #[tokio::test]
    async fn http_sender_talks_to_bridge() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<serde_json::Value>(4);
        let app = Router::new()
            .route(
                "/rooms/{room}",
                get(|Path(room): Path<String>| async move {
                    axum::Json(json!({"joined": room == "open"}))
                }),
            )
            .route(
                "/messages",
                post(move |axum::Json(body): axum::Json<serde_json::Value>| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(body).await;
                    }
                }),
            );
        let Ok(listener) = tokio::net::TcpListener::bind("127.0.0.1:0").await else {
            panic!("bind failed");
        };
        let Ok(addr) = listener.local_addr() else {
            panic!("no local addr");
        };
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let Ok(sender) = HttpChatSender::new(&format!("http://{addr}/"), Duration::from_secs(5))
        else {
            panic!("client build failed");
        };
        assert!(matches!(sender.is_destination_ready("open").await, Ok(true)));
        assert!(matches!(sender.is_destination_ready("closed").await, Ok(false)));

        let message = OutboxMessage::pending(
            Provider::Kick,
            ChannelId::new(),
            "open".to_string(),
            json!({"text": "gg"}),
        );
        assert!(sender.send(&message).await.is_ok());
        let Some(body) = rx.recv().await else {
            panic!("bridge received nothing");
        };
        assert_eq!(body["destination"], "open");
        assert_eq!(body["payload"]["text"], "gg");
    }
}
