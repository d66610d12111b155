//! Per-service circuit breakers for outbound platform and peer calls.
//!
//! A [`CircuitBreaker`] wraps any async call. After `failure_threshold`
//! consecutive qualifying failures it opens and fails fast for
//! `reset_timeout`; then it admits at most `half_open_max_in_flight` trial
//! calls, closing again after `success_threshold` trial successes.
//!
//! Breakers are process-local and never persisted. A
//! [`CircuitBreakerRegistry`] owns one breaker per service name and fans
//! state transitions out on a broadcast channel for metrics and alerting.
//! The breaker never retries; callers decide.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast.
    Open,
    /// A bounded number of trial calls is admitted.
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Per-service breaker tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive qualifying failures that open the breaker.
    pub failure_threshold: u32,
    /// Time spent open before trial calls are admitted.
    pub reset_timeout: Duration,
    /// Trial successes needed to close again.
    pub success_threshold: u32,
    /// Concurrent trial calls admitted while half-open.
    pub half_open_max_in_flight: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_in_flight: 1,
        }
    }
}

/// Classifies errors into breaker failures (transient upstream trouble)
/// and everything else.
pub trait BreakerFailure {
    /// Returns `true` for 5xx responses, timeouts and network resets.
    fn is_breaker_failure(&self) -> bool;
}

impl BreakerFailure for reqwest::Error {
    fn is_breaker_failure(&self) -> bool {
        if self.is_timeout() || self.is_connect() || self.is_request() {
            return true;
        }
        self.status().is_some_and(|s| s.is_server_error())
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The breaker refused the call; the action was not invoked.
    #[error("circuit breaker '{service}' is open")]
    Open {
        /// Breaker name.
        service: String,
        /// Time until trial calls are admitted (zero when half-open slots are full).
        retry_after: Duration,
    },
    /// The action ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns `true` if the call was refused without running.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Observable state change of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerTransition {
    /// Breaker name.
    pub service: String,
    /// Previous state.
    pub from: BreakerState,
    /// New state.
    pub to: BreakerState,
}

/// Point-in-time view of a breaker for health output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    /// Breaker name.
    pub service: String,
    /// Current state.
    pub state: BreakerState,
    /// Consecutive qualifying failures while closed.
    pub failure_count: u32,
    /// Trial successes while half-open.
    pub success_count: u32,
    /// Trial calls currently running.
    pub half_open_in_flight: u32,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    open_until: Option<Instant>,
    half_open_in_flight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallOutcome {
    Success,
    /// Qualifying failure (transient upstream trouble).
    Failure,
    /// Non-qualifying failure (e.g. a 4xx answer).
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Closed,
    Trial,
}

/// Releases a half-open slot when the trial call finishes or is dropped.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        if self.admission == Admission::Trial {
            let mut inner = self.breaker.lock();
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }
}

/// A single named circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    transitions: Option<broadcast::Sender<BreakerTransition>>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(service: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                open_until: None,
                half_open_in_flight: 0,
            }),
            transitions: None,
        }
    }

    fn with_transitions(mut self, sender: broadcast::Sender<BreakerTransition>) -> Self {
        self.transitions = Some(sender);
        self
    }

    /// Returns the breaker name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the current state without advancing timers.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Returns a snapshot of counters and state.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            service: self.service.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            half_open_in_flight: inner.half_open_in_flight,
        }
    }

    /// Runs `action` through the breaker using the error's own
    /// [`BreakerFailure`] classification.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] without running `action` when the
    /// breaker refuses the call, or [`BreakerError::Inner`] when `action`
    /// fails.
    pub async fn execute<T, E, F, Fut>(&self, action: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: BreakerFailure,
    {
        self.execute_with(action, BreakerFailure::is_breaker_failure)
            .await
    }

    /// Runs `action` through the breaker with a custom failure classifier.
    ///
    /// # Errors
    ///
    /// Same as [`CircuitBreaker::execute`].
    pub async fn execute_with<T, E, F, Fut, C>(
        &self,
        action: F,
        is_failure: C,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        let slot = self.admit()?;
        let result = action().await;
        let outcome = match &result {
            Ok(_) => CallOutcome::Success,
            Err(e) if is_failure(e) => CallOutcome::Failure,
            Err(_) => CallOutcome::Rejected,
        };
        self.record(slot.admission, outcome);
        drop(slot);
        result.map_err(BreakerError::Inner)
    }

    fn admit<E>(&self) -> Result<TrialSlot<'_>, BreakerError<E>> {
        let now = Instant::now();
        let mut transition = None;
        let admission = {
            let mut inner = self.lock();
            if inner.state == BreakerState::Open {
                match inner.open_until {
                    Some(until) if now < until => {
                        return Err(BreakerError::Open {
                            service: self.service.clone(),
                            retry_after: until - now,
                        });
                    }
                    _ => {
                        inner.state = BreakerState::HalfOpen;
                        inner.success_count = 0;
                        inner.half_open_in_flight = 0;
                        inner.open_until = None;
                        transition = Some((BreakerState::Open, BreakerState::HalfOpen));
                    }
                }
            }
            match inner.state {
                BreakerState::Closed => Admission::Closed,
                BreakerState::HalfOpen
                    if inner.half_open_in_flight < self.config.half_open_max_in_flight =>
                {
                    inner.half_open_in_flight += 1;
                    Admission::Trial
                }
                BreakerState::HalfOpen | BreakerState::Open => {
                    drop(inner);
                    self.emit(transition);
                    return Err(BreakerError::Open {
                        service: self.service.clone(),
                        retry_after: Duration::ZERO,
                    });
                }
            }
        };
        self.emit(transition);
        Ok(TrialSlot {
            breaker: self,
            admission,
        })
    }

    fn record(&self, admission: Admission, outcome: CallOutcome) {
        let transition = {
            let mut inner = self.lock();
            match (admission, inner.state, outcome) {
                (Admission::Closed, BreakerState::Closed, CallOutcome::Failure) => {
                    inner.failure_count = inner.failure_count.saturating_add(1);
                    if inner.failure_count >= self.config.failure_threshold {
                        self.trip(&mut inner);
                        Some((BreakerState::Closed, BreakerState::Open))
                    } else {
                        None
                    }
                }
                (Admission::Closed, BreakerState::Closed, _) => {
                    inner.failure_count = 0;
                    None
                }
                (Admission::Trial, BreakerState::HalfOpen, CallOutcome::Failure) => {
                    self.trip(&mut inner);
                    Some((BreakerState::HalfOpen, BreakerState::Open))
                }
                (Admission::Trial, BreakerState::HalfOpen, CallOutcome::Success) => {
                    inner.success_count = inner.success_count.saturating_add(1);
                    if inner.success_count >= self.config.success_threshold {
                        Self::reset(&mut inner);
                        Some((BreakerState::HalfOpen, BreakerState::Closed))
                    } else {
                        None
                    }
                }
                // The service answered, just not favourably: close at once.
                (Admission::Trial, BreakerState::HalfOpen, CallOutcome::Rejected) => {
                    Self::reset(&mut inner);
                    Some((BreakerState::HalfOpen, BreakerState::Closed))
                }
                // Outcome of a call admitted under a state that has since changed.
                _ => None,
            }
        };
        self.emit(transition);
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.open_until = Some(Instant::now() + self.config.reset_timeout);
        inner.failure_count = 0;
        inner.success_count = 0;
    }

    fn reset(inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.open_until = None;
    }

    fn emit(&self, transition: Option<(BreakerState, BreakerState)>) {
        let Some((from, to)) = transition else {
            return;
        };
        if to == BreakerState::Open {
            tracing::warn!(service = %self.service, %from, %to, "circuit breaker opened");
        } else {
            tracing::info!(service = %self.service, %from, %to, "circuit breaker transition");
        }
        if let Some(sender) = &self.transitions {
            let _ = sender.send(BreakerTransition {
                service: self.service.clone(),
                from,
                to,
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns one breaker per service name.
///
/// Process-local: state is created lazily on first use and lost on restart.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose breakers use `defaults` unless overridden.
    #[must_use]
    pub fn new(defaults: BreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(256);
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
            transitions,
        }
    }

    /// Sets a per-service configuration. Must be called before first use.
    #[must_use]
    pub fn with_override(mut self, service: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(service.into(), config);
        self
    }

    /// Returns the breaker for `service`, creating it on first use.
    #[must_use]
    pub fn get(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
        {
            return Arc::clone(existing);
        }
        let mut map = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let breaker = map.entry(service.to_string()).or_insert_with(|| {
            let config = self.overrides.get(service).copied().unwrap_or(self.defaults);
            Arc::new(CircuitBreaker::new(service, config).with_transitions(self.transitions.clone()))
        });
        Arc::clone(breaker)
    }

    /// Subscribes to state transitions of every breaker in the registry.
    #[must_use]
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Returns snapshots of all breakers, sorted by name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let map = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = map.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct HttpStatus(u16);

    impl BreakerFailure for HttpStatus {
        fn is_breaker_failure(&self) -> bool {
            self.0 >= 500
        }
    }

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(1_000),
            success_threshold: 2,
            half_open_max_in_flight: 2,
        }
    }

    async fn fail(breaker: &CircuitBreaker, status: u16) -> Result<(), BreakerError<HttpStatus>> {
        breaker.execute(|| async move { Err(HttpStatus(status)) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, BreakerError<HttpStatus>> {
        breaker.execute(|| async { Ok::<_, HttpStatus>(7) }).await
    }

    async fn open_breaker(breaker: &CircuitBreaker) {
        for _ in 0..3 {
            let _ = fail(breaker, 503).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("svc", config());
        let _ = fail(&breaker, 500).await;
        let _ = fail(&breaker, 500).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        let _ = fail(&breaker, 500).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        let calls = AtomicU32::new(0);
        let result: Result<(), BreakerError<HttpStatus>> = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(result.as_ref().is_err_and(BreakerError::is_open));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_do_not_count() {
        let breaker = CircuitBreaker::new("svc", config());
        for _ in 0..10 {
            let _ = fail(&breaker, 404).await;
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("svc", config());
        let _ = fail(&breaker, 500).await;
        let _ = fail(&breaker, 500).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker, 500).await;
        let _ = fail(&breaker, 500).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_bounded_trials() {
        let breaker = CircuitBreaker::new("svc", config());
        open_breaker(&breaker).await;

        tokio::time::advance(Duration::from_millis(1_001)).await;

        let Ok(first) = breaker.admit::<HttpStatus>() else {
            panic!("first trial should be admitted");
        };
        let Ok(second) = breaker.admit::<HttpStatus>() else {
            panic!("second trial should be admitted");
        };
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.admit::<HttpStatus>().is_err());

        drop(first);
        assert!(breaker.admit::<HttpStatus>().is_ok());
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_successes_close_and_reset_counters() {
        let breaker = CircuitBreaker::new("svc", config());
        open_breaker(&breaker).await;
        tokio::time::advance(Duration::from_millis(1_001)).await;

        assert_eq!(succeed(&breaker).await.ok(), Some(7));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert_eq!(succeed(&breaker).await.ok(), Some(7));

        let snap = breaker.snapshot();
        assert_eq!(snap.state, BreakerState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.success_count, 0);
        assert_eq!(snap.half_open_in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("svc", config());
        open_breaker(&breaker).await;
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let _ = fail(&breaker, 502).await;
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(succeed(&breaker).await.is_err_and(|e| e.is_open()));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_business_failure_closes() {
        let breaker = CircuitBreaker::new("svc", config());
        open_breaker(&breaker).await;
        tokio::time::advance(Duration::from_millis(1_001)).await;

        let _ = fail(&breaker, 403).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_shares_breakers_and_reports_transitions() {
        let registry = CircuitBreakerRegistry::new(config());
        let mut rx = registry.subscribe_transitions();

        let a = registry.get("chat:twitch");
        let b = registry.get("chat:twitch");
        assert!(Arc::ptr_eq(&a, &b));

        open_breaker(&a).await;
        let Ok(transition) = rx.try_recv() else {
            panic!("expected a transition");
        };
        assert_eq!(transition.service, "chat:twitch");
        assert_eq!(transition.to, BreakerState::Open);
        assert_eq!(registry.snapshots().len(), 1);
    }
}
