//! Failure isolation and conflict retry.
//!
//! - [`circuit_breaker`] guards outbound calls to external platforms and
//!   peer instances.
//! - [`retry`] re-runs serializable transactions that lost a conflict.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    BreakerConfig, BreakerError, BreakerFailure, BreakerState, BreakerTransition, CircuitBreaker,
    CircuitBreakerRegistry,
};
pub use retry::{RetryPolicy, Retryable, with_retry};
