//! Retry logic.
//!
//! # Design Decisions
//! - Only transport failures are retried; a backend's own 5xx is its answer
//! - Non-idempotent methods are retried only when the connection was never made
//! - Each retry moves to the next backend in rotation

use std::time::Duration;

use axum::http::Method;

use crate::config::RetryConfig;
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::timeouts::AttemptPhase;

/// Whether repeating the request cannot change its effect.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }

    /// Total attempts per request, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide whether a failed attempt number `attempt` (1-based) gets another try.
    pub fn should_retry(&self, method: &Method, phase: AttemptPhase, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match phase {
            AttemptPhase::Connect => true,
            AttemptPhase::Send => is_idempotent(method),
            AttemptPhase::Receive => false,
        }
    }

    /// Pause before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        calculate_backoff(retry, self.base_delay_ms, self.max_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_one_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 2);
        assert!(policy.should_retry(&Method::GET, AttemptPhase::Send, 1));
        assert!(!policy.should_retry(&Method::GET, AttemptPhase::Send, 2));
        assert_eq!(policy.delay(1), Duration::ZERO);
    }

    #[test]
    fn post_retried_only_before_connecting() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 3,
            ..Default::default()
        });
        assert!(policy.should_retry(&Method::POST, AttemptPhase::Connect, 1));
        assert!(!policy.should_retry(&Method::POST, AttemptPhase::Send, 1));
        assert!(policy.should_retry(&Method::PUT, AttemptPhase::Send, 2));
    }

    #[test]
    fn receive_failures_are_final() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(&Method::GET, AttemptPhase::Receive, 1));
    }

    #[test]
    fn zero_attempts_is_treated_as_one() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max_attempts: 0,
            ..Default::default()
        });
        assert_eq!(policy.max_attempts(), 1);
        assert!(!policy.should_retry(&Method::GET, AttemptPhase::Connect, 1));
    }
}
