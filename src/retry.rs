//! Retry decisions for classified outcomes.
//!
//! Only two outcome classes are retried: transport errors that look like a
//! timeout or a connection problem, and HTTP 429. Everything else, 5xx
//! included, is terminal on the first attempt. A delay longer than
//! `max_delay_seconds` ends the request instead of sleeping.

use crate::classifier::{Outcome, OutcomeKind};

/// Maximum number of retries per logical request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Longest single backoff, in backoff units. Matches the transport timeout.
pub const DEFAULT_MAX_DELAY_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub max_delay_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_delay_seconds: DEFAULT_MAX_DELAY_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay_seconds: u64,
}

impl RetryDecision {
    const STOP: RetryDecision = RetryDecision {
        retry: false,
        delay_seconds: 0,
    };

    fn after(delay_seconds: u64) -> Self {
        Self {
            retry: true,
            delay_seconds,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay_seconds: u64) -> Self {
        self.max_delay_seconds = max_delay_seconds;
        self
    }

    /// Decides whether the attempt that produced `outcome` is retried.
    ///
    /// `retry_count` is the number of retries already made for this request.
    pub fn should_retry(&self, outcome: &Outcome, retry_count: u32) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::STOP;
        }

        let decision = self.decide(outcome, retry_count);
        if decision.retry && decision.delay_seconds > self.max_delay_seconds {
            tracing::warn!(
                "Retry delay of {}s exceeds the {}s cap, giving up",
                decision.delay_seconds,
                self.max_delay_seconds
            );
            return RetryDecision::STOP;
        }
        decision
    }

    fn decide(&self, outcome: &Outcome, retry_count: u32) -> RetryDecision {
        match outcome.kind {
            OutcomeKind::TransportError => {
                let retryable = outcome
                    .error
                    .as_deref()
                    .is_some_and(is_retryable_transport_message);
                if retryable {
                    RetryDecision::after(exponential(retry_count))
                } else {
                    RetryDecision::STOP
                }
            }
            OutcomeKind::RateLimited => RetryDecision::after(
                outcome
                    .retry_after
                    .unwrap_or_else(|| exponential(retry_count + 1)),
            ),
            OutcomeKind::Success
            | OutcomeKind::ClientError
            | OutcomeKind::UnexpectedStatus
            | OutcomeKind::InvalidResponse => RetryDecision::STOP,
        }
    }
}

/// Whether a transport error message points at a transient timeout or connection failure.
pub fn is_retryable_transport_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["timeout", "timed out", "connection"]
        .iter()
        .any(|pattern| lower.contains(pattern))
}

fn exponential(exponent: u32) -> u64 {
    2u64.saturating_pow(exponent)
}
