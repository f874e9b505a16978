// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use thiserror::Error;

/// Provider failure taxonomy.
///
/// Bindings wrap their transport errors in one of these variants so the run
/// loop can distinguish retry-worthy failures from fatal ones without
/// inspecting provider-specific strings.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Connection-level failure (DNS, reset, timeout).  Retryable with
    /// exponential backoff.
    #[error("connection error: {0}")]
    Connection(String),

    /// The provider asked us to slow down.  Retryable after the suggested
    /// delay when one was given.
    #[error("rate limited")]
    RateLimited {
        /// Server-suggested delay before the next attempt.
        retry_after: Option<Duration>,
    },

    /// Invalid or missing credentials.  Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The request exceeded the model's context window.  Never retried:
    /// resending the same prompt cannot succeed.
    #[error("context length exceeded: {0}")]
    ContextLength(String),

    /// Any other non-retryable provider failure (quota, bad request).
    #[error("{0}")]
    Fatal(String),
}

impl ProviderError {
    /// Whether the run loop may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Connection(_) | ProviderError::RateLimited { .. }
        )
    }

    /// Find a `ProviderError` anywhere in an error chain.
    ///
    /// Providers typically wrap their errors with context; this walks the
    /// chain so classification survives `anyhow::Context`.
    pub fn find_in(err: &anyhow::Error) -> Option<&ProviderError> {
        err.chain().find_map(|e| e.downcast_ref::<ProviderError>())
    }
}

/// Exponential backoff schedule for transient provider errors.
///
/// Defaults: base 500 ms, factor 2, at most 3 retries, delay capped at 8 s.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub factor: u32,
    pub max_retries: u32,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2,
            max_retries: 3,
            cap: Duration::from_secs(8),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based), or `None` when the
    /// retry budget is exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries {
            return None;
        }
        let factor = self.factor.saturating_pow(attempt.saturating_sub(1));
        Some(self.base.saturating_mul(factor).min(self.cap))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_errors_are_retryable() {
        assert!(ProviderError::Connection("reset".into()).is_retryable());
    }

    #[test]
    fn rate_limits_are_retryable() {
        let e = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(1)),
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn auth_and_context_length_are_fatal() {
        assert!(!ProviderError::Auth("bad key".into()).is_retryable());
        assert!(!ProviderError::ContextLength("too long".into()).is_retryable());
        assert!(!ProviderError::Fatal("quota".into()).is_retryable());
    }

    #[test]
    fn find_in_survives_context_wrapping() {
        use anyhow::Context;
        let err: anyhow::Error = Err::<(), _>(ProviderError::Auth("nope".into()))
            .context("opening stream")
            .unwrap_err();
        let found = ProviderError::find_in(&err).expect("should find provider error");
        assert!(matches!(found, ProviderError::Auth(_)));
    }

    #[test]
    fn find_in_returns_none_for_plain_errors() {
        let err = anyhow::anyhow!("something else");
        assert!(ProviderError::find_in(&err).is_none());
    }

    // ── Backoff schedule ──────────────────────────────────────────────────────

    #[test]
    fn backoff_doubles_from_base() {
        let b = Backoff::default();
        assert_eq!(b.delay(1), Some(Duration::from_millis(500)));
        assert_eq!(b.delay(2), Some(Duration::from_millis(1000)));
        assert_eq!(b.delay(3), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn backoff_exhausts_after_max_retries() {
        let b = Backoff::default();
        assert!(b.delay(4).is_none());
    }

    #[test]
    fn backoff_caps_the_delay() {
        let b = Backoff {
            max_retries: 10,
            ..Backoff::default()
        };
        assert_eq!(b.delay(10), Some(Duration::from_secs(8)));
    }
}
