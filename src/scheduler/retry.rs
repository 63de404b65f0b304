//! Bounded retry with exponential backoff for marketplace calls.
//!
//! Reads and qualification grants are idempotent and retry on any transient
//! error. Task creation is not: it is only resent when the failure proves the
//! request never reached the server.

use std::future::Future;
use std::time::Duration;

use crate::marketplace::MarketplaceError;

/// How a failed call may be repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Safe to repeat after any transient failure.
    Idempotent,
    /// Repeat only when the server certainly did not apply the request.
    CreateOnce,
}

impl RetryMode {
    fn allows(&self, error: &MarketplaceError) -> bool {
        match self {
            RetryMode::Idempotent => error.is_transient(),
            RetryMode::CreateOnce => error.is_safe_to_resend(),
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Backoff after the first failure.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Single attempt, never sleeps.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Run `op`, repeating it while `mode` allows and attempts remain.
    pub async fn run<T, F, Fut>(&self, mode: RetryMode, what: &str, mut op: F) -> Result<T, MarketplaceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, MarketplaceError>>,
    {
        let mut backoff = BackoffState::new();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    backoff.consecutive_failures += 1;
                    if backoff.consecutive_failures >= self.max_attempts || !mode.allows(&error) {
                        return Err(error);
                    }
                    let delay = backoff.next_delay(self, &error);
                    tracing::warn!(
                        operation = what,
                        attempt = backoff.consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Marketplace call failed, backing off"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

/// Failure counter for one logical call.
#[derive(Debug, Default)]
struct BackoffState {
    consecutive_failures: u32,
}

impl BackoffState {
    fn new() -> Self {
        Self::default()
    }

    /// The delay is the larger of the server's retry-after and
    /// `initial * 2^(failures-1)`, capped at `max_backoff`.
    fn next_delay(&self, policy: &RetryPolicy, error: &MarketplaceError) -> Duration {
        let exponent = self.consecutive_failures.saturating_sub(1).min(16);
        let exp_backoff = policy.initial_backoff.saturating_mul(2u32.pow(exponent));
        let suggested = match error {
            MarketplaceError::RateLimited { retry_after_secs } => Duration::from_secs(*retry_after_secs),
            _ => Duration::ZERO,
        };
        exp_backoff.max(suggested).min(policy.max_backoff)
    }
}
