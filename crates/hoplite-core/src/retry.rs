//! Bounded exponential-backoff retries for probe operations.

use crate::TraceError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Retry policy: `count` retries after the initial attempt, with an
/// exponential backoff starting at `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub count: u32,
    pub delay: Duration,
}

/// Runs `op` until it succeeds or the policy is exhausted, returning the
/// last error.
///
/// The wait after failed attempt `r` (1-based) is `delay * 2^(r-1)`, so the
/// first retry waits exactly `delay`. The wait races the cancellation
/// token; cancelling it ends the sleep immediately.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    cfg: RetryConfig,
    mut op: F,
) -> Result<T, TraceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TraceError>>,
{
    let mut attempt: u32 = 1;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt > cfg.count {
            return Err(err);
        }

        let delay = backoff(cfg.delay, attempt);
        warn!(
            attempt,
            delay = %humantime::format_duration(delay),
            error = %err,
            "Probe attempt failed, backing off"
        );
        tokio::select! {
            _ = cancel.cancelled() => return Err(TraceError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Backoff before the next attempt, given the 1-based index of the attempt
/// that just failed.
fn backoff(delay: Duration, attempt: u32) -> Duration {
    if attempt <= 1 {
        return delay;
    }
    delay * 2u32.saturating_pow(attempt - 1)
}
