//! Retry logic for transport-level failures.
//!
//! Only connection-level problems (refused or reset connections, local
//! timeouts, broken streams) are retried here, with a short exponential
//! backoff. Upstream-reported failures — including 5xx — are surfaced
//! after a single attempt: the homeserver owns the real queue and drives
//! the retry cadence.

use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

/// Total attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Backoff before the first retry; doubles per retry.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Retry behavior knobs.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
        }
    }
}

/// Result of a single attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The upstream answered; no further attempts regardless of content.
    Done(T),
    /// The request never completed at the transport level.
    Transport(String),
}

/// Classify a reqwest error as transport-level or not.
///
/// Errors raised before or while the request was on the wire are
/// transport-level; anything that made it to a status line is not.
pub fn is_transport_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request() || err.is_body()
}

/// Run `operation` until it yields [`Attempt::Done`] or the attempt budget
/// is exhausted; returns the transport failure reason in the latter case.
pub async fn with_transport_retry<T, F, Fut>(
    config: &RetryConfig,
    service_name: &str,
    mut operation: F,
) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Attempt<T>>,
{
    let mut backoff = config.initial_backoff;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Attempt::Done(result) => return Ok(result),
            Attempt::Transport(reason) if attempt < config.max_attempts => {
                warn!(
                    service = service_name,
                    attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    reason = %reason,
                    "Transport failure, retrying"
                );
                sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Attempt::Transport(reason) => {
                warn!(
                    service = service_name,
                    attempts = attempt,
                    reason = %reason,
                    "Transport failure, attempts exhausted"
                );
                return Err(reason);
            }
        }
    }
}

/// Parse a `Retry-After` header value into a Duration.
///
/// Supports the delay-seconds form; HTTP-date values yield `None`.
pub fn parse_retry_after(header_value: Option<&str>) -> Option<Duration> {
    header_value?.parse::<u64>().ok().map(Duration::from_secs)
}

/// Extract the retry-after delay from a response, if present.
pub fn retry_after_from(response: &reqwest::Response) -> Option<Duration> {
    parse_retry_after(
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok()),
    )
}
