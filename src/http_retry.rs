use crate::error::TranscribeError;
use log::{debug, warn};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;

/// Retry/timeout policy for one outbound operation.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Deadline for each individual attempt.
    pub timeout: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Jitter added to backoff delays so retries across chunks do not line up.
/// Derived from the clock's subsecond nanos; no rand dependency.
fn jitter() -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis((nanos % 250) as u64)
}

/// Backoff before retry number `attempt` (0-based): capped exponential plus
/// jitter.
pub fn backoff_delay(options: &RetryOptions, attempt: u32) -> Duration {
    let exp = options
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    exp.min(options.max_delay) + jitter()
}

/// Runs `operation` with a per-attempt timeout, retrying retry-eligible
/// failures (connection errors, timeouts, 5xx, 429) with exponential backoff.
/// 4xx other than 429, configuration errors, and empty transcripts are
/// surfaced immediately.
pub async fn call_with_retry<T, F, Fut>(
    operation_name: &str,
    options: &RetryOptions,
    mut operation: F,
) -> Result<T, TranscribeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TranscribeError>>,
{
    let mut last_error = None;

    for attempt in 0..=options.max_retries {
        if attempt > 0 {
            let delay = backoff_delay(options, attempt - 1);
            debug!(
                "{}: retry {}/{} in {:?}",
                operation_name, attempt, options.max_retries, delay
            );
            tokio::time::sleep(delay).await;
        }

        let result = match timeout(options.timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(TranscribeError::Timeout(options.timeout)),
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{}: succeeded on retry {}", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < options.max_retries => {
                warn!(
                    "{}: attempt {}/{} failed ({:?}): {}",
                    operation_name,
                    attempt + 1,
                    options.max_retries + 1,
                    err.category(),
                    err
                );
                last_error = Some(err);
            }
            Err(err) => {
                warn!(
                    "{}: giving up after attempt {} ({:?}): {}",
                    operation_name,
                    attempt + 1,
                    err.category(),
                    err
                );
                return Err(err);
            }
        }
    }

    // Loop always returns before falling through unless every attempt hit
    // the retryable arm.
    Err(last_error.unwrap_or_else(|| {
        TranscribeError::Other(anyhow::anyhow!("{} failed with no recorded error", operation_name))
    }))
}
