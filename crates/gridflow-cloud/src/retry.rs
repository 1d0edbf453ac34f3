//! Bounded retry with exponential backoff
//!
//! One primitive serves every network-facing wait: provider calls that may
//! fail transiently, resource state polling and node reachability polling.
//! Each attempt tells the loop whether to stop, retry or abort, and the loop
//! returns a typed outcome instead of blocking forever:
//!
//! - the attempt ceiling bounds the number of tries
//! - an optional deadline bounds the total time, including a hanging attempt
//! - a [`CancellationToken`] stops the loop at the next suspension point

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = bounded by the deadline only)
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub initial_delay: Duration,

    /// Upper bound of a single delay
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,

    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Millisecond delays without jitter, for tests and simulations.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay after the given (zero-based) failed attempt, before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Verdict of a single attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Done, stop retrying
    Done(T),
    /// Failed in a way that may go away, try again
    Retry(E),
    /// Failed for good
    Abort(E),
}

/// Why a retry loop gave up.
#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// The attempt ceiling was reached
    Exhausted { attempts: u32, last: E },
    /// An attempt reported a permanent failure
    Aborted(E),
    /// The deadline passed; `last` is the error of the last finished attempt
    TimedOut { elapsed: Duration, last: Option<E> },
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying error, if an attempt produced one.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Aborted(last) => Some(last),
            RetryError::TimedOut { last, .. } => last,
            RetryError::Cancelled => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "gave up after {} attempts: {}", attempts, last)
            }
            RetryError::Aborted(e) => write!(f, "{}", e),
            RetryError::TimedOut { elapsed, last } => {
                write!(f, "timed out after {:?}", elapsed)?;
                if let Some(e) = last {
                    write!(f, ": {}", e)?;
                }
                Ok(())
            }
            RetryError::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Runs `operation` until it is done, aborts, or the attempt ceiling is hit.
///
/// The operation receives the one-based attempt number.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: fmt::Display,
{
    run(config, operation_name, None, cancel, operation).await
}

/// Polls `probe` until it is done, bounded by `timeout` and the attempt ceiling.
pub async fn poll_until<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    probe: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: fmt::Display,
{
    run(config, operation_name, Some(timeout), cancel, probe).await
}

async fn run<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: fmt::Display,
{
    let start = Instant::now();
    let deadline = timeout.map(|t| start + t);
    let mut attempt = 0u32;
    let mut last: Option<E> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        let verdict = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, operation(attempt)).await {
                Ok(verdict) => verdict,
                Err(_) => {
                    return Err(RetryError::TimedOut {
                        elapsed: start.elapsed(),
                        last,
                    });
                }
            },
            None => operation(attempt).await,
        };

        let error = match verdict {
            Attempt::Done(value) => {
                if attempt > 1 {
                    debug!(operation = %operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Attempt::Abort(e) => return Err(RetryError::Aborted(e)),
            Attempt::Retry(e) => e,
        };

        if config.max_attempts > 0 && attempt >= config.max_attempts {
            warn!(
                operation = %operation_name,
                attempt,
                error = %error,
                "Operation failed after max attempts"
            );
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let mut delay = config.jittered(config.delay_for_attempt(attempt - 1));
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(RetryError::TimedOut {
                    elapsed: start.elapsed(),
                    last: Some(error),
                });
            }
            delay = delay.min(deadline - now);
        }

        debug!(
            operation = %operation_name,
            attempt,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Retrying"
        );
        last = Some(error);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10000),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4000));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(8000));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(10000)); // capped at max
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<u32, RetryError<String>> = retry_with_backoff(
            &RetryConfig::immediate(5),
            "op",
            &CancellationToken::new(),
            |attempt| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Attempt::Retry("rate limited".to_string())
                    } else {
                        Attempt::Done(attempt)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_after_ceiling() {
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &RetryConfig::immediate(3),
            "op",
            &CancellationToken::new(),
            |_| async { Attempt::Retry("timeout") },
        )
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                last: "timeout"
            })
        );
    }

    #[tokio::test]
    async fn test_abort_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let result: Result<(), RetryError<&str>> = retry_with_backoff(
            &RetryConfig::immediate(5),
            "op",
            &CancellationToken::new(),
            |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Attempt::Abort("quota exceeded")
                }
            },
        )
        .await;

        assert_eq!(result, Err(RetryError::Aborted("quota exceeded")));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let result: Result<(), RetryError<&str>> = poll_until(
            &config,
            "wait",
            Duration::from_secs(30),
            &CancellationToken::new(),
            |_| async { Attempt::Retry("still building") },
        )
        .await;

        match result {
            Err(RetryError::TimedOut { elapsed, last }) => {
                assert!(elapsed >= Duration::from_secs(30));
                assert_eq!(last, Some("still building"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), RetryError<&str>> =
            retry_with_backoff(&RetryConfig::immediate(3), "op", &cancel, |_| async {
                Attempt::Done(())
            })
            .await;

        assert_eq!(result, Err(RetryError::Cancelled));
    }
}
