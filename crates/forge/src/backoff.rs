//! Backoff timing and bounded retries for operations that fail transiently,
//! such as connecting to a machine that is still booting or deleting a network
//! whose dependents the backend has not finished removing.
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Determines how long to back off before performing a retry.
pub trait BackoffStrategy: Send {
    /// Gets how long to wait before the next retry.
    fn next_duration(&mut self) -> Duration;
}

/// A `BackoffStrategy` in which the durations increase exponentially
/// until hitting a cap.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffStrategy {
    base_duration: Duration,
    cap: Duration,
    last_duration: Duration,
}

impl Default for ExponentialBackoffStrategy {
    /// Starts at 5 seconds and doubles up to 5 minutes.
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl ExponentialBackoffStrategy {
    pub fn new(base_duration: Duration, cap: Duration) -> Self {
        Self {
            base_duration,
            cap,
            last_duration: Duration::from_secs(0),
        }
    }

    fn capped_next_duration(&self) -> Duration {
        let next_duration = if self.last_duration == Duration::from_secs(0) {
            self.base_duration
        } else {
            self.last_duration * 2
        };

        if next_duration > self.cap {
            self.cap
        } else {
            next_duration
        }
    }
}

impl BackoffStrategy for ExponentialBackoffStrategy {
    fn next_duration(&mut self) -> Duration {
        let next_duration = self.capped_next_duration();
        self.last_duration = next_duration;
        next_duration
    }
}

/// A `BackoffStrategy` that always waits the same amount of time.
#[derive(Clone, Debug)]
pub struct FixedBackoffStrategy(pub Duration);

impl BackoffStrategy for FixedBackoffStrategy {
    fn next_duration(&mut self) -> Duration {
        self.0
    }
}

/// Runs `operation` until it succeeds, it fails with an error `retryable`
/// rejects, or `max_attempts` attempts have been made. The last error is
/// returned when attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E, B, P>(
    max_attempts: u32,
    mut backoff: B,
    retryable: P,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    B: BackoffStrategy,
    P: Fn(&E) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && retryable(&e) => {
                let delay = backoff.next_duration();
                warn!(
                    operation = %operation_name,
                    attempt,
                    max_attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn first_backoff_is_base_duration() {
        let mut backoff = ExponentialBackoffStrategy::default();
        assert_eq!(backoff.next_duration(), Duration::from_secs(5));
    }

    #[test]
    fn backoff_doubles_each_time_until_capped() {
        let mut backoff =
            ExponentialBackoffStrategy::new(Duration::from_secs(10), Duration::from_secs(60));
        assert_eq!(backoff.next_duration(), Duration::from_secs(10));
        assert_eq!(backoff.next_duration(), Duration::from_secs(20));
        assert_eq!(backoff.next_duration(), Duration::from_secs(40));
        assert_eq!(backoff.next_duration(), Duration::from_secs(60));
        assert_eq!(backoff.next_duration(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn retry_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            4,
            FixedBackoffStrategy(Duration::from_millis(0)),
            |_| true,
            "always failing",
            |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let result: Result<u32, String> = retry_with_backoff(
            5,
            FixedBackoffStrategy(Duration::from_millis(0)),
            |_| true,
            "eventually succeeds",
            |attempt| async move {
                if attempt < 3 {
                    Err(format!("attempt {}", attempt))
                } else {
                    Ok(attempt)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn non_retryable_error_is_returned_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(
            5,
            FixedBackoffStrategy(Duration::from_millis(0)),
            |e: &String| e != "fatal",
            "fatal",
            |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            },
        )
        .await;

        assert_eq!(result, Err("fatal".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
