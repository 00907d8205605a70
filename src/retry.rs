//! Retry logic with exponential backoff

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use tracing::debug;

use crate::config::RetryConfig;

/// Retry policy for idempotent outbound calls
///
/// Pure data: the schedule it produces can be inspected without performing
/// any I/O, and [`with_retry`] is the only place it is put to work.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
    /// Connection timeout applied to each attempt
    pub connect_timeout: Duration,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig, connect_timeout: Duration) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
            connect_timeout,
        }
    }

    /// A policy that performs exactly one attempt
    #[must_use]
    pub fn none() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Backoff builder handed to `backon`
    #[must_use]
    pub fn builder(&self) -> ExponentialBuilder {
        let retries = if self.enabled {
            self.max_attempts.saturating_sub(1) as usize
        } else {
            0
        };

        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(retries)
    }

    /// The delays slept between attempts, in order
    #[must_use]
    pub fn schedule(&self) -> Vec<Duration> {
        self.builder().build().collect()
    }

    /// Upper bound on the time spent sleeping between attempts
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        self.schedule().into_iter().sum()
    }
}

/// Execute a future with retry logic
///
/// `retryable` decides per error whether another attempt is worth making.
///
/// # Errors
///
/// Returns the last error from `f` if all attempts are exhausted or the
/// error is not retryable.
pub async fn with_retry<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    name: &str,
    f: F,
    retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    f.retry(policy.builder())
        .when(|e| retryable(e))
        .notify(|e, delay| {
            debug!(
                operation = name,
                delay_ms = delay.as_millis(),
                error = %e,
                "Retrying after backoff"
            );
        })
        .await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            enabled: true,
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2.0,
            connect_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn schedule_has_one_delay_between_each_attempt() {
        assert_eq!(policy(5).schedule().len(), 4);
        assert_eq!(policy(1).schedule().len(), 0);
    }

    #[test]
    fn schedule_is_capped_by_max_backoff() {
        let schedule = policy(6).schedule();
        assert_eq!(schedule[0], Duration::from_millis(1));
        assert!(schedule.iter().all(|d| *d <= Duration::from_millis(4)));
        assert!(schedule.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn disabled_policy_never_retries() {
        let mut p = policy(5);
        p.enabled = false;
        assert!(p.schedule().is_empty());
        assert_eq!(RetryPolicy::none().total_backoff(), Duration::ZERO);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<u32, String> = with_retry(
            &policy(5),
            "test",
            || {
                let c = Arc::clone(&c);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 { Err("transient".to_string()) } else { Ok(n) }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<(), String> = with_retry(
            &policy(5),
            "test",
            || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                }
            },
            |_| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<(), String> = with_retry(
            &policy(5),
            "test",
            || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("404".to_string())
                }
            },
            |e| e != "404",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
