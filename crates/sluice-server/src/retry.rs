use std::future::Future;
use std::time::Duration;

use log::warn;
use sluice_common::config;
use tokio::time::Instant;

/// How an operation that talks to a possibly-absent peer is retried:
/// net-channel dials wait for workers that are still starting up, and
/// worker registration waits for the driver to come online. A restartable
/// task group reuses the same machinery with a total deadline on top.
#[derive(Debug, Clone)]
pub enum RetryStrategy {
    Fixed {
        max_count: usize,
        delay: Duration,
    },
    ExponentialBackoff {
        max_count: usize,
        initial_delay: Duration,
        max_delay: Duration,
        factor: u32,
    },
}

impl RetryStrategy {
    fn max_count(&self) -> usize {
        match self {
            Self::Fixed { max_count, .. } => *max_count,
            Self::ExponentialBackoff { max_count, .. } => *max_count,
        }
    }

    /// The delay taken before the given retry, counted from one.
    fn delay_before(&self, retry: usize) -> Duration {
        match self {
            Self::Fixed { delay, .. } => *delay,
            Self::ExponentialBackoff {
                initial_delay,
                max_delay,
                factor,
                ..
            } => {
                let exponent = u32::try_from(retry.saturating_sub(1)).unwrap_or(u32::MAX);
                match factor.checked_pow(exponent) {
                    Some(multiplier) => {
                        std::cmp::min(initial_delay.saturating_mul(multiplier), *max_delay)
                    }
                    None => *max_delay,
                }
            }
        }
    }

    /// Run the operation, sleeping between failed attempts until the
    /// retry budget is spent. The error of the last attempt is returned;
    /// earlier failures are only logged, since a peer that is still
    /// coming up produces a burst of connection errors that mean nothing
    /// once a later dial succeeds.
    pub async fn run<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: std::fmt::Display + Send,
    {
        self.run_bounded(f, None).await
    }

    /// Like [`RetryStrategy::run`], but gives up once the next retry
    /// could not start within the total deadline. The scheduler bounds
    /// restartable task groups this way, so a group never keeps retrying
    /// past its wall-clock budget even when attempts are slow.
    pub async fn run_with_deadline<F, Fut, T, E>(&self, f: F, deadline: Duration) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: std::fmt::Display + Send,
    {
        self.run_bounded(f, Some(deadline)).await
    }

    async fn run_bounded<F, Fut, T, E>(&self, mut f: F, deadline: Option<Duration>) -> Result<T, E>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        T: Send,
        E: std::fmt::Display + Send,
    {
        let started = Instant::now();
        let mut retries = 0;
        loop {
            match f().await {
                x @ Ok(_) => return x,
                Err(e) => {
                    if retries >= self.max_count() {
                        return Err(e);
                    }
                    retries += 1;
                    let delay = self.delay_before(retries);
                    if let Some(deadline) = deadline {
                        if started.elapsed() + delay > deadline {
                            return Err(e);
                        }
                    }
                    warn!("retrying in {delay:?} after failed attempt: {e}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl From<&config::RetryStrategy> for RetryStrategy {
    fn from(config: &config::RetryStrategy) -> Self {
        match config {
            config::RetryStrategy::Fixed {
                max_count,
                delay_secs,
            } => Self::Fixed {
                max_count: *max_count,
                delay: Duration::from_secs(*delay_secs),
            },
            config::RetryStrategy::ExponentialBackoff {
                max_count,
                initial_delay_secs,
                max_delay_secs,
                factor,
            } => Self::ExponentialBackoff {
                max_count: *max_count,
                initial_delay: Duration::from_secs(*initial_delay_secs),
                max_delay: Duration::from_secs(*max_delay_secs),
                factor: *factor,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_backoff_delays_are_capped() {
        let strategy = RetryStrategy::ExponentialBackoff {
            max_count: 10,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(35),
            factor: 2,
        };
        assert_eq!(strategy.delay_before(1), Duration::from_millis(10));
        assert_eq!(strategy.delay_before(2), Duration::from_millis(20));
        assert_eq!(strategy.delay_before(3), Duration::from_millis(35));
        assert_eq!(strategy.delay_before(100), Duration::from_millis(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_success() {
        let attempts = AtomicUsize::new(0);
        let strategy = RetryStrategy::Fixed {
            max_count: 5,
            delay: Duration::from_secs(1),
        };
        let out = strategy
            .run(|| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("not yet")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(out, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausted() {
        let strategy = RetryStrategy::Fixed {
            max_count: 3,
            delay: Duration::from_millis(10),
        };
        let out: Result<(), &str> = strategy.run(|| async { Err("always") }).await;
        assert_eq!(out, Err("always"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_retries_short() {
        let attempts = AtomicUsize::new(0);
        let strategy = RetryStrategy::Fixed {
            max_count: 10,
            delay: Duration::from_secs(60),
        };
        let out: Result<(), &str> = strategy
            .run_with_deadline(
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err("always") }
                },
                Duration::from_secs(150),
            )
            .await;
        assert_eq!(out, Err("always"));
        // The third retry would start at 180s, past the 150s deadline.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
