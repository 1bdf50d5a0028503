//! C2 Retry Executor — runs an operation up to `max_attempts` times with a
//! configurable backoff discipline, optionally pausing on network-down
//! instead of consuming an attempt or a delay.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::network::{NetworkMonitor, NetworkState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffDiscipline {
    Linear,
    Exponential,
    Fibonacci,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub discipline: BackoffDiscipline,
    pub jitter: bool,
    pub wait_for_network: bool,
    /// Optional allow-list of retryable categories; empty means "the
    /// default Transient/NetworkDown classification applies unmodified".
    pub retryable_categories: Vec<crate::error::ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            discipline: BackoffDiscipline::Exponential,
            jitter: true,
            wait_for_network: true,
            retryable_categories: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n` (1-indexed retry number, i.e. the wait
    /// before the 2nd attempt has n=1).
    pub fn delay_for(&self, n: u32) -> Duration {
        let base = match self.discipline {
            BackoffDiscipline::Linear => self.initial_delay.as_secs_f64() * n as f64,
            BackoffDiscipline::Exponential => {
                self.initial_delay.as_secs_f64() * self.multiplier.powi(n as i32 - 1)
            }
            BackoffDiscipline::Fibonacci => self.initial_delay.as_secs_f64() * fib(n) as f64,
        };
        let capped = base.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    fn is_retryable(&self, err: &CoreError) -> bool {
        if !err.is_retryable() {
            return false;
        }
        if self.retryable_categories.is_empty() {
            return true;
        }
        self.retryable_categories.contains(&err.category())
    }
}

fn fib(n: u32) -> u64 {
    if n == 0 {
        return 0;
    }
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 1..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    b
}

pub struct RetryContext<'a> {
    pub cancel: &'a CancellationToken,
    pub network_monitor: Option<&'a NetworkMonitor>,
}

/// Executes `op` up to `policy.max_attempts` times.
pub async fn execute<T, F, Fut>(
    mut op: F,
    policy: &RetryPolicy,
    ctx: &RetryContext<'_>,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut attempt = 0u32;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        attempt += 1;
        let result = op().await;
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !policy.is_retryable(&err) {
                    warn!(attempt, error = %err, "retry executor giving up");
                    return Err(err);
                }

                if policy.wait_for_network {
                    if let Some(monitor) = ctx.network_monitor {
                        if monitor.state() == NetworkState::Down {
                            info!("pausing for network to come back up, attempt not consumed");
                            monitor.wait_for_up(ctx.cancel).await?;
                            attempt -= 1;
                            continue;
                        }
                    }
                }

                let delay = policy.delay_for(attempt);
                info!(attempt, ?delay, "retrying after backoff");
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(CoreError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(discipline: BackoffDiscipline) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            discipline,
            jitter: false,
            wait_for_network: false,
            retryable_categories: Vec::new(),
        }
    }

    #[test]
    fn linear_backoff_formula() {
        let p = policy(BackoffDiscipline::Linear);
        assert_eq!(p.delay_for(1), Duration::from_millis(10));
        assert_eq!(p.delay_for(3), Duration::from_millis(30));
    }

    #[test]
    fn exponential_backoff_formula() {
        let p = policy(BackoffDiscipline::Exponential);
        assert_eq!(p.delay_for(1), Duration::from_millis(10));
        assert_eq!(p.delay_for(2), Duration::from_millis(20));
        assert_eq!(p.delay_for(3), Duration::from_millis(40));
    }

    #[test]
    fn fibonacci_backoff_formula() {
        let p = policy(BackoffDiscipline::Fibonacci);
        assert_eq!(p.delay_for(1), Duration::from_millis(10));
        assert_eq!(p.delay_for(2), Duration::from_millis(10));
        assert_eq!(p.delay_for(3), Duration::from_millis(20));
        assert_eq!(p.delay_for(4), Duration::from_millis(30));
        assert_eq!(p.delay_for(5), Duration::from_millis(50));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let mut p = policy(BackoffDiscipline::Exponential);
        p.max_delay = Duration::from_millis(25);
        assert_eq!(p.delay_for(5), Duration::from_millis(25));
    }

    #[tokio::test]
    async fn attempt_count_equals_invocations_with_no_network_pauses() {
        let p = policy(BackoffDiscipline::Exponential);
        let calls = AtomicU32::new(0);
        let ctx = CancellationToken::new();
        let rctx = RetryContext {
            cancel: &ctx,
            network_monitor: None,
        };
        let result: Result<(), CoreError> = execute(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(CoreError::Transient("boom".into()))
                    } else {
                        Ok(())
                    }
                }
            },
            &p,
            &rctx,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn auth_error_is_not_retried() {
        let p = policy(BackoffDiscipline::Exponential);
        let calls = AtomicU32::new(0);
        let ctx = CancellationToken::new();
        let rctx = RetryContext {
            cancel: &ctx,
            network_monitor: None,
        };
        let result: Result<(), CoreError> = execute(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::Auth("denied".into())) }
            },
            &p,
            &rctx,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn network_down_pause_does_not_consume_attempt() {
        let p = policy(BackoffDiscipline::Exponential);
        let monitor = NetworkMonitor::new(vec![]);
        monitor.transition(NetworkState::Down);
        let calls = AtomicU32::new(0);
        let ctx = CancellationToken::new();
        let rctx = RetryContext {
            cancel: &ctx,
            network_monitor: Some(&monitor),
        };

        let monitor2 = monitor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            monitor2.transition(NetworkState::Up);
        });

        let result: Result<(), CoreError> = execute(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 2 {
                        Err(CoreError::Transient("boom".into()))
                    } else {
                        Ok(())
                    }
                }
            },
            &p,
            &rctx,
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
