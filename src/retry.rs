//! Bounded retry for Result Sink calls.
//!
//! Every call runs under a timeout. Transient failures (unavailable, timed
//! out) are retried with exponential backoff until either the attempt budget
//! or the overall deadline is exhausted; any other error is returned at once.

use crate::error::SinkError;
use crate::stats::PipelineStats;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub call_timeout: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based): base, 2*base, 4*base...
    /// clamped to `backoff_max`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let factor = 1u32 << exponent;
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Attempt counter plus deadline. Each failure is fed in and the state says
/// whether another attempt is allowed.
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    attempts: u32,
    deadline: Instant,
}

impl<'a> RetryState<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            deadline: Instant::now() + policy.max_elapsed,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn on_failure(&self, err: &SinkError) -> RetryDecision {
        if !err.is_transient() || self.attempts >= self.policy.max_attempts.max(1) {
            return RetryDecision::GiveUp;
        }
        let delay = self.policy.delay_after(self.attempts);
        if Instant::now() + delay >= self.deadline {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(delay)
    }
}

pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    stats: &PipelineStats,
    operation: &'static str,
    mut call: F,
) -> Result<T, SinkError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SinkError>>,
{
    let mut state = RetryState::new(policy);
    loop {
        state.begin_attempt();
        let outcome = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout(policy.call_timeout)),
        };
        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        match state.on_failure(&err) {
            RetryDecision::RetryAfter(delay) => {
                PipelineStats::add(&stats.sink_retries, 1);
                tracing::warn!(
                    operation,
                    attempt = state.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "result sink call failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::GiveUp => {
                if err.is_transient() {
                    tracing::error!(
                        operation,
                        attempts = state.attempts(),
                        error = %err,
                        "result sink retry budget exhausted"
                    );
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            call_timeout: Duration::from_millis(200),
            max_elapsed: Duration::from_secs(5),
        }
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(500),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
        assert_eq!(policy.delay_after(40), Duration::from_millis(500));
    }

    #[test]
    fn state_gives_up_on_permanent_errors_and_exhausted_budget() {
        let policy = fast_policy(2);
        let mut state = RetryState::new(&policy);
        state.begin_attempt();
        assert_eq!(
            state.on_failure(&SinkError::Backend("constraint".into())),
            RetryDecision::GiveUp
        );
        assert!(matches!(
            state.on_failure(&SinkError::Unavailable("down".into())),
            RetryDecision::RetryAfter(_)
        ));
        state.begin_attempt();
        assert_eq!(
            state.on_failure(&SinkError::Unavailable("down".into())),
            RetryDecision::GiveUp
        );
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let stats = PipelineStats::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = with_retry(&fast_policy(3), &stats, "put_aggregate", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SinkError::Unavailable("connection reset".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(stats.snapshot().sink_retries, 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_count_against_budget() {
        let stats = PipelineStats::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = with_retry(&fast_policy(2), &stats, "get_aggregate", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, SinkError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SinkError::Timeout(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_returned_without_retrying() {
        let stats = PipelineStats::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = with_retry(&fast_policy(5), &stats, "put_aggregate", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(SinkError::Backend("bad row".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SinkError::Backend(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
