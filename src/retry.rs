// ============================================================================
// Bounded Retry-on-Conflict
// ============================================================================
//
// Optimistic transactions report a conflict as a value, never as an error.
// This combinator re-runs the attempt until it succeeds or the wall-clock
// deadline passes, and hands back how many attempts it took.
//
// ============================================================================

use crate::core::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{Level, event};

/// Configuration for conflict retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Wall-clock budget for all attempts of one call, in milliseconds.
    pub deadline_ms: u64,
    /// Base duration in milliseconds for backoff calculation.
    pub base_backoff_ms: u64,
    /// Maximum duration in milliseconds for backoff.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            deadline_ms: 10_000,
            base_backoff_ms: 1,
            max_backoff_ms: 50,
        }
    }
}

impl RetryPolicy {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    /// Exponential backoff after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let base = self.base_backoff_ms.max(1);
        let cap = self.max_backoff_ms.max(base);

        let mut backoff = base;
        for _ in 1..attempt {
            backoff = backoff.saturating_mul(2).min(cap);
        }
        Duration::from_millis(backoff)
    }
}

/// Result of one optimistic attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    Done(T),
    /// The commit lost a race; try again.
    Conflict,
}

/// Successful value plus retry diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: usize,
    pub elapsed: Duration,
}

/// Runs `op` until it returns `Attempt::Done` or `policy`'s deadline passes.
///
/// At least one attempt is always made. Errors returned by `op` are not
/// retried; they propagate immediately. Running out of time yields
/// `EngineError::Contention` labelled with `key`.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &RetryPolicy,
    key: &str,
    mut op: F,
) -> Result<RetryOutcome<T>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    let started = Instant::now();
    let deadline = policy.deadline();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match op(attempts).await? {
            Attempt::Done(value) => {
                return Ok(RetryOutcome {
                    value,
                    attempts,
                    elapsed: started.elapsed(),
                });
            }
            Attempt::Conflict => {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    event!(
                        Level::WARN,
                        key,
                        attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "optimistic retry deadline exceeded"
                    );
                    return Err(EngineError::Contention {
                        key: key.to_string(),
                        attempts,
                        elapsed,
                    });
                }
                event!(Level::DEBUG, key, attempts, "optimistic commit conflicted, retrying");
                let pause = policy.backoff(attempts).min(deadline - elapsed);
                tokio::time::sleep(pause).await;
            }
        }
    }
}
