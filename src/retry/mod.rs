//! Exponential backoff with jitter and a step cap.
//!
//! [`Backoff`] describes how delays grow between attempts; [`retry`] runs an
//! async operation until it succeeds or the policy's `steps` are used up.
//!
//! The delay before retry `n` (0-indexed) is `duration × factor^n`, plus a
//! random jitter in `[0, jitter × delay)`. The base is derived from the
//! attempt number alone, so jitter never compounds across attempts.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use eventgate::retry::Backoff;
//!
//! let backoff = Backoff {
//!     duration: Duration::from_millis(100),
//!     factor: 2.0,
//!     jitter: 0.0,
//!     steps: 4,
//! };
//!
//! assert_eq!(backoff.nominal(0), Duration::from_millis(100));
//! assert_eq!(backoff.nominal(2), Duration::from_millis(400));
//! ```

use anyhow::{bail, Result};
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Upper bound for a single computed delay.
const MAX_DELAY: Duration = Duration::from_secs(3600);

/// Retry backoff policy.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry.
    #[serde(rename = "duration_ms", with = "millis")]
    pub duration: Duration,
    /// Multiplicative growth factor applied per attempt.
    pub factor: f64,
    /// Jitter as a fraction of the nominal delay (`0.3` adds up to 30%).
    pub jitter: f64,
    /// Total number of attempts, including the first one.
    pub steps: u32,
}

impl Default for Backoff {
    /// Fixed policy used for mandatory operations such as connecting to the
    /// event bus: 5 attempts, 1s apart, up to 100% jitter.
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(1),
            factor: 1.0,
            jitter: 1.0,
            steps: 5,
        }
    }
}

impl Backoff {
    /// Policy for supervised connector tasks.
    pub fn connector() -> Self {
        Self {
            duration: Duration::from_secs(1),
            factor: 1.0,
            jitter: 0.3,
            steps: 10,
        }
    }

    /// Rejects factors and jitters that cannot produce a delay.
    pub fn validate(&self) -> Result<()> {
        if !self.factor.is_finite() || self.factor < 0.0 {
            bail!("backoff factor must be a finite, non-negative number, got {}", self.factor);
        }
        if !self.jitter.is_finite() || self.jitter < 0.0 {
            bail!("backoff jitter must be a finite, non-negative number, got {}", self.jitter);
        }
        Ok(())
    }

    /// Delay before retry `attempt` without jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.duration.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > MAX_DELAY.as_secs_f64() {
            MAX_DELAY
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before retry `attempt` with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.nominal(attempt);
        if !self.jitter.is_finite() || self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter) * base.as_secs_f64();
        (base + Duration::from_secs_f64(extra)).min(MAX_DELAY)
    }
}

/// Returned when the retry loop gave up.
#[derive(Debug, thiserror::Error)]
#[error("after {attempts} retries: {last}")]
pub struct RetryError<E> {
    /// Number of attempts charged against the policy.
    pub attempts: u32,
    /// Error of the final attempt.
    pub last: E,
    /// The loop ended because its token was cancelled during a backoff.
    pub cancelled: bool,
}

/// How a failed attempt counts against the policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Charge {
    /// Consumes one step.
    Step,
    /// Waits the current delay and tries again without consuming a step.
    Free,
    /// Gives up immediately.
    Stop,
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        self.last
    }
}

/// Runs `op` until it succeeds or the policy is exhausted.
///
/// `None` selects [`Backoff::default`]. The operation is called at most
/// `steps` times; `steps == 0` is treated as a single attempt.
pub async fn retry<T, E, F, Fut>(policy: Option<&Backoff>, op: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_charged(policy, None, op, |_| Charge::Step).await
}

/// Like [`retry`], but `charge` decides per error whether the failure
/// consumes a step, is retried for free, or ends the loop at once.
///
/// When `ctx` is given, a cancellation during a backoff ends the loop with
/// the last error and `cancelled` set.
pub async fn retry_charged<T, E, F, Fut, C>(
    policy: Option<&Backoff>,
    ctx: Option<&CancellationToken>,
    mut op: F,
    charge: C,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> Charge,
{
    let default_policy;
    let policy = match policy {
        Some(p) => p,
        None => {
            default_policy = Backoff::default();
            &default_policy
        }
    };
    let steps = policy.steps.max(1);
    let mut attempt: u32 = 0;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        match charge(&err) {
            Charge::Step => {
                attempt += 1;
                if attempt >= steps {
                    return Err(RetryError {
                        attempts: attempt,
                        last: err,
                        cancelled: false,
                    });
                }
            }
            Charge::Free => {}
            Charge::Stop => {
                return Err(RetryError {
                    attempts: attempt + 1,
                    last: err,
                    cancelled: false,
                })
            }
        }

        let delay = policy.delay(attempt.saturating_sub(1));
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before retry");
        match ctx {
            Some(ctx) => {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        return Err(RetryError {
                            attempts: attempt,
                            last: err,
                            cancelled: true,
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
