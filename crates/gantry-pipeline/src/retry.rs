//! Retry helpers: backoff between handler attempts and per-edge loop budgets.

use std::time::Duration;

use gantry_types::{Result, StageOutput, Usage};

use crate::graph::RouteContext;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let millis = (base.as_millis() as u64).saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Run a stage attempt up to `max_retries + 1` times.
///
/// An attempt is retried when it returns an unsuccessful [`StageOutput`] or an
/// error other than cancellation. Usage from discarded attempts is folded into
/// the returned output so token accounting stays monotonic.
pub async fn execute_with_retry<F, Fut>(
    f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    stage_id: &str,
) -> Result<StageOutput>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<StageOutput>>,
{
    let mut spent = Usage::default();
    let mut attempt = 0;
    loop {
        let last = attempt >= max_retries;
        match f().await {
            Ok(mut output) => {
                if output.success || last {
                    output.usage += spent;
                    return Ok(output);
                }
                spent += output.usage;
                let delay = policy.delay_for_attempt(attempt);
                tracing::info!(
                    stage = %stage_id,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    errors = ?output.errors,
                    "Stage attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if !e.is_cancellation() && !last => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(stage = %stage_id, attempt, delay_ms = %delay.as_millis(), error = %e, "Stage error, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
        attempt += 1;
    }
}

/// Bound on a routed loop, tracked in a named retry counter.
///
/// Routing functions own their counters; a budget is the helper they use to
/// read and bump one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudget {
    pub counter: String,
    pub max: u32,
}

impl RetryBudget {
    pub fn new(counter: impl Into<String>, max: u32) -> Self {
        Self {
            counter: counter.into(),
            max,
        }
    }

    pub fn exhausted(&self, ctx: &RouteContext<'_>) -> bool {
        ctx.retries(&self.counter) >= self.max
    }

    /// Consume one retry if any remain. Returns `false` once exhausted.
    pub fn try_consume(&self, ctx: &mut RouteContext<'_>) -> bool {
        if self.exhausted(ctx) {
            tracing::warn!(
                stage = %ctx.stage,
                counter = %self.counter,
                max = self.max,
                "Retry budget exhausted"
            );
            return false;
        }
        ctx.bump(&self.counter);
        true
    }
}
