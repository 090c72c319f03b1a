//! Shared exponential backoff with jitter.
//!
//! A single [`Backoff`] policy is used by the scheduler (to size requeues after
//! repeated job-creation failures) and by every connection to an external
//! endpoint (e.g. registering alerts on a dashboard that is not up yet).
//!
//! # Example
//!
//! ```ignore
//! use frisbee_common::retry::{retry_with_backoff, Backoff};
//!
//! retry_with_backoff(&Backoff::default(), "set_alert", |e: &Error| e.is_retryable(), || async {
//!     client.set_alert(&alert, &name, &msg).await
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Exponential backoff policy.
///
/// The delay of step `n` is `base_delay * factor^n`, spread by up to
/// `±jitter` of itself. After `steps` attempts the operation is abandoned.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied to the delay after each attempt
    pub factor: f64,
    /// Fraction of the delay used as random spread (0.1 = ±10%)
    pub jitter: f64,
    /// Maximum number of attempts (0 = retry forever)
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(3),
            factor: 5.0,
            jitter: 0.1,
            steps: 3,
        }
    }
}

impl Backoff {
    /// Create a policy with a maximum number of attempts
    pub fn with_steps(steps: u32) -> Self {
        Self {
            steps,
            ..Default::default()
        }
    }

    /// Create a policy that retries forever
    pub fn infinite() -> Self {
        Self::with_steps(0)
    }

    /// Nominal delay for the given step, without jitter.
    pub fn nominal_delay(&self, step: u32) -> Duration {
        let exp = i32::try_from(step).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exp);
        if secs.is_finite() {
            Duration::from_secs_f64(secs)
        } else {
            Duration::MAX
        }
    }

    /// Delay for the given step with jitter applied.
    ///
    /// The step is clamped to the last configured step so that callers who keep
    /// counting failures past `steps` do not grow the delay without bound.
    pub fn delay(&self, step: u32) -> Duration {
        let step = if self.steps > 0 {
            step.min(self.steps.saturating_sub(1))
        } else {
            step
        };
        let nominal = self.nominal_delay(step);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((nominal.as_secs_f64() * (1.0 + spread)).max(0.0))
    }

    /// Whether the attempt number (1-based) exhausts the policy
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.steps > 0 && attempt >= self.steps
    }
}

/// Execute an async operation under the given backoff policy.
///
/// Retries until success, until the policy is exhausted, or until
/// `is_retryable` rejects an error. In the last two cases that error is
/// returned.
///
/// # Arguments
/// * `backoff` - Backoff policy
/// * `operation_name` - Name for logging purposes
/// * `is_retryable` - Whether another attempt may succeed after an error
/// * `operation` - The async operation to retry
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    backoff: &Backoff,
    operation_name: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable(&e) {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed permanently"
                    );
                    return Err(e);
                }

                if backoff.is_exhausted(attempt) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = backoff.delay(attempt - 1);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
