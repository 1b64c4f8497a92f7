use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::health::HealthRecorder;
use crate::backup::CycleOutcome;
use crate::errors::{BackupFailed, CycleError};

/// How often a failed cycle is attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Fail on the first error.
    Disabled,
    /// `retries` extra attempts, `delay` apart.
    Constant { retries: u32, delay: Duration },
}

impl RetryPolicy {
    pub fn from_settings(retries: u32, delay: Duration) -> Self {
        if retries == 0 {
            RetryPolicy::Disabled
        } else {
            RetryPolicy::Constant { retries, delay }
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            RetryPolicy::Disabled => 1,
            RetryPolicy::Constant { retries, .. } => retries.saturating_add(1),
        }
    }

    fn delay(&self) -> Duration {
        match self {
            RetryPolicy::Disabled => Duration::ZERO,
            RetryPolicy::Constant { delay, .. } => *delay,
        }
    }
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error, or
/// the policy gives up. Cancellation ends the loop immediately, including
/// while waiting out the backoff delay.
pub async fn run_with_retry<F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    recorder: &HealthRecorder,
    mut attempt: F,
) -> Result<CycleOutcome, BackupFailed>
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<CycleOutcome, CycleError>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempts = 0;

    loop {
        attempts += 1;
        recorder.attempt_started(attempts);
        let started = Instant::now();
        let result = attempt(cancel.clone()).await;
        recorder.attempt_finished(started.elapsed(), result.is_ok());

        let err = match result {
            Ok(outcome) => {
                recorder.cycle_finished(true);
                return Ok(outcome);
            }
            Err(err) => err,
        };

        if err.is_cancelled() || cancel.is_cancelled() {
            info!(attempts, "Backup interrupted by shutdown");
            return Err(BackupFailed {
                attempts,
                source: err,
            });
        }
        if !err.is_retryable() || attempts >= max_attempts {
            recorder.cycle_finished(false);
            return Err(BackupFailed {
                attempts,
                source: err,
            });
        }

        let delay = policy.delay();
        warn!(
            attempt = attempts,
            max_attempts,
            delay_secs = delay.as_secs(),
            error = %err,
            "Backup attempt failed, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BackupFailed {
                    attempts,
                    source: CycleError::Cancelled,
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
