//! Cron-driven retry loop around the backup cycle.

pub mod health;
pub mod retry;

use chrono::{DateTime, Local, TimeZone, Utc};
use cron::Schedule;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backup::CycleOutcome;
use crate::errors::{ConfigError, CycleError};

pub use health::{HealthHandle, HealthRecorder, HealthReport, RetryState};
pub use retry::{RetryPolicy, run_with_retry};

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

/// The `cron` crate wants seconds and year fields; plain 5-field Unix
/// expressions fire at second 0 of any year.
fn to_cron_crate_format(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression} *")
    } else {
        expression.to_string()
    }
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ConfigError> {
        let expression = expression.trim();
        let schedule = Schedule::from_str(&to_cron_crate_format(expression)).map_err(|e| {
            ConfigError::Schedule {
                expression: expression.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next tick strictly after `after`, evaluated in `after`'s time zone.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }
}

/// Fires the backup cycle on every tick, one cycle at a time. Ticks that
/// pass while a cycle is still running are skipped. Expressions are read in
/// the host's local time zone.
pub struct Scheduler {
    schedule: CronSchedule,
    policy: RetryPolicy,
    recorder: HealthRecorder,
}

impl Scheduler {
    pub fn new(schedule: CronSchedule, policy: RetryPolicy, recorder: HealthRecorder) -> Self {
        Self {
            schedule,
            policy,
            recorder,
        }
    }

    /// Runs until `cancel` fires. A failed cycle is logged and recorded,
    /// never propagated.
    pub async fn run<F, Fut>(&self, cancel: &CancellationToken, mut cycle: F)
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<CycleOutcome, CycleError>>,
    {
        info!(schedule = %self.schedule.expression(), "Backup scheduler started");
        let mut previous: Option<DateTime<Local>> = None;

        loop {
            let now = Local::now();
            let after = previous.map_or(now, |p| p.max(now));
            let Some(next) = self.schedule.next_after(&after) else {
                warn!(
                    schedule = %self.schedule.expression(),
                    "Schedule has no upcoming runs, stopping"
                );
                return;
            };
            previous = Some(next);
            self.recorder.schedule_next(next.with_timezone(&Utc));
            info!(next_run = %next, "Next scheduled run");

            let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, no further backups will be scheduled");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match run_with_retry(self.policy, cancel, &self.recorder, &mut cycle).await {
                Ok(outcome) => info!(
                    cycle_id = %outcome.cycle_id,
                    databases = outcome.succeeded,
                    "Scheduled backup succeeded"
                ),
                Err(failed) if failed.is_cancelled() => {
                    info!("Scheduled backup interrupted by shutdown");
                    return;
                }
                Err(failed) => error!(
                    attempts = failed.attempts,
                    error = %failed,
                    "Scheduled backup failed"
                ),
            }

            if cancel.is_cancelled() {
                return;
            }
        }
    }
}
