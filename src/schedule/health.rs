use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::backup::Dumper;

/// In-memory state of the retry/schedule loop. Nothing is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    /// Attempt number within the current cycle, 0 when idle.
    pub attempt: u32,
    pub last_run_succeeded: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub errors_seen: u64,
    pub retries_attempted: u64,
    pub cycles_succeeded: u64,
    pub cycles_failed: u64,
    pub consecutive_failures: u32,
    pub last_duration: Option<Duration>,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            attempt: 0,
            last_run_succeeded: true,
            next_run: None,
            errors_seen: 0,
            retries_attempted: 0,
            cycles_succeeded: 0,
            cycles_failed: 0,
            consecutive_failures: 0,
            last_duration: None,
        }
    }
}

/// Write side of [`RetryState`], owned by the retry/schedule loop.
#[derive(Debug, Clone)]
pub struct HealthRecorder {
    tx: Arc<watch::Sender<RetryState>>,
}

impl Default for HealthRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRecorder {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RetryState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn attempt_started(&self, attempt: u32) {
        self.tx.send_modify(|state| {
            state.attempt = attempt;
            if attempt > 1 {
                state.retries_attempted += 1;
            }
        });
    }

    pub fn attempt_finished(&self, elapsed: Duration, succeeded: bool) {
        self.tx.send_modify(|state| {
            state.last_duration = Some(elapsed);
            if !succeeded {
                state.errors_seen += 1;
            }
        });
    }

    /// Records the final result of a cycle once retries are over.
    pub fn cycle_finished(&self, succeeded: bool) {
        self.tx.send_modify(|state| {
            state.attempt = 0;
            state.last_run_succeeded = succeeded;
            if succeeded {
                state.cycles_succeeded += 1;
                state.consecutive_failures = 0;
            } else {
                state.cycles_failed += 1;
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
            }
        });
    }

    /// Publishes the next tick. The published time never moves backwards.
    pub fn schedule_next(&self, next: DateTime<Utc>) {
        self.tx.send_if_modified(|state| match state.next_run {
            Some(current) if current >= next => false,
            _ => {
                state.next_run = Some(next);
                true
            }
        });
    }

    pub fn snapshot(&self) -> RetryState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RetryState> {
        self.tx.subscribe()
    }

    pub fn handle(&self, dumper: Arc<dyn Dumper>) -> HealthHandle {
        HealthHandle {
            state: self.subscribe(),
            dumper,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ComponentHealth {
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: HealthState::Healthy,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub db_connection: ComponentHealth,
    pub last_backup: ComponentHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status != HealthState::Unhealthy
    }
}

/// Read-only view for operational checks: the loop's [`RetryState`] plus
/// the connectivity probe.
#[derive(Clone)]
pub struct HealthHandle {
    state: watch::Receiver<RetryState>,
    dumper: Arc<dyn Dumper>,
}

impl HealthHandle {
    pub fn state(&self) -> RetryState {
        self.state.borrow().clone()
    }

    pub async fn report(&self) -> HealthReport {
        let db_connection = match self.dumper.validate().await {
            Ok(()) => ComponentHealth::healthy(),
            Err(e) => ComponentHealth {
                status: HealthState::Unhealthy,
                detail: Some(e.to_string()),
            },
        };

        let state = self.state();
        let last_backup = if state.last_run_succeeded {
            ComponentHealth::healthy()
        } else {
            ComponentHealth {
                status: HealthState::Degraded,
                detail: Some(format!(
                    "last backup failed ({} consecutive failure(s), {} error(s) seen)",
                    state.consecutive_failures, state.errors_seen
                )),
            }
        };

        let status = [db_connection.status, last_backup.status]
            .into_iter()
            .max_by_key(|status| match status {
                HealthState::Healthy => 0,
                HealthState::Degraded => 1,
                HealthState::Unhealthy => 2,
            })
            .unwrap_or(HealthState::Healthy);

        HealthReport {
            status,
            db_connection,
            last_backup,
            next_run: state.next_run,
        }
    }
}
