//! Core task types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobreserve_core::{ExternalJobId, JobDescription, JobRowId, ReservationQuantity, TaskId};

use super::writer::{PersistError, WriteReport};

/// One reservation waiting to be written against its job row.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceTask {
    /// Bookkeeping id, unique per enqueue.
    pub id: TaskId,
    /// Locates the job row once it exists.
    pub external_id: ExternalJobId,
    pub quantity: ReservationQuantity,
    pub enqueued_at: DateTime<Utc>,
}

impl PersistenceTask {
    pub fn new(external_id: ExternalJobId, quantity: ReservationQuantity) -> Self {
        Self {
            id: TaskId::new(),
            external_id,
            quantity,
            enqueued_at: Utc::now(),
        }
    }

    /// Build the task for a launched job, keyed by its invocation id.
    pub fn for_job(job: &JobDescription, quantity: ReservationQuantity) -> Self {
        Self::new(job.invocation_id.clone(), quantity)
    }
}

/// How long the writer waits for a job row to appear.
///
/// Lookups are retried at a fixed interval; `max_attempts` counts lookups, so
/// the longest wait is `(max_attempts - 1) * interval` plus query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvePolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ResolvePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(2),
        }
    }
}

impl ResolvePolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Whether another lookup is allowed after `attempt` lookups came back empty.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Upper bound on time spent sleeping between lookups.
    pub fn resolution_window(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// How a task ended, as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The update touched the job row.
    Written { job_id: JobRowId, rows_affected: u64 },
    /// The row resolved but was gone by the time of the update.
    RowVanished { job_id: JobRowId },
    /// The job id never resolved within the policy window.
    TimedOut { attempts: u32 },
    /// Shutdown interrupted the task before it wrote.
    Cancelled,
    /// Any other storage or conversion failure.
    Failed { error: String },
    /// The writer panicked.
    Panicked,
}

impl TaskOutcome {
    pub fn from_result(result: &Result<WriteReport, PersistError>) -> Self {
        match result {
            Ok(report) if report.rows_affected == 0 => Self::RowVanished {
                job_id: report.job_id,
            },
            Ok(report) => Self::Written {
                job_id: report.job_id,
                rows_affected: report.rows_affected,
            },
            Err(PersistError::ResolutionTimedOut { attempts, .. }) => Self::TimedOut {
                attempts: *attempts,
            },
            Err(PersistError::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed {
                error: e.to_string(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Written { .. } | Self::RowVanished { .. })
    }
}

/// Coordinator runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub resolution_timeouts: u64,
    pub cancelled: u64,
    pub zero_row_updates: u64,
    pub in_flight: usize,
}

impl CoordinatorStats {
    pub(crate) fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Written { .. } => self.succeeded += 1,
            TaskOutcome::RowVanished { .. } => {
                self.succeeded += 1;
                self.zero_row_updates += 1;
            }
            TaskOutcome::TimedOut { .. } => {
                self.failed += 1;
                self.resolution_timeouts += 1;
            }
            TaskOutcome::Cancelled => {
                self.failed += 1;
                self.cancelled += 1;
            }
            TaskOutcome::Failed { .. } | TaskOutcome::Panicked => self.failed += 1,
        }
    }

    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}
