//! Persistence writer: resolve the job row, then write the reservation.
//!
//! ## Resolve
//!
//! The job row for an invocation id is created by another process and may not
//! be visible yet. Resolution is a small state machine:
//!
//! ```text
//! Resolving(1) --not found--> Resolving(2) --not found--> ... --> TimedOut
//!      |                           |
//!      +--------found--------------+-----------------------------> Resolved
//!      +--------cancel-------------+-----------------------------> Cancelled
//! ```
//!
//! Only "not found" is retried. Any other read error ends the task at once.
//!
//! ## Write
//!
//! The decimal reservation is truncated toward zero to whole millicores and
//! written with a single update keyed by the resolved row id. An update that
//! touches no rows means the row disappeared after resolution; it is logged,
//! not retried.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobreserve_core::{ExternalJobId, JobRowId, ReservationQuantity};

use super::storage::{JobRowAccessor, StorageError};
use super::types::ResolvePolicy;

/// Why a reservation was not written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("job {external_id} did not resolve to a job row after {attempts} lookups")]
    ResolutionTimedOut {
        external_id: ExternalJobId,
        attempts: u32,
    },
    #[error("reservation write cancelled")]
    Cancelled,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("reservation {0} does not fit the millicores column")]
    QuantityOutOfRange(ReservationQuantity),
}

/// Result of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReport {
    pub job_id: JobRowId,
    /// The truncated value sent to storage.
    pub millicores: i64,
    pub rows_affected: u64,
}

/// Result of one lookup, as far as the state machine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Found(JobRowId),
    NotFound,
}

impl From<Option<JobRowId>> for LookupOutcome {
    fn from(value: Option<JobRowId>) -> Self {
        match value {
            Some(job_id) => Self::Found(job_id),
            None => Self::NotFound,
        }
    }
}

/// Resolution state. Transitions are pure; the writer drives them with real
/// lookups and sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveState {
    /// About to perform lookup number `attempt` (1-indexed).
    Resolving { attempt: u32 },
    Resolved(JobRowId),
    TimedOut { attempts: u32 },
    Cancelled,
}

impl ResolveState {
    pub fn start() -> Self {
        Self::Resolving { attempt: 1 }
    }

    /// Apply the outcome of the current lookup.
    pub fn on_lookup(self, outcome: LookupOutcome, policy: &ResolvePolicy) -> Self {
        match (self, outcome) {
            (Self::Resolving { .. }, LookupOutcome::Found(job_id)) => Self::Resolved(job_id),
            (Self::Resolving { attempt }, LookupOutcome::NotFound) => {
                if policy.should_retry(attempt) {
                    Self::Resolving {
                        attempt: attempt + 1,
                    }
                } else {
                    Self::TimedOut { attempts: attempt }
                }
            }
            (terminal, _) => terminal,
        }
    }

    pub fn cancel(self) -> Self {
        match self {
            Self::Resolving { .. } => Self::Cancelled,
            terminal => terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Resolving { .. })
    }

    /// Whether the writer must pause before the next lookup.
    pub fn needs_pause(&self) -> bool {
        matches!(self, Self::Resolving { attempt } if *attempt > 1)
    }
}

/// Writes reservations against job rows that may not exist yet.
pub struct PersistenceWriter<A: JobRowAccessor> {
    accessor: Arc<A>,
    policy: ResolvePolicy,
}

impl<A: JobRowAccessor> Clone for PersistenceWriter<A> {
    fn clone(&self) -> Self {
        Self {
            accessor: self.accessor.clone(),
            policy: self.policy,
        }
    }
}

impl<A: JobRowAccessor> PersistenceWriter<A> {
    pub fn new(accessor: A, policy: ResolvePolicy) -> Self {
        Self::from_shared(Arc::new(accessor), policy)
    }

    pub fn from_shared(accessor: Arc<A>, policy: ResolvePolicy) -> Self {
        Self { accessor, policy }
    }

    pub fn policy(&self) -> &ResolvePolicy {
        &self.policy
    }

    /// Resolve `external_id` and store `quantity` on its job row.
    ///
    /// Cancelling `cancel` interrupts lookups and the pauses between them. Once
    /// the row is resolved the update itself runs to completion.
    pub async fn write(
        &self,
        external_id: &ExternalJobId,
        quantity: &ReservationQuantity,
        cancel: &CancellationToken,
    ) -> Result<WriteReport, PersistError> {
        let millicores = quantity
            .truncated_millicores()
            .ok_or_else(|| PersistError::QuantityOutOfRange(quantity.clone()))?;

        debug!(%external_id, "looking up job ID");
        let job_id = self.resolve(external_id, cancel).await?;
        info!(%external_id, %job_id, "resolved job row");

        debug!(%job_id, %quantity, millicores, "converted millicores value");
        let rows_affected = self
            .accessor
            .set_millicores_reserved(job_id, millicores)
            .await
            .inspect_err(|e| error!(%external_id, %job_id, error = %e, "failed to set millicores reserved"))?;

        if rows_affected == 0 {
            warn!(
                %external_id,
                %job_id,
                millicores,
                "job row disappeared between lookup and update; reservation not stored"
            );
        } else {
            debug!(%job_id, rows_affected, "rows affected");
        }

        Ok(WriteReport {
            job_id,
            millicores,
            rows_affected,
        })
    }

    /// Poll for the job row until it exists, the policy runs out, or `cancel` fires.
    pub async fn resolve(
        &self,
        external_id: &ExternalJobId,
        cancel: &CancellationToken,
    ) -> Result<JobRowId, PersistError> {
        let mut state = ResolveState::start();

        loop {
            match state {
                ResolveState::Resolving { .. } => {}
                ResolveState::Resolved(job_id) => return Ok(job_id),
                ResolveState::TimedOut { attempts } => {
                    error!(%external_id, attempts, "job row never appeared; giving up");
                    return Err(PersistError::ResolutionTimedOut {
                        external_id: external_id.clone(),
                        attempts,
                    });
                }
                ResolveState::Cancelled => {
                    warn!(%external_id, "job row lookup cancelled");
                    return Err(PersistError::Cancelled);
                }
            }

            if state.needs_pause() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        state = state.cancel();
                        continue;
                    }
                    _ = tokio::time::sleep(self.policy.interval) => {}
                }
            }

            let found = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    state = state.cancel();
                    continue;
                }
                found = self.accessor.find_job_id(external_id) => found,
            };

            let outcome = match found {
                Ok(found) => LookupOutcome::from(found),
                Err(e) => {
                    error!(%external_id, error = %e, "job row lookup failed");
                    return Err(e.into());
                }
            };

            if let ResolveState::Resolving { attempt } = state {
                debug!(%external_id, attempt, found = outcome != LookupOutcome::NotFound, "job row lookup");
            }
            state = state.on_lookup(outcome, &self.policy);
        }
    }
}
