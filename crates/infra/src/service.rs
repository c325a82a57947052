//! Entry point used at job launch: compute a reservation and persist it in the
//! background.

use thiserror::Error;
use tracing::{info, instrument};

use jobreserve_core::{
    DomainError, DomainResult, JobDescription, ReservationCalculator, ReservationQuantity, TaskId,
};

use crate::config::ReservationConfig;
use crate::reservations::{
    Coordinator, CoordinatorHandle, CoordinatorStats, JobRowAccessor, PersistenceTask,
    PersistenceWriter, PgJobRowAccessor, SubmitError, connect_pool,
};

#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("invalid job description: {0}")]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
}

/// Calculator plus coordinator, configured together.
#[derive(Debug, Clone)]
pub struct ReservationService {
    calculator: ReservationCalculator,
    coordinator: Coordinator,
}

impl ReservationService {
    pub fn new(calculator: ReservationCalculator, coordinator: Coordinator) -> Self {
        Self {
            calculator,
            coordinator,
        }
    }

    /// Build the service over `accessor`. Must be called inside a Tokio runtime,
    /// since it spawns the coordinator.
    pub fn from_config<A>(
        config: &ReservationConfig,
        accessor: A,
    ) -> anyhow::Result<(Self, CoordinatorHandle)>
    where
        A: JobRowAccessor + 'static,
    {
        config.validate()?;
        let calculator = ReservationCalculator::with_default_millicores(config.default_millicores)?;
        let handle = Coordinator::spawn(PersistenceWriter::new(accessor, config.resolve_policy()));

        Ok((Self::new(calculator, handle.coordinator()), handle))
    }

    /// Connect to Postgres and build the service over it.
    pub async fn connect(config: &ReservationConfig) -> anyhow::Result<(Self, CoordinatorHandle)> {
        let pool = connect_pool(config).await?;
        Self::from_config(config, PgJobRowAccessor::new(pool))
    }

    pub fn calculator(&self) -> &ReservationCalculator {
        &self.calculator
    }

    pub fn compute_reservation(&self, job: &JobDescription) -> DomainResult<ReservationQuantity> {
        self.calculator.compute(job)
    }

    /// Queue `quantity` for the job's row. Returns as soon as the task is queued.
    pub fn submit_reservation(
        &self,
        job: &JobDescription,
        quantity: ReservationQuantity,
    ) -> Result<TaskId, SubmitError> {
        self.coordinator
            .enqueue(PersistenceTask::for_job(job, quantity))
    }

    /// Compute and queue in one step.
    #[instrument(skip(self, job), fields(external_id = %job.invocation_id), err)]
    pub fn reserve(&self, job: &JobDescription) -> Result<(TaskId, ReservationQuantity), ReserveError> {
        let quantity = self.compute_reservation(job)?;
        info!(
            submitter = job.submitter.as_deref().unwrap_or(""),
            reservation = %quantity,
            steps = job.steps.len(),
            "launched with millicores reserved"
        );
        let task_id = self.submit_reservation(job, quantity.clone())?;
        Ok((task_id, quantity))
    }

    pub async fn stats(&self) -> Result<CoordinatorStats, SubmitError> {
        self.coordinator.stats().await
    }

    /// Signal shutdown. Await [`CoordinatorHandle::shutdown`] to wait for the
    /// control task.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use jobreserve_core::Step;

    use crate::reservations::InMemoryJobRows;

    fn config() -> ReservationConfig {
        ReservationConfig::default().with_resolve_policy(3, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn compute_uses_configured_default() {
        let (service, handle) = ReservationService::from_config(
            &config().with_default_millicores(1500.0),
            InMemoryJobRows::new(),
        )
        .unwrap();

        let job = JobDescription::new("job-1")
            .with_step(Step::unlimited())
            .with_step(Step::with_max_cpu_cores(0.5));

        assert_eq!(
            service.compute_reservation(&job).unwrap(),
            "2000".parse::<ReservationQuantity>().unwrap()
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn reserve_rejects_bad_jobs_without_queueing() {
        let (service, handle) =
            ReservationService::from_config(&config(), InMemoryJobRows::new()).unwrap();

        let negative = JobDescription::new("job-1").with_step(Step::with_max_cpu_cores(-2.0));
        assert!(matches!(service.reserve(&negative), Err(ReserveError::Invalid(_))));

        let anonymous = JobDescription::new("").with_step(Step::unlimited());
        assert!(matches!(
            service.reserve(&anonymous),
            Err(ReserveError::Submit(SubmitError::MissingJobId))
        ));

        assert_eq!(service.stats().await.unwrap().submitted, 0);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn submit_without_invocation_id_is_refused_by_the_coordinator() {
        let (service, handle) =
            ReservationService::from_config(&config(), InMemoryJobRows::new()).unwrap();

        let anonymous = JobDescription::new("");
        assert_eq!(
            service.submit_reservation(&anonymous, ReservationQuantity::zero()),
            Err(SubmitError::MissingJobId)
        );

        let stats = handle.shutdown().await;
        assert_eq!(stats.submitted, 0);
    }

    #[tokio::test]
    async fn reserve_after_shutdown_is_refused() {
        let (service, handle) =
            ReservationService::from_config(&config(), InMemoryJobRows::new()).unwrap();
        service.shutdown();

        let job = JobDescription::new("job-1").with_step(Step::unlimited());
        assert!(matches!(
            service.reserve(&job),
            Err(ReserveError::Submit(SubmitError::ShutDown))
        ));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let err = ReservationService::from_config(
            &config().with_default_millicores(f64::NAN),
            InMemoryJobRows::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("default millicores"));
    }
}
