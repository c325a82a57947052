//! Background coordinator for reservation writes.
//!
//! A single control task owns the in-flight set and the statistics. Callers and
//! writer tasks talk to it only through an unbounded channel:
//!
//! - `Submit` registers a task and spawns its writer
//! - `Completed` retires a task and records its outcome
//! - `InFlight` / `Stats` answer queries over a oneshot
//!
//! Nothing else reads or mutates that state, so it needs no lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobreserve_core::TaskId;

use super::storage::JobRowAccessor;
use super::types::{CoordinatorStats, PersistenceTask, TaskOutcome};
use super::writer::PersistenceWriter;

/// Why a task could not be handed to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("reservation coordinator is shut down")]
    ShutDown,
    #[error("job has no invocation id to resolve")]
    MissingJobId,
}

#[derive(Debug)]
enum Command {
    Submit(PersistenceTask),
    Completed { task_id: TaskId, outcome: TaskOutcome },
    InFlight(oneshot::Sender<usize>),
    Stats(oneshot::Sender<CoordinatorStats>),
}

/// Cloneable front door to the control task.
#[derive(Debug, Clone)]
pub struct Coordinator {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
}

impl Coordinator {
    /// Spawn the control task on the current Tokio runtime.
    pub fn spawn<A>(writer: PersistenceWriter<A>) -> CoordinatorHandle
    where
        A: JobRowAccessor + 'static,
    {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let join = tokio::spawn(control_loop(
            writer,
            receiver,
            commands.clone(),
            shutdown.clone(),
        ));

        CoordinatorHandle {
            coordinator: Self { commands, shutdown },
            join,
        }
    }

    /// Hand a task to the control task. Never waits on storage.
    pub fn enqueue(&self, task: PersistenceTask) -> Result<TaskId, SubmitError> {
        if task.external_id.is_empty() {
            return Err(SubmitError::MissingJobId);
        }
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::ShutDown);
        }

        let task_id = task.id;
        self.commands
            .send(Command::Submit(task))
            .map_err(|_| SubmitError::ShutDown)?;
        Ok(task_id)
    }

    /// Number of writes currently outstanding.
    pub async fn in_flight(&self) -> Result<usize, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::InFlight(tx))
            .map_err(|_| SubmitError::ShutDown)?;
        rx.await.map_err(|_| SubmitError::ShutDown)
    }

    pub async fn stats(&self) -> Result<CoordinatorStats, SubmitError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(tx))
            .map_err(|_| SubmitError::ShutDown)?;
        rx.await.map_err(|_| SubmitError::ShutDown)
    }

    /// Stop accepting work and signal running writers to stop retrying.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Owner of the control task.
#[derive(Debug)]
pub struct CoordinatorHandle {
    coordinator: Coordinator,
    join: JoinHandle<CoordinatorStats>,
}

impl CoordinatorHandle {
    pub fn coordinator(&self) -> Coordinator {
        self.coordinator.clone()
    }

    /// Request shutdown and wait for the control task to stop.
    ///
    /// Writers already running are not aborted; they observe the cancellation
    /// at their next lookup or pause, and the control task waits for them to
    /// retire. Tasks accepted but not yet started are retired as cancelled.
    /// Returns the final statistics.
    pub async fn shutdown(self) -> CoordinatorStats {
        self.coordinator.shutdown();
        match self.join.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "reservation coordinator task failed");
                CoordinatorStats::default()
            }
        }
    }
}

/// State owned by the control task.
struct ControlState<A: JobRowAccessor> {
    writer: PersistenceWriter<A>,
    completions: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    in_flight: HashMap<TaskId, DateTime<Utc>>,
    stats: CoordinatorStats,
}

impl<A> ControlState<A>
where
    A: JobRowAccessor + 'static,
{
    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit(task) => {
                self.stats.submitted += 1;
                if self.shutdown.is_cancelled() {
                    self.reject(task);
                    return;
                }

                self.in_flight.insert(task.id, Utc::now());
                debug!(task_id = %task.id, in_flight = self.in_flight.len(), "task registered");

                dispatch(
                    self.writer.clone(),
                    task,
                    self.completions.clone(),
                    self.shutdown.child_token(),
                );
            }
            Command::Completed { task_id, outcome } => {
                match self.in_flight.remove(&task_id) {
                    Some(started_at) => {
                        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0);
                        debug!(
                            task_id = %task_id,
                            duration_ms,
                            in_flight = self.in_flight.len(),
                            "task retired"
                        );
                    }
                    None => warn!(task_id = %task_id, "completion for unknown task"),
                }
                self.stats.record(&outcome);
            }
            Command::InFlight(reply) => {
                let _ = reply.send(self.in_flight.len());
            }
            Command::Stats(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Retire a task accepted before shutdown but never started.
    fn reject(&mut self, task: PersistenceTask) {
        error!(
            task_id = %task.id,
            external_id = %task.external_id,
            reservation = %task.quantity,
            "coordinator shut down before the write started; reservation not stored"
        );
        self.stats.record(&TaskOutcome::Cancelled);
    }

    fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            in_flight: self.in_flight.len(),
            ..self.stats.clone()
        }
    }
}

async fn control_loop<A>(
    writer: PersistenceWriter<A>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
) -> CoordinatorStats
where
    A: JobRowAccessor + 'static,
{
    info!("reservation coordinator started");

    let mut state = ControlState {
        writer,
        completions,
        shutdown: shutdown.clone(),
        in_flight: HashMap::new(),
        stats: CoordinatorStats::default(),
    };

    loop {
        let command = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        state.handle(command);
    }

    // Running writers are cancelled through their child tokens; wait for them.
    while !state.in_flight.is_empty() {
        match commands.recv().await {
            Some(command) => state.handle(command),
            None => break,
        }
    }

    // Anything still buffered was accepted before shutdown.
    commands.close();
    while let Some(command) = commands.recv().await {
        state.handle(command);
    }

    let stats = state.snapshot();
    info!(
        outstanding = stats.in_flight,
        submitted = stats.submitted,
        succeeded = stats.succeeded,
        failed = stats.failed,
        cancelled = stats.cancelled,
        "reservation coordinator stopped"
    );
    stats
}

fn dispatch<A>(
    writer: PersistenceWriter<A>,
    task: PersistenceTask,
    completions: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
) where
    A: JobRowAccessor + 'static,
{
    let task_id = task.id;
    let external_id = task.external_id.clone();

    let write = tokio::spawn(async move {
        info!(
            task_id = %task.id,
            external_id = %task.external_id,
            reservation = %task.quantity,
            "storing millicores reserved"
        );
        let result = writer.write(&task.external_id, &task.quantity, &cancel).await;
        if let Err(e) = &result {
            error!(
                task_id = %task.id,
                external_id = %task.external_id,
                reservation = %task.quantity,
                error = %e,
                "reservation not stored"
            );
        }
        TaskOutcome::from_result(&result)
    });

    // Outer task so a panicking writer still retires its entry.
    tokio::spawn(async move {
        let outcome = match write.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(task_id = %task_id, external_id = %external_id, error = %e, "reservation writer panicked");
                TaskOutcome::Panicked
            }
        };
        info!(task_id = %task_id, external_id = %external_id, outcome = ?outcome, "done storing millicores reserved");

        // The control task may already be gone after shutdown.
        let _ = completions.send(Command::Completed { task_id, outcome });
    });
}
