//! Asynchronous persistence of job CPU reservations.
//!
//! ## Design
//!
//! - Submission is non-blocking: callers enqueue and return immediately
//! - The job row may not exist yet, so writers poll for it at a fixed interval
//! - One control task owns the in-flight set; everything else sends it messages
//! - Shutdown stops new submissions and interrupts writers between lookups
//!
//! ## Components
//!
//! - `PersistenceTask`: a reservation waiting to be written
//! - `JobRowAccessor`: storage seam (Postgres or in-memory)
//! - `PersistenceWriter`: resolve-then-update for one task
//! - `Coordinator`: tracks and spawns writers

pub mod coordinator;
pub mod postgres;
pub mod storage;
pub mod types;
pub mod writer;

pub use coordinator::{Coordinator, CoordinatorHandle, SubmitError};
pub use postgres::{PgJobRowAccessor, connect_pool};
pub use storage::{InMemoryJobRows, JobRowAccessor, StorageError};
pub use types::{CoordinatorStats, PersistenceTask, ResolvePolicy, TaskOutcome};
pub use writer::{
    LookupOutcome, PersistError, PersistenceWriter, ResolveState, WriteReport,
};
