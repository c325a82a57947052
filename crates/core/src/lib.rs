//! `jobreserve-core` — pure building blocks of the reservation pipeline.
//!
//! No I/O lives here: job descriptions, identifiers, and the millicore
//! reservation calculator.

pub mod error;
pub mod id;
pub mod job;
pub mod reservation;

pub use error::{DomainError, DomainResult};
pub use id::{ExternalJobId, JobRowId, TaskId};
pub use job::{Component, Container, JobDescription, Step};
pub use reservation::{
    DECIMAL_PRECISION, MILLICORES_PER_CORE, ReservationCalculator, ReservationQuantity, compute,
};
