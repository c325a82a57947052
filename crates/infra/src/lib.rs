//! Infrastructure layer: job-row storage, background reservation writes, config.

pub mod config;
pub mod reservations;
pub mod service;

pub use config::ReservationConfig;
pub use service::{ReservationService, ReserveError};
