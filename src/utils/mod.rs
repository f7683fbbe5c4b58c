//! Shared utilities: errors, clock, file helpers

pub mod clock;
pub mod error;
pub mod fs;

pub use clock::{Clock, ManualClock, MonotonicClock, StopSignal};
pub use error::{AppError, AppResult, ErrorKind, ErrorResponse};
