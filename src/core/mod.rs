//! Error type and process-wide readiness shared by every component.

pub mod error;
pub mod status;

pub use error::{IntakeError, IntakeResult};
