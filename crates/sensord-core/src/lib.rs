//! `sensord-core` — configuration and process-level errors shared by the
//! scheduler crate and the `sensord` binary.

pub mod config;
pub mod error;

pub use config::{CallbackConfig, DatabaseConfig, SchedulerConfig, SensordConfig};
pub use error::{Result, SensordError};
