//! Shared plumbing for the netops scheduler crates: configuration loading and
//! the configuration error type.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, NetopsConfig, SchedulerSettings};
pub use error::{CoreError, Result};
