//! Shared configuration and error types for the ruleclock workspace.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, RuleclockConfig, SchedulerConfig};
pub use error::{CoreError, Result};
