//! # Taskr Config
//!
//! Configuration management for the Taskr job engine.
//!
//! Queue jobs are always configured as a list of `[[queue]]` tables, one per
//! binding; there is no single-table shorthand.

mod error;
mod loader;
mod schema;
mod validator;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
pub use validator::{ConfigValidator, ValidationError, ValidationResult, ValidationWarning};
