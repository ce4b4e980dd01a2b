//! View Core - foundation for project view coordination
//!
//! Provides the view and project data model, error handling, configuration
//! and logging setup shared by the sharding, backend, lifecycle and
//! coordinator crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use types::*;
