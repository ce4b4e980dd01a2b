//! Worker lifecycle management for view coordination
//!
//! Starts and stops view workers and deletes the backing stores of removed
//! views in the background, with bounded retries.

mod cleanup;
mod manager;
mod retry;

pub use cleanup::{
    CleanupEvent, CleanupExecutor, CleanupRecord, CleanupStatus, CleanupTicket, DeadLetter,
};
pub use manager::WorkerLifecycle;
pub use retry::{RetryExhausted, RetryStrategy, Retried};
