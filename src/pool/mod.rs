//! Worker pool for parallel task execution.
//!
//! [`WorkerPool`] runs submitted closures on a fixed set of threads and
//! hands back a [`TaskHandle`] per task for result collection, timed
//! waits, and cooperative cancellation.

pub mod handle;
pub mod worker;

pub use handle::{CancelToken, TaskError, TaskHandle, TaskState};
pub use worker::{Backpressure, PoolConfig, PoolError, PoolState, PoolStats, WorkerPool};
