#![deny(warnings)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Tandem
//!
//! Intra-process concurrency toolkit.
//!
//! This crate provides five building blocks that compose into concurrent
//! applications:
//!
//! - Atomic accumulators for lock-free numeric state
//! - Lock disciplines: reentrant mutex, writer-preferring read/write lock,
//!   and an optimistic versioned (stamped) lock
//! - A managed worker pool with futures, batch invocation, and shutdown
//! - A time-based scheduler for one-shot and periodic tasks
//! - A sharded concurrent map with threshold-gated parallel bulk operations
//!
//! The worker pool is the execution substrate for anything concurrent; the
//! sharded map composes per-segment locks with the pool to parallelize bulk
//! reads. Everything is strictly intra-process; there is no distributed
//! coordination here.

/// Sharded concurrent map with atomic per-key and parallel bulk operations
pub mod map;

/// Worker pool, task handles, and batch invocation
pub mod pool;

/// Time-based task scheduling on top of the worker pool
pub mod scheduler;

/// Synchronization primitives: accumulators and lock disciplines
pub mod sync;

// Re-export key types for easier access
pub use map::sharded::ShardedMap;
pub use pool::worker::WorkerPool;
pub use scheduler::timer::Scheduler;
pub use sync::accumulator::AtomicAccumulator;
