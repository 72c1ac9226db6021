//! Delayed and periodic task scheduling.
//!
//! [`Scheduler`] layers timed dispatch on top of a
//! [`WorkerPool`](crate::pool::WorkerPool): one-shot delays, fixed-rate
//! grids, and fixed-delay repetition, each controlled through a
//! [`ScheduledHandle`].

pub mod timer;

pub use timer::{ScheduledHandle, Scheduler};
