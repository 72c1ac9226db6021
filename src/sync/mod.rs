//! Synchronization primitives.
//!
//! This module provides the low-level coordination pieces of the toolkit:
//!
//! - Atomic accumulators for lock-free numeric state
//! - A reentrant, owner-checked mutex
//! - A writer-preferring read/write lock
//! - An optimistic versioned (stamped) lock with read-to-write upgrade

pub mod accumulator;
pub mod mutex;
pub mod rwlock;
pub mod stamped;

use std::time::Duration;
use thiserror::Error;

/// Errors from the lock disciplines in this module.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LockError {
    /// The lock is not held by the calling thread
    #[error("lock is not held by the calling thread")]
    NotOwner,

    /// The lock could not be acquired within the specified timeout
    #[error("lock acquisition timed out after {0:?}")]
    Timeout(Duration),

    /// The stamp is stale or does not match the current acquisition
    #[error("stamp is stale or invalid")]
    InvalidStamp,
}

// Re-export key types from accumulator
pub use accumulator::{AtomicAccumulator, StripedAccumulator};

// Re-export key types from the lock disciplines
pub use mutex::ReentrantMutex;
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use stamped::StampedLock;
