//! Reentrant, owner-checked mutual exclusion.
//!
//! Unlike a guard-based mutex, this lock is released by an explicit
//! `unlock` call, which lets it enforce ownership: unlocking from a thread
//! that does not hold the lock is an error rather than undefined behavior.

use super::LockError;
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct MutexState {
    /// Thread currently holding the lock, if any
    owner: Option<ThreadId>,

    /// Nested acquisitions by the owner
    hold_count: usize,
}

/// A mutual exclusion lock the owning thread may acquire repeatedly.
///
/// An internal hold count tracks nested acquisitions; the lock fully
/// releases only when unlock calls balance lock calls. [`unlock`] by a
/// non-owning thread fails with [`LockError::NotOwner`].
///
/// [`unlock`]: ReentrantMutex::unlock
pub struct ReentrantMutex {
    /// Ownership bookkeeping
    state: Mutex<MutexState>,

    /// Signalled when the lock becomes free
    available: Condvar,

    /// Name of this lock for debugging
    name: Option<String>,
}

impl ReentrantMutex {
    /// Create a new, unlocked mutex.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MutexState::default()),
            available: Condvar::new(),
            name: None,
        }
    }

    /// Create a new mutex with a name for debugging.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(MutexState::default()),
            available: Condvar::new(),
            name: Some(name.into()),
        }
    }

    /// Block until the lock is held by the calling thread.
    ///
    /// Reentrant: if the caller already holds the lock, the hold count is
    /// incremented and the call returns immediately.
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();

        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.hold_count = 1;
                    break;
                }
                Some(owner) if owner == me => {
                    state.hold_count += 1;
                    break;
                }
                Some(_) => self.available.wait(&mut state),
            }
        }

        trace!(
            "Lock acquired: {} (hold count: {})",
            self.name.as_deref().unwrap_or("unnamed"),
            state.hold_count
        );
    }

    /// Acquire the lock without blocking.
    ///
    /// Returns true if the lock is now held by the calling thread.
    pub fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();

        match state.owner {
            None => {
                state.owner = Some(me);
                state.hold_count = 1;
                true
            }
            Some(owner) if owner == me => {
                state.hold_count += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Acquire the lock, waiting at most `timeout`.
    pub fn try_lock_for(&self, timeout: Duration) -> Result<(), LockError> {
        let me = thread::current().id();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.hold_count = 1;
                    return Ok(());
                }
                Some(owner) if owner == me => {
                    state.hold_count += 1;
                    return Ok(());
                }
                Some(_) => {
                    if self.available.wait_until(&mut state, deadline).timed_out() {
                        trace!(
                            "Lock timeout: {} after {:?}",
                            self.name.as_deref().unwrap_or("unnamed"),
                            timeout
                        );
                        return Err(LockError::Timeout(timeout));
                    }
                }
            }
        }
    }

    /// Release one hold on the lock.
    ///
    /// The lock becomes available to other threads once the unlock count
    /// matches the lock count. Fails with [`LockError::NotOwner`] if the
    /// calling thread does not hold the lock.
    pub fn unlock(&self) -> Result<(), LockError> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        if state.owner != Some(me) {
            return Err(LockError::NotOwner);
        }

        state.hold_count -= 1;

        if state.hold_count == 0 {
            state.owner = None;
            self.available.notify_one();

            trace!(
                "Lock released: {}",
                self.name.as_deref().unwrap_or("unnamed")
            );
        }

        Ok(())
    }

    /// Whether any thread currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Whether the calling thread holds the lock.
    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    /// Nested acquisitions by the calling thread (zero when not held).
    pub fn hold_count(&self) -> usize {
        let state = self.state.lock();
        if state.owner == Some(thread::current().id()) {
            state.hold_count
        } else {
            0
        }
    }

    /// Get the name of this lock.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Default for ReentrantMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReentrantMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReentrantMutex")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish()
    }
}
