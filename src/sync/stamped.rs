//! Optimistic versioned lock with read-to-write upgrade.
//!
//! A non-reentrant lock whose acquisitions return opaque `u64` stamps.
//! The stamp doubles as a version: it is even while no writer is active
//! and odd while one is, and a write section bumps it on both entry and
//! exit. An optimistic reader can therefore take a stamp without blocking,
//! do its read, and call [`StampedLock::validate`] to learn whether any
//! write section started or completed in between.
//!
//! Non-reentrant: a thread that already holds the lock and calls a
//! blocking acquisition again deadlocks. That hazard is documented, not
//! detected.

use super::LockError;
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct Inner {
    /// Readers currently registered
    readers: usize,

    /// Identity of the only reader, tracked while exactly one thread has
    /// been the sole reader since its registration; `None` once readers
    /// overlap. Stamps carry no reader identity, so this is what lets an
    /// upgrade tell the sole reader apart from an outside caller.
    sole_reader: Option<ThreadId>,

    /// Whether a writer currently holds the lock
    writer: bool,

    /// Read accessors currently inside `with_read`
    pinned_read: usize,

    /// Whether a `with_write` accessor is currently inside its closure
    writing_access: bool,
}

/// An optimistic versioned lock protecting a value of type `T`.
///
/// Three read modes are offered: blocking shared reads ([`read`]),
/// non-blocking optimistic stamps ([`try_optimistic_read`] +
/// [`validate`]), and an atomic upgrade from either to a write stamp
/// ([`try_convert_to_write`]).
///
/// [`read`]: StampedLock::read
/// [`try_optimistic_read`]: StampedLock::try_optimistic_read
/// [`validate`]: StampedLock::validate
/// [`try_convert_to_write`]: StampedLock::try_convert_to_write
pub struct StampedLock<T> {
    /// Reader/writer bookkeeping
    inner: Mutex<Inner>,

    /// Signalled whenever the lock state may have opened up
    cond: Condvar,

    /// Version word: even = no writer, odd = writer active.
    /// Readable without the inner mutex for the optimistic path.
    version: AtomicU64,

    /// The protected value
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for StampedLock<T> {}
unsafe impl<T: Send + Sync> Sync for StampedLock<T> {}

impl<T> StampedLock<T> {
    /// Create a new lock protecting `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cond: Condvar::new(),
            version: AtomicU64::new(2),
            data: UnsafeCell::new(value),
        }
    }

    /// Block until exclusive access is granted; returns the write stamp.
    ///
    /// Entering the write section bumps the version to odd, so optimistic
    /// stamps taken before or during the section will fail validation.
    pub fn write(&self) -> u64 {
        let mut inner = self.inner.lock();

        while inner.writer || inner.readers > 0 || inner.pinned_read > 0 {
            self.cond.wait(&mut inner);
        }

        inner.writer = true;
        let stamp = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("Write stamp issued: {}", stamp);
        stamp
    }

    /// Release a write acquisition.
    ///
    /// Bumps the version again (back to even) so readers validating
    /// mid-write always see invalidation. Fails with
    /// [`LockError::InvalidStamp`] when `stamp` does not match the live
    /// write acquisition.
    pub fn unlock_write(&self, stamp: u64) -> Result<(), LockError> {
        let mut inner = self.inner.lock();

        if !inner.writer
            || inner.writing_access
            || stamp % 2 == 0
            || stamp != self.version.load(Ordering::SeqCst)
        {
            return Err(LockError::InvalidStamp);
        }

        inner.writer = false;
        self.version.fetch_add(1, Ordering::SeqCst);
        self.cond.notify_all();
        trace!("Write stamp released: {}", stamp);
        Ok(())
    }

    /// Block only while a writer holds the lock; returns a read stamp.
    pub fn read(&self) -> u64 {
        let mut inner = self.inner.lock();

        while inner.writer {
            self.cond.wait(&mut inner);
        }

        inner.readers += 1;
        inner.sole_reader = if inner.readers == 1 {
            Some(thread::current().id())
        } else {
            None
        };
        self.version.load(Ordering::SeqCst)
    }

    /// Release a read acquisition.
    pub fn unlock_read(&self, stamp: u64) -> Result<(), LockError> {
        let mut inner = self.inner.lock();

        if inner.readers == 0
            || stamp % 2 != 0
            || stamp != self.version.load(Ordering::SeqCst)
        {
            return Err(LockError::InvalidStamp);
        }

        inner.readers -= 1;
        if inner.readers == 0 {
            inner.sole_reader = None;
            self.cond.notify_all();
        }
        Ok(())
    }

    /// Return the current version stamp without blocking.
    ///
    /// Always returns immediately, regardless of writer activity; a stamp
    /// taken while a writer is active is odd and will never validate.
    pub fn try_optimistic_read(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Whether no write section has started or completed since `stamp`
    /// was issued.
    pub fn validate(&self, stamp: u64) -> bool {
        stamp % 2 == 0 && stamp == self.version.load(Ordering::SeqCst)
    }

    /// Atomically upgrade a still-valid read or optimistic stamp to a
    /// write stamp.
    ///
    /// Returns `None` when an intervening writer exists, when the stamp
    /// is stale, or when a reader other than the caller is registered;
    /// the caller should then fall back to a blocking
    /// [`write`](StampedLock::write). The upgrade succeeds only when the
    /// lock has no readers at all, or when the calling thread is the
    /// registered sole reader; in that case its read registration is
    /// consumed by the upgrade and must not be unlocked separately. A
    /// reader that ever overlapped with another loses sole-reader status
    /// for good and cannot upgrade.
    pub fn try_convert_to_write(&self, stamp: u64) -> Option<u64> {
        let mut inner = self.inner.lock();
        let current = self.version.load(Ordering::SeqCst);

        if stamp % 2 == 1 {
            // Already a write stamp; valid only if it is the live one
            return (inner.writer && stamp == current).then_some(stamp);
        }

        if stamp != current || inner.writer || inner.pinned_read > 0 {
            return None;
        }

        match inner.readers {
            0 => {}
            1 if inner.sole_reader == Some(thread::current().id()) => {
                // The caller's own read registration; consumed here
                inner.readers = 0;
                inner.sole_reader = None;
            }
            _ => return None,
        }

        inner.writer = true;
        let new_stamp = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("Stamp {} converted to write stamp {}", stamp, new_stamp);
        Some(new_stamp)
    }

    /// Run `f` with shared access under a held read stamp.
    pub fn with_read<R>(&self, stamp: u64, f: impl FnOnce(&T) -> R) -> Result<R, LockError> {
        {
            let mut inner = self.inner.lock();
            if inner.readers == 0
                || stamp % 2 != 0
                || stamp != self.version.load(Ordering::SeqCst)
            {
                return Err(LockError::InvalidStamp);
            }
            inner.pinned_read += 1;
        }

        // Writers wait on pinned_read, so shared access stays valid here
        let result = f(unsafe { &*self.data.get() });

        let mut inner = self.inner.lock();
        inner.pinned_read -= 1;
        if inner.pinned_read == 0 {
            self.cond.notify_all();
        }
        Ok(result)
    }

    /// Run `f` with exclusive access under a held write stamp.
    pub fn with_write<R>(&self, stamp: u64, f: impl FnOnce(&mut T) -> R) -> Result<R, LockError> {
        {
            let mut inner = self.inner.lock();
            if !inner.writer
                || inner.writing_access
                || stamp % 2 == 0
                || stamp != self.version.load(Ordering::SeqCst)
            {
                return Err(LockError::InvalidStamp);
            }
            inner.writing_access = true;
        }

        // unlock_write refuses while writing_access is set, so the write
        // acquisition cannot be released out from under this borrow
        let result = f(unsafe { &mut *self.data.get() });

        self.inner.lock().writing_access = false;
        Ok(result)
    }

    /// Run `f` with shared access under an optimistic stamp, without
    /// registering as a reader.
    ///
    /// Returns `None` when `stamp` is no longer current. The closure runs
    /// inside a short internal critical section that keeps writers out, so
    /// keep it brief; fall back to [`read`](StampedLock::read) for longer
    /// sections.
    pub fn try_with_optimistic<R>(&self, stamp: u64, f: impl FnOnce(&T) -> R) -> Option<R> {
        let _inner = self.inner.lock();

        if stamp % 2 != 0 || stamp != self.version.load(Ordering::SeqCst) {
            return None;
        }

        Some(f(unsafe { &*self.data.get() }))
    }

    /// Consume the lock, returning the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for StampedLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StampedLock")
            .field("readers", &inner.readers)
            .field("writer", &inner.writer)
            .field("version", &self.version.load(Ordering::SeqCst))
            .finish()
    }
}
