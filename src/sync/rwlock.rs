//! Writer-preferring read/write lock.
//!
//! Multiple readers may hold the lock simultaneously as long as no writer
//! holds or is waiting for it. A pending writer blocks new readers from
//! entering, which bounds writer starvation under read-heavy load; readers
//! already inside when the writer arrives are allowed to finish.

use super::LockError;
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct RwState {
    /// Readers currently inside their critical section
    readers: usize,

    /// Whether a writer currently holds the lock
    writer: bool,

    /// Writers blocked waiting for exclusivity
    waiting_writers: usize,
}

/// A read/write lock with a writer-preferring fairness policy.
///
/// Read access is shared, write access exclusive. Acquisitions return RAII
/// guards; dropping a guard releases the lock and wakes the appropriate
/// waiter class.
pub struct RwLock<T> {
    /// Reader/writer bookkeeping
    state: Mutex<RwState>,

    /// Readers wait here while a writer holds or waits
    readers_gate: Condvar,

    /// Writers wait here for exclusivity
    writers_gate: Condvar,

    /// The protected value
    data: UnsafeCell<T>,
}

// Readers hand out &T and writers &mut T under the discipline above, so
// the usual Send/Sync bounds of a reader-writer lock apply.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

/// Shared-access guard returned by [`RwLock::read`].
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

/// Exclusive-access guard returned by [`RwLock::write`].
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> RwLock<T> {
    /// Create a new lock protecting `value`.
    pub fn new(value: T) -> Self {
        Self {
            state: Mutex::new(RwState::default()),
            readers_gate: Condvar::new(),
            writers_gate: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire shared read access, blocking while a writer holds or waits.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut state = self.state.lock();

        while state.writer || state.waiting_writers > 0 {
            self.readers_gate.wait(&mut state);
        }

        state.readers += 1;
        trace!("Read lock acquired ({} readers)", state.readers);

        RwLockReadGuard { lock: self }
    }

    /// Acquire shared read access, waiting at most `timeout`.
    pub fn try_read_for(&self, timeout: Duration) -> Result<RwLockReadGuard<'_, T>, LockError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        while state.writer || state.waiting_writers > 0 {
            if self.readers_gate.wait_until(&mut state, deadline).timed_out() {
                return Err(LockError::Timeout(timeout));
            }
        }

        state.readers += 1;
        Ok(RwLockReadGuard { lock: self })
    }

    /// Acquire exclusive write access, blocking until all readers release.
    ///
    /// While this call waits, new readers are held back.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        let mut state = self.state.lock();
        state.waiting_writers += 1;

        while state.writer || state.readers > 0 {
            self.writers_gate.wait(&mut state);
        }

        state.waiting_writers -= 1;
        state.writer = true;
        trace!("Write lock acquired");

        RwLockWriteGuard { lock: self }
    }

    /// Acquire exclusive write access, waiting at most `timeout`.
    pub fn try_write_for(&self, timeout: Duration) -> Result<RwLockWriteGuard<'_, T>, LockError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.waiting_writers += 1;

        while state.writer || state.readers > 0 {
            if self.writers_gate.wait_until(&mut state, deadline).timed_out() {
                state.waiting_writers -= 1;
                if state.waiting_writers == 0 && !state.writer {
                    // No writer left pending; let held-back readers through
                    self.readers_gate.notify_all();
                }
                return Err(LockError::Timeout(timeout));
            }
        }

        state.waiting_writers -= 1;
        state.writer = true;
        Ok(RwLockWriteGuard { lock: self })
    }

    /// Number of readers currently inside the lock.
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers
    }

    /// Whether a writer currently holds the lock.
    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer
    }

    /// Consume the lock, returning the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLock")
            .field("readers", &self.reader_count())
            .field("write_locked", &self.is_write_locked())
            .finish()
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.readers -= 1;

        if state.readers == 0 && state.waiting_writers > 0 {
            self.lock.writers_gate.notify_one();
        }
    }
}

impl<T> std::ops::Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // Shared access is valid while this reader is registered
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.writer = false;

        if state.waiting_writers > 0 {
            self.lock.writers_gate.notify_one();
        } else {
            self.lock.readers_gate.notify_all();
        }
    }
}

impl<T> std::ops::Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> std::ops::DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Exclusive access is valid while the writer flag is held
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_write_basic() {
        let lock = RwLock::new(0);

        {
            let guard = lock.read();
            assert_eq!(*guard, 0);
        }

        {
            let mut guard = lock.write();
            *guard += 1;
        }

        assert_eq!(*lock.read(), 1);
    }

    #[test]
    fn test_multiple_readers() {
        let lock = Arc::new(RwLock::new(7));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];

        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            let peak = Arc::clone(&peak);
            handles.push(thread::spawn(move || {
                let guard = lock.read();
                peak.fetch_max(lock.reader_count(), Ordering::SeqCst);
                thread::sleep(Duration::from_millis(30));
                *guard
            }));
        }

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 7);
        }

        // At least two readers overlapped
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Arc::new(RwLock::new(0));
        let in_write = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];

        for _ in 0..2 {
            let lock = Arc::clone(&lock);
            let in_write = Arc::clone(&in_write);
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    let mut guard = lock.write();
                    in_write.store(true, Ordering::SeqCst);
                    *guard += 1;
                    thread::sleep(Duration::from_micros(200));
                    in_write.store(false, Ordering::SeqCst);
                }
            }));
        }

        for _ in 0..2 {
            let lock = Arc::clone(&lock);
            let in_write = Arc::clone(&in_write);
            let violations = Arc::clone(&violations);
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    let _guard = lock.read();
                    if in_write.load(Ordering::SeqCst) {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        // No reader section may start while the flag only writers toggle is up
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(*lock.read(), 40);
    }

    #[test]
    fn test_pending_writer_blocks_new_readers() {
        let lock = Arc::new(RwLock::new(0));
        let first_read = lock.read();

        // Writer arrives and blocks behind the active reader
        let lock_w = Arc::clone(&lock);
        let writer = thread::spawn(move || {
            let mut guard = lock_w.write();
            *guard = 1;
        });

        // Give the writer time to register as waiting
        thread::sleep(Duration::from_millis(30));

        // A new reader must now wait behind the pending writer
        let lock_r = Arc::clone(&lock);
        let reader = thread::spawn(move || *lock_r.read());

        thread::sleep(Duration::from_millis(30));
        drop(first_read);

        writer.join().unwrap();
        assert_eq!(reader.join().unwrap(), 1);
    }

    #[test]
    fn test_try_write_for_timeout() {
        let lock = Arc::new(RwLock::new(0));
        let guard = lock.read();

        let lock_clone = Arc::clone(&lock);
        let result = thread::spawn(move || {
            lock_clone
                .try_write_for(Duration::from_millis(20))
                .map(|_| ())
        })
        .join()
        .unwrap();

        assert_eq!(result, Err(LockError::Timeout(Duration::from_millis(20))));
        drop(guard);

        // A timed-out writer must not leave readers gated forever
        let _read = lock.try_read_for(Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn test_try_read_for_timeout() {
        let lock = Arc::new(RwLock::new(0));
        let guard = lock.write();

        let lock_clone = Arc::clone(&lock);
        let result = thread::spawn(move || {
            lock_clone
                .try_read_for(Duration::from_millis(20))
                .map(|_| ())
        })
        .join()
        .unwrap();

        assert_eq!(result, Err(LockError::Timeout(Duration::from_millis(20))));
        drop(guard);
    }
}
