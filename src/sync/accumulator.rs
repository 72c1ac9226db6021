//! Atomic accumulators for lock-free numeric state.
//!
//! Provides a single-cell accumulator with compound compare-and-swap
//! updates, and a striped variant that trades read exactness for write
//! throughput under heavy contention.

use crossbeam_utils::CachePadded;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, Ordering};

/// A numeric value updated through atomic compare-and-retry operations.
///
/// Every observed value is the result of some linearizable sequence of
/// applied updates: no update is lost, none is applied twice. There is no
/// fairness bound — a caller may retry many times under heavy contention.
#[derive(Debug)]
pub struct AtomicAccumulator {
    /// The current value
    value: AtomicI64,

    /// The value the accumulator resets to
    initial_value: i64,
}

impl AtomicAccumulator {
    /// Create a new accumulator with an initial value.
    pub fn new(initial_value: i64) -> Self {
        Self {
            value: AtomicI64::new(initial_value),
            initial_value,
        }
    }

    /// Get the current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Increment the value by one and return the new value.
    pub fn increment(&self) -> i64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Add a delta to the value and return the new value.
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::SeqCst) + delta
    }

    /// Atomically capture the current value and reset to the initial value.
    pub fn get_and_reset(&self) -> i64 {
        self.value.swap(self.initial_value, Ordering::SeqCst)
    }

    /// Apply an arbitrary update function and return the new value.
    ///
    /// `f` must be pure: it may be invoked more than once when a concurrent
    /// update forces a retry.
    pub fn update_and_get<F>(&self, f: F) -> i64
    where
        F: Fn(i64) -> i64,
    {
        let mut current = self.value.load(Ordering::SeqCst);

        loop {
            let next = f(current);
            match self.value.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Combine the current value with `value` and return the new value.
    ///
    /// `combine` must be pure, and for a deterministic aggregate across
    /// concurrent callers it must also be associative and commutative —
    /// the application order of concurrent calls is unspecified.
    pub fn accumulate_and_get<F>(&self, value: i64, combine: F) -> i64
    where
        F: Fn(i64, i64) -> i64,
    {
        self.update_and_get(|current| combine(current, value))
    }
}

impl Default for AtomicAccumulator {
    fn default() -> Self {
        Self::new(0)
    }
}

/// An accumulator striped across independent cells to reduce contention.
///
/// Each calling thread is mapped to one cell by a hash of its thread id,
/// so concurrent increments from different threads usually touch different
/// cache lines. Prefer this over [`AtomicAccumulator`] when updates from
/// many threads are far more common than reads; the cost is higher memory
/// use and weaker read semantics.
#[derive(Debug)]
pub struct StripedAccumulator {
    /// Independent cells, one updated per calling thread
    cells: Box<[CachePadded<AtomicI64>]>,

    /// Index mask (cell count is a power of two)
    mask: usize,
}

impl StripedAccumulator {
    /// Create a striped accumulator sized for the host's parallelism.
    pub fn new() -> Self {
        Self::with_stripes(2 * num_cpus::get())
    }

    /// Create a striped accumulator with at least `stripes` cells.
    ///
    /// The cell count is rounded up to the next power of two.
    pub fn with_stripes(stripes: usize) -> Self {
        let count = stripes.max(1).next_power_of_two();
        let cells = (0..count)
            .map(|_| CachePadded::new(AtomicI64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            cells,
            mask: count - 1,
        }
    }

    /// Increment the calling thread's cell by one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// Add a delta to the calling thread's cell.
    pub fn add(&self, delta: i64) {
        self.cells[self.cell_index()].fetch_add(delta, Ordering::SeqCst);
    }

    /// Sum all cells.
    ///
    /// The sum is not a linearizable snapshot: increments concurrent with
    /// the read may or may not be included.
    pub fn sum(&self) -> i64 {
        self.cells
            .iter()
            .map(|cell| cell.load(Ordering::SeqCst))
            .sum()
    }

    /// Sum all cells, zeroing each as it is read.
    ///
    /// Cell resets are individually atomic but not collectively so: an
    /// increment that lands after its cell was zeroed but before the last
    /// cell is read will be counted by a later call instead. The returned
    /// sum is a best-effort snapshot, not a linearizable one. No update is
    /// ever lost or double-counted across calls.
    pub fn sum_then_reset(&self) -> i64 {
        self.cells
            .iter()
            .map(|cell| cell.swap(0, Ordering::SeqCst))
            .sum()
    }

    /// Number of cells in this accumulator.
    pub fn stripes(&self) -> usize {
        self.cells.len()
    }

    fn cell_index(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        hasher.finish() as usize & self.mask
    }
}

impl Default for StripedAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_accumulator_basic() {
        let acc = AtomicAccumulator::new(5);

        assert_eq!(acc.get(), 5);
        assert_eq!(acc.increment(), 6);
        assert_eq!(acc.add(4), 10);
        assert_eq!(acc.get_and_reset(), 10); // Returns old value
        assert_eq!(acc.get(), 5); // Back to initial value
    }

    #[test]
    fn test_accumulator_update_and_get() {
        let acc = AtomicAccumulator::new(0);

        assert_eq!(acc.update_and_get(|n| n + 2), 2);
        assert_eq!(acc.update_and_get(|n| n * 10), 20);
        assert_eq!(acc.get(), 20);
    }

    #[test]
    fn test_accumulator_accumulate_and_get() {
        let acc = AtomicAccumulator::new(0);

        for i in 0..10 {
            acc.accumulate_and_get(i, |a, b| a + b);
        }

        assert_eq!(acc.get(), 45);
    }

    #[test]
    fn test_accumulator_concurrent_increments() {
        let acc = Arc::new(AtomicAccumulator::new(0));
        let threads = 4;
        let increments_per_thread = 250;

        let mut handles = vec![];

        for _ in 0..threads {
            let acc = Arc::clone(&acc);
            handles.push(thread::spawn(move || {
                for _ in 0..increments_per_thread {
                    acc.increment();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(acc.get(), threads * increments_per_thread);
    }

    #[test]
    fn test_accumulator_concurrent_update_and_get() {
        let acc = Arc::new(AtomicAccumulator::new(0));
        let threads = 4;
        let updates_per_thread = 250;

        let mut handles = vec![];

        for _ in 0..threads {
            let acc = Arc::clone(&acc);
            handles.push(thread::spawn(move || {
                for _ in 0..updates_per_thread {
                    acc.update_and_get(|n| n + 2);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        // No update lost, none applied twice
        assert_eq!(acc.get(), 2 * threads * updates_per_thread);
    }

    #[test]
    fn test_striped_stripe_count() {
        let striped = StripedAccumulator::with_stripes(5);
        assert_eq!(striped.stripes(), 8);

        let striped = StripedAccumulator::with_stripes(0);
        assert_eq!(striped.stripes(), 1);
    }

    #[test]
    fn test_striped_sum() {
        let striped = StripedAccumulator::with_stripes(4);

        striped.increment();
        striped.add(9);

        assert_eq!(striped.sum(), 10);
    }

    #[test]
    fn test_striped_concurrent_increments() {
        let striped = Arc::new(StripedAccumulator::new());
        let threads = 4;
        let increments_per_thread = 250;

        let mut handles = vec![];

        for _ in 0..threads {
            let striped = Arc::clone(&striped);
            handles.push(thread::spawn(move || {
                for _ in 0..increments_per_thread {
                    striped.increment();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        // 1000 increments in total, all observed once the writers are done
        assert_eq!(striped.sum_then_reset(), 1000);
        assert_eq!(striped.sum(), 0);
    }
}
