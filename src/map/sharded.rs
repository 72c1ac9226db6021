//! Sharded hash map with per-key atomic operations and parallel bulk
//! traversal.
//!
//! The key space is split across independently locked segments, so
//! operations on different keys rarely contend. Bulk operations fan out
//! one task per segment onto a [`WorkerPool`] once the map is large
//! enough to make that worthwhile.

use crate::pool::{TaskError, WorkerPool};
use crate::sync::RwLock;
use log::{debug, trace};
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Configuration for [`ShardedMap`].
#[derive(Debug, Clone)]
pub struct MapConfig {
    /// Number of segments; rounded up to the next power of two
    pub segments: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self { segments: 16 }
    }
}

struct MapInner<K, V> {
    segments: Box<[RwLock<HashMap<K, V>>]>,
    mask: u64,
    hasher: RandomState,
    pool: Arc<WorkerPool>,
}

/// A concurrent hash map sharded across independently locked segments.
///
/// Each segment is guarded by the toolkit's writer-preferring
/// [`RwLock`], so per-key operations on distinct segments proceed in
/// parallel and readers of one segment never starve its writers.
///
/// Clones share the same underlying map.
pub struct ShardedMap<K, V> {
    inner: Arc<MapInner<K, V>>,
}

impl<K, V> Clone for ShardedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq,
{
    /// Create a map with the default segment count.
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self::with_config(pool, MapConfig::default())
    }

    /// Create a map with the specified configuration.
    pub fn with_config(pool: Arc<WorkerPool>, config: MapConfig) -> Self {
        let count = config.segments.max(1).next_power_of_two();
        let segments: Box<[RwLock<HashMap<K, V>>]> = (0..count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        debug!("Creating sharded map with {} segments", count);

        Self {
            inner: Arc::new(MapInner {
                segments,
                mask: count as u64 - 1,
                hasher: RandomState::new(),
                pool,
            }),
        }
    }

    /// A key's hash folded down to its owning segment index.
    fn segment_for(&self, key: &K) -> usize {
        let hash = self.inner.hasher.hash_one(key);
        ((hash ^ (hash >> 32)) & self.inner.mask) as usize
    }

    /// Number of segments backing this map.
    pub fn segment_count(&self) -> usize {
        self.inner.segments.len()
    }

    /// Check whether a mapping exists for `key`.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.segments[self.segment_for(key)]
            .read()
            .contains_key(key)
    }

    /// Insert a mapping, returning the previous value if any.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let segment = self.segment_for(&key);
        self.inner.segments[segment].write().insert(key, value)
    }

    /// Remove a mapping, returning the value if it was present.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.segments[self.segment_for(key)]
            .write()
            .remove(key)
    }

    /// Total number of mappings, summed segment by segment.
    ///
    /// No global lock is taken, so under concurrent mutation the result
    /// is a moment-in-time estimate.
    pub fn len(&self) -> usize {
        self.inner
            .segments
            .iter()
            .map(|segment| segment.read().len())
            .sum()
    }

    /// Check whether the map holds no mappings.
    pub fn is_empty(&self) -> bool {
        self.inner
            .segments
            .iter()
            .all(|segment| segment.read().is_empty())
    }

    /// Remove every mapping, one segment at a time.
    pub fn clear(&self) {
        for segment in self.inner.segments.iter() {
            segment.write().clear();
        }
    }

    /// Keep only the mappings for which `f` returns true.
    ///
    /// Write locks on every segment are taken in ascending order and held
    /// together for the duration of the pass, so the predicate observes
    /// one consistent snapshot; bulk operations block until it finishes.
    pub fn retain<F>(&self, f: F)
    where
        F: Fn(&K, &V) -> bool,
    {
        let mut guards: Vec<_> = self
            .inner
            .segments
            .iter()
            .map(|segment| segment.write())
            .collect();

        for guard in guards.iter_mut() {
            guard.retain(|k, v| f(k, &*v));
        }
    }

    /// Replace every value with `f(key, value)`, one segment at a time.
    pub fn replace_all<F>(&self, f: F)
    where
        F: Fn(&K, &V) -> V,
    {
        for segment in self.inner.segments.iter() {
            let mut guard = segment.write();
            for (k, v) in guard.iter_mut() {
                *v = f(k, &*v);
            }
        }
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Look up the value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.segments[self.segment_for(key)]
            .read()
            .get(key)
            .cloned()
    }

    /// Insert only if no mapping exists; returns the existing value
    /// otherwise.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<V> {
        let segment = self.segment_for(&key);
        let mut guard = self.inner.segments[segment].write();
        match guard.get(&key) {
            Some(existing) => Some(existing.clone()),
            None => {
                guard.insert(key, value);
                None
            }
        }
    }

    /// Return the value for `key`, computing and inserting it first if
    /// absent. The factory runs at most once per miss, under the
    /// segment's write lock.
    pub fn compute_if_absent<F>(&self, key: K, f: F) -> V
    where
        F: FnOnce(&K) -> V,
    {
        let segment = self.segment_for(&key);
        let mut guard = self.inner.segments[segment].write();
        if let Some(existing) = guard.get(&key) {
            return existing.clone();
        }
        let value = f(&key);
        guard.insert(key, value.clone());
        value
    }

    /// Remap an existing value; `None` from the closure removes the
    /// mapping. Absent keys are untouched.
    pub fn compute_if_present<F>(&self, key: &K, f: F) -> Option<V>
    where
        F: FnOnce(&K, &V) -> Option<V>,
    {
        let segment = self.segment_for(key);
        let mut guard = self.inner.segments[segment].write();
        let remapped = match guard.get(key) {
            Some(current) => f(key, current),
            None => return None,
        };
        match remapped {
            Some(updated) => {
                if let Some(slot) = guard.get_mut(key) {
                    *slot = updated.clone();
                }
                Some(updated)
            }
            None => {
                guard.remove(key);
                None
            }
        }
    }

    /// Remap the value for `key` whether or not one exists.
    ///
    /// The closure sees the current value (`None` when absent) and its
    /// return decides the new state: `Some` stores, `None` removes.
    pub fn compute<F>(&self, key: K, f: F) -> Option<V>
    where
        F: FnOnce(&K, Option<&V>) -> Option<V>,
    {
        let segment = self.segment_for(&key);
        let mut guard = self.inner.segments[segment].write();
        match f(&key, guard.get(&key)) {
            Some(updated) => {
                guard.insert(key, updated.clone());
                Some(updated)
            }
            None => {
                guard.remove(&key);
                None
            }
        }
    }

    /// Insert `value` for an absent key, or combine it with the existing
    /// value via `f`. Returns the value now stored.
    pub fn merge<F>(&self, key: K, value: V, f: F) -> V
    where
        F: FnOnce(V, V) -> V,
    {
        let segment = self.segment_for(&key);
        let mut guard = self.inner.segments[segment].write();
        let merged = match guard.get(&key) {
            Some(existing) => f(existing.clone(), value),
            None => value,
        };
        guard.insert(key, merged.clone());
        merged
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Apply `f` to every mapping, with no ordering guarantee.
    ///
    /// Sequential below `parallelism_threshold` entries, otherwise one
    /// pool task per segment. Panics if `f` panics in a pool task.
    pub fn for_each<F>(&self, parallelism_threshold: usize, f: F)
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        if self.len() < parallelism_threshold {
            for segment in self.inner.segments.iter() {
                let guard = segment.read();
                for (k, v) in guard.iter() {
                    f(k, v);
                }
            }
            return;
        }

        trace!("for_each fanning out across {} segments", self.segment_count());

        let f = Arc::new(f);
        self.run_per_segment(move |inner, index| {
            let guard = inner.segments[index].read();
            for (k, v) in guard.iter() {
                f(k, v);
            }
        });
    }

    /// Search for the first mapping where `f` returns `Some`.
    ///
    /// In the parallel regime partitions race: when several mappings
    /// match, which result comes back is unspecified, but it is always a
    /// genuine match. A shared flag lets the remaining partitions stop
    /// early. Panics if `f` panics in a pool task.
    pub fn search<R, F>(&self, parallelism_threshold: usize, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: Fn(&K, &V) -> Option<R> + Send + Sync + 'static,
    {
        if self.len() < parallelism_threshold {
            for segment in self.inner.segments.iter() {
                let guard = segment.read();
                for (k, v) in guard.iter() {
                    if let Some(result) = f(k, v) {
                        return Some(result);
                    }
                }
            }
            return None;
        }

        let f = Arc::new(f);
        let found = Arc::new(AtomicBool::new(false));
        let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));

        {
            let found = Arc::clone(&found);
            let slot = Arc::clone(&slot);
            self.run_per_segment(move |inner, index| {
                let guard = inner.segments[index].read();
                for (k, v) in guard.iter() {
                    if found.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Some(result) = f(k, v) {
                        // First writer wins; later matches are dropped
                        if found
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            *slot.lock() = Some(result);
                        }
                        return;
                    }
                }
            });
        }

        let result = slot.lock().take();
        result
    }

    /// Fold every mapping into a single value.
    ///
    /// `transform` maps each entry to a partial; `combine` merges
    /// partials. In the parallel regime each segment folds on its own
    /// worker and the partials merge in unspecified order, so `combine`
    /// must be associative and give the same answer regardless of
    /// operand order. Returns `None` on an empty map. Panics if a
    /// closure panics in a pool task.
    pub fn reduce<U, T, C>(
        &self,
        parallelism_threshold: usize,
        transform: T,
        combine: C,
    ) -> Option<U>
    where
        U: Send + 'static,
        T: Fn(&K, &V) -> U + Send + Sync + 'static,
        C: Fn(U, U) -> U + Send + Sync + 'static,
    {
        if self.len() < parallelism_threshold {
            let mut acc: Option<U> = None;
            for segment in self.inner.segments.iter() {
                let guard = segment.read();
                for (k, v) in guard.iter() {
                    let part = transform(k, v);
                    acc = Some(match acc {
                        Some(acc) => combine(acc, part),
                        None => part,
                    });
                }
            }
            return acc;
        }

        let transform = Arc::new(transform);
        let combine = Arc::new(combine);

        let partials = {
            let combine = Arc::clone(&combine);
            self.map_per_segment(move |inner, index| {
                let guard = inner.segments[index].read();
                let mut acc: Option<U> = None;
                for (k, v) in guard.iter() {
                    let part = transform(k, v);
                    acc = Some(match acc {
                        Some(acc) => combine(acc, part),
                        None => part,
                    });
                }
                acc
            })
        };

        partials
            .into_iter()
            .flatten()
            .reduce(|left, right| combine(left, right))
    }

    /// Run `f` once per segment on the pool, falling back to the caller's
    /// thread when a submission is refused.
    fn run_per_segment<F>(&self, f: F)
    where
        F: Fn(&MapInner<K, V>, usize) + Send + Sync + 'static,
    {
        let results = self.map_per_segment(move |inner, index| f(inner, index));
        drop(results);
    }

    fn map_per_segment<U, F>(&self, f: F) -> Vec<U>
    where
        U: Send + 'static,
        F: Fn(&MapInner<K, V>, usize) -> U + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let mut handles = Vec::with_capacity(self.inner.segments.len());
        let mut inline = Vec::new();

        for index in 0..self.inner.segments.len() {
            let inner = Arc::clone(&self.inner);
            let f = Arc::clone(&f);
            match self.inner.pool.submit(move || f(&inner, index)) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    debug!("Bulk task for segment {} ran inline: {}", index, err);
                    inline.push(index);
                }
            }
        }

        let mut results: Vec<U> = handles
            .iter()
            .map(|handle| match handle.get() {
                // A panic in a user closure is resumed on the caller with
                // its original message, not swallowed inside the pool
                Ok(value) => value,
                Err(TaskError::Panicked(message)) => {
                    std::panic::resume_unwind(Box::new(message))
                }
                Err(err) => std::panic::resume_unwind(Box::new(err.to_string())),
            })
            .collect();

        for index in inline {
            results.push(f(&self.inner, index));
        }

        results
    }
}

impl<K, V> std::fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMap")
            .field("segments", &self.inner.segments.len())
            .finish()
    }
}
