//! Deadline-driven scheduler over a worker pool.
//!
//! A single timer thread keeps a min-heap of deadline-ordered entries and
//! dispatches due ones to a [`WorkerPool`]. Periodic entries re-arm
//! themselves after the body completes, from the worker that ran it, so
//! executions of one task never overlap.

use crate::pool::{CancelToken, PoolConfig, PoolError, WorkerPool};
use log::{debug, info, trace};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long a due entry waits before retrying a dispatch the pool
/// refused with a full queue.
const DISPATCH_RETRY: Duration = Duration::from_millis(2);

/// Re-trigger policy for a periodic task.
#[derive(Debug, Clone, Copy)]
enum Repeat {
    /// Next deadline is the previous deadline plus the period
    FixedRate(Duration),

    /// Next deadline is the end of the previous run plus the delay
    FixedDelay(Duration),
}

enum Body {
    Once(Mutex<Option<Box<dyn FnOnce() + Send>>>),
    Repeating(Box<dyn Fn(&CancelToken) + Send + Sync>),
}

struct ScheduledTask {
    body: Body,
    repeat: Option<Repeat>,
    cancelled: AtomicBool,
    run_count: AtomicUsize,
}

/// Handle to a scheduled task.
pub struct ScheduledHandle {
    task: Arc<ScheduledTask>,
}

impl ScheduledHandle {
    /// Cancel the task: it will not fire again.
    ///
    /// A run already handed to the pool may still execute once if it was
    /// dispatched before the flag landed.
    pub fn cancel(&self) {
        self.task.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.task.cancelled.load(Ordering::SeqCst)
    }

    /// Number of completed executions so far.
    pub fn run_count(&self) -> usize {
        self.task.run_count.load(Ordering::SeqCst)
    }
}

/// Heap entry; `seq` breaks deadline ties in submission order.
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    task: Arc<ScheduledTask>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the BinaryHeap pops the earliest deadline first
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    shutdown: bool,
}

struct TimerShared {
    queue: Mutex<TimerQueue>,
    tick: Condvar,
}

impl TimerShared {
    /// Push an entry and wake the timer thread; no-op after shutdown.
    fn arm(&self, deadline: Instant, task: Arc<ScheduledTask>) {
        let mut queue = self.queue.lock();
        if queue.shutdown {
            return;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(TimerEntry {
            deadline,
            seq,
            task,
        });
        self.tick.notify_one();
    }
}

/// Schedules one-shot and periodic tasks for execution on a worker pool.
pub struct Scheduler {
    pool: Arc<WorkerPool>,
    shared: Arc<TimerShared>,
    timer: Option<JoinHandle<()>>,
    owns_pool: bool,
}

impl Scheduler {
    /// Create a scheduler with its own worker pool of `workers` threads.
    pub fn new(workers: usize) -> Self {
        let pool = Arc::new(WorkerPool::with_config(PoolConfig {
            workers,
            thread_name_prefix: "tandem-sched".to_string(),
            ..Default::default()
        }));
        Self::build(pool, true)
    }

    /// Create a scheduler dispatching onto an existing pool.
    ///
    /// The pool is shared: `shutdown` stops the timer but leaves the pool
    /// to its other users.
    pub fn with_pool(pool: Arc<WorkerPool>) -> Self {
        Self::build(pool, false)
    }

    fn build(pool: Arc<WorkerPool>, owns_pool: bool) -> Self {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(TimerQueue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            tick: Condvar::new(),
        });

        info!("Creating scheduler over pool with {} workers", pool.worker_count());

        let timer = {
            let pool = Arc::clone(&pool);
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("tandem-timer".to_string())
                .spawn(move || timer_loop(pool, shared))
                .expect("Failed to spawn timer thread")
        };

        Self {
            pool,
            shared,
            timer: Some(timer),
            owns_pool,
        }
    }

    /// Run `f` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> ScheduledHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let task = Arc::new(ScheduledTask {
            body: Body::Once(Mutex::new(Some(Box::new(f)))),
            repeat: None,
            cancelled: AtomicBool::new(false),
            run_count: AtomicUsize::new(0),
        });
        self.shared.arm(Instant::now() + delay, Arc::clone(&task));
        ScheduledHandle { task }
    }

    /// Run `f` repeatedly on a fixed time grid.
    ///
    /// Triggers at `initial_delay`, then every `period` measured from the
    /// previous trigger time. Runs never overlap: when an execution
    /// overruns its period, the next one fires immediately on completion
    /// and the grid re-anchors there, with no burst of missed ticks.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        f: F,
    ) -> ScheduledHandle
    where
        F: Fn(&CancelToken) + Send + Sync + 'static,
    {
        self.schedule_repeating(initial_delay, Repeat::FixedRate(period), f)
    }

    /// Run `f` repeatedly with a fixed pause between executions.
    ///
    /// Triggers at `initial_delay`; each subsequent trigger is `delay`
    /// after the previous execution finished.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        f: F,
    ) -> ScheduledHandle
    where
        F: Fn(&CancelToken) + Send + Sync + 'static,
    {
        self.schedule_repeating(initial_delay, Repeat::FixedDelay(delay), f)
    }

    fn schedule_repeating<F>(
        &self,
        initial_delay: Duration,
        repeat: Repeat,
        f: F,
    ) -> ScheduledHandle
    where
        F: Fn(&CancelToken) + Send + Sync + 'static,
    {
        let task = Arc::new(ScheduledTask {
            body: Body::Repeating(Box::new(f)),
            repeat: Some(repeat),
            cancelled: AtomicBool::new(false),
            run_count: AtomicUsize::new(0),
        });
        self.shared
            .arm(Instant::now() + initial_delay, Arc::clone(&task));
        ScheduledHandle { task }
    }

    /// The pool this scheduler dispatches onto.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Stop the timer thread; pending entries are dropped.
    ///
    /// If the scheduler owns its pool, the pool is shut down too and its
    /// in-flight tasks drain.
    pub fn shutdown(&mut self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            queue.heap.clear();
            self.shared.tick.notify_all();
        }

        info!("Shutting down scheduler");

        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }

        if self.owns_pool {
            self.pool.shutdown();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.pool.worker_count())
            .finish()
    }
}

/// Timer thread: sleep until the earliest deadline, then dispatch.
fn timer_loop(pool: Arc<WorkerPool>, shared: Arc<TimerShared>) {
    debug!("Timer thread started");

    loop {
        let entry = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown {
                    debug!("Timer thread exiting");
                    return;
                }
                match queue.heap.peek() {
                    None => {
                        shared.tick.wait(&mut queue);
                    }
                    Some(head) => {
                        let deadline = head.deadline;
                        if deadline <= Instant::now() {
                            break queue.heap.pop().unwrap();
                        }
                        shared.tick.wait_until(&mut queue, deadline);
                    }
                }
            }
        };

        // Dispatch outside the queue lock: submission may block under a
        // blocking backpressure policy.
        dispatch(&pool, &shared, entry);
    }
}

fn dispatch(pool: &Arc<WorkerPool>, shared: &Arc<TimerShared>, entry: TimerEntry) {
    let task = entry.task;
    if task.cancelled.load(Ordering::SeqCst) {
        return;
    }

    trace!("Dispatching scheduled task (seq {})", entry.seq);

    let fired_at = entry.deadline;
    let retry = Arc::clone(&task);
    let shared_clone = Arc::clone(shared);
    let submitted = pool.submit_with_token(move |token| {
        run_scheduled(&shared_clone, task, fired_at, token);
    });

    match submitted {
        Ok(_) => {}
        Err(PoolError::QueueFull) => {
            // A full queue is transient; the task's lifecycle continues
            // until it is cancelled or the pool shuts down
            trace!("Queue full, retrying scheduled dispatch (seq {})", entry.seq);
            shared.arm(Instant::now() + DISPATCH_RETRY, retry);
        }
        Err(err @ PoolError::ShuttingDown) => {
            debug!("Dropping scheduled task, pool rejected it: {}", err);
        }
    }
}

/// Execute a due task on a pool worker and re-arm it if periodic.
fn run_scheduled(
    shared: &Arc<TimerShared>,
    task: Arc<ScheduledTask>,
    fired_at: Instant,
    token: &CancelToken,
) {
    if task.cancelled.load(Ordering::SeqCst) || token.is_cancelled() {
        return;
    }

    match &task.body {
        Body::Once(slot) => {
            let f = slot.lock().take();
            if let Some(f) = f {
                f();
            }
        }
        Body::Repeating(f) => f(token),
    }

    task.run_count.fetch_add(1, Ordering::SeqCst);

    // A panic in the body unwinds past this point, so a failing periodic
    // task stops re-arming and never fires again.
    let repeat = match task.repeat {
        Some(repeat) => repeat,
        None => return,
    };

    if task.cancelled.load(Ordering::SeqCst) || token.is_cancelled() {
        return;
    }

    let next = match repeat {
        Repeat::FixedRate(period) => {
            let next = fired_at + period;
            let now = Instant::now();
            // Overrun: fire immediately and re-anchor the grid, instead
            // of bursting through every missed tick
            if next < now {
                now
            } else {
                next
            }
        }
        Repeat::FixedDelay(delay) => Instant::now() + delay,
    };

    shared.arm(next, task);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_fires_after_delay() {
        let scheduler = Scheduler::new(1);
        let fired = Arc::new(AtomicBool::new(false));

        let fired_clone = Arc::clone(&fired);
        let start = Instant::now();
        scheduler.schedule(Duration::from_millis(40), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(15));
        assert!(!fired.load(Ordering::SeqCst));

        thread::sleep(Duration::from_millis(100));
        assert!(fired.load(Ordering::SeqCst));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_one_shot_runs_at_most_once() {
        let scheduler = Scheduler::new(2);
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_clone = Arc::clone(&runs);
        let handle = scheduler.schedule(Duration::from_millis(10), move || {
            runs_clone.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(handle.run_count(), 1);
    }

    #[test]
    fn test_cancel_before_fire() {
        let scheduler = Scheduler::new(1);
        let fired = Arc::new(AtomicBool::new(false));

        let fired_clone = Arc::clone(&fired);
        let handle = scheduler.schedule(Duration::from_millis(50), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        handle.cancel();
        assert!(handle.is_cancelled());

        thread::sleep(Duration::from_millis(120));
        assert!(!fired.load(Ordering::SeqCst));
        assert_eq!(handle.run_count(), 0);
    }

    #[test]
    fn test_fixed_rate_repeats() {
        let scheduler = Scheduler::new(1);
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_clone = Arc::clone(&runs);
        let handle = scheduler.schedule_at_fixed_rate(
            Duration::from_millis(10),
            Duration::from_millis(25),
            move |_| {
                runs_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        thread::sleep(Duration::from_millis(150));
        handle.cancel();
        let observed = runs.load(Ordering::SeqCst);
        assert!(observed >= 3, "expected at least 3 runs, got {}", observed);

        // No further runs after cancellation
        thread::sleep(Duration::from_millis(80));
        assert_eq!(runs.load(Ordering::SeqCst), handle.run_count());
    }

    #[test]
    fn test_fixed_rate_never_overlaps() {
        let scheduler = Scheduler::new(4);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let concurrent_clone = Arc::clone(&concurrent);
        let overlapped_clone = Arc::clone(&overlapped);
        let handle = scheduler.schedule_at_fixed_rate(
            Duration::from_millis(5),
            Duration::from_millis(10),
            move |_| {
                if concurrent_clone.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped_clone.store(true, Ordering::SeqCst);
                }
                // Body overruns its period
                thread::sleep(Duration::from_millis(30));
                concurrent_clone.fetch_sub(1, Ordering::SeqCst);
            },
        );

        thread::sleep(Duration::from_millis(200));
        handle.cancel();
        thread::sleep(Duration::from_millis(60));

        assert!(!overlapped.load(Ordering::SeqCst));
        // Overrunning runs fire back to back rather than piling up
        assert!(handle.run_count() >= 3);
    }

    #[test]
    fn test_fixed_delay_spacing() {
        let scheduler = Scheduler::new(1);
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let stamps_clone = Arc::clone(&stamps);
        let handle = scheduler.schedule_with_fixed_delay(
            Duration::from_millis(5),
            Duration::from_millis(30),
            move |_| {
                stamps_clone.lock().push(Instant::now());
                thread::sleep(Duration::from_millis(20));
            },
        );

        thread::sleep(Duration::from_millis(200));
        handle.cancel();
        thread::sleep(Duration::from_millis(60));

        let stamps = stamps.lock();
        assert!(stamps.len() >= 2);
        for pair in stamps.windows(2) {
            // Gap covers the 20ms body plus the 30ms delay
            assert!(pair[1] - pair[0] >= Duration::from_millis(45));
        }
    }

    #[test]
    fn test_periodic_task_survives_full_queue() {
        let pool = Arc::new(WorkerPool::with_config(PoolConfig {
            workers: 1,
            queue_capacity: 1,
            ..Default::default()
        }));
        let scheduler = Scheduler::with_pool(Arc::clone(&pool));

        // Saturate the pool: the worker blocks and the queue fills
        let barrier = Arc::new(Mutex::new(()));
        let held = barrier.lock();
        let barrier_clone = Arc::clone(&barrier);
        pool.submit(move || {
            let _guard = barrier_clone.lock();
        })
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        pool.submit(|| {}).unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = Arc::clone(&runs);
        let handle = scheduler.schedule_at_fixed_rate(
            Duration::from_millis(5),
            Duration::from_millis(10),
            move |_| {
                runs_clone.fetch_add(1, Ordering::SeqCst);
            },
        );

        // Every dispatch bounces off the full queue for now
        thread::sleep(Duration::from_millis(60));
        assert_eq!(handle.run_count(), 0);

        // Once the queue frees, rejected dispatches must have kept the
        // task alive rather than dropping it
        drop(held);
        thread::sleep(Duration::from_millis(120));
        handle.cancel();
        assert!(handle.run_count() >= 1);
    }

    #[test]
    fn test_shared_pool_survives_scheduler_shutdown() {
        let pool = Arc::new(WorkerPool::new(2));
        let mut scheduler = Scheduler::with_pool(Arc::clone(&pool));

        let handle = scheduler.schedule(Duration::from_millis(5), || {});
        thread::sleep(Duration::from_millis(60));
        assert_eq!(handle.run_count(), 1);

        scheduler.shutdown();
        assert_eq!(pool.submit(|| 7).unwrap().get().unwrap(), 7);
    }

    #[test]
    fn test_shutdown_drops_pending_entries() {
        let mut scheduler = Scheduler::new(1);
        let fired = Arc::new(AtomicBool::new(false));

        let fired_clone = Arc::clone(&fired);
        scheduler.schedule(Duration::from_millis(80), move || {
            fired_clone.store(true, Ordering::SeqCst);
        });

        scheduler.shutdown();
        thread::sleep(Duration::from_millis(150));
        assert!(!fired.load(Ordering::SeqCst));
    }
}
