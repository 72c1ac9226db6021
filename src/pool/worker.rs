//! Bounded worker pool for parallel task execution.
//!
//! A fixed set of named worker threads pulls jobs from a shared bounded
//! queue. Submission returns a [`TaskHandle`] future; batch invocation,
//! configurable backpressure, and two shutdown modes round out the
//! executor surface.

use super::handle::{CancelToken, TaskCore, TaskError, TaskHandle};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, trace};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error when submitting work to the pool.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The task queue is full under the reject backpressure policy
    #[error("worker pool queue is full")]
    QueueFull,

    /// The pool no longer accepts submissions
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

/// Policy applied when the bounded task queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Fail the submission with [`PoolError::QueueFull`]
    Reject,

    /// Block the submitting caller until queue space frees
    Block,
}

/// Pool lifecycle state; transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Accepting and executing submissions
    Running,

    /// No longer accepting; draining queued and running tasks
    ShuttingDown,

    /// All workers have exited
    Terminated,
}

/// Statistics about the pool.
#[derive(Debug, Default, Clone)]
pub struct PoolStats {
    /// Number of tasks accepted into the queue
    pub tasks_queued: usize,

    /// Number of tasks that completed normally
    pub tasks_completed: usize,

    /// Number of tasks whose body panicked
    pub tasks_panicked: usize,

    /// Number of tasks cancelled or discarded before completion
    pub tasks_cancelled: usize,

    /// Total task execution time (microseconds)
    pub total_execution_time_us: u64,

    /// Total time tasks spent queued (microseconds)
    pub total_queue_time_us: u64,

    /// Maximum task execution time (microseconds)
    pub max_execution_time_us: u64,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads
    pub workers: usize,

    /// Maximum size of the task queue
    pub queue_capacity: usize,

    /// Name prefix for worker threads
    pub thread_name_prefix: String,

    /// Policy when the queue is full
    pub backpressure: Backpressure,

    /// Whether to collect performance statistics
    pub collect_stats: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            queue_capacity: 1000,
            thread_name_prefix: "tandem-worker".to_string(),
            backpressure: Backpressure::Reject,
            collect_stats: true,
        }
    }
}

enum JobMode {
    Run,
    Discard,
}

enum JobOutcome {
    Completed,
    Panicked,
    Cancelled,
    Discarded,
}

/// Type-erased unit of work with queueing metadata.
struct Job {
    call: Box<dyn FnOnce(JobMode) -> JobOutcome + Send + 'static>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct StatCounters {
    tasks_queued: AtomicUsize,
    tasks_completed: AtomicUsize,
    tasks_panicked: AtomicUsize,
    tasks_cancelled: AtomicUsize,
    total_execution_time_us: AtomicUsize,
    total_queue_time_us: AtomicUsize,
    max_execution_time_us: AtomicUsize,
}

struct LiveWorkers {
    count: Mutex<usize>,
    all_exited: Condvar,
}

/// Worker context holding shared state for the worker loop.
struct WorkerContext {
    receiver: Receiver<Job>,
    discard: Arc<AtomicBool>,
    collect_stats: bool,
    stats: Arc<StatCounters>,
    live: Arc<LiveWorkers>,
}

/// A bounded pool of worker threads executing submitted tasks.
pub struct WorkerPool {
    /// Queue entrance; taken (dropped) on shutdown so workers drain out
    sender: Mutex<Option<Sender<Job>>>,

    /// Worker threads
    workers: Vec<JoinHandle<()>>,

    /// Set once a shutdown has been requested
    shutting_down: AtomicBool,

    /// When set, workers discard queued jobs instead of running them
    discard: Arc<AtomicBool>,

    /// Pool-wide cooperative interrupt flag, shared with every token
    pool_cancel: Arc<AtomicBool>,

    /// Live worker accounting for `await_termination`
    live: Arc<LiveWorkers>,

    /// Statistics counters shared with workers
    stats: Arc<StatCounters>,

    /// Configuration
    config: PoolConfig,
}

impl WorkerPool {
    /// Create a pool with `workers` threads and default configuration.
    pub fn new(workers: usize) -> Self {
        Self::with_config(PoolConfig {
            workers,
            ..Default::default()
        })
    }

    /// Create a pool with the specified configuration.
    pub fn with_config(config: PoolConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity);
        let discard = Arc::new(AtomicBool::new(false));
        let pool_cancel = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(StatCounters::default());
        let live = Arc::new(LiveWorkers {
            count: Mutex::new(config.workers),
            all_exited: Condvar::new(),
        });

        info!(
            "Creating worker pool with {} workers and queue capacity {}",
            config.workers, config.queue_capacity
        );

        let mut workers = Vec::with_capacity(config.workers);

        for id in 0..config.workers {
            let thread_name = format!("{}-{}", config.thread_name_prefix, id);
            let ctx = WorkerContext {
                receiver: receiver.clone(),
                discard: Arc::clone(&discard),
                collect_stats: config.collect_stats,
                stats: Arc::clone(&stats),
                live: Arc::clone(&live),
            };

            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || Self::worker_loop(id, ctx))
                .expect("Failed to spawn worker thread");

            workers.push(handle);
        }

        Self {
            sender: Mutex::new(Some(sender)),
            workers,
            shutting_down: AtomicBool::new(false),
            discard,
            pool_cancel,
            live,
            stats,
            config,
        }
    }

    /// Worker thread main loop: drains the queue until it disconnects.
    fn worker_loop(id: usize, ctx: WorkerContext) {
        debug!("Worker {}: starting", id);

        while let Ok(job) = ctx.receiver.recv() {
            let mode = if ctx.discard.load(Ordering::SeqCst) {
                JobMode::Discard
            } else {
                JobMode::Run
            };

            let queue_time = job.enqueued_at.elapsed();
            if ctx.collect_stats {
                ctx.stats
                    .total_queue_time_us
                    .fetch_add(queue_time.as_micros() as usize, Ordering::Relaxed);
            }

            let exec_start = Instant::now();
            let outcome = (job.call)(mode);
            let exec_time = exec_start.elapsed();

            if ctx.collect_stats {
                let exec_time_us = exec_time.as_micros() as usize;
                ctx.stats
                    .total_execution_time_us
                    .fetch_add(exec_time_us, Ordering::Relaxed);

                let mut current_max = ctx.stats.max_execution_time_us.load(Ordering::Relaxed);
                while exec_time_us > current_max {
                    match ctx.stats.max_execution_time_us.compare_exchange(
                        current_max,
                        exec_time_us,
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => break,
                        Err(actual) => current_max = actual,
                    }
                }
            }

            match outcome {
                JobOutcome::Completed => {
                    trace!(
                        "Worker {}: task completed in {:.2}ms",
                        id,
                        exec_time.as_micros() as f64 / 1000.0
                    );
                    if ctx.collect_stats {
                        ctx.stats.tasks_completed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                JobOutcome::Panicked => {
                    if ctx.collect_stats {
                        ctx.stats.tasks_panicked.fetch_add(1, Ordering::Relaxed);
                    }
                }
                JobOutcome::Cancelled | JobOutcome::Discarded => {
                    if ctx.collect_stats {
                        ctx.stats.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        debug!("Worker {}: shutting down", id);

        let mut count = ctx.live.count.lock();
        *count -= 1;
        if *count == 0 {
            ctx.live.all_exited.notify_all();
        }
    }

    /// Submit a task for execution, returning a handle to its result.
    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_with_token(move |_| f())
    }

    /// Submit a task that can observe cooperative cancellation.
    ///
    /// The closure receives a [`CancelToken`]; a long-running body should
    /// poll it and bail out early once cancellation is requested.
    pub fn submit_with_token<T, F>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce(&CancelToken) -> T + Send + 'static,
    {
        let sender = {
            let guard = self.sender.lock();
            match guard.as_ref() {
                Some(sender) => sender.clone(),
                None => return Err(PoolError::ShuttingDown),
            }
        };

        let core = TaskCore::new(Arc::clone(&self.pool_cancel));
        let handle = TaskHandle::from_core(Arc::clone(&core));

        let job = Job {
            call: Box::new(move |mode| match mode {
                JobMode::Discard => {
                    core.mark_cancelled();
                    JobOutcome::Discarded
                }
                JobMode::Run => {
                    if !core.begin_running() {
                        return JobOutcome::Cancelled;
                    }

                    let token = core.token().clone();
                    match catch_unwind(AssertUnwindSafe(|| f(&token))) {
                        Ok(value) => {
                            if core.finish(Ok(value)) {
                                JobOutcome::Completed
                            } else {
                                JobOutcome::Cancelled
                            }
                        }
                        Err(payload) => {
                            let message = panic_message(payload);
                            error!("Task panicked: {}", message);
                            core.finish(Err(TaskError::Panicked(message)));
                            JobOutcome::Panicked
                        }
                    }
                }
            }),
            enqueued_at: Instant::now(),
        };

        match self.config.backpressure {
            Backpressure::Reject => match sender.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => return Err(PoolError::QueueFull),
                Err(TrySendError::Disconnected(_)) => return Err(PoolError::ShuttingDown),
            },
            Backpressure::Block => {
                sender.send(job).map_err(|_| PoolError::ShuttingDown)?;
            }
        }

        if self.config.collect_stats {
            self.stats.tasks_queued.fetch_add(1, Ordering::Relaxed);
        }

        Ok(handle)
    }

    /// Execute every task and block until all complete.
    ///
    /// The output preserves input order regardless of completion order;
    /// each slot carries that task's own result or error.
    pub fn invoke_all<T, F>(&self, tasks: Vec<F>) -> Result<Vec<Result<T, TaskError>>, PoolError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let handles: Vec<TaskHandle<T>> = tasks
            .into_iter()
            .map(|f| self.submit(f))
            .collect::<Result<_, _>>()?;

        Ok(handles.iter().map(|handle| handle.get()).collect())
    }

    /// Execute the tasks and return the first successful result.
    ///
    /// Once a task succeeds, the remaining tasks are cancelled (queued
    /// ones outright, running ones cooperatively). If every task fails,
    /// an aggregate [`TaskError::AllFailed`] is returned.
    pub fn invoke_any<T, F>(&self, tasks: Vec<F>) -> Result<T, TaskError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let total = tasks.len();
        if total == 0 {
            return Err(TaskError::AllFailed(0));
        }

        let (tx, rx) = bounded(total);
        let mut handles = Vec::with_capacity(total);

        for f in tasks {
            let tx = tx.clone();
            let handle = self.submit_with_token(move |token| {
                if token.is_cancelled() {
                    return;
                }
                let outcome = match catch_unwind(AssertUnwindSafe(f)) {
                    Ok(value) => Ok(value),
                    Err(payload) => Err(TaskError::Panicked(panic_message(payload))),
                };
                let _ = tx.send(outcome);
            })?;
            handles.push(handle);
        }
        drop(tx);

        while let Ok(outcome) = rx.recv() {
            match outcome {
                Ok(value) => {
                    for handle in &handles {
                        handle.cancel(true);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    debug!("invoke_any candidate failed: {}", err);
                }
            }
        }

        Err(TaskError::AllFailed(total))
    }

    /// Stop accepting submissions; queued and running tasks finish.
    ///
    /// Best-effort: this call does not wait. Pair it with
    /// [`await_termination`](WorkerPool::await_termination).
    pub fn shutdown(&self) {
        info!("Shutting down worker pool");
        self.shutting_down.store(true, Ordering::SeqCst);
        // Dropping the sender disconnects the queue once it drains
        let _ = self.sender.lock().take();
    }

    /// Stop accepting submissions, discard queued tasks, and signal
    /// cooperative interruption to running ones.
    ///
    /// Discarded tasks report [`super::handle::TaskState::Cancelled`]
    /// through their handles. Running tasks are not forcibly stopped.
    pub fn shutdown_now(&self) {
        info!("Shutting down worker pool immediately");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.discard.store(true, Ordering::SeqCst);
        self.pool_cancel.store(true, Ordering::SeqCst);
        let _ = self.sender.lock().take();
    }

    /// Block until every worker has exited or `timeout` elapses.
    ///
    /// Returns true when the pool reached [`PoolState::Terminated`].
    /// Without a prior shutdown call the workers never exit, so this will
    /// simply wait out the timeout.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.live.count.lock();

        while *count > 0 {
            if self.live.all_exited.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }

        true
    }

    /// Current lifecycle state of the pool.
    pub fn state(&self) -> PoolState {
        if !self.shutting_down.load(Ordering::SeqCst) {
            PoolState::Running
        } else if *self.live.count.lock() > 0 {
            PoolState::ShuttingDown
        } else {
            PoolState::Terminated
        }
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Current statistics for the pool.
    pub fn stats(&self) -> PoolStats {
        if !self.config.collect_stats {
            return PoolStats::default();
        }

        PoolStats {
            tasks_queued: self.stats.tasks_queued.load(Ordering::Relaxed),
            tasks_completed: self.stats.tasks_completed.load(Ordering::Relaxed),
            tasks_panicked: self.stats.tasks_panicked.load(Ordering::Relaxed),
            tasks_cancelled: self.stats.tasks_cancelled.load(Ordering::Relaxed),
            total_execution_time_us: self.stats.total_execution_time_us.load(Ordering::Relaxed)
                as u64,
            total_queue_time_us: self.stats.total_queue_time_us.load(Ordering::Relaxed) as u64,
            max_execution_time_us: self.stats.max_execution_time_us.load(Ordering::Relaxed) as u64,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.shutting_down.load(Ordering::SeqCst) {
            self.shutdown();
        }
        debug!("Worker pool dropped; workers exit once the queue drains");
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("state", &self.state())
            .finish()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<unknown panic>".to_string()
    }
}
