//! Task handles and lifecycle state.
//!
//! A submitted task is represented by a [`TaskHandle`], which observes the
//! task's `Pending → Running → {Completed, Failed, Cancelled}` lifecycle,
//! collects its result, and requests cooperative cancellation.

use super::worker::PoolError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors observed through a task handle.
#[derive(Error, Debug)]
pub enum TaskError {
    /// The task body panicked; the payload message is preserved
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was cancelled before or instead of completing
    #[error("task was cancelled")]
    Cancelled,

    /// The result did not arrive within the wait deadline.
    /// The task itself keeps running; only the waiting caller detaches.
    #[error("result not available within {0:?}")]
    WaitTimeout(Duration),

    /// The result was already collected by an earlier call
    #[error("task result already collected")]
    AlreadyCollected,

    /// Every task in a batch failed
    #[error("all {0} tasks failed")]
    AllFailed(usize),

    /// The pool refused the submission
    #[error("task rejected by pool: {0}")]
    Rejected(#[from] PoolError),
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, not yet picked up by a worker
    Pending,

    /// A worker is executing the task body
    Running,

    /// The body returned normally
    Completed,

    /// The body panicked
    Failed,

    /// Cancelled before completion; any late result is discarded
    Cancelled,
}

impl TaskState {
    /// Whether the state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Cooperative cancellation signal observable from inside a task body.
///
/// Trips either when the task's handle is cancelled with interruption or
/// when the whole pool is shut down immediately. Observing the signal is
/// the task's responsibility; cancellation of a running task does not
/// guarantee prompt termination.
#[derive(Clone)]
pub struct CancelToken {
    /// Per-task interrupt flag
    task: Arc<AtomicBool>,

    /// Pool-wide interrupt flag, tripped by `shutdown_now`
    pool: Arc<AtomicBool>,
}

impl CancelToken {
    pub(crate) fn new(pool: Arc<AtomicBool>) -> Self {
        Self {
            task: Arc::new(AtomicBool::new(false)),
            pool,
        }
    }

    /// Whether cancellation has been requested for this task or the pool.
    pub fn is_cancelled(&self) -> bool {
        self.task.load(Ordering::SeqCst) || self.pool.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel(&self) {
        self.task.store(true, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct CoreState<T> {
    state: TaskState,
    result: Option<Result<T, TaskError>>,
}

/// Shared state between a handle and the worker executing the task.
pub(crate) struct TaskCore<T> {
    state: Mutex<CoreState<T>>,
    done: Condvar,
    token: CancelToken,
}

impl<T> TaskCore<T> {
    pub(crate) fn new(pool_cancel: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CoreState {
                state: TaskState::Pending,
                result: None,
            }),
            done: Condvar::new(),
            token: CancelToken::new(pool_cancel),
        })
    }

    pub(crate) fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Transition Pending → Running. Returns false when the task was
    /// cancelled while queued; the worker then skips the body.
    pub(crate) fn begin_running(&self) -> bool {
        let mut state = self.state.lock();
        if state.state == TaskState::Pending {
            state.state = TaskState::Running;
            true
        } else {
            false
        }
    }

    /// Record the body's outcome. Returns false when the task was
    /// cancelled mid-run, in which case the result is discarded.
    pub(crate) fn finish(&self, result: Result<T, TaskError>) -> bool {
        let mut state = self.state.lock();

        if state.state == TaskState::Cancelled {
            self.done.notify_all();
            return false;
        }

        state.state = match result {
            Ok(_) => TaskState::Completed,
            Err(_) => TaskState::Failed,
        };
        state.result = Some(result);
        self.done.notify_all();
        true
    }

    /// Mark the task cancelled without running it (queue discard).
    pub(crate) fn mark_cancelled(&self) {
        let mut state = self.state.lock();
        if !state.state.is_terminal() {
            state.state = TaskState::Cancelled;
            state.result = Some(Err(TaskError::Cancelled));
            self.done.notify_all();
        }
    }
}

/// A handle to a submitted task.
///
/// Cloneable; any clone may observe the state, but a result is delivered
/// exactly once across all clones.
pub struct TaskHandle<T> {
    core: Arc<TaskCore<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn from_core(core: Arc<TaskCore<T>>) -> Self {
        Self { core }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.core.state.lock().state
    }

    /// Whether the task has reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Block until the task completes, then return its result.
    ///
    /// A panic inside the task body is re-raised here as
    /// [`TaskError::Panicked`]; task failures are never silently dropped.
    pub fn get(&self) -> Result<T, TaskError> {
        let mut state = self.core.state.lock();

        while !state.state.is_terminal() {
            self.core.done.wait(&mut state);
        }

        state.result.take().unwrap_or(Err(TaskError::AlreadyCollected))
    }

    /// Block until the task completes or `timeout` elapses.
    ///
    /// A timeout detaches only this waiting call; the task keeps running
    /// and a later `get` can still collect its result.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.core.state.lock();

        while !state.state.is_terminal() {
            if self.core.done.wait_until(&mut state, deadline).timed_out() {
                return Err(TaskError::WaitTimeout(timeout));
            }
        }

        state.result.take().unwrap_or(Err(TaskError::AlreadyCollected))
    }

    /// Request cancellation.
    ///
    /// A pending task is cancelled outright and will never run. A running
    /// task is only signalled — and only when `may_interrupt` is true —
    /// via its [`CancelToken`]; whether it stops early is up to the body.
    /// Returns true when the request had any effect.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let mut state = self.core.state.lock();

        match state.state {
            TaskState::Pending => {
                state.state = TaskState::Cancelled;
                state.result = Some(Err(TaskError::Cancelled));
                self.core.token.cancel();
                self.core.done.notify_all();
                true
            }
            TaskState::Running if may_interrupt => {
                self.core.token.cancel();
                true
            }
            _ => false,
        }
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_flag() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_lifecycle_completed() {
        let core = TaskCore::new(pool_flag());
        let handle = TaskHandle::from_core(Arc::clone(&core));

        assert_eq!(handle.state(), TaskState::Pending);
        assert!(core.begin_running());
        assert_eq!(handle.state(), TaskState::Running);
        assert!(core.finish(Ok(42)));

        assert!(handle.is_done());
        assert_eq!(handle.get().unwrap(), 42);
    }

    #[test]
    fn test_result_collected_once() {
        let core = TaskCore::new(pool_flag());
        let handle = TaskHandle::from_core(Arc::clone(&core));

        core.begin_running();
        core.finish(Ok(1));

        assert_eq!(handle.get().unwrap(), 1);
        assert!(matches!(handle.get(), Err(TaskError::AlreadyCollected)));
    }

    #[test]
    fn test_cancel_pending_prevents_run() {
        let core: Arc<TaskCore<u32>> = TaskCore::new(pool_flag());
        let handle = TaskHandle::from_core(Arc::clone(&core));

        assert!(handle.cancel(false));
        assert_eq!(handle.state(), TaskState::Cancelled);

        // The worker refuses to start a cancelled task
        assert!(!core.begin_running());
        assert!(matches!(handle.get(), Err(TaskError::Cancelled)));
    }

    #[test]
    fn test_cancel_running_only_signals() {
        let core: Arc<TaskCore<u32>> = TaskCore::new(pool_flag());
        let handle = TaskHandle::from_core(Arc::clone(&core));

        core.begin_running();
        assert!(!handle.cancel(false));
        assert!(!core.token().is_cancelled());

        assert!(handle.cancel(true));
        assert!(core.token().is_cancelled());
        assert_eq!(handle.state(), TaskState::Running);
    }

    #[test]
    fn test_late_result_after_cancel_discarded() {
        let core = TaskCore::new(pool_flag());
        let handle = TaskHandle::from_core(Arc::clone(&core));

        core.begin_running();
        handle.cancel(true);
        core.mark_cancelled();

        assert!(!core.finish(Ok(7)));
        assert_eq!(handle.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_get_timeout_detaches_without_cancelling() {
        let core: Arc<TaskCore<u32>> = TaskCore::new(pool_flag());
        let handle = TaskHandle::from_core(Arc::clone(&core));

        core.begin_running();
        let result = handle.get_timeout(Duration::from_millis(20));
        assert!(matches!(result, Err(TaskError::WaitTimeout(_))));

        // The task was not cancelled by the timed-out wait
        assert_eq!(handle.state(), TaskState::Running);
        core.finish(Ok(9));
        assert_eq!(handle.get().unwrap(), 9);
    }

    #[test]
    fn test_pool_wide_cancel_trips_token() {
        let flag = pool_flag();
        let core: Arc<TaskCore<u32>> = TaskCore::new(Arc::clone(&flag));

        assert!(!core.token().is_cancelled());
        flag.store(true, Ordering::SeqCst);
        assert!(core.token().is_cancelled());
    }
}
