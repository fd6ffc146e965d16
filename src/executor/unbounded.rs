//! One thread per task

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use crate::error::TaskError;
use crate::pool::{CancelToken, DEFAULT_GRACE_PERIOD, ShutdownOutcome, TaskHandle, lock, package};

#[derive(Default)]
struct Tracker {
    state: Mutex<TrackerState>,
    idle: Condvar,
}

#[derive(Default)]
struct TrackerState {
    live: usize,
    stopped: bool,
    outcome: Option<ShutdownOutcome>,
}

/// Counts a task as live until dropped, even if the task panics or its
/// thread never starts.
struct LiveTask(Arc<Tracker>);

impl Drop for LiveTask {
    fn drop(&mut self) {
        let mut state = lock(&self.0.state);
        state.live -= 1;
        if state.live == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Runs every task on a fresh thread, with no cap on concurrency.
///
/// Meant for blocking I/O where the number of tasks in flight is small. Tasks
/// here must not use an [`crate::AffinityCache`]: each thread would open a
/// bundle of its own.
pub struct UnboundedExecutor {
    name: String,
    grace_period: Duration,
    next_thread: AtomicU64,
    tracker: Arc<Tracker>,
    cancel: CancelToken,
}

impl UnboundedExecutor {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            grace_period: DEFAULT_GRACE_PERIOD,
            next_thread: AtomicU64::new(0),
            tracker: Arc::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Grace period used when the executor is dropped
    #[must_use]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tasks submitted and not yet finished
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        lock(&self.tracker.state).live
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        lock(&self.tracker.state).stopped
    }

    /// Raised when a shutdown gives up waiting
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn submit<T, F>(&self, task: F) -> Result<TaskHandle<T>, TaskError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        {
            let mut state = lock(&self.tracker.state);
            if state.stopped {
                return Err(TaskError::Rejected {
                    name: self.name.clone(),
                });
            }
            state.live += 1;
        }
        let live = LiveTask(Arc::clone(&self.tracker));

        let (handle, job) = package(task, self.cancel.clone());
        let index = self.next_thread.fetch_add(1, Ordering::Relaxed);
        thread::Builder::new()
            .name(format!("{}-{index}", self.name))
            .spawn(move || {
                let _live = live;
                job();
            })
            .map_err(|e| {
                warn!("{}: failed to start task thread: {e}", self.name);
                TaskError::SpawnFailed {
                    detail: e.to_string(),
                }
            })?;
        Ok(handle)
    }

    /// Reject new tasks and wait up to `grace` for running ones.
    ///
    /// Tasks still running afterwards keep their threads; the cancel token is
    /// raised and a single warning is logged.
    pub fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        let mut state = lock(&self.tracker.state);
        if state.stopped {
            // another caller is already waiting; share its outcome
            let state = self
                .tracker
                .idle
                .wait_while(state, |state| state.outcome.is_none())
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            return state.outcome.unwrap_or(ShutdownOutcome::Graceful);
        }
        state.stopped = true;
        debug!("{}: shutting down, {} tasks live", self.name, state.live);

        let (mut state, _) = self
            .tracker
            .idle
            .wait_timeout_while(state, grace, |state| state.live > 0)
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let outcome = if state.live == 0 {
            ShutdownOutcome::Graceful
        } else {
            self.cancel.cancel();
            warn!(
                "{}: {} tasks still running {grace:?} after shutdown, leaving them behind",
                self.name, state.live
            );
            ShutdownOutcome::Incomplete {
                stuck_workers: state.live,
            }
        };
        state.outcome = Some(outcome);
        self.tracker.idle.notify_all();
        outcome
    }
}

impl Drop for UnboundedExecutor {
    fn drop(&mut self) {
        self.shutdown(self.grace_period);
    }
}
