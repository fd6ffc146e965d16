//! Task packaging and result delivery

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError};
use log::error;

use crate::error::{TaskError, panic_message};

/// Unit of work as queued to a worker thread
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Cooperative cancellation flag shared by a pool and its tasks.
///
/// Raised when a shutdown stops waiting politely. Long-running tasks should
/// poll [`CancelToken::is_cancelled`] and return early.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// The eventual result of a submitted task
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes.
    ///
    /// A task discarded before it ran reports [`TaskError::Cancelled`].
    pub fn join(self) -> Result<T, TaskError> {
        self.rx.recv().unwrap_or(Err(TaskError::Cancelled))
    }

    /// Like [`TaskHandle::join`], giving up after `timeout`
    pub fn join_timeout(&self, timeout: Duration) -> Result<T, TaskError> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(TaskError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(TaskError::Cancelled),
        }
    }

    /// True once a result is available or the task was discarded
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !self.rx.is_empty() || self.rx.is_disconnected()
    }
}

/// Wrap `task` so that it reports through a [`TaskHandle`].
///
/// The job skips the task once `cancel` is raised. Panics are caught and
/// delivered as [`TaskError::Panicked`] so the worker thread survives.
pub(crate) fn package<T, F>(task: F, cancel: CancelToken) -> (TaskHandle<T>, Job)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = flume::bounded(1);
    let job: Job = Box::new(move || {
        if cancel.is_cancelled() {
            // dropping tx tells the handle the task was cancelled
            return;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(task)).map_err(|payload| {
            let message = panic_message(payload.as_ref());
            error!("Task panicked: {message}");
            TaskError::Panicked { message }
        });
        let _ = tx.send(result);
    });
    (TaskHandle { rx }, job)
}
