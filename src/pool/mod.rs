//! Bounded worker pool with graceful-then-forced shutdown.
//!
//! A fixed set of named OS threads pull jobs from one shared flume queue,
//! each holding a clone of the same receiver. Each job runs to completion on
//! the thread that picked it up, which is what lets [`crate::AffinityCache`]
//! keep one bundle per worker.

mod shutdown;
mod task;

use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender};
use log::{debug, warn};

pub use shutdown::{DEFAULT_GRACE_PERIOD, Interrupt, PoolPhase, ShutdownOutcome};
pub use task::{CancelToken, TaskHandle};

pub(crate) use shutdown::{ExitNotice, PoolEvent, WaitResult, deadline_after, wait_for_exits};
pub(crate) use task::{Job, package};

use crate::error::TaskError;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Number of threads to use when the caller does not say
#[must_use]
pub fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

struct Lifecycle {
    phase: PoolPhase,
    /// Dropped when draining starts so workers exit once the queue is empty
    submitter: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    outcome: Option<ShutdownOutcome>,
}

/// Configures and starts a [`WorkerPool`]
#[derive(Clone, Debug)]
pub struct WorkerPoolBuilder {
    name: String,
    parallelism: usize,
    grace_period: Duration,
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            parallelism: available_parallelism(),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl WorkerPoolBuilder {
    /// Prefix for thread names and log lines
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Number of worker threads; zero is treated as one
    #[must_use]
    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Grace period used when the pool is dropped without an explicit shutdown
    #[must_use]
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Spawn the worker threads
    pub fn build(self) -> io::Result<WorkerPool> {
        let parallelism = self.parallelism.max(1);
        let (job_tx, job_rx) = flume::unbounded::<Job>();
        let (events_tx, events_rx) = flume::unbounded();
        let interrupt = Interrupt::new(events_tx.clone());

        let pool = WorkerPool {
            name: self.name,
            parallelism,
            grace_period: self.grace_period,
            lifecycle: Mutex::new(Lifecycle {
                phase: PoolPhase::Running,
                submitter: Some(job_tx),
                workers: Vec::with_capacity(parallelism),
                outcome: None,
            }),
            shutdown_serial: Mutex::new(()),
            queue: job_rx,
            events: events_rx,
            events_tx,
            interrupt,
            cancel: CancelToken::new(),
        };

        for index in 0..parallelism {
            let queue = pool.queue.clone();
            let notice = ExitNotice(pool.events_tx.clone());
            // On spawn failure `pool` is dropped and shuts down the workers
            // already running.
            let handle = thread::Builder::new()
                .name(format!("{}-{index}", pool.name))
                .spawn(move || worker_loop(queue, notice))?;
            lock(&pool.lifecycle).workers.push(handle);
        }

        debug!("{}: started {parallelism} workers", pool.name);
        Ok(pool)
    }
}

fn worker_loop(queue: Receiver<Job>, _notice: ExitNotice) {
    // Ends once every sender is gone and the queue is empty.
    for job in queue.iter() {
        job();
    }
}

/// Fixed-size pool of worker threads.
///
/// Tasks run in no particular order. Dropping the pool shuts it down with the
/// configured grace period.
pub struct WorkerPool {
    name: String,
    parallelism: usize,
    grace_period: Duration,
    lifecycle: Mutex<Lifecycle>,
    /// Held for the whole of a shutdown so concurrent callers wait for it
    shutdown_serial: Mutex<()>,
    /// Kept to discard queued jobs on forced cancellation
    queue: Receiver<Job>,
    events: Receiver<PoolEvent>,
    events_tx: Sender<PoolEvent>,
    /// Shared by every handle from [`WorkerPool::interrupt_handle`]
    interrupt: Interrupt,
    cancel: CancelToken,
}

impl WorkerPool {
    #[must_use]
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::default()
    }

    /// Pool with `parallelism` workers and default settings
    pub fn new(parallelism: usize) -> io::Result<Self> {
        Self::builder().parallelism(parallelism).build()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    #[must_use]
    pub fn phase(&self) -> PoolPhase {
        lock(&self.lifecycle).phase
    }

    /// Tasks waiting for a worker
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Token raised when shutdown turns forced; clone it into long tasks
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Handle that can interrupt a shutdown blocked in another thread
    #[must_use]
    pub fn interrupt_handle(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Whether any of the pool's interrupt handles has fired
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted()
    }

    /// Queue `task` for execution.
    ///
    /// Fails with [`TaskError::Rejected`] once shutdown has begun.
    pub fn submit<T, F>(&self, task: F) -> Result<TaskHandle<T>, TaskError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (handle, job) = package(task, self.cancel.clone());

        let lifecycle = lock(&self.lifecycle);
        let submitter = match (lifecycle.phase, lifecycle.submitter.as_ref()) {
            (PoolPhase::Running, Some(submitter)) => submitter,
            _ => return Err(self.rejected()),
        };
        submitter.send(job).map_err(|_| self.rejected())?;
        Ok(handle)
    }

    fn rejected(&self) -> TaskError {
        TaskError::Rejected {
            name: self.name.clone(),
        }
    }

    fn set_phase(&self, phase: PoolPhase) {
        lock(&self.lifecycle).phase = phase;
        debug!("{}: {phase}", self.name);
    }

    /// Raise the cancel token and drop every queued job
    fn force_cancel(&self) -> usize {
        self.set_phase(PoolPhase::ForceCancelling);
        self.cancel.cancel();
        self.queue.drain().count()
    }

    /// Stop the pool.
    ///
    /// Rejects new tasks and waits up to `grace` for queued and running tasks.
    /// If they do not finish, raises the cancel token, discards the queue and
    /// waits another `grace`; workers still busy after that are detached.
    /// Only a shutdown that had to force anything logs a warning, and it logs
    /// exactly one. Calling this again returns the first outcome.
    pub fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        let _serial = lock(&self.shutdown_serial);

        let workers = {
            let mut lifecycle = lock(&self.lifecycle);
            if let Some(outcome) = lifecycle.outcome {
                return outcome;
            }
            lifecycle.phase = PoolPhase::Draining;
            lifecycle.submitter = None;
            std::mem::take(&mut lifecycle.workers)
        };
        debug!(
            "{}: draining, {} tasks still queued",
            self.name,
            self.queue.len()
        );

        let mut remaining = workers.len();
        let outcome = match wait_for_exits(&self.events, &mut remaining, deadline_after(grace)) {
            WaitResult::AllExited => ShutdownOutcome::Graceful,
            WaitResult::Interrupted => self.interrupted(),
            WaitResult::TimedOut => {
                let discarded = self.force_cancel();
                match wait_for_exits(&self.events, &mut remaining, deadline_after(grace)) {
                    WaitResult::AllExited => {
                        warn!(
                            "{}: tasks did not finish within {grace:?}, forced cancellation discarded {discarded} queued tasks",
                            self.name
                        );
                        ShutdownOutcome::Forced { discarded }
                    }
                    WaitResult::TimedOut => {
                        warn!(
                            "{}: {remaining} workers still busy {grace:?} after forced cancellation, leaving them behind",
                            self.name
                        );
                        ShutdownOutcome::Incomplete {
                            stuck_workers: remaining,
                        }
                    }
                    WaitResult::Interrupted => self.interrupted(),
                }
            }
        };

        if remaining == 0 {
            for worker in workers {
                if worker.join().is_err() {
                    warn!("{}: worker thread panicked", self.name);
                }
            }
        }
        // otherwise the handles drop here and the busy threads are detached

        let mut lifecycle = lock(&self.lifecycle);
        lifecycle.phase = PoolPhase::Stopped;
        lifecycle.outcome = Some(outcome);
        debug!("{}: stopped ({outcome:?})", self.name);
        outcome
    }

    fn interrupted(&self) -> ShutdownOutcome {
        let discarded = self.force_cancel();
        warn!(
            "{}: shutdown interrupted, forced cancellation discarded {discarded} queued tasks",
            self.name
        );
        ShutdownOutcome::Interrupted
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let stopped = lock(&self.lifecycle).outcome.is_some();
        if !stopped {
            self.shutdown(self.grace_period);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::time::Instant;

    use super::*;

    fn pool(parallelism: usize) -> WorkerPool {
        WorkerPool::builder()
            .name("test")
            .parallelism(parallelism)
            .grace_period(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[test]
    fn runs_submitted_tasks() {
        let pool = pool(2);
        let handles: Vec<_> = (0..10).map(|i| pool.submit(move || i * i).unwrap()).collect();
        let results: Vec<i32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, (0..10).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn zero_parallelism_is_clamped() {
        let pool = pool(0);
        assert_eq!(pool.parallelism(), 1);
        assert_eq!(pool.submit(|| "ok").unwrap().join(), Ok("ok"));
    }

    #[test]
    fn tasks_run_on_at_most_parallelism_threads() {
        let pool = pool(3);
        let handles: Vec<_> = (0..30)
            .map(|_| {
                pool.submit(|| {
                    thread::sleep(Duration::from_millis(2));
                    thread::current().id()
                })
                .unwrap()
            })
            .collect();
        let threads: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(threads.len() <= 3);
        assert!(!threads.contains(&thread::current().id()));
    }

    #[test]
    fn workers_run_in_parallel() {
        let pool = pool(4);
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                pool.submit(move || {
                    barrier.wait();
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join_timeout(Duration::from_secs(5)), Ok(()));
        }
    }

    #[test]
    fn worker_thread_names_use_pool_name() {
        let pool = pool(1);
        let name = pool
            .submit(|| thread::current().name().map(str::to_string))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(name.as_deref(), Some("test-0"));
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = pool(1);
        let bad = pool.submit(|| -> u32 { panic!("bad page") }).unwrap();
        let good = pool.submit(|| 7_u32).unwrap();

        assert!(matches!(bad.join(), Err(TaskError::Panicked { .. })));
        assert_eq!(good.join(), Ok(7));
    }

    #[test]
    fn graceful_shutdown_finishes_queued_tasks() {
        let pool = pool(2);
        let done = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let done = Arc::clone(&done);
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(5));
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        assert_eq!(
            pool.shutdown(Duration::from_secs(5)),
            ShutdownOutcome::Graceful
        );
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(handles.into_iter().all(|h| h.join().is_ok()));
        assert_eq!(pool.phase(), PoolPhase::Stopped);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let pool = pool(1);
        pool.shutdown(Duration::from_secs(1));
        let err = pool.submit(|| ()).unwrap_err();
        assert_eq!(
            err,
            TaskError::Rejected {
                name: "test".to_string()
            }
        );
    }

    #[test]
    fn forced_shutdown_cancels_queued_tasks() {
        let pool = pool(1);
        let token = pool.cancel_token();
        let started = Arc::new(Barrier::new(2));

        let running = {
            let started = Arc::clone(&started);
            pool.submit(move || {
                started.wait();
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
                "stopped early"
            })
            .unwrap()
        };
        let queued: Vec<_> = (0..3).map(|_| pool.submit(|| "ran").unwrap()).collect();
        started.wait();

        let outcome = pool.shutdown(Duration::from_millis(50));
        assert_eq!(outcome, ShutdownOutcome::Forced { discarded: 3 });
        assert_eq!(running.join(), Ok("stopped early"));
        for handle in queued {
            assert_eq!(handle.join(), Err(TaskError::Cancelled));
        }
    }

    #[test]
    fn stuck_worker_leaves_shutdown_incomplete() {
        let pool = pool(1);
        let release = Arc::new(Barrier::new(2));
        let started = Arc::new(Barrier::new(2));
        {
            let release = Arc::clone(&release);
            let started = Arc::clone(&started);
            pool.submit(move || {
                started.wait();
                // ignores the cancel token
                release.wait();
            })
            .unwrap();
        }
        started.wait();

        let outcome = pool.shutdown(Duration::from_millis(20));
        assert_eq!(outcome, ShutdownOutcome::Incomplete { stuck_workers: 1 });
        release.wait();
    }

    #[test]
    fn second_shutdown_returns_first_outcome() {
        let pool = pool(1);
        let first = pool.shutdown(Duration::from_secs(1));
        let second = pool.shutdown(Duration::from_secs(1));
        assert_eq!(first, second);
    }

    #[test]
    fn interrupt_forces_cancellation_immediately() {
        let pool = Arc::new(pool(1));
        let interrupt = pool.interrupt_handle();
        let started = Arc::new(Barrier::new(2));
        let token = pool.cancel_token();
        {
            let started = Arc::clone(&started);
            pool.submit(move || {
                started.wait();
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        }
        let queued = pool.submit(|| ()).unwrap();
        started.wait();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let begun = Instant::now();
                (pool.shutdown(Duration::from_secs(30)), begun.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        interrupt.interrupt();

        let (outcome, elapsed) = waiter.join().unwrap();
        assert_eq!(outcome, ShutdownOutcome::Interrupted);
        assert!(elapsed < Duration::from_secs(30));
        assert!(interrupt.is_interrupted());
        assert_eq!(queued.join(), Err(TaskError::Cancelled));
    }

    #[test]
    fn interrupt_handles_share_one_flag() {
        let pool = pool(1);
        let first = pool.interrupt_handle();
        let second = pool.interrupt_handle();
        assert!(!pool.is_interrupted());

        second.interrupt();
        assert!(first.is_interrupted());
        assert!(pool.is_interrupted());
        assert_eq!(pool.shutdown(Duration::from_secs(5)), ShutdownOutcome::Interrupted);

        assert!(first.clear());
        assert!(!second.is_interrupted());
        assert!(!pool.is_interrupted());
    }

    #[test]
    fn drop_shuts_down() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let pool = pool(2);
            for _ in 0..4 {
                let done = Arc::clone(&done);
                pool.submit(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }
}
