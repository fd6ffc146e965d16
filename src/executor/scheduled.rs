//! Single-thread executor for delayed and periodic work.
//!
//! All tasks run one after another on one named thread, so two runs of a
//! periodic task never overlap. The thread sleeps on its command channel until
//! the earliest task is due.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, error, warn};

use crate::error::{TaskError, panic_message};
use crate::pool::{
    CancelToken, DEFAULT_GRACE_PERIOD, Job, ShutdownOutcome, TaskHandle, deadline_after, lock,
    package,
};

/// Handle to a periodic task
#[derive(Clone, Debug)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Stop future runs. A run already in progress finishes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once cancelled, stopped by a panic, or stopped by shutdown
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

enum Work {
    Once(Job),
    FixedRate {
        period: Duration,
        task: Box<dyn FnMut() + Send>,
    },
    FixedDelay {
        delay: Duration,
        task: Box<dyn FnMut() + Send>,
    },
}

struct Entry {
    due: Instant,
    /// Breaks ties between entries due at the same instant, oldest first
    seq: u64,
    cancelled: Arc<AtomicBool>,
    work: Work,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // reversed: BinaryHeap pops the greatest, we want the earliest
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.due, other.seq).cmp(&(self.due, self.seq))
    }
}

enum Command {
    Schedule(Entry),
    Shutdown {
        deadline: Instant,
        /// Receives the number of one-shot tasks that were discarded
        done: Sender<usize>,
    },
}

struct State {
    accepting: bool,
    next_seq: u64,
    outcome: Option<ShutdownOutcome>,
}

/// Runs delayed and periodic tasks on one dedicated thread
pub struct ScheduledExecutor {
    name: String,
    grace_period: Duration,
    commands: Sender<Command>,
    state: Mutex<State>,
    shutdown_serial: Mutex<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduledExecutor {
    pub fn new(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (commands, inbox) = flume::unbounded();
        let worker = {
            let name = name.clone();
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || Scheduler::new(name, inbox).run())?
        };

        Ok(Self {
            name,
            grace_period: DEFAULT_GRACE_PERIOD,
            commands,
            state: Mutex::new(State {
                accepting: true,
                next_seq: 0,
                outcome: None,
            }),
            shutdown_serial: Mutex::new(()),
            worker: Mutex::new(Some(worker)),
        })
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

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        !lock(&self.state).accepting
    }

    /// Run `task` once after `delay`
    pub fn schedule<T, F>(&self, delay: Duration, task: F) -> Result<TaskHandle<T>, TaskError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (handle, job) = package(task, CancelToken::new());
        self.enqueue(deadline_after(delay), Work::Once(job))?;
        Ok(handle)
    }

    /// Run `task` after `initial`, then every `period` measured from the
    /// previous scheduled start. Late runs are not skipped; they run back to
    /// back until the schedule catches up.
    ///
    /// Fails with [`TaskError::ZeroPeriod`] if `period` is zero.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial: Duration,
        period: Duration,
        task: F,
    ) -> Result<ScheduledTask, TaskError>
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            return Err(TaskError::ZeroPeriod);
        }
        self.enqueue(
            deadline_after(initial),
            Work::FixedRate {
                period,
                task: Box::new(task),
            },
        )
    }

    /// Run `task` after `initial`, then `delay` after each run finishes.
    ///
    /// Fails with [`TaskError::ZeroPeriod`] if `delay` is zero.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial: Duration,
        delay: Duration,
        task: F,
    ) -> Result<ScheduledTask, TaskError>
    where
        F: FnMut() + Send + 'static,
    {
        if delay.is_zero() {
            return Err(TaskError::ZeroPeriod);
        }
        self.enqueue(
            deadline_after(initial),
            Work::FixedDelay {
                delay,
                task: Box::new(task),
            },
        )
    }

    fn enqueue(&self, due: Instant, work: Work) -> Result<ScheduledTask, TaskError> {
        let rejected = || TaskError::Rejected {
            name: self.name.clone(),
        };
        let cancelled = Arc::new(AtomicBool::new(false));

        // Sent under the state lock so nothing can follow a Shutdown command.
        let mut state = lock(&self.state);
        if !state.accepting {
            return Err(rejected());
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        self.commands
            .send(Command::Schedule(Entry {
                due,
                seq,
                cancelled: Arc::clone(&cancelled),
                work,
            }))
            .map_err(|_| rejected())?;

        Ok(ScheduledTask { cancelled })
    }

    /// Stop the executor.
    ///
    /// Periodic tasks are cancelled. One-shot tasks due within `grace` still
    /// run; the rest are discarded and their handles report
    /// [`TaskError::Cancelled`]. Discarding anything logs one warning, as does
    /// finding the scheduler thread already dead.
    pub fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        let _serial = lock(&self.shutdown_serial);
        let (done, finished) = flume::bounded(1);
        {
            let mut state = lock(&self.state);
            if let Some(outcome) = state.outcome {
                return outcome;
            }
            state.accepting = false;
            let deadline = deadline_after(grace);
            // a send failure means the thread is gone; `finished` then disconnects
            let _ = self.commands.send(Command::Shutdown { deadline, done });
        }

        // one grace for pending tasks, one more for a run that overshoots it
        let outcome = match finished.recv_deadline(deadline_after(grace.saturating_mul(2))) {
            Ok(0) => ShutdownOutcome::Graceful,
            Ok(discarded) => {
                warn!(
                    "{}: discarded {discarded} scheduled tasks not due within {grace:?}",
                    self.name
                );
                ShutdownOutcome::Forced { discarded }
            }
            Err(RecvTimeoutError::Disconnected) => {
                // the thread is gone, so joining cannot block
                let panicked = lock(&self.worker)
                    .take()
                    .is_some_and(|worker| worker.join().is_err());
                warn!(
                    "{}: scheduler thread exited{} before shutdown, its pending tasks were lost",
                    self.name,
                    if panicked { " after a panic" } else { "" }
                );
                ShutdownOutcome::Incomplete { stuck_workers: 0 }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "{}: scheduler thread still busy after {grace:?}, leaving it behind",
                    self.name
                );
                ShutdownOutcome::Incomplete { stuck_workers: 1 }
            }
        };

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if matches!(outcome, ShutdownOutcome::Incomplete { .. }) {
                drop(worker);
            } else if worker.join().is_err() {
                warn!("{}: scheduler thread panicked", self.name);
            }
        }

        lock(&self.state).outcome = Some(outcome);
        debug!("{}: stopped ({outcome:?})", self.name);
        outcome
    }
}

impl Drop for ScheduledExecutor {
    fn drop(&mut self) {
        self.shutdown(self.grace_period);
    }
}

struct Scheduler {
    name: String,
    inbox: Receiver<Command>,
    queue: BinaryHeap<Entry>,
}

impl Scheduler {
    fn new(name: String, inbox: Receiver<Command>) -> Self {
        Self {
            name,
            inbox,
            queue: BinaryHeap::new(),
        }
    }

    fn run(mut self) {
        loop {
            let command = match self.queue.peek().map(|entry| entry.due) {
                Some(due) => match self.inbox.recv_deadline(due) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.inbox.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                },
            };

            match command {
                Some(Command::Schedule(entry)) => self.queue.push(entry),
                Some(Command::Shutdown { deadline, done }) => {
                    let discarded = self.drain(deadline);
                    let _ = done.send(discarded);
                    return;
                }
                None => self.run_due(),
            }
        }
        // The executor vanished without a shutdown command.
        self.drain(Instant::now());
    }

    /// Run every entry due now, once each. Periodic entries rescheduled
    /// during the pass wait for the next one, so a schedule that keeps
    /// falling behind still lets other entries and the inbox through.
    fn run_due(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        while self.queue.peek().is_some_and(|entry| entry.due <= now) {
            if let Some(entry) = self.queue.pop() {
                due.push(entry);
            }
        }
        for entry in due {
            self.run_entry(entry);
        }
    }

    fn run_entry(&mut self, entry: Entry) {
        let Entry {
            due,
            seq,
            cancelled,
            work,
        } = entry;
        if cancelled.load(Ordering::Acquire) {
            return;
        }

        let (next_due, work) = match work {
            Work::Once(job) => {
                job();
                return;
            }
            Work::FixedRate { period, mut task } => {
                if !self.run_periodic(&mut task, &cancelled) {
                    return;
                }
                (
                    due.checked_add(period)
                        .unwrap_or_else(|| deadline_after(period)),
                    Work::FixedRate { period, task },
                )
            }
            Work::FixedDelay { delay, mut task } => {
                if !self.run_periodic(&mut task, &cancelled) {
                    return;
                }
                (deadline_after(delay), Work::FixedDelay { delay, task })
            }
        };

        if !cancelled.load(Ordering::Acquire) {
            self.queue.push(Entry {
                due: next_due,
                seq,
                cancelled,
                work,
            });
        }
    }

    /// Run one periodic iteration; false if it panicked and must stop
    fn run_periodic(&self, task: &mut Box<dyn FnMut() + Send>, cancelled: &AtomicBool) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| task())) {
            Ok(()) => true,
            Err(payload) => {
                error!(
                    "{}: periodic task panicked and will not run again: {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
                cancelled.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Cancel periodic tasks and run one-shots due by `deadline`.
    /// Returns how many one-shots were discarded.
    fn drain(&mut self, deadline: Instant) -> usize {
        let mut discarded = 0;
        while let Some(entry) = self.queue.pop() {
            match entry.work {
                Work::Once(job) => {
                    if entry.cancelled.load(Ordering::Acquire) {
                        continue;
                    }
                    if entry.due > deadline || Instant::now() > deadline {
                        // dropping the job reports Cancelled to its handle
                        drop(job);
                        discarded += 1;
                        continue;
                    }
                    let wait = entry.due.saturating_duration_since(Instant::now());
                    if !wait.is_zero() {
                        thread::sleep(wait);
                    }
                    job();
                }
                Work::FixedRate { .. } | Work::FixedDelay { .. } => {
                    entry.cancelled.store(true, Ordering::Release);
                }
            }
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn executor() -> ScheduledExecutor {
        ScheduledExecutor::new("sched")
            .unwrap()
            .with_grace_period(Duration::from_secs(5))
    }

    #[test]
    fn delayed_task_runs_after_its_delay() {
        let executor = executor();
        let begun = Instant::now();
        let handle = executor
            .schedule(Duration::from_millis(30), move || begun.elapsed())
            .unwrap();
        let elapsed = handle.join().unwrap();
        assert!(elapsed >= Duration::from_millis(30));
    }

    #[test]
    fn tasks_run_in_due_order_on_one_thread() {
        let executor = executor();
        let late = executor
            .schedule(Duration::from_millis(40), || {
                (Instant::now(), thread::current().id())
            })
            .unwrap();
        let early = executor
            .schedule(Duration::from_millis(10), || {
                (Instant::now(), thread::current().id())
            })
            .unwrap();

        let (late_at, late_thread) = late.join().unwrap();
        let (early_at, early_thread) = early.join().unwrap();
        assert!(early_at < late_at);
        assert_eq!(early_thread, late_thread);
        assert_ne!(early_thread, thread::current().id());
    }

    #[test]
    fn fixed_rate_runs_repeatedly_until_cancelled() {
        let executor = executor();
        let runs = Arc::new(AtomicUsize::new(0));
        let task = {
            let runs = Arc::clone(&runs);
            executor
                .schedule_at_fixed_rate(Duration::ZERO, Duration::from_millis(5), move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };

        while runs.load(Ordering::SeqCst) < 3 {
            thread::sleep(Duration::from_millis(1));
        }
        task.cancel();
        // let a run that was already in progress finish
        thread::sleep(Duration::from_millis(20));
        let after_cancel = runs.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn periodic_runs_never_overlap() {
        let executor = executor();
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let active = Arc::clone(&active);
            let overlaps = Arc::clone(&overlaps);
            let runs = Arc::clone(&runs);
            let task = executor
                .schedule_with_fixed_delay(Duration::ZERO, Duration::from_millis(1), move || {
                    if active.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(3));
                    active.fetch_sub(1, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            tasks.push(task);
        }

        while runs.load(Ordering::SeqCst) < 10 {
            thread::sleep(Duration::from_millis(1));
        }
        tasks.iter().for_each(ScheduledTask::cancel);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_periodic_task_stops() {
        let executor = executor();
        let runs = Arc::new(AtomicUsize::new(0));
        let task = {
            let runs = Arc::clone(&runs);
            executor
                .schedule_with_fixed_delay(Duration::ZERO, Duration::from_millis(1), move || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    panic!("sweep failed");
                })
                .unwrap()
        };

        while !task.is_cancelled() {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // the scheduler thread itself survives
        let handle = executor.schedule(Duration::ZERO, || "alive").unwrap();
        assert_eq!(handle.join(), Ok("alive"));
    }

    #[test]
    fn shutdown_runs_pending_one_shots_and_cancels_periodic() {
        let executor = executor();
        let periodic = executor
            .schedule_at_fixed_rate(Duration::from_secs(3600), Duration::from_secs(1), || {})
            .unwrap();
        let soon = executor
            .schedule(Duration::from_millis(10), || "ran")
            .unwrap();

        assert_eq!(
            executor.shutdown(Duration::from_secs(5)),
            ShutdownOutcome::Graceful
        );
        assert_eq!(soon.join(), Ok("ran"));
        assert!(periodic.is_cancelled());
    }

    #[test]
    fn shutdown_discards_one_shots_beyond_the_grace() {
        let executor = executor();
        let far = executor
            .schedule(Duration::from_secs(3600), || "never")
            .unwrap();

        assert_eq!(
            executor.shutdown(Duration::from_millis(10)),
            ShutdownOutcome::Forced { discarded: 1 }
        );
        assert_eq!(far.join(), Err(TaskError::Cancelled));
    }

    #[test]
    fn zero_period_is_rejected() {
        let executor = executor();
        assert_eq!(
            executor
                .schedule_at_fixed_rate(Duration::ZERO, Duration::ZERO, || ())
                .unwrap_err(),
            TaskError::ZeroPeriod
        );
        assert_eq!(
            executor
                .schedule_with_fixed_delay(Duration::ZERO, Duration::ZERO, || ())
                .unwrap_err(),
            TaskError::ZeroPeriod
        );

        let handle = executor.schedule(Duration::ZERO, || "ran").unwrap();
        assert_eq!(handle.join_timeout(Duration::from_secs(1)), Ok("ran"));
        assert_eq!(
            executor.shutdown(Duration::from_millis(200)),
            ShutdownOutcome::Graceful
        );
    }

    #[test]
    fn overdue_fixed_rate_task_does_not_starve_other_work() {
        let executor = executor();
        // every run takes longer than the period, so the schedule never catches up
        let task = executor
            .schedule_at_fixed_rate(Duration::ZERO, Duration::from_micros(1), || {
                thread::sleep(Duration::from_millis(1));
            })
            .unwrap();
        thread::sleep(Duration::from_millis(10));

        let handle = executor.schedule(Duration::ZERO, || "ran").unwrap();
        assert_eq!(handle.join_timeout(Duration::from_secs(1)), Ok("ran"));
        task.cancel();
        assert_eq!(
            executor.shutdown(Duration::from_millis(200)),
            ShutdownOutcome::Graceful
        );
    }

    #[test]
    fn dead_scheduler_thread_makes_shutdown_incomplete() {
        let (commands, inbox) = flume::unbounded::<Command>();
        let worker = thread::spawn(move || drop(inbox));
        while !worker.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        let executor = ScheduledExecutor {
            name: "dead".to_string(),
            grace_period: Duration::from_secs(5),
            commands,
            state: Mutex::new(State {
                accepting: true,
                next_seq: 0,
                outcome: None,
            }),
            shutdown_serial: Mutex::new(()),
            worker: Mutex::new(Some(worker)),
        };

        assert_eq!(
            executor.shutdown(Duration::from_millis(50)),
            ShutdownOutcome::Incomplete { stuck_workers: 0 }
        );
        assert!(lock(&executor.worker).is_none());
    }

    #[test]
    fn rejects_after_shutdown() {
        let executor = executor();
        executor.shutdown(Duration::ZERO);
        assert!(executor.is_shutdown());
        assert!(matches!(
            executor.schedule(Duration::ZERO, || ()),
            Err(TaskError::Rejected { .. })
        ));
        assert!(matches!(
            executor.schedule_at_fixed_rate(Duration::ZERO, Duration::from_secs(1), || ()),
            Err(TaskError::Rejected { .. })
        ));
    }
}
