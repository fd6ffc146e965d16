//! Shutdown protocol shared by the pool and its waiters

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};

/// Default time to wait for tasks at each shutdown phase
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Lifecycle of a pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolPhase {
    /// Accepting tasks
    Running,
    /// No new tasks; queued and running tasks may finish
    Draining,
    /// Queue discarded, cancel token raised
    ForceCancelling,
    Stopped,
}

impl PoolPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolPhase::Running => "running",
            PoolPhase::Draining => "draining",
            PoolPhase::ForceCancelling => "force-cancelling",
            PoolPhase::Stopped => "stopped",
        }
    }
}

impl fmt::Display for PoolPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a shutdown ended. Shutdown never fails; this records what it took.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every task finished within the grace period
    Graceful,
    /// Queued tasks were discarded after the grace period, then workers stopped
    Forced { discarded: usize },
    /// Workers were still busy after forced cancellation and were detached.
    /// Zero stuck workers means the workers had already died and whatever
    /// they held was lost.
    Incomplete { stuck_workers: usize },
    /// The wait was interrupted; cancellation was forced immediately
    Interrupted,
}

impl ShutdownOutcome {
    /// True when nothing had to be cancelled
    #[must_use]
    pub fn is_graceful(&self) -> bool {
        matches!(self, ShutdownOutcome::Graceful)
    }
}

/// `now + grace`, saturating far in the future instead of overflowing
pub(crate) fn deadline_after(grace: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(grace)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

#[derive(Debug)]
pub(crate) enum PoolEvent {
    WorkerExited,
    Interrupted,
}

/// Wakes a thread blocked in a shutdown wait.
///
/// Clones share one flag, and every handle from a pool is a clone of the
/// pool's own, so whoever fired it, any holder can see it. The flag stays
/// raised after the shutdown returns so the interrupted caller can react.
#[derive(Clone, Debug)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    events: Sender<PoolEvent>,
}

impl Interrupt {
    pub(crate) fn new(events: Sender<PoolEvent>) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.events.send(PoolEvent::Interrupted);
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Lower the flag, returning whether it was raised
    pub fn clear(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

/// Sends [`PoolEvent::WorkerExited`] when dropped, including during unwinding
pub(crate) struct ExitNotice(pub(crate) Sender<PoolEvent>);

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.0.send(PoolEvent::WorkerExited);
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitResult {
    AllExited,
    TimedOut,
    Interrupted,
}

/// Wait for `remaining` workers to exit, until `deadline`.
///
/// `remaining` is decremented as exits arrive so a later phase can continue
/// counting where this one stopped.
pub(crate) fn wait_for_exits(
    events: &Receiver<PoolEvent>,
    remaining: &mut usize,
    deadline: Instant,
) -> WaitResult {
    while *remaining > 0 {
        match events.recv_deadline(deadline) {
            Ok(PoolEvent::WorkerExited) => *remaining -= 1,
            Ok(PoolEvent::Interrupted) => return WaitResult::Interrupted,
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                return WaitResult::TimedOut;
            }
        }
    }
    WaitResult::AllExited
}
