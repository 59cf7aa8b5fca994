//! Cross-thread task queue feeding an event loop.
//!
//! Any thread may hand work to the loop through [`TaskQueue::add_with_priority`];
//! the loop thread drains it between poll iterations. Each priority has its own
//! bounded lane and its own per-iteration budget, so a flood of low priority
//! work cannot hold back high priority work and a busy lane cannot stall I/O
//! callbacks for more than `budget` tasks.
//!
//! ## Capacity policy
//!
//! Submission never blocks. A full lane rejects with [`QueueError::Full`] and
//! the task is handed back to the caller inside [`AddError`].
//!
//! Disposals have a lane of their own that is not bounded by capacity and is
//! drained in full every iteration, ahead of the priority lanes. Releasing a
//! payload on its loop must not fail just because the loop is busy.
//!
//! ## Shutdown
//!
//! [`TaskQueue::shutdown`] flips the queue closed under an exclusive lock, so
//! once it returns no producer can still be midway through an accepted add.
//! Everything accepted before that point is run by [`TaskQueue::drain_all`]
//! before the loop exits.

use super::error::{InitError, QueueError};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use mio::Waker;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, trace};

/// Number of priority lanes.
pub const NUM_PRIORITIES: usize = 3;

/// Default number of tasks run per lane per loop iteration (High, Medium, Low).
pub const DEFAULT_REQUESTS_PER_ITERATION: [u32; NUM_PRIORITIES] = [13, 3, 1];

/// Priority of a task submitted to a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; NUM_PRIORITIES] = [Priority::High, Priority::Medium, Priority::Low];

    fn lane(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// A rejected submission. Carries the task back to the caller.
pub struct AddError<T> {
    pub kind: QueueError,
    pub task: T,
}

impl<T> AddError<T> {
    pub fn into_inner(self) -> T {
        self.task
    }
}

impl<T> fmt::Debug for AddError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddError").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl<T> fmt::Display for AddError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl<T> std::error::Error for AddError<T> {}

struct Lane<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

/// Bounded, priority-aware, multi-producer queue drained by a single loop thread.
pub struct TaskQueue<T> {
    lanes: [Lane<T>; NUM_PRIORITIES],
    /// Unbounded; only closed by shutdown.
    disposals: Lane<T>,
    budgets: [u32; NUM_PRIORITIES],
    capacity: usize,
    /// Held shared by producers while they add; taken exclusively to close.
    closed: RwLock<bool>,
    /// Mirror of `closed` the loop can poll without locking.
    shutdown: AtomicBool,
    /// Set by producers when the loop still has to be woken for new work.
    notified: AtomicBool,
    waker: Arc<Waker>,
}

impl<T> TaskQueue<T> {
    /// Create a queue whose lanes hold at most `capacity` tasks each.
    pub fn new(
        waker: Arc<Waker>,
        capacity: usize,
        requests_per_iteration: [u32; NUM_PRIORITIES],
    ) -> Result<Self, InitError> {
        if capacity == 0 {
            return Err(InitError::Internal("task queue capacity must be positive".into()));
        }
        if let Some(idx) = requests_per_iteration.iter().position(|&b| b == 0) {
            return Err(InitError::Internal(format!(
                "requests per iteration for {:?} must be positive",
                Priority::ALL[idx]
            )));
        }

        let lanes = std::array::from_fn(|_| {
            let (tx, rx) = crossbeam_channel::bounded(capacity);
            Lane { tx, rx }
        });

        let (tx, rx) = crossbeam_channel::unbounded();

        Ok(Self {
            lanes,
            disposals: Lane { tx, rx },
            budgets: requests_per_iteration,
            capacity,
            closed: RwLock::new(false),
            shutdown: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            waker,
        })
    }

    /// Submit at `Priority::Low`.
    pub fn add(&self, task: T) -> Result<(), AddError<T>> {
        self.add_with_priority(task, Priority::Low)
    }

    /// Submit a task for the loop thread. Never blocks.
    pub fn add_with_priority(&self, task: T, priority: Priority) -> Result<(), AddError<T>> {
        self.push(&self.lanes[priority.lane()], task)
    }

    /// Submit a disposal. Ignores capacity, so it only fails after shutdown.
    pub fn add_disposal(&self, task: T) -> Result<(), AddError<T>> {
        self.push(&self.disposals, task)
    }

    fn push(&self, lane: &Lane<T>, task: T) -> Result<(), AddError<T>> {
        let closed = self.closed.read().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return Err(AddError {
                kind: QueueError::Shutdown,
                task,
            });
        }

        match lane.tx.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                return Err(AddError {
                    kind: QueueError::Full,
                    task,
                })
            }
            Err(TrySendError::Disconnected(task)) => {
                return Err(AddError {
                    kind: QueueError::Shutdown,
                    task,
                })
            }
        }
        drop(closed);

        if !self.notified.swap(true, Ordering::AcqRel) {
            self.wake();
        }
        Ok(())
    }

    /// Stop accepting tasks and wake the loop so it can drain and exit.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        let mut closed = self.closed.write().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return;
        }
        *closed = true;
        self.shutdown.store(true, Ordering::Release);
        drop(closed);

        trace!("task queue shut down");
        self.wake();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Run up to one budget of tasks per lane, highest priority first.
    ///
    /// Returns true if work is left over, in which case the loop must not
    /// block in its next poll.
    pub fn drain(&self, mut run: impl FnMut(T)) -> bool {
        self.notified.swap(false, Ordering::AcqRel);

        // Only what is queued now, so a disposal posting another cannot spin.
        for _ in 0..self.disposals.rx.len() {
            match self.disposals.rx.try_recv() {
                Ok(task) => run(task),
                Err(_) => break,
            }
        }

        for (lane, &budget) in self.lanes.iter().zip(self.budgets.iter()) {
            for _ in 0..budget {
                match lane.rx.try_recv() {
                    Ok(task) => run(task),
                    Err(_) => break,
                }
            }
        }

        !self.disposals.rx.is_empty() || self.lanes.iter().any(|lane| !lane.rx.is_empty())
    }

    /// Run everything currently queued, ignoring budgets. Used once the queue
    /// is shut down, when nothing new can arrive.
    pub fn drain_all(&self, mut run: impl FnMut(T)) -> usize {
        let mut count = 0;
        loop {
            let mut ran = false;
            for lane in std::iter::once(&self.disposals).chain(&self.lanes) {
                while let Ok(task) = lane.rx.try_recv() {
                    run(task);
                    count += 1;
                    ran = true;
                }
            }
            if !ran {
                return count;
            }
        }
    }

    /// Tasks currently queued across all lanes, disposals included.
    pub fn len(&self) -> usize {
        self.disposals.rx.len() + self.lanes.iter().map(|lane| lane.rx.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-lane capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake event loop");
        }
    }
}
