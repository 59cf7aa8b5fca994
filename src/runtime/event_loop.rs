//! Event loop: one OS thread running one reactor.
//!
//! `EventLoop::new` spawns the thread and blocks until the thread reports
//! whether its reactor and task queue came up. Once running, other threads
//! talk to the loop only through [`LoopHandle`]: posting tasks, disposing
//! payloads, reading counters. Dropping the `EventLoop` shuts the task queue
//! down, which makes the loop run what is left and exit, then joins the
//! thread.
//!
//! ## Delay check
//!
//! Every loop runs a self-monitoring timer. Each firing alternates between
//! opening a window (note the time, re-arm with the zero timeout) and closing
//! it (add the time it took the reactor to come back around to `delay_us`,
//! re-arm with the full interval). An idle loop comes back almost at once; a
//! loop busy with callbacks and tasks accumulates delay.

use super::disposer::{DisposalCounter, Disposer};
use super::error::{InitError, QueueError};
use super::reactor::{Reactor, Task, TimerId};
use super::task_queue::{
    AddError, Priority, TaskQueue, DEFAULT_REQUESTS_PER_ITERATION, NUM_PRIORITIES,
};
use crate::thread_id::{self, ThreadType};
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Default pending tasks per priority lane.
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 1024;

/// Default delay check interval.
pub const DEFAULT_DELAY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Default limit on registered I/O sources per loop.
pub const DEFAULT_MAX_IO_HANDLERS: usize = 10_000;

thread_local! {
    static CURRENT: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
}

/// Construction options for an [`EventLoop`].
#[derive(Debug, Clone)]
pub struct EventLoopOptions {
    /// Thread name, also used as the loop's label in logs.
    pub thread_name: String,
    pub thread_type: ThreadType,
    /// Pending tasks allowed per priority lane.
    pub task_queue_capacity: usize,
    /// When false every task goes to the high priority lane.
    pub enable_priority_queues: bool,
    /// Tasks run per lane per iteration (High, Medium, Low).
    pub requests_per_iteration: [u32; NUM_PRIORITIES],
    pub delay_check_interval: Duration,
    pub max_io_handlers: usize,
}

impl EventLoopOptions {
    pub fn new(thread_name: impl Into<String>, thread_type: ThreadType) -> Self {
        Self {
            thread_name: thread_name.into(),
            thread_type,
            ..Self::default()
        }
    }
}

impl Default for EventLoopOptions {
    fn default() -> Self {
        Self {
            thread_name: "event-loop".to_string(),
            thread_type: ThreadType::Unknown,
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
            enable_priority_queues: true,
            requests_per_iteration: DEFAULT_REQUESTS_PER_ITERATION,
            delay_check_interval: DEFAULT_DELAY_CHECK_INTERVAL,
            max_io_handlers: DEFAULT_MAX_IO_HANDLERS,
        }
    }
}

/// State shared between the loop thread and its handles.
struct LoopShared {
    name: String,
    thread_type: ThreadType,
    thread_id: ThreadId,
    tid: Option<i32>,
    queue: TaskQueue<Task>,
    priority_queues_enabled: bool,
    delay_us: AtomicU64,
    disposals: DisposalCounter,
}

/// Cloneable, thread-safe handle to a running loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn thread_type(&self) -> ThreadType {
        self.shared.thread_type
    }

    /// Kernel thread id of the loop thread (Linux only).
    pub fn tid(&self) -> Option<i32> {
        self.shared.tid
    }

    /// Whether the caller is running on this loop's thread.
    pub fn on_this_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Cumulative scheduling delay observed by the delay check, in microseconds.
    pub fn delay_us(&self) -> u64 {
        self.shared.delay_us.load(Ordering::Relaxed)
    }

    pub fn priority_queues_enabled(&self) -> bool {
        self.shared.priority_queues_enabled
    }

    /// Tasks waiting in the queue.
    pub fn pending_tasks(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.queue.is_shutdown()
    }

    /// Run `task` on the loop thread at low priority.
    pub fn post<F>(&self, task: F) -> Result<(), QueueError>
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.post_with_priority(task, Priority::Low)
    }

    /// Run `task` on the loop thread at `priority`.
    ///
    /// Fails without blocking when the lane is full or the loop is shutting
    /// down; the task is dropped in that case.
    pub fn post_with_priority<F>(&self, task: F, priority: Priority) -> Result<(), QueueError>
    where
        F: FnOnce(&mut Reactor) + Send + 'static,
    {
        self.submit(Box::new(task), priority).map_err(|e| e.kind)
    }

    /// Run `task` inline if called on the loop thread, otherwise post it.
    pub fn execute<F>(&self, task: F) -> Result<(), QueueError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.on_this_thread() {
            task();
            Ok(())
        } else {
            self.post_with_priority(move |_| task(), Priority::Medium)
        }
    }

    /// Release `payload` on this loop. See [`Disposer::dispose`].
    pub fn dispose<P: Send + 'static>(&self, payload: P) {
        self.disposer().dispose(payload)
    }

    pub fn disposer(&self) -> Disposer {
        Disposer::new(self.clone())
    }

    /// Disposals posted to this loop and not yet run.
    pub fn outstanding_disposals(&self) -> usize {
        self.shared.disposals.outstanding()
    }

    pub(crate) fn disposals(&self) -> &DisposalCounter {
        &self.shared.disposals
    }

    pub(crate) fn submit_disposal(&self, task: Task) -> Result<(), AddError<Task>> {
        self.shared.queue.add_disposal(task)
    }

    pub(crate) fn submit(&self, task: Task, priority: Priority) -> Result<(), AddError<Task>> {
        let priority = if self.shared.priority_queues_enabled {
            priority
        } else {
            Priority::High
        };
        self.shared.queue.add_with_priority(task, priority)
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.shared.name)
            .field("thread_type", &self.shared.thread_type)
            .field("tid", &self.shared.tid)
            .finish()
    }
}

/// Owner of an event loop thread.
pub struct EventLoop {
    handle: LoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Spawn the loop thread and wait for it to initialize.
    pub fn new(options: EventLoopOptions) -> Result<Self, InitError> {
        Self::start(options, Reactor::new)
    }

    /// `new` with the reactor built by `make_reactor` on the loop thread.
    fn start(
        options: EventLoopOptions,
        make_reactor: fn(usize) -> io::Result<Reactor>,
    ) -> Result<Self, InitError> {
        let (init_tx, init_rx) = crossbeam_channel::bounded(1);
        let name = options.thread_name.clone();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let interval = options.delay_check_interval;
                match init(&options, make_reactor) {
                    Ok((reactor, shared)) => {
                        let _ = init_tx.send(Ok(Arc::clone(&shared)));
                        run(reactor, shared, interval);
                    }
                    Err(e) => {
                        thread_id::clear();
                        let _ = init_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| InitError::from_io(&e))?;

        match init_rx.recv() {
            Ok(Ok(shared)) => Ok(Self {
                handle: LoopHandle { shared },
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                error!(event_loop = %name, error = %e, "Failed to initialize event loop");
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(InitError::Internal(format!(
                    "event loop thread {name} exited during initialization"
                )))
            }
        }
    }

    /// Handle to the loop running on the calling thread, if any.
    pub fn current() -> Option<LoopHandle> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }
}

impl Deref for EventLoop {
    type Target = LoopHandle;

    fn deref(&self) -> &LoopHandle {
        &self.handle
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventLoop").field(&self.handle).finish()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if thread::panicking() {
            self.handle.shared.queue.shutdown();
            return;
        }

        let outstanding = self.handle.outstanding_disposals();
        assert_eq!(
            outstanding, 0,
            "event loop {} dropped with {} outstanding disposals",
            self.handle.shared.name, outstanding
        );
        debug_assert!(
            !self.handle.on_this_thread(),
            "event loop dropped from its own thread"
        );

        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle.shared.queue.shutdown();
        if thread.join().is_err() {
            error!(event_loop = %self.handle.shared.name, "Event loop thread panicked");
        }
    }
}

/// Runs on the new thread: build everything the loop needs.
fn init(
    options: &EventLoopOptions,
    make_reactor: fn(usize) -> io::Result<Reactor>,
) -> Result<(Reactor, Arc<LoopShared>), InitError> {
    thread_id::set(options.thread_type, &options.thread_name);

    if options.delay_check_interval.is_zero() {
        return Err(InitError::Internal("delay check interval must be positive".into()));
    }

    let reactor = make_reactor(options.max_io_handlers).map_err(|e| {
        error!(event_loop = %options.thread_name, error = %e, "Failed to create poller");
        InitError::from_io(&e)
    })?;
    let queue = TaskQueue::new(
        reactor.waker(),
        options.task_queue_capacity,
        options.requests_per_iteration,
    )?;

    let shared = Arc::new(LoopShared {
        name: options.thread_name.clone(),
        thread_type: options.thread_type,
        thread_id: thread::current().id(),
        tid: thread_id::gettid(),
        queue,
        priority_queues_enabled: options.enable_priority_queues,
        delay_us: AtomicU64::new(0),
        disposals: DisposalCounter::new(),
    });
    Ok((reactor, shared))
}

/// Sets the thread-local current loop for as long as it lives.
struct CurrentGuard;

impl CurrentGuard {
    fn enter(handle: LoopHandle) -> Self {
        CURRENT.with(|c| *c.borrow_mut() = Some(handle));
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.borrow_mut().take());
        thread_id::clear();
    }
}

/// Runs on the loop thread until the task queue is shut down.
fn run(mut reactor: Reactor, shared: Arc<LoopShared>, interval: Duration) {
    let _current = CurrentGuard::enter(LoopHandle {
        shared: Arc::clone(&shared),
    });

    shared.delay_us.store(0, Ordering::Relaxed);
    let delay_check = start_delay_check(&mut reactor, Arc::clone(&shared), interval);

    info!(
        event_loop = %shared.name,
        thread_type = %shared.thread_type,
        tid = ?shared.tid,
        "Event loop started"
    );

    if let Err(e) = reactor.run(&shared.queue) {
        error!(event_loop = %shared.name, error = %e, "Event loop exited abnormally");
        debug_assert!(false, "event loop {} poll failed: {e}", shared.name);
    }

    reactor.free_timer(delay_check);
    debug!(
        event_loop = %shared.name,
        iterations = reactor.iterations(),
        timers_fired = reactor.timers_fired(),
        "Releasing reactor"
    );
    drop(reactor);

    info!(
        event_loop = %shared.name,
        delay_us = shared.delay_us.load(Ordering::Relaxed),
        "Event loop stopped"
    );
}

fn start_delay_check(
    reactor: &mut Reactor,
    shared: Arc<LoopShared>,
    interval: Duration,
) -> TimerId {
    let mut window_start: Option<Instant> = None;

    let timer = reactor.new_timer(move |r, me| {
        let now = Instant::now();
        match window_start.take() {
            Some(start) => {
                let full = r.common_timeout(interval);
                r.arm(me, &full);
                if now > start {
                    let delay = now.duration_since(start).as_micros() as u64;
                    shared.delay_us.fetch_add(delay, Ordering::Relaxed);
                }
            }
            None => {
                let zero = r.zero_timeout();
                r.arm(me, &zero);
                window_start = Some(now);
            }
        }
    });

    let full = reactor.common_timeout(interval);
    reactor.arm(timer, &full);
    timer
}
