//! Per-worker event loop runtime.
//!
//! Each worker owns an [`EventLoop`]: a dedicated OS thread running a
//! single-threaded mio reactor. The pieces:
//! - `TaskQueue`: bounded, priority-aware queue other threads post work through
//! - `TimeoutMap`: cache of common timer durations
//! - `Reactor`: timers, I/O readiness callbacks and task draining
//! - `Disposer`: loop-affine payload disposal tracked by tickets

mod disposer;
mod error;
mod event_loop;
mod reactor;
mod registry;
mod task_queue;
mod timeout_map;

pub use disposer::{DisposalCounter, DisposalTicket, Disposer, ZeroCopyPayload};
pub use error::{InitError, QueueError};
pub use event_loop::{
    EventLoop, EventLoopOptions, LoopHandle, DEFAULT_DELAY_CHECK_INTERVAL,
    DEFAULT_MAX_IO_HANDLERS, DEFAULT_TASK_QUEUE_CAPACITY,
};
pub use reactor::{IoToken, Reactor, Task, TimerId};
pub use task_queue::{
    AddError, Priority, TaskQueue, DEFAULT_REQUESTS_PER_ITERATION, NUM_PRIORITIES,
};
pub use timeout_map::{Timeout, TimeoutMap, MAX_FAST_TIMEOUTS};
