//! worker-loop: per-worker event loops and permission-gated message dispatch.
//!
//! - [`runtime`]: one OS thread per [`EventLoop`], each a single-threaded mio
//!   reactor with timers, I/O callbacks and a cross-thread task queue
//! - [`dispatch`]: authorizes inbound messages before their handlers run
//! - [`processor`]: the pool of worker loops plus the gate in front of them
//! - [`config`] / [`settings`]: CLI and TOML loading into swappable snapshots

pub mod config;
pub mod dispatch;
pub mod processor;
pub mod runtime;
pub mod settings;
pub mod thread_id;

pub use processor::Processor;
pub use runtime::{EventLoop, EventLoopOptions, LoopHandle};
pub use settings::{Settings, SettingsHandle};
