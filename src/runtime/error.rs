//! Error types shared by the runtime.

use std::io;
use thiserror::Error;

/// Why an event loop could not be constructed.
///
/// Construction either yields a running loop or one of these; no partially
/// initialized loop is ever handed out.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InitError {
    /// The poller or one of its buffers could not be allocated.
    #[error("out of memory while initializing event loop")]
    NoMem,
    /// A process or system resource limit was hit (file descriptors, threads).
    #[error("system resource limit reached while initializing event loop: {0}")]
    SysLimit(String),
    /// Anything else, including invalid loop options.
    #[error("internal error while initializing event loop: {0}")]
    Internal(String),
}

impl InitError {
    /// Classify an OS error raised while creating the poller or spawning the
    /// loop thread.
    pub fn from_io(e: &io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::ENOMEM) => InitError::NoMem,
            Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::EAGAIN) => {
                InitError::SysLimit(e.to_string())
            }
            _ if e.kind() == io::ErrorKind::OutOfMemory => InitError::NoMem,
            _ => InitError::Internal(e.to_string()),
        }
    }
}

/// Why a task was not accepted by a task queue.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The lane for the requested priority is at capacity.
    #[error("task queue is full")]
    Full,
    /// Shutdown was requested; the queue accepts nothing anymore.
    #[error("task queue is shut down")]
    Shutdown,
}
