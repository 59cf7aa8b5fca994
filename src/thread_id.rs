//! Per-thread identity for server threads.
//!
//! Every event loop thread records what kind of thread it is and its name
//! in thread-local storage at startup, so log lines, assertions and
//! diagnostics can tell a worker from a storage or utility thread.

use std::cell::RefCell;
use std::fmt;

/// Classification of a server thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ThreadType {
    /// Thread never identified itself.
    #[default]
    Unknown,
    /// Worker thread running client and peer message handlers.
    Worker,
    /// Worker dedicated to background work (rebuilding, trimming).
    BackgroundWorker,
    /// Storage I/O thread.
    Storage,
    /// Anything else (admin, stats, watchdogs).
    Utility,
}

impl fmt::Display for ThreadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThreadType::Unknown => "unknown",
            ThreadType::Worker => "worker",
            ThreadType::BackgroundWorker => "background-worker",
            ThreadType::Storage => "storage",
            ThreadType::Utility => "utility",
        };
        f.write_str(s)
    }
}

thread_local! {
    static IDENTITY: RefCell<Option<(ThreadType, String)>> = const { RefCell::new(None) };
}

/// Record the identity of the calling thread.
pub fn set(thread_type: ThreadType, name: &str) {
    IDENTITY.with(|id| *id.borrow_mut() = Some((thread_type, name.to_string())));
}

/// Forget the identity of the calling thread.
pub fn clear() {
    IDENTITY.with(|id| *id.borrow_mut() = None);
}

/// Type of the calling thread, `Unknown` if it never called [`set`].
pub fn current_type() -> ThreadType {
    IDENTITY.with(|id| id.borrow().as_ref().map(|(t, _)| *t).unwrap_or_default())
}

/// Name of the calling thread, if it identified itself.
pub fn current_name() -> Option<String> {
    IDENTITY.with(|id| id.borrow().as_ref().map(|(_, n)| n.clone()))
}

/// Kernel thread id of the calling thread.
#[cfg(target_os = "linux")]
pub fn gettid() -> Option<i32> {
    // SAFETY: gettid takes no arguments and cannot fail.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    Some(tid as i32)
}

/// Kernel thread id of the calling thread.
#[cfg(not(target_os = "linux"))]
pub fn gettid() -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_thread_local() {
        set(ThreadType::Storage, "S3");
        assert_eq!(current_type(), ThreadType::Storage);
        assert_eq!(current_name().as_deref(), Some("S3"));

        let other = std::thread::spawn(|| (current_type(), current_name()))
            .join()
            .unwrap();
        assert_eq!(other, (ThreadType::Unknown, None));

        clear();
        assert_eq!(current_type(), ThreadType::Unknown);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_gettid_differs_across_threads() {
        let here = gettid().unwrap();
        let there = std::thread::spawn(|| gettid().unwrap()).join().unwrap();
        assert!(here > 0);
        assert_ne!(here, there);
    }
}
