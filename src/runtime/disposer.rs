//! Loop-affine disposal of payloads.
//!
//! Some payloads (zero-copy buffers handed out by a worker, handler state
//! tied to a loop's registrations) must be released on the loop that owns
//! them. Disposing from a foreign thread posts the drop to the loop and
//! holds a [`DisposalTicket`] until it has happened. The loop refuses to be
//! torn down while any ticket is outstanding.

use super::error::QueueError;
use super::event_loop::LoopHandle;
use super::reactor::Task;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Zero-copy buffer shared between a worker and the transport.
pub type ZeroCopyPayload = bytes::Bytes;

/// Count of disposals posted to a loop and not yet run.
#[derive(Debug, Clone, Default)]
pub struct DisposalCounter {
    outstanding: Arc<AtomicUsize>,
}

impl DisposalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a ticket; the count stays raised until the ticket is dropped.
    pub fn ticket(&self) -> DisposalTicket {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        DisposalTicket {
            outstanding: Arc::clone(&self.outstanding),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

/// One in-flight disposal.
#[derive(Debug)]
#[must_use = "the disposal is no longer tracked once the ticket is dropped"]
pub struct DisposalTicket {
    outstanding: Arc<AtomicUsize>,
}

impl Drop for DisposalTicket {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Disposer bound to one event loop.
#[derive(Debug, Clone)]
pub struct Disposer {
    handle: LoopHandle,
}

impl Disposer {
    pub fn new(handle: LoopHandle) -> Self {
        Self { handle }
    }

    /// Release `payload` on the owning loop.
    ///
    /// On the loop thread the payload is dropped right away. From any other
    /// thread the drop is queued on the loop's disposal lane under a ticket;
    /// that lane is not bounded by the task queue capacity, so a busy loop
    /// still gets the payload. Only once the loop has shut down is there
    /// nowhere left to send it, and then it is dropped here.
    pub fn dispose<P: Send + 'static>(&self, payload: P) {
        if self.handle.on_this_thread() {
            drop(payload);
            return;
        }

        let ticket = self.handle.disposals().ticket();
        let task: Task = Box::new(move |_| {
            drop(payload);
            drop(ticket);
        });

        if let Err(e) = self.handle.submit_disposal(task) {
            debug_assert_eq!(e.kind, QueueError::Shutdown);
            warn!(
                event_loop = %self.handle.name(),
                error = %e,
                "Event loop shut down, disposing payload on the calling thread"
            );
            drop(e.into_inner());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_tracks_outstanding() {
        let counter = DisposalCounter::new();
        let a = counter.ticket();
        let b = counter.clone().ticket();
        assert_eq!(counter.outstanding(), 2);

        drop(a);
        assert_eq!(counter.outstanding(), 1);
        drop(b);
        assert_eq!(counter.outstanding(), 0);
    }
}
