//! Server settings snapshots.
//!
//! Settings are immutable once built. A reload builds a new [`Settings`] and
//! swaps it into the [`SettingsHandle`]; readers that already loaded the old
//! snapshot keep using it until they are done, so an authorization never
//! sees half of a reload.

use crate::dispatch::MessageType;
use crate::runtime::{
    EventLoopOptions, DEFAULT_DELAY_CHECK_INTERVAL, DEFAULT_MAX_IO_HANDLERS,
    DEFAULT_REQUESTS_PER_ITERATION, DEFAULT_TASK_QUEUE_CAPACITY, NUM_PRIORITIES,
};
use crate::thread_id::ThreadType;
use arc_swap::ArcSwap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// One immutable view of the server settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Number of worker event loops.
    pub num_workers: usize,
    /// Pending tasks allowed per priority lane of each worker.
    pub task_queue_capacity: usize,
    pub enable_priority_queues: bool,
    /// Tasks run per lane per loop iteration (High, Medium, Low).
    pub requests_per_iteration: [u32; NUM_PRIORITIES],
    pub delay_check_interval: Duration,
    pub max_io_handlers: usize,
    /// Message types the dispatch gate enforces permissions for. Types not
    /// listed are never checked.
    pub require_permission_message_types: BTreeSet<MessageType>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
            enable_priority_queues: true,
            requests_per_iteration: DEFAULT_REQUESTS_PER_ITERATION,
            delay_check_interval: DEFAULT_DELAY_CHECK_INTERVAL,
            max_io_handlers: DEFAULT_MAX_IO_HANDLERS,
            require_permission_message_types: BTreeSet::new(),
        }
    }
}

impl Settings {
    /// Event loop options for a thread built from these settings.
    pub fn event_loop_options(
        &self,
        thread_name: impl Into<String>,
        thread_type: ThreadType,
    ) -> EventLoopOptions {
        EventLoopOptions {
            thread_name: thread_name.into(),
            thread_type,
            task_queue_capacity: self.task_queue_capacity,
            enable_priority_queues: self.enable_priority_queues,
            requests_per_iteration: self.requests_per_iteration,
            delay_check_interval: self.delay_check_interval,
            max_io_handlers: self.max_io_handlers,
        }
    }

    pub fn requires_permission(&self, message_type: MessageType) -> bool {
        self.require_permission_message_types.contains(&message_type)
    }
}

/// Shared, swappable pointer to the current settings.
#[derive(Debug, Clone)]
pub struct SettingsHandle {
    current: Arc<ArcSwap<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(settings)),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<Settings> {
        self.current.load_full()
    }

    /// Replace the snapshot. Readers holding the old one are unaffected.
    pub fn update(&self, settings: Settings) {
        info!(
            enforced_types = settings.require_permission_message_types.len(),
            "Settings updated"
        );
        self.current.store(Arc::new(settings));
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.num_workers >= 1);
        assert!(settings.require_permission_message_types.is_empty());
        assert_eq!(settings.requests_per_iteration, [13, 3, 1]);
        assert_eq!(settings.delay_check_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_update_keeps_loaded_snapshot() {
        let handle = SettingsHandle::default();
        let before = handle.load();

        let mut next = (*before).clone();
        next.require_permission_message_types.insert(MessageType::Trim);
        handle.update(next);

        assert!(!before.requires_permission(MessageType::Trim));
        assert!(handle.load().requires_permission(MessageType::Trim));

        // Clones observe the same updates.
        let other = handle.clone();
        assert!(other.load().requires_permission(MessageType::Trim));
    }

    #[test]
    fn test_event_loop_options_follow_settings() {
        let settings = Settings {
            task_queue_capacity: 8,
            enable_priority_queues: false,
            ..Settings::default()
        };
        let opts = settings.event_loop_options("W3", ThreadType::Worker);
        assert_eq!(opts.thread_name, "W3");
        assert_eq!(opts.task_queue_capacity, 8);
        assert!(!opts.enable_priority_queues);
    }
}
