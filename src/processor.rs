//! Worker pool and entry point for inbound messages.
//!
//! A `Processor` owns one [`EventLoop`] per worker, the shared settings and
//! the dispatch gate. Messages are routed to a worker by sender address, so
//! all traffic from one connection is handled on the same thread.

use crate::dispatch::{
    Address, Disposition, Message, PermissionChecker, PrincipalIdentity, ServerMessageDispatch,
};
use crate::runtime::{EventLoop, InitError, LoopHandle};
use crate::settings::{Settings, SettingsHandle};
use crate::thread_id::ThreadType;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Processor {
    workers: Vec<EventLoop>,
    settings: SettingsHandle,
    dispatch: ServerMessageDispatch,
}

impl Processor {
    /// Start `num_workers` worker loops from the current settings.
    ///
    /// If any worker fails to start, the ones already running are shut down
    /// and the error is returned.
    pub fn new(
        settings: SettingsHandle,
        checker: Option<Arc<dyn PermissionChecker>>,
    ) -> Result<Self, InitError> {
        let snapshot = settings.load();
        if snapshot.num_workers == 0 {
            return Err(InitError::Internal("num_workers must be positive".into()));
        }

        info!(
            workers = snapshot.num_workers,
            task_queue_capacity = snapshot.task_queue_capacity,
            priority_queues = snapshot.enable_priority_queues,
            enforced_types = snapshot.require_permission_message_types.len(),
            acl = checker.is_some(),
            "Starting processor"
        );

        let mut workers = Vec::with_capacity(snapshot.num_workers);
        for idx in 0..snapshot.num_workers {
            let options = snapshot.event_loop_options(format!("W{idx}"), ThreadType::Worker);
            workers.push(EventLoop::new(options)?);
        }

        Ok(Self {
            workers,
            dispatch: ServerMessageDispatch::new(settings.clone(), checker),
            settings,
        })
    }

    pub fn worker(&self, idx: usize) -> Option<&EventLoop> {
        self.workers.get(idx)
    }

    pub fn workers(&self) -> &[EventLoop] {
        &self.workers
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Worker that owns traffic from `from`.
    pub fn worker_for(&self, from: &Address) -> &EventLoop {
        let idx = match *from {
            Address::Client(id) => id as usize,
            Address::Node(idx) => idx as usize,
            Address::Invalid => 0,
        };
        &self.workers[idx % self.workers.len()]
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// Swap in new settings. Enforcement changes apply to the next message;
    /// event loop options only apply to loops started afterwards.
    pub fn update_settings(&self, settings: Settings) {
        if settings.num_workers != self.workers.len() {
            warn!(
                running = self.workers.len(),
                requested = settings.num_workers,
                "Worker count changes take effect on restart"
            );
        }
        self.settings.update(settings);
    }

    pub fn dispatch(&self) -> &ServerMessageDispatch {
        &self.dispatch
    }

    /// Authorize `message` and hand it to the worker owning `from`.
    pub fn on_received(
        &self,
        message: Box<dyn Message>,
        from: Address,
        principal: &PrincipalIdentity,
    ) -> Disposition {
        let worker: LoopHandle = self.worker_for(&from).handle();
        self.dispatch.on_received(message, from, principal, &worker)
    }

    /// Sum of the scheduling delay measured on every worker.
    pub fn total_delay_us(&self) -> u64 {
        self.workers.iter().map(|w| w.delay_us()).sum()
    }

    /// Stop every worker, one at a time.
    pub fn shutdown(self) {
        let Processor { workers, .. } = self;
        for worker in workers {
            let name = worker.name().to_string();
            drop(worker);
            info!(worker = %name, "Worker stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Action, MessageType, PermissionParams, Principal};
    use crossbeam_channel::{bounded, Sender};

    struct RoutedMessage {
        params: PermissionParams,
        tx: Sender<String>,
    }

    impl Message for RoutedMessage {
        fn message_type(&self) -> MessageType {
            MessageType::Append
        }

        fn permission_params(&self) -> PermissionParams {
            self.params
        }

        fn on_received(self: Box<Self>, _from: Address) -> Disposition {
            let name = EventLoop::current()
                .map(|h| h.name().to_string())
                .unwrap_or_default();
            let _ = self.tx.send(name);
            Disposition::Normal
        }
    }

    fn settings(workers: usize) -> SettingsHandle {
        SettingsHandle::new(Settings {
            num_workers: workers,
            task_queue_capacity: 16,
            ..Settings::default()
        })
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            Processor::new(settings(0), None),
            Err(InitError::Internal(_))
        ));
    }

    #[test]
    fn test_workers_are_named_and_typed() {
        let processor = Processor::new(settings(3), None).unwrap();
        assert_eq!(processor.worker_count(), 3);
        let names: Vec<_> = processor.workers().iter().map(|w| w.name().to_string()).collect();
        assert_eq!(names, vec!["W0", "W1", "W2"]);
        assert!(processor
            .workers()
            .iter()
            .all(|w| w.thread_type() == ThreadType::Worker));
        assert!(processor.worker(3).is_none());
        processor.shutdown();
    }

    #[test]
    fn test_messages_routed_by_sender() {
        let processor = Processor::new(settings(2), None).unwrap();
        let (tx, rx) = bounded(4);
        let principal = PrincipalIdentity::new(Principal::Authenticated);

        let routes = [
            (Address::Client(4), "W0"),
            (Address::Client(7), "W1"),
            (Address::Node(1), "W1"),
        ];
        for (from, expected) in routes {
            let message = RoutedMessage {
                params: PermissionParams::unchecked(Action::Append),
                tx: tx.clone(),
            };
            assert_eq!(
                processor.on_received(Box::new(message), from, &principal),
                Disposition::Normal
            );
            assert_eq!(rx.recv().unwrap(), expected);
        }
        processor.shutdown();
    }

    #[test]
    fn test_update_settings_changes_enforcement() {
        let processor = Processor::new(settings(1), None).unwrap();
        let (tx, rx) = bounded(1);
        let principal = PrincipalIdentity::new(Principal::Authenticated);

        let mut next = (*processor.settings().load()).clone();
        next.require_permission_message_types.insert(MessageType::Append);
        processor.update_settings(next);

        let message = RoutedMessage {
            params: PermissionParams::required(Action::Append),
            tx,
        };
        assert_eq!(
            processor.on_received(Box::new(message), Address::Client(1), &principal),
            Disposition::Error
        );
        assert!(rx.recv().is_err());
        assert_eq!(processor.dispatch().stats().snapshot().denied, 1);
        processor.shutdown();
    }

    #[test]
    fn test_total_delay_starts_low() {
        let processor = Processor::new(settings(2), None).unwrap();
        // Nothing has kept the workers busy yet.
        assert!(processor.total_delay_us() < 1_000_000);
        processor.shutdown();
    }
}
