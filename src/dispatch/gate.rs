//! Permission gate in front of every inbound message.
//!
//! `authorize` applies, strictly in this order:
//! 1. message type not in `require_permission_message_types` → pass
//! 2. instance does not require permission → pass
//! 3. sender is a cluster node → pass
//! 4. action is `ServerInternal` → reject
//! 5. ask the permission checker; anything but `Allowed` → reject
//!
//! Without a configured checker step 5 rejects. Cluster nodes are decided at
//! step 3, so a missing or broken checker never blocks internal traffic, and
//! no checker can open internal operations to anyone else.

use super::message::{Address, Disposition, Message, MessageType};
use super::permission::{Action, PermissionCheckResult, PermissionChecker, PermissionParams};
use super::principal::PrincipalIdentity;
use crate::runtime::{LoopHandle, Priority};
use crate::settings::SettingsHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Counters of gate decisions.
#[derive(Debug, Default)]
pub struct DispatchStats {
    passed_unlisted: AtomicU64,
    passed_unchecked: AtomicU64,
    passed_cluster_node: AtomicU64,
    allowed: AtomicU64,
    denied: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounts {
    pub passed_unlisted: u64,
    pub passed_unchecked: u64,
    pub passed_cluster_node: u64,
    pub allowed: u64,
    pub denied: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchCounts {
        DispatchCounts {
            passed_unlisted: self.passed_unlisted.load(Ordering::Relaxed),
            passed_unchecked: self.passed_unchecked.load(Ordering::Relaxed),
            passed_cluster_node: self.passed_cluster_node.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Server-side message dispatch.
pub struct ServerMessageDispatch {
    settings: SettingsHandle,
    checker: Option<Arc<dyn PermissionChecker>>,
    stats: DispatchStats,
}

impl ServerMessageDispatch {
    pub fn new(settings: SettingsHandle, checker: Option<Arc<dyn PermissionChecker>>) -> Self {
        Self {
            settings,
            checker,
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Decide whether `message` from `principal` may be processed.
    ///
    /// Reads one settings snapshot and mutates nothing but the counters, so
    /// the same inputs under the same settings always give the same answer.
    pub fn authorize(
        &self,
        message: &dyn Message,
        from: &Address,
        principal: &PrincipalIdentity,
    ) -> Disposition {
        let settings = self.settings.load();
        let message_type = message.message_type();

        if !settings.requires_permission(message_type) {
            DispatchStats::bump(&self.stats.passed_unlisted);
            return Disposition::Normal;
        }

        let params = message.permission_params();
        if !params.requires_permission {
            DispatchStats::bump(&self.stats.passed_unchecked);
            return Disposition::Normal;
        }

        if principal.is_cluster_node() {
            DispatchStats::bump(&self.stats.passed_cluster_node);
            trace!(%message_type, %from, "Cluster node bypasses permission check");
            return Disposition::Normal;
        }

        if params.action == Action::ServerInternal {
            return self.deny(message_type, &params, from, principal, PermissionCheckResult::Denied);
        }

        let verdict = match &self.checker {
            Some(checker) => checker.is_allowed(principal, &params),
            None => PermissionCheckResult::NotReady,
        };

        match verdict {
            PermissionCheckResult::Allowed => {
                DispatchStats::bump(&self.stats.allowed);
                Disposition::Normal
            }
            verdict => self.deny(message_type, &params, from, principal, verdict),
        }
    }

    fn deny(
        &self,
        message_type: MessageType,
        params: &PermissionParams,
        from: &Address,
        principal: &PrincipalIdentity,
        verdict: PermissionCheckResult,
    ) -> Disposition {
        DispatchStats::bump(&self.stats.denied);
        warn!(
            %message_type,
            action = %params.action,
            log_id = ?params.log_id,
            %principal,
            %from,
            ?verdict,
            "Permission denied, rejecting message"
        );
        Disposition::Error
    }

    /// Authorize `message` and, if it passes, run its handler on `worker`.
    ///
    /// On the worker's own thread the handler runs inline and its disposition
    /// is returned. From elsewhere it is posted; a worker that cannot take it
    /// makes this return `Error`.
    pub fn on_received(
        &self,
        message: Box<dyn Message>,
        from: Address,
        principal: &PrincipalIdentity,
        worker: &LoopHandle,
    ) -> Disposition {
        if self.authorize(message.as_ref(), &from, principal) == Disposition::Error {
            return Disposition::Error;
        }

        if worker.on_this_thread() {
            return message.on_received(from);
        }

        let message_type = message.message_type();
        let posted = worker.post_with_priority(
            move |_| {
                if message.on_received(from) == Disposition::Error {
                    debug!(%from, "Message handler rejected message");
                }
            },
            Priority::Medium,
        );
        match posted {
            Ok(()) => Disposition::Normal,
            Err(e) => {
                warn!(
                    %message_type,
                    %from,
                    worker = %worker.name(),
                    error = %e,
                    "Worker cannot accept message"
                );
                Disposition::Error
            }
        }
    }
}
