//! What a message needs in order to be processed, and the seam to the ACL
//! evaluator that decides whether a principal may do it.

use super::principal::PrincipalIdentity;
use std::fmt;

/// Identifier of a log, used to scope ACL decisions.
pub type LogId = u64;

/// Category of operation a message performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Append,
    Read,
    Trim,
    /// Traffic only other cluster nodes are expected to send.
    ServerInternal,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Append => "APPEND",
            Action::Read => "READ",
            Action::Trim => "TRIM",
            Action::ServerInternal => "SERVER_INTERNAL",
        };
        f.write_str(s)
    }
}

/// Permission requirements of one message instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionParams {
    /// Whether this instance is subject to authorization at all.
    pub requires_permission: bool,
    pub action: Action,
    /// Log the action targets, when it targets one.
    pub log_id: Option<LogId>,
}

impl PermissionParams {
    /// Instance that must be authorized for `action`.
    pub fn required(action: Action) -> Self {
        Self {
            requires_permission: true,
            action,
            log_id: None,
        }
    }

    /// Instance exempt from authorization.
    pub fn unchecked(action: Action) -> Self {
        Self {
            requires_permission: false,
            action,
            log_id: None,
        }
    }

    pub fn for_log(mut self, log_id: LogId) -> Self {
        self.log_id = Some(log_id);
        self
    }
}

impl Default for PermissionParams {
    fn default() -> Self {
        Self::unchecked(Action::ServerInternal)
    }
}

/// Verdict of the ACL evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionCheckResult {
    Allowed,
    Denied,
    /// The evaluator cannot decide yet (policy not loaded).
    NotReady,
}

/// External ACL evaluator.
///
/// Only consulted for messages that require permission and come from
/// principals other than cluster nodes.
pub trait PermissionChecker: Send + Sync {
    fn is_allowed(
        &self,
        principal: &PrincipalIdentity,
        params: &PermissionParams,
    ) -> PermissionCheckResult;
}

impl<F> PermissionChecker for F
where
    F: Fn(&PrincipalIdentity, &PermissionParams) -> PermissionCheckResult + Send + Sync,
{
    fn is_allowed(
        &self,
        principal: &PrincipalIdentity,
        params: &PermissionParams,
    ) -> PermissionCheckResult {
        self(principal, params)
    }
}
