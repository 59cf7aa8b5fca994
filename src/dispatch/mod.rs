//! Permission-gated message dispatch.
//!
//! Every inbound message passes [`ServerMessageDispatch::authorize`] before
//! its handler runs. The transport resolves the sender into a
//! [`PrincipalIdentity`]; the ACL evaluator plugs in as a
//! [`PermissionChecker`].

mod gate;
mod message;
mod permission;
mod principal;

pub use gate::{DispatchCounts, DispatchStats, ServerMessageDispatch};
pub use message::{Address, Disposition, Message, MessageType};
pub use permission::{Action, LogId, PermissionCheckResult, PermissionChecker, PermissionParams};
pub use principal::{Principal, PrincipalIdentity};
