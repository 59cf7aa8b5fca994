//! Who sent a message.
//!
//! The transport resolves the sender's address into a [`PrincipalIdentity`]
//! before dispatch; nothing in this crate performs that resolution.

use std::fmt;

/// Trust classification of a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Principal {
    /// Connection that did not authenticate.
    Unauthenticated,
    /// No classification applied.
    Default,
    /// Client that authenticated successfully.
    Authenticated,
    /// Peer server of the same cluster.
    ClusterNode,
    /// Identity resolution failed.
    Invalid,
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Principal::Unauthenticated => "UNAUTHENTICATED",
            Principal::Default => "DEFAULT",
            Principal::Authenticated => "AUTHENTICATED",
            Principal::ClusterNode => "CLUSTER_NODE",
            Principal::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// Resolved identity attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrincipalIdentity {
    principal: Principal,
    /// Authenticated name (certificate subject, user), if any.
    name: Option<String>,
}

impl PrincipalIdentity {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn principal(&self) -> Principal {
        self.principal
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_cluster_node(&self) -> bool {
        self.principal == Principal::ClusterNode
    }
}

impl From<Principal> for PrincipalIdentity {
    fn from(principal: Principal) -> Self {
        Self::new(principal)
    }
}

impl fmt::Display for PrincipalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{}:{}", self.principal, name),
            None => write!(f, "{}", self.principal),
        }
    }
}
