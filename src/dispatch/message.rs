//! Protocol message interface as seen by the dispatch layer.
//!
//! Framing and decoding happen in the transport; by the time a message gets
//! here it is a typed object that can report its type, its permission
//! requirements, and run its handler.

use super::permission::PermissionParams;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Ack,
    Append,
    Appended,
    CheckNodeHealth,
    Clean,
    ConfigChanged,
    ConfigFetch,
    Delete,
    Gap,
    GetSeqState,
    GetTrimPoint,
    Hello,
    Record,
    Release,
    Seal,
    Sealed,
    Shutdown,
    Start,
    Started,
    Stop,
    Store,
    Stored,
    Test,
    Trim,
    Trimmed,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Same spelling as the configuration file.
        let s = match self {
            MessageType::Ack => "ACK",
            MessageType::Append => "APPEND",
            MessageType::Appended => "APPENDED",
            MessageType::CheckNodeHealth => "CHECK_NODE_HEALTH",
            MessageType::Clean => "CLEAN",
            MessageType::ConfigChanged => "CONFIG_CHANGED",
            MessageType::ConfigFetch => "CONFIG_FETCH",
            MessageType::Delete => "DELETE",
            MessageType::Gap => "GAP",
            MessageType::GetSeqState => "GET_SEQ_STATE",
            MessageType::GetTrimPoint => "GET_TRIM_POINT",
            MessageType::Hello => "HELLO",
            MessageType::Record => "RECORD",
            MessageType::Release => "RELEASE",
            MessageType::Seal => "SEAL",
            MessageType::Sealed => "SEALED",
            MessageType::Shutdown => "SHUTDOWN",
            MessageType::Start => "START",
            MessageType::Started => "STARTED",
            MessageType::Stop => "STOP",
            MessageType::Store => "STORE",
            MessageType::Stored => "STORED",
            MessageType::Test => "TEST",
            MessageType::Trim => "TRIM",
            MessageType::Trimmed => "TRIMMED",
        };
        f.write_str(s)
    }
}

/// Verdict on an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Continue normal processing.
    Normal,
    /// Reject; the transport closes the connection or reports a protocol error.
    Error,
}

/// Transport-level sender of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Address {
    /// Connection from a client, by client id.
    Client(u32),
    /// Connection from another cluster node, by node index.
    Node(u16),
    /// Not resolved.
    #[default]
    Invalid,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Client(id) => write!(f, "C{id}"),
            Address::Node(idx) => write!(f, "N{idx}"),
            Address::Invalid => f.write_str("[invalid]"),
        }
    }
}

/// A decoded protocol message.
pub trait Message: Send {
    fn message_type(&self) -> MessageType;

    /// Permission requirements of this particular instance.
    fn permission_params(&self) -> PermissionParams;

    /// Handler; runs on the owning worker once the message is authorized.
    fn on_received(self: Box<Self>, from: Address) -> Disposition;
}
