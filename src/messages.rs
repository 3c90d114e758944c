//! Parsed datagram model.
//!
//! The node never sees raw bytes: the host's codec parses each datagram into
//! a [Message] before handing it to the core, and serializes the messages the
//! core emits. Everything here is plain owned data so messages can cross the
//! outbound channel to the socket thread.

use std::net::SocketAddr;
use std::time::Instant;

use crate::common::{InfoHash, NodeExport, Value};

/// Transaction id correlating a request with its reply.
pub type Tid = u16;

/// Remote listen subscriptions are correlated by the requester's listen id.
pub type ListenId = u32;

/// Write token bytes, opaque to the sender.
pub type Token = Vec<u8>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
/// Which address families the sender wants nodes for.
pub enum Want {
    V4,
    V6,
    Both,
}

impl Want {
    pub fn v4(&self) -> bool {
        matches!(self, Want::V4 | Want::Both)
    }

    pub fn v6(&self) -> bool {
        matches!(self, Want::V6 | Want::Both)
    }
}

#[derive(Clone, Debug)]
/// The four remote operations a node serves, plus ping.
pub enum RequestKind {
    Ping,
    FindNode {
        target: InfoHash,
        want: Want,
    },
    GetValues {
        hash: InfoHash,
        want: Want,
    },
    Listen {
        hash: InfoHash,
        token: Token,
        rid: ListenId,
    },
    AnnounceValues {
        hash: InfoHash,
        token: Token,
        values: Vec<Value>,
        /// Publisher-claimed creation time, already clamped to local time by
        /// the codec. `None` means "now".
        created: Option<Instant>,
    },
}

impl RequestKind {
    pub fn method(&self) -> &'static str {
        match self {
            RequestKind::Ping => "ping",
            RequestKind::FindNode { .. } => "find_node",
            RequestKind::GetValues { .. } => "get_values",
            RequestKind::Listen { .. } => "listen",
            RequestKind::AnnounceValues { .. } => "announce_values",
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Payload of a reply. A single shape covers all five request kinds; unused
/// fields stay empty.
pub struct ReplyArguments {
    /// Closest nodes per family.
    pub nodes4: Vec<NodeExport>,
    pub nodes6: Vec<NodeExport>,
    /// Stored values, for get-values and listen replies and listener pushes.
    pub values: Vec<Value>,
    /// Fresh write token bound to the requester's address.
    pub token: Option<Token>,
    /// Echo of the listen id, on listen replies and listener pushes.
    pub rid: Option<ListenId>,
    /// The requester's address as observed by the responder.
    pub requester_addr: Option<SocketAddr>,
}

impl ReplyArguments {
    pub fn new() -> ReplyArguments {
        ReplyArguments::default()
    }
}

/// Canonical wire error codes.
pub mod error_code {
    pub const GENERIC: u16 = 201;
    pub const WRONG_TOKEN: u16 = 203;
    pub const UNKNOWN_METHOD: u16 = 204;
}

#[derive(Clone, Debug)]
/// One parsed datagram.
pub enum Message {
    Request {
        tid: Tid,
        id: InfoHash,
        kind: RequestKind,
    },
    Reply {
        tid: Tid,
        id: InfoHash,
        answer: ReplyArguments,
    },
    Error {
        tid: Tid,
        id: InfoHash,
        code: u16,
    },
}

impl Message {
    /// The sender's node id.
    pub fn author(&self) -> &InfoHash {
        match self {
            Message::Request { id, .. } | Message::Reply { id, .. } | Message::Error { id, .. } => {
                id
            }
        }
    }

    pub fn tid(&self) -> Tid {
        match self {
            Message::Request { tid, .. }
            | Message::Reply { tid, .. }
            | Message::Error { tid, .. } => *tid,
        }
    }
}
