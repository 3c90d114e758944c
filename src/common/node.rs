//! Peer record shared between the routing table, the node cache and searches.
use std::cell::Cell;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::common::InfoHash;

/// A node that replied within this window counts as good.
pub const NODE_EXPIRE_TIME: Duration = Duration::from_secs(15 * 60);

/// A node we have not heard *anything* from for this long is ancient and
/// never counts as good, even if its last reply is more recent.
pub const NODE_GOOD_TIME: Duration = Duration::from_secs(2 * 60 * 60);

/// How long we wait for a reply to one request attempt.
pub const MAX_RESPONSE_TIME: Duration = Duration::from_secs(3);

/// Unanswered request attempts before a node is expired.
const MAX_UNANSWERED: u32 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
/// Address family a node (or routing table, or search) belongs to.
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Family {
        if addr.is_ipv4() {
            Family::V4
        } else {
            Family::V6
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
/// How much an interaction proves about a node's liveness.
pub enum Confirm {
    /// Hearsay: the node was merely mentioned by a peer.
    None,
    /// We received a datagram from it.
    Seen,
    /// It replied to one of our requests.
    Replied,
}

/// Peer record. Uniquely keyed by `(id, family)` and shared as `Rc<Node>`
/// between the routing table, the node cache (weakly) and any search
/// shortlist, so a liveness update made by one holder is visible to all.
pub struct Node {
    id: InfoHash,
    addr: Cell<SocketAddr>,
    /// Last time this node said anything to us.
    last_seen: Cell<Option<Instant>>,
    /// Last time this node replied to one of our requests.
    last_reply: Cell<Option<Instant>>,
    /// Last time we sent this node a request.
    last_pinged: Cell<Option<Instant>>,
    /// Requests sent since the last reply.
    pinged: Cell<u32>,
}

impl Node {
    pub fn new(id: InfoHash, addr: SocketAddr) -> Node {
        Node {
            id,
            addr: Cell::new(addr),
            last_seen: Cell::new(None),
            last_reply: Cell::new(None),
            last_pinged: Cell::new(None),
            pinged: Cell::new(0),
        }
    }

    // === Getters ===

    pub fn id(&self) -> &InfoHash {
        &self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr.get()
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr.get())
    }

    pub fn last_reply(&self) -> Option<Instant> {
        self.last_reply.get()
    }

    // === Liveness ===

    /// Replied recently and not repeatedly unanswered.
    pub fn is_good(&self, now: Instant) -> bool {
        !self.is_expired()
            && self
                .last_reply
                .get()
                .is_some_and(|t| t + NODE_EXPIRE_TIME > now)
            && self
                .last_seen
                .get()
                .is_some_and(|t| t + NODE_GOOD_TIME > now)
    }

    /// Several requests in a row went unanswered.
    pub fn is_expired(&self) -> bool {
        self.pinged.get() >= MAX_UNANSWERED
    }

    /// A request was sent and its response window is still open.
    pub fn is_reply_pending(&self, now: Instant) -> bool {
        self.last_pinged.get().is_some_and(|pinged| {
            pinged + MAX_RESPONSE_TIME > now
                && self.last_reply.get().map_or(true, |reply| reply < pinged)
        })
    }

    /// Rate-limits pings: recently pinged nodes are not pinged again until
    /// the previous attempt had its chance to answer.
    pub fn should_ping(&self, now: Instant) -> bool {
        !self.is_expired() && !self.is_reply_pending(now)
    }

    // === State updates ===

    /// Called when we hear from (or about) this node.
    pub fn received(&self, now: Instant, confirm: Confirm) {
        if confirm == Confirm::None {
            return;
        }
        self.last_seen.set(Some(now));
        if confirm == Confirm::Replied {
            self.last_reply.set(Some(now));
            self.pinged.set(0);
        }
    }

    /// Called when a request is sent to this node.
    pub fn requested(&self, now: Instant) {
        self.last_pinged.set(Some(now));
        self.pinged.set(self.pinged.get() + 1);
    }

    /// Update the address when the same id shows up from somewhere new; the
    /// newer address wins.
    pub fn set_addr(&self, addr: SocketAddr) {
        self.addr.set(addr);
    }

    /// Forget past failures so the node gets a fresh chance. Used after a
    /// connectivity change.
    pub fn reset_liveness(&self) {
        self.pinged.set(0);
        self.last_pinged.set(None);
    }

    pub fn export(&self) -> NodeExport {
        NodeExport {
            id: self.id,
            addr: self.addr.get(),
        }
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("addr", &self.addr.get())
            .field("pinged", &self.pinged.get())
            .finish()
    }
}

/// Shared handle to a [Node].
pub type NodeRef = Rc<Node>;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
/// Serializable node record for bootstrap persistence.
pub struct NodeExport {
    pub id: InfoHash,
    pub addr: SocketAddr,
}
