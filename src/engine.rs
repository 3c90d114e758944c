//! Request/transaction bookkeeping between the node and the host's sockets.
//!
//! Outbound messages are emitted on a channel the host drains into its UDP
//! sockets; inbound parsed datagrams come back through [NetworkEngine::process],
//! which correlates replies with in-flight requests. A [Request] handle is
//! shared between the engine's transaction map and the originating search
//! node, so both observe completion without further lookups.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, trace};

use crate::common::{Confirm, InfoHash, NodeRef, Value, ValueId, MAX_RESPONSE_TIME};
use crate::messages::{ListenId, Message, ReplyArguments, RequestKind, Tid};
use crate::scheduler::{Job, Scheduler};
use crate::Family;

/// Send attempts per request before it fails with a timeout.
const MAX_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FailureKind {
    /// All attempts went unanswered.
    Timeout,
    /// The peer replied with a protocol error.
    Protocol(u16),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RequestState {
    Pending,
    Replied,
    Failed(FailureKind),
    Cancelled,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
/// What an outbound request was sent for, so its completion can be routed
/// back to the owning operation without callbacks.
pub enum Purpose {
    Ping,
    /// Routing table maintenance lookup.
    MaintenanceFindNode { family: Family },
    SearchGet { family: Family, target: InfoHash },
    SearchListen { family: Family, target: InfoHash },
    SearchAnnounce {
        family: Family,
        target: InfoHash,
        vid: ValueId,
    },
}

#[derive(Debug)]
/// One in-flight (or completed) outbound request.
pub struct Request {
    tid: Tid,
    node: NodeRef,
    kind: RequestKind,
    purpose: Purpose,
    state: RequestState,
    start: Instant,
    last_try: Instant,
    reply_time: Option<Instant>,
    attempts: u32,
}

impl Request {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn pending(&self) -> bool {
        self.state == RequestState::Pending
    }

    pub fn completed_ok(&self) -> bool {
        self.state == RequestState::Replied
    }

    /// When the reply arrived, for renewal timing.
    pub fn reply_time(&self) -> Option<Instant> {
        self.reply_time
    }

    /// Last send attempt, for backoff timing.
    pub fn last_try(&self) -> Instant {
        self.last_try
    }

    pub fn start(&self) -> Instant {
        self.start
    }
}

/// Shared handle to a [Request].
pub type RequestRef = Rc<RefCell<Request>>;

#[derive(Debug)]
/// Typed event handed to the node for each meaningful inbound datagram.
pub enum NetEvent {
    /// A peer wants something from us.
    Request {
        from: SocketAddr,
        tid: Tid,
        id: InfoHash,
        kind: RequestKind,
    },
    /// A reply to one of our requests.
    Reply {
        request: RequestRef,
        from: SocketAddr,
        /// The responder's node id, as claimed in the datagram.
        author: InfoHash,
        answer: ReplyArguments,
    },
    /// A protocol error to one of our requests.
    RequestError { request: RequestRef, code: u16 },
    /// Unsolicited values pushed for one of our listen subscriptions.
    ListenPush {
        from: SocketAddr,
        rid: ListenId,
        values: Vec<Value>,
    },
}

#[derive(Debug)]
pub struct NetworkEngine {
    myid: InfoHash,
    next_tid: Tid,
    requests: HashMap<Tid, RequestRef>,
    outbound: flume::Sender<(SocketAddr, Message)>,
}

impl NetworkEngine {
    pub fn new(myid: InfoHash, outbound: flume::Sender<(SocketAddr, Message)>) -> NetworkEngine {
        NetworkEngine {
            // Transaction id 0 is reserved for unsolicited listener pushes.
            myid,
            next_tid: 1,
            requests: HashMap::new(),
            outbound,
        }
    }

    // === Outbound ===

    /// Send a request to `node` and schedule its first timeout. The returned
    /// handle is also kept in the transaction map until completion.
    pub fn send_request(
        &mut self,
        scheduler: &mut Scheduler,
        node: NodeRef,
        kind: RequestKind,
        purpose: Purpose,
        now: Instant,
    ) -> RequestRef {
        let tid = self.tid();
        trace!(tid, to = %node.addr(), method = kind.method(), "sending request");

        let message = Message::Request {
            tid,
            id: self.myid,
            kind: kind.clone(),
        };
        self.send(node.addr(), message);
        node.requested(now);

        let request = Rc::new(RefCell::new(Request {
            tid,
            node,
            kind,
            purpose,
            state: RequestState::Pending,
            start: now,
            last_try: now,
            reply_time: None,
            attempts: 1,
        }));
        self.requests.insert(tid, request.clone());
        scheduler.add(now + MAX_RESPONSE_TIME, Job::RequestTimeout { tid });

        request
    }

    pub fn send_reply(&mut self, to: SocketAddr, tid: Tid, answer: ReplyArguments) {
        self.send(
            to,
            Message::Reply {
                tid,
                id: self.myid,
                answer,
            },
        );
    }

    pub fn send_error(&mut self, to: SocketAddr, tid: Tid, code: u16) {
        self.send(
            to,
            Message::Error {
                tid,
                id: self.myid,
                code,
            },
        );
    }

    /// Push updated values to a foreign listener, correlated by the listen id
    /// it gave us.
    pub fn push_values(&mut self, to: SocketAddr, rid: ListenId, values: Vec<Value>) {
        let mut answer = ReplyArguments::new();
        answer.rid = Some(rid);
        answer.values = values;

        // A push reuses the reply shape; the rid does the correlating, the
        // transaction id carries no meaning here.
        self.send(
            to,
            Message::Reply {
                tid: 0,
                id: self.myid,
                answer,
            },
        );
    }

    // === Inbound ===

    /// Correlate one parsed inbound datagram. Returns the typed event the
    /// node should act on, or `None` for stray datagrams.
    pub fn process(&mut self, message: Message, from: SocketAddr, now: Instant) -> Option<NetEvent> {
        match message {
            Message::Request { tid, id, kind } => Some(NetEvent::Request {
                from,
                tid,
                id,
                kind,
            }),
            Message::Reply { tid, id, answer } => {
                if let Some(request) = self.take_matching(tid, from) {
                    {
                        let mut req = request.borrow_mut();
                        req.state = RequestState::Replied;
                        req.reply_time = Some(now);
                        req.node.received(now, Confirm::Replied);
                    }
                    return Some(NetEvent::Reply {
                        request,
                        from,
                        author: id,
                        answer,
                    });
                }

                // Not one of ours: either a listener push or a stray reply.
                if let Some(rid) = answer.rid {
                    return Some(NetEvent::ListenPush {
                        from,
                        rid,
                        values: answer.values,
                    });
                }
                trace!(tid, %from, "stray reply");
                None
            }
            Message::Error { tid, id: _, code } => {
                let request = self.take_matching(tid, from)?;
                {
                    let mut req = request.borrow_mut();
                    req.state = RequestState::Failed(FailureKind::Protocol(code));
                    // An error still proves the peer is alive.
                    req.node.received(now, Confirm::Replied);
                }
                debug!(tid, %from, code, "request failed with protocol error");
                Some(NetEvent::RequestError { request, code })
            }
        }
    }

    /// Handle a [Job::RequestTimeout] firing. Retries the request while
    /// attempts remain; otherwise fails it and returns the handle so the
    /// node can react.
    pub fn timeout(
        &mut self,
        scheduler: &mut Scheduler,
        tid: Tid,
        now: Instant,
    ) -> Option<RequestRef> {
        let request = self.requests.get(&tid)?.clone();

        if !request.borrow().pending() {
            self.requests.remove(&tid);
            return None;
        }

        if request.borrow().attempts < MAX_ATTEMPTS {
            let (addr, message) = {
                let mut req = request.borrow_mut();
                req.attempts += 1;
                req.last_try = now;
                req.node.requested(now);
                (
                    req.node.addr(),
                    Message::Request {
                        tid,
                        id: self.myid,
                        kind: req.kind.clone(),
                    },
                )
            };
            trace!(tid, to = %addr, "retrying request");
            self.send(addr, message);
            scheduler.add(now + MAX_RESPONSE_TIME, Job::RequestTimeout { tid });
            return None;
        }

        self.requests.remove(&tid);
        request.borrow_mut().state = RequestState::Failed(FailureKind::Timeout);
        debug!(tid, node = %request.borrow().node.id(), "request timed out");
        Some(request)
    }

    /// Drop a request we no longer care about; a late reply will be ignored.
    pub fn cancel(&mut self, request: &RequestRef) {
        let mut req = request.borrow_mut();
        if req.pending() {
            req.state = RequestState::Cancelled;
        }
        self.requests.remove(&req.tid);
    }

    /// Number of requests currently in flight.
    pub fn pending_count(&self) -> usize {
        self.requests.len()
    }

    // === Private ===

    fn take_matching(&mut self, tid: Tid, from: SocketAddr) -> Option<RequestRef> {
        let request = self.requests.get(&tid)?;

        // A reply must come from where the request went.
        if request.borrow().node.addr() != from {
            trace!(tid, %from, "reply from unexpected address");
            return None;
        }
        self.requests.remove(&tid)
    }

    fn tid(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        if self.next_tid == 0 {
            self.next_tid = 1;
        }
        tid
    }

    fn send(&mut self, to: SocketAddr, message: Message) {
        // Fire and forget; a closed channel means the host is shutting down.
        let _ = self.outbound.send((to, message));
    }
}
