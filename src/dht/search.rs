//! Iterative lookup state machine.
//!
//! A search tracks a bounded shortlist of the closest known peers to a
//! target key, sorted by XOR distance, and drives get, announce and listen
//! operations over it. Up to [SEARCH_NODES] peers are tracked so the search
//! can backtrack when one of the closest [TARGET_NODES] turns out dead.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{
    Family, Filter, InfoHash, NodeRef, TypeStore, Value, ValueId, ValueType, MAX_RESPONSE_TIME,
    NODE_EXPIRE_TIME,
};
use crate::dht::routing::{RoutingTable, TARGET_NODES};
use crate::dht::storage::LISTEN_EXPIRE_TIME;
use crate::dht::{DoneCallback, GetCallback};
use crate::engine::{NetworkEngine, Purpose, RequestRef};
use crate::messages::{ListenId, RequestKind, Token, Want};
use crate::scheduler::{Job, JobHandle, Scheduler};

/// Shortlist size; the extra nodes beyond [TARGET_NODES] are backtrack
/// candidates.
pub const SEARCH_NODES: usize = 14;

/// Synced nodes a listen subscription is maintained on.
pub const LISTEN_NODES: usize = 3;

/// Pause between get volleys when a search gets no answers.
pub const SEARCH_GET_STEP: Duration = Duration::from_secs(3);

/// An idle search older than this is expirable.
pub const SEARCH_EXPIRE_TIME: Duration = Duration::from_secs(62 * 60);

/// Renewals are sent this much before the peer-side expiration.
pub const REANNOUNCE_MARGIN: Duration = Duration::from_secs(5);

/// Concurrent gets sent per step.
const SEARCH_ALPHA: usize = 3;

/// Minimum delay between routing-table refills.
const REFILL_BACKOFF: Duration = Duration::from_secs(5);

/// One entry of a search shortlist.
pub(crate) struct SearchNode {
    pub node: NodeRef,
    /// Last time the node answered one of our get requests with a token.
    pub last_get_reply: Option<Instant>,
    pub get_status: Option<RequestRef>,
    pub listen_status: Option<RequestRef>,
    /// Announce status per value id.
    pub acked: HashMap<ValueId, RequestRef>,
    pub token: Option<Token>,
    /// Auditioning for the shortlist of an already-synced search; not part
    /// of the target set until it answers a get.
    pub candidate: bool,
}

impl SearchNode {
    fn new(node: NodeRef, candidate: bool) -> SearchNode {
        SearchNode {
            node,
            last_get_reply: None,
            get_status: None,
            listen_status: None,
            acked: HashMap::new(),
            token: None,
            candidate,
        }
    }

    /// Usable for announce/listen: alive, has a token and a recent reply.
    pub fn is_synced(&self, now: Instant) -> bool {
        !self.node.is_expired()
            && self.token.is_some()
            && self
                .last_get_reply
                .is_some_and(|t| t + NODE_EXPIRE_TIME > now)
    }

    /// Worth sending a get: alive, stale (or older than the `update`
    /// horizon) and with no get in flight.
    pub fn can_get(&self, now: Instant, update: Option<Instant>) -> bool {
        if self.node.is_expired() {
            return false;
        }
        let stale = match self.last_get_reply {
            None => true,
            Some(reply) => {
                now > reply + NODE_EXPIRE_TIME || update.is_some_and(|u| u > reply)
            }
        };
        stale && self.get_status.as_ref().map_or(true, |r| !r.borrow().pending())
    }

    pub fn is_announced(&self, vid: ValueId, vt: &ValueType, now: Instant) -> bool {
        self.acked.get(&vid).is_some_and(|r| {
            let r = r.borrow();
            r.completed_ok() && r.reply_time().is_some_and(|t| t + vt.expiration > now)
        })
    }

    pub fn is_listening(&self, now: Instant) -> bool {
        self.listen_status.as_ref().is_some_and(|r| {
            let r = r.borrow();
            r.completed_ok()
                && r.reply_time()
                    .is_some_and(|t| t + LISTEN_EXPIRE_TIME > now)
        })
    }

    /// When the announce of `vid` should next be sent. `None` means due now.
    pub fn announce_time(&self, vid: ValueId, vt: &ValueType) -> Option<Instant> {
        self.acked.get(&vid).map(|r| {
            let r = r.borrow();
            let backoff = r.last_try() + MAX_RESPONSE_TIME;
            match r.reply_time() {
                Some(reply) => (reply + vt.expiration - REANNOUNCE_MARGIN).max(backoff),
                None => backoff,
            }
        })
    }

    /// When the listen subscription should next be refreshed. `None` means
    /// due now.
    pub fn listen_time(&self) -> Option<Instant> {
        self.listen_status.as_ref().map(|r| {
            let r = r.borrow();
            let backoff = r.last_try() + MAX_RESPONSE_TIME;
            match r.reply_time() {
                Some(reply) => (reply + LISTEN_EXPIRE_TIME - REANNOUNCE_MARGIN).max(backoff),
                None => backoff,
            }
        })
    }
}

/// A single pending `get` operation.
pub(crate) struct Get {
    pub start: Instant,
    pub filter: Filter,
    pub get_cb: GetCallback,
    pub done_cb: Option<DoneCallback>,
}

/// A single pending `put`; never completes by itself, each renewal cycle
/// re-announces it until cancelled.
pub(crate) struct Announce {
    pub value: Rc<Value>,
    pub created: Instant,
    pub done_cb: Option<DoneCallback>,
}

/// A local listen subscription attached to a search.
pub(crate) struct SearchListener {
    pub filter: Filter,
    pub get_cb: GetCallback,
}

/// Disjoint borrows of node state a search step needs.
pub(crate) struct SearchCtx<'a> {
    pub engine: &'a mut NetworkEngine,
    pub scheduler: &'a mut Scheduler,
    pub types: &'a TypeStore,
    pub table: &'a RoutingTable,
    pub now: Instant,
}

pub(crate) struct Search {
    pub id: InfoHash,
    pub family: Family,
    pub nodes: Vec<SearchNode>,
    pub announces: Vec<Announce>,
    pub callbacks: Vec<Get>,
    pub listeners: HashMap<usize, SearchListener>,
    /// Listen correlation id given to peers, allocated on first use.
    pub listen_rid: Option<ListenId>,
    pub step_time: Option<Instant>,
    pub get_step_time: Option<Instant>,
    pub refill_time: Option<Instant>,
    /// No live node left. Cleared when fresh nodes arrive.
    pub expired: bool,
    /// Synced with nothing left to do; kept cached for reactivation.
    pub done: bool,
    /// Once a search has been synced, later arrivals join as candidates.
    pub ever_synced: bool,
    pub next_step_job: Option<JobHandle>,
}

impl Search {
    pub fn new(id: InfoHash, family: Family) -> Search {
        Search {
            id,
            family,
            nodes: Vec::with_capacity(SEARCH_NODES + 1),
            announces: Vec::new(),
            callbacks: Vec::new(),
            listeners: HashMap::new(),
            listen_rid: None,
            step_time: None,
            get_step_time: None,
            refill_time: None,
            expired: false,
            done: false,
            ever_synced: false,
            next_step_job: None,
        }
    }

    // === Shortlist ===

    /// Seed the shortlist from the routing table.
    pub fn bootstrap(&mut self, table: &RoutingTable, now: Instant) {
        for node in table.find_closest_nodes(&self.id, SEARCH_NODES) {
            self.insert_node(node, now, None);
        }
    }

    /// Insert or refresh a shortlist entry. Returns true when the node was
    /// new and kept within the shortlist.
    pub fn insert_node(&mut self, node: NodeRef, now: Instant, token: Option<&Token>) -> bool {
        if node.family() != self.family {
            return false;
        }

        if let Some(sn) = self.nodes.iter_mut().find(|sn| sn.node.id() == node.id()) {
            if let Some(token) = token {
                sn.token = Some(token.clone());
                sn.last_get_reply = Some(now);
                sn.candidate = false;
                self.expired = false;
                self.done = false;
            }
            return false;
        }

        if node.is_expired() {
            return false;
        }

        let pos = self
            .nodes
            .partition_point(|sn| self.id.xor_cmp(sn.node.id(), node.id()).is_lt());
        if pos >= SEARCH_NODES {
            return false;
        }

        let mut sn = SearchNode::new(node, self.ever_synced);
        if let Some(token) = token {
            sn.token = Some(token.clone());
            sn.last_get_reply = Some(now);
            sn.candidate = false;
        }
        self.nodes.insert(pos, sn);
        self.nodes.truncate(SEARCH_NODES);
        self.expired = false;
        true
    }

    /// Evict expired entries from the tail of the shortlist.
    pub fn remove_expired_nodes(&mut self) {
        while self
            .nodes
            .last()
            .is_some_and(|sn| sn.node.is_expired())
        {
            self.nodes.pop();
        }
    }

    /// Top up the shortlist from the routing table, rate limited.
    pub fn refill(&mut self, table: &RoutingTable, now: Instant) -> usize {
        if self
            .refill_time
            .is_some_and(|t| now < t + REFILL_BACKOFF)
        {
            return 0;
        }
        self.refill_time = Some(now);

        let mut inserted = 0;
        for node in table.find_closest_nodes(&self.id, SEARCH_NODES) {
            if self.insert_node(node, now, None) {
                inserted += 1;
            }
        }
        if inserted > 0 {
            trace!(target = %self.id, family = ?self.family, inserted, "search refilled");
        }
        inserted
    }

    pub fn get_nodes(&self) -> Vec<NodeRef> {
        self.nodes.iter().map(|sn| sn.node.clone()).collect()
    }

    // === Derived state ===

    /// The first up-to-[TARGET_NODES] live non-candidate entries.
    fn target_set(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, sn)| !sn.node.is_expired() && !sn.candidate)
            .map(|(i, _)| i)
            .take(TARGET_NODES)
    }

    /// The whole target set holds live tokens.
    pub fn is_synced(&self, now: Instant) -> bool {
        let mut any = false;
        for i in self.target_set() {
            if !self.nodes[i].is_synced(now) {
                return false;
            }
            any = true;
        }
        any
    }

    /// The whole target set acked the value recently enough.
    pub fn is_announced(&self, vid: ValueId, types: &TypeStore, now: Instant) -> bool {
        let mut any = false;
        for i in self.target_set() {
            let vt = types.get(self.value_type_of(vid));
            if !self.nodes[i].is_announced(vid, vt, now) {
                return false;
            }
            any = true;
        }
        any
    }

    /// The listen subscription is live on enough nodes.
    pub fn is_listening(&self, now: Instant) -> bool {
        let mut any = false;
        for i in self.target_set().take(LISTEN_NODES) {
            if !self.nodes[i].is_listening(now) {
                return false;
            }
            any = true;
        }
        any
    }

    /// A get is done once the whole target set answered it.
    pub fn is_done(&self, get: &Get, _now: Instant) -> bool {
        let mut any = false;
        for i in self.target_set() {
            match self.nodes[i].last_get_reply {
                Some(reply) if reply >= get.start => any = true,
                _ => return false,
            }
        }
        any
    }

    /// Mark every entry a candidate and forget sync state, so the search
    /// re-proves its shortlist. For connectivity changes.
    pub fn reset_for_reconnect(&mut self) {
        for sn in &mut self.nodes {
            sn.candidate = true;
            sn.token = None;
            sn.last_get_reply = None;
            sn.get_status = None;
            sn.listen_status = None;
            sn.acked.clear();
        }
        self.ever_synced = false;
        self.done = false;
        self.expired = false;
        self.get_step_time = None;
        self.refill_time = None;
    }

    /// Whether this search still pins state that must not be evicted.
    pub fn has_work(&self) -> bool {
        !self.announces.is_empty() || !self.callbacks.is_empty() || !self.listeners.is_empty()
    }

    // === Stepping ===

    /// Drive the search forward and schedule its next wake-up.
    pub fn step(&mut self, ctx: &mut SearchCtx<'_>) {
        let now = ctx.now;
        self.step_time = Some(now);
        self.next_step_job = None;

        self.remove_expired_nodes();
        if self.nodes.len() < SEARCH_NODES {
            self.refill(ctx.table, now);
        }

        if self.nodes.iter().all(|sn| sn.node.is_expired()) {
            self.expire_with_failure();
            return;
        }

        let update = self.callbacks.iter().map(|g| g.start).max();
        let synced = self.is_synced(now);
        if synced {
            self.ever_synced = true;
        }

        // Get phase, bounded to α nodes and rate limited between volleys.
        if !synced || update.is_some() {
            let gate = self
                .get_step_time
                .map_or(true, |t| now >= t + SEARCH_GET_STEP);
            if gate {
                let mut sent = 0;
                while sent < SEARCH_ALPHA && self.send_get_values(ctx, None, update) {
                    sent += 1;
                }
                if sent > 0 {
                    self.get_step_time = Some(now);
                }
            }
        }

        if synced {
            self.announce_phase(ctx);
            self.listen_phase(ctx);
        }

        // Complete finished gets.
        let nodes = self.get_nodes();
        let mut i = 0;
        while i < self.callbacks.len() {
            if self.is_done(&self.callbacks[i], now) {
                let mut get = self.callbacks.remove(i);
                debug!(target = %self.id, family = ?self.family, "get done");
                if let Some(cb) = get.done_cb.take() {
                    cb(true, &nodes);
                }
            } else {
                i += 1;
            }
        }

        self.done = synced
            && self.callbacks.is_empty()
            && self
                .announces
                .iter()
                .all(|a| self.is_announced(a.value.id, ctx.types, now))
            && (self.listeners.is_empty() || self.is_listening(now));

        if let Some(next) = self.next_step_time(ctx.types, now) {
            self.next_step_job = Some(ctx.scheduler.add(
                next,
                Job::SearchStep {
                    family: self.family,
                    target: self.id,
                },
            ));
        }
    }

    /// Send one get-values to the chosen node, or to the closest eligible
    /// one. Only one get per node may be in flight.
    pub fn send_get_values(
        &mut self,
        ctx: &mut SearchCtx<'_>,
        node: Option<usize>,
        update: Option<Instant>,
    ) -> bool {
        let now = ctx.now;
        let index = match node {
            Some(i) => {
                if !self.nodes[i].can_get(now, update) {
                    return false;
                }
                i
            }
            None => match self.nodes.iter().position(|sn| sn.can_get(now, update)) {
                Some(i) => i,
                None => return false,
            },
        };

        let sn = &mut self.nodes[index];
        trace!(target = %self.id, node = %sn.node.id(), "sending get_values");
        let request = ctx.engine.send_request(
            ctx.scheduler,
            sn.node.clone(),
            RequestKind::GetValues {
                hash: self.id,
                want: Want::Both,
            },
            Purpose::SearchGet {
                family: self.family,
                target: self.id,
            },
            now,
        );
        sn.get_status = Some(request);
        true
    }

    /// Compute the next instant this search needs driving.
    pub fn next_step_time(&self, types: &TypeStore, now: Instant) -> Option<Instant> {
        if self.expired {
            return None;
        }
        let mut next: Option<Instant> = None;
        let mut consider = |t: Instant| match next {
            Some(cur) if cur <= t => {}
            _ => next = Some(t),
        };

        if let Some(t) = self.update_time(now) {
            consider(t);
        }
        if self.is_synced(now) {
            if !self.announces.is_empty() {
                if let Some(t) = self.announce_wake_time(types) {
                    consider(t);
                }
            }
            if !self.listeners.is_empty() {
                if let Some(t) = self.listen_wake_time() {
                    consider(t);
                }
            }
        }
        next.map(|t| t.max(now))
    }

    // === Private ===

    fn expire_with_failure(&mut self) {
        if !self.expired {
            debug!(target = %self.id, family = ?self.family, "search expired");
        }
        self.expired = true;
        self.done = false;
        for mut get in self.callbacks.drain(..) {
            if let Some(cb) = get.done_cb.take() {
                cb(false, &[]);
            }
        }
        for a in &mut self.announces {
            if let Some(cb) = a.done_cb.take() {
                cb(false, &[]);
            }
        }
    }

    fn announce_phase(&mut self, ctx: &mut SearchCtx<'_>) {
        let now = ctx.now;
        let targets: Vec<usize> = self.target_set().collect();

        for a_index in 0..self.announces.len() {
            let value = self.announces[a_index].value.clone();
            let created = self.announces[a_index].created;
            let vt = ctx.types.get(value.value_type);

            if self.is_announced(value.id, ctx.types, now) {
                if let Some(cb) = self.announces[a_index].done_cb.take() {
                    debug!(target = %self.id, vid = value.id, "announce done");
                    cb(true, &self.get_nodes());
                }
                continue;
            }

            for &i in &targets {
                let sn = &self.nodes[i];
                if sn.is_announced(value.id, vt, now)
                    || sn.announce_time(value.id, vt).is_some_and(|t| t > now)
                {
                    continue;
                }
                let Some(token) = sn.token.clone() else {
                    continue;
                };
                trace!(target = %self.id, node = %sn.node.id(), vid = value.id, "sending announce");
                let request = ctx.engine.send_request(
                    ctx.scheduler,
                    sn.node.clone(),
                    RequestKind::AnnounceValues {
                        hash: self.id,
                        token,
                        values: vec![(*value).clone()],
                        created: Some(created),
                    },
                    Purpose::SearchAnnounce {
                        family: self.family,
                        target: self.id,
                        vid: value.id,
                    },
                    now,
                );
                self.nodes[i].acked.insert(value.id, request);
            }
        }
    }

    fn listen_phase(&mut self, ctx: &mut SearchCtx<'_>) {
        if self.listeners.is_empty() {
            return;
        }
        let Some(rid) = self.listen_rid else {
            return;
        };
        let now = ctx.now;
        let targets: Vec<usize> = self.target_set().take(LISTEN_NODES).collect();

        for i in targets {
            let sn = &self.nodes[i];
            if sn.listen_time().is_some_and(|t| t > now) {
                continue;
            }
            let Some(token) = sn.token.clone() else {
                continue;
            };
            trace!(target = %self.id, node = %sn.node.id(), "sending listen");
            let request = ctx.engine.send_request(
                ctx.scheduler,
                sn.node.clone(),
                RequestKind::Listen {
                    hash: self.id,
                    token,
                    rid,
                },
                Purpose::SearchListen {
                    family: self.family,
                    target: self.id,
                },
                now,
            );
            self.nodes[i].listen_status = Some(request);
        }
    }

    /// Deliver freshly received values to pending gets and local listeners.
    /// Gets whose callback asked to stop are dropped.
    pub fn deliver_values(&mut self, values: &[Rc<Value>]) {
        if values.is_empty() {
            return;
        }

        self.callbacks.retain(|get| {
            let matching: Vec<Rc<Value>> = values
                .iter()
                .filter(|v| (get.filter)(v))
                .cloned()
                .collect();
            if matching.is_empty() {
                return true;
            }
            (get.get_cb)(&matching)
        });

        for listener in self.listeners.values() {
            let matching: Vec<Rc<Value>> = values
                .iter()
                .filter(|v| (listener.filter)(v))
                .cloned()
                .collect();
            if !matching.is_empty() {
                (listener.get_cb)(&matching);
            }
        }
    }

    fn value_type_of(&self, vid: ValueId) -> u16 {
        self.announces
            .iter()
            .find(|a| a.value.id == vid)
            .map(|a| a.value.value_type)
            .unwrap_or(0)
    }

    /// Next time a get wants sending, if any node is worth querying.
    fn update_time(&self, now: Instant) -> Option<Instant> {
        let update = self.callbacks.iter().map(|g| g.start).max();

        let wants_get = self
            .nodes
            .iter()
            .any(|sn| sn.can_get(now, update));
        if !wants_get {
            return None;
        }
        Some(
            self.get_step_time
                .map_or(now, |t| (t + SEARCH_GET_STEP).max(now)),
        )
    }

    fn announce_wake_time(&self, types: &TypeStore) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        for a in &self.announces {
            let vt = types.get(a.value.value_type);
            for i in self.target_set() {
                let t = self.nodes[i].announce_time(a.value.id, vt);
                let t = t.unwrap_or_else(|| self.step_time.unwrap_or_else(Instant::now));
                if next.map_or(true, |cur| t < cur) {
                    next = Some(t);
                }
            }
        }
        next
    }

    fn listen_wake_time(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        for i in self.target_set().take(LISTEN_NODES) {
            let t = self.nodes[i]
                .listen_time()
                .unwrap_or_else(|| self.step_time.unwrap_or_else(Instant::now));
            if next.map_or(true, |cur| t < cur) {
                next = Some(t);
            }
        }
        next
    }
}

impl std::fmt::Debug for Search {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Search")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("nodes", &self.nodes.len())
            .field("announces", &self.announces.len())
            .field("callbacks", &self.callbacks.len())
            .field("listeners", &self.listeners.len())
            .field("expired", &self.expired)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::Node;
    use std::net::SocketAddr;

    fn peer(prefix: u8, port: u16) -> NodeRef {
        let mut id = InfoHash::random();
        id.0[0] = prefix;
        Rc::new(Node::new(id, SocketAddr::from(([127, 0, 0, 1], port))))
    }

    #[test]
    fn shortlist_stays_sorted_unique_and_bounded() {
        let mut search = Search::new(InfoHash::ZERO, Family::V4);
        let now = Instant::now();

        for i in 0..30u16 {
            search.insert_node(peer((i * 8) as u8, 1000 + i), now, None);
        }

        assert!(search.nodes.len() <= SEARCH_NODES);
        for pair in search.nodes.windows(2) {
            assert_ne!(
                search
                    .id
                    .xor_cmp(pair[0].node.id(), pair[1].node.id()),
                std::cmp::Ordering::Greater
            );
            assert_ne!(pair[0].node.id(), pair[1].node.id());
        }
    }

    #[test]
    fn reinsert_does_not_duplicate() {
        let mut search = Search::new(InfoHash::ZERO, Family::V4);
        let now = Instant::now();
        let node = peer(0x10, 1000);

        assert!(search.insert_node(node.clone(), now, None));
        assert!(!search.insert_node(node, now, None));
        assert_eq!(search.nodes.len(), 1);
    }

    #[test]
    fn token_confirms_candidate() {
        let mut search = Search::new(InfoHash::ZERO, Family::V4);
        let now = Instant::now();
        search.ever_synced = true;

        let node = peer(0x10, 1000);
        search.insert_node(node.clone(), now, None);
        assert!(search.nodes[0].candidate);

        let token: Token = vec![1, 2, 3];
        search.insert_node(node, now, Some(&token));
        assert!(!search.nodes[0].candidate);
        assert_eq!(search.nodes[0].token.as_deref(), Some(&token[..]));
        assert!(search.nodes[0].is_synced(now));
    }

    #[test]
    fn synced_needs_whole_target_set() {
        let mut search = Search::new(InfoHash::ZERO, Family::V4);
        let now = Instant::now();
        let token: Token = vec![9; 4];

        for i in 0..4u16 {
            let node = peer((16 + i * 8) as u8, 1000 + i);
            search.insert_node(node.clone(), now, None);
            if i < 3 {
                search.insert_node(node, now, Some(&token));
            }
        }
        assert!(!search.is_synced(now));

        // Sync the straggler too.
        let left = search.nodes.iter().position(|sn| sn.token.is_none()).unwrap();
        let node = search.nodes[left].node.clone();
        search.insert_node(node, now, Some(&token));
        assert!(search.is_synced(now));
    }

    #[test]
    fn get_is_done_only_after_fresh_replies() {
        let mut search = Search::new(InfoHash::ZERO, Family::V4);
        let t0 = Instant::now();
        let token: Token = vec![1];

        let node = peer(0x20, 1000);
        search.insert_node(node.clone(), t0, Some(&token));

        let get = Get {
            start: t0 + Duration::from_secs(1),
            filter: crate::common::all_filter(),
            get_cb: Rc::new(|_| true),
            done_cb: None,
        };
        // Reply predates the get.
        assert!(!search.is_done(&get, t0 + Duration::from_secs(2)));

        search.insert_node(node, t0 + Duration::from_secs(2), Some(&token));
        assert!(search.is_done(&get, t0 + Duration::from_secs(2)));
    }

    #[test]
    fn expired_nodes_are_dropped_from_tail() {
        let mut search = Search::new(InfoHash::ZERO, Family::V4);
        let now = Instant::now();

        let dead = peer(0xf0, 2000);
        let live = peer(0x01, 2001);
        search.insert_node(dead.clone(), now, None);
        search.insert_node(live, now, None);
        for _ in 0..3 {
            dead.requested(now);
        }

        search.remove_expired_nodes();
        assert_eq!(search.nodes.len(), 1);
        assert!(!search.nodes[0].node.is_expired());
    }

    #[test]
    fn deliver_values_applies_filters_and_cancellation() {
        let mut search = Search::new(InfoHash::ZERO, Family::V4);
        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));

        let seen2 = seen.clone();
        search.callbacks.push(Get {
            start: Instant::now(),
            filter: Rc::new(|v: &Value| v.id != 2),
            get_cb: Rc::new(move |values: &[Rc<Value>]| {
                seen2.borrow_mut().extend(values.iter().map(|v| v.id));
                false // cancel after first delivery
            }),
            done_cb: None,
        });

        let values: Vec<Rc<Value>> = vec![
            Rc::new(Value::new(1, 0, &b"a"[..])),
            Rc::new(Value::new(2, 0, &b"b"[..])),
        ];
        search.deliver_values(&values);

        assert_eq!(*seen.borrow(), vec![1]);
        assert!(search.callbacks.is_empty());

        // A second delivery goes nowhere.
        search.deliver_values(&values);
        assert_eq!(*seen.borrow(), vec![1]);
    }
}
