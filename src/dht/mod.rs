//! The DHT node itself.
//!
//! [Dht] owns the routing tables, the per-key storage, the active searches
//! and the token secrets, and drives them against the request engine and the
//! job scheduler. The host owns the sockets and the clock: it feeds parsed
//! datagrams and the current instant into [Dht::periodic] and drains the
//! outbound message channel.

mod node_cache;
mod routing;
mod search;
mod storage;
mod tokens;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::common::{
    all_filter, Confirm, Family, Filter, InfoHash, NodeExport, NodeRef, TypeStore, Value, ValueId,
    ValueType,
};
use crate::engine::{NetEvent, NetworkEngine, Purpose, RequestRef};
use crate::messages::{error_code, ListenId, Message, ReplyArguments, RequestKind, Tid, Want};
use crate::scheduler::{Job, Scheduler};
use crate::{Error, Result};

use node_cache::NodeCache;
use routing::{InsertOutcome, RoutingTable};
use search::{Announce, Get, Search, SearchCtx, SearchListener};
use storage::{Storage, StoreError};

pub use routing::TARGET_NODES;
pub use search::{
    LISTEN_NODES, REANNOUNCE_MARGIN, SEARCH_EXPIRE_TIME, SEARCH_GET_STEP, SEARCH_NODES,
};
pub use storage::{LISTEN_EXPIRE_TIME, MAX_STORAGE_MAINTENANCE_EXPIRE_TIME, MAX_VALUES};
pub use tokens::TOKEN_SIZE;

/// Distinct keys this node is willing to track.
pub const MAX_HASHES: usize = 16384;

/// Searches kept per address family; done searches are evicted LRU.
pub const MAX_SEARCHES: usize = 128;

/// Size of the blacklist ring.
pub const BLACKLISTED_MAX: usize = 10;

/// Default storage quota.
pub const DEFAULT_STORAGE_LIMIT: usize = 64 * 1024 * 1024;

/// Token secret rotation period; must exceed a typical search duration so a
/// token obtained in one round is still valid for the following announce.
const SECRET_ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Bounds for the jittered node-confirmation timer.
const CONFIRM_NODES_MIN: Duration = Duration::from_secs(60);
const CONFIRM_NODES_MAX: Duration = Duration::from_secs(180);

/// Bounds for the jittered expiry pass.
const EXPIRE_STATE_MIN: Duration = Duration::from_secs(120);
const EXPIRE_STATE_MAX: Duration = Duration::from_secs(240);

/// A bucket not refreshed for this long gets a maintenance lookup.
const BUCKET_REFRESH_TIME: Duration = Duration::from_secs(10 * 60);

/// Shutdown drains pending announces up to this long.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(8);
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

/// Streaming delivery of matching values. Return false to cancel the rest of
/// the operation.
pub type GetCallback = Rc<dyn Fn(&[Rc<Value>]) -> bool>;

/// Fired exactly once when an operation's iterative search terminates.
pub type DoneCallback = Box<dyn FnOnce(bool, &[NodeRef])>;

/// Fired once from [Dht::shutdown].
pub type ShutdownCallback = Box<dyn FnOnce()>;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
/// Connectivity of one address family.
pub enum Status {
    /// No known nodes.
    Disconnected,
    /// Known nodes, none of them good yet.
    Connecting,
    /// At least one good node.
    Connected,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// This node's id; random when unset.
    pub node_id: Option<InfoHash>,
    /// Bootstrap-only nodes serve requests but never initiate operations.
    pub is_bootstrap: bool,
    /// Storage quota in bytes.
    pub max_store_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: None,
            is_bootstrap: false,
            max_store_size: DEFAULT_STORAGE_LIMIT,
        }
    }
}

impl Config {
    pub fn with_node_id(mut self, id: InfoHash) -> Config {
        self.node_id = Some(id);
        self
    }

    pub fn with_bootstrap_mode(mut self, is_bootstrap: bool) -> Config {
        self.is_bootstrap = is_bootstrap;
        self
    }
}

/// Serialized form of one stored value, for [Dht::export_values].
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    id: ValueId,
    value_type: u16,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
    /// Age at export time, so the import can reconstruct the store time.
    age_secs: u64,
}

/// One key's worth of exported values: the key and an opaque blob.
pub type ValuesExport = (InfoHash, Vec<u8>);

struct ShutdownState {
    remaining: Rc<Cell<usize>>,
    callback: Option<ShutdownCallback>,
    deadline: Instant,
}

pub struct Dht {
    myid: InfoHash,
    is_bootstrap: bool,

    types: TypeStore,
    cache: NodeCache,
    buckets4: RoutingTable,
    buckets6: RoutingTable,

    store: Vec<Storage>,
    total_values: usize,
    total_store_size: usize,
    max_store_size: usize,

    searches4: HashMap<InfoHash, Search>,
    searches6: HashMap<InfoHash, Search>,

    /// Global listen token → key, shared by the per-search and per-storage
    /// listener maps.
    listeners: HashMap<usize, InfoHash>,
    listener_token: usize,
    /// Listen correlation id → the search it belongs to.
    listen_rids: HashMap<ListenId, (Family, InfoHash)>,
    next_rid: ListenId,

    blacklist: Vec<SocketAddr>,
    next_blacklisted: usize,

    tokens: tokens::Tokens,
    scheduler: Scheduler,
    engine: NetworkEngine,

    /// Votes for our externally observed addresses.
    reported_addrs: Vec<(u32, SocketAddr)>,

    shutting_down: bool,
    shutdown: Option<ShutdownState>,
}

impl Dht {
    /// Create a node. Outbound messages are emitted on `outbound`; the host
    /// serializes and sends them, and feeds inbound traffic back through
    /// [Dht::periodic].
    pub fn new(
        config: Config,
        outbound: flume::Sender<(SocketAddr, Message)>,
        now: Instant,
    ) -> Dht {
        let myid = config.node_id.unwrap_or_else(InfoHash::random);
        info!(%myid, is_bootstrap = config.is_bootstrap, "starting node");

        let mut scheduler = Scheduler::new();
        scheduler.add(now + jitter(CONFIRM_NODES_MIN, CONFIRM_NODES_MAX), Job::ConfirmNodes);
        scheduler.add(now + jitter(EXPIRE_STATE_MIN, EXPIRE_STATE_MAX), Job::ExpireState);
        scheduler.add(now + SECRET_ROTATE_INTERVAL, Job::RotateSecrets);
        scheduler.add(
            now + MAX_STORAGE_MAINTENANCE_EXPIRE_TIME,
            Job::DataPersistence,
        );

        Dht {
            myid,
            is_bootstrap: config.is_bootstrap,
            types: TypeStore::new(),
            cache: NodeCache::new(),
            buckets4: RoutingTable::new(Family::V4),
            buckets6: RoutingTable::new(Family::V6),
            store: Vec::new(),
            total_values: 0,
            total_store_size: 0,
            max_store_size: config.max_store_size,
            searches4: HashMap::new(),
            searches6: HashMap::new(),
            listeners: HashMap::new(),
            listener_token: 0,
            listen_rids: HashMap::new(),
            next_rid: 1,
            blacklist: Vec::with_capacity(BLACKLISTED_MAX),
            next_blacklisted: 0,
            tokens: tokens::Tokens::new(),
            scheduler,
            engine: NetworkEngine::new(myid, outbound),
            reported_addrs: Vec::new(),
            shutting_down: false,
            shutdown: None,
        }
    }

    // === Getters ===

    pub fn node_id(&self) -> &InfoHash {
        &self.myid
    }

    /// Connectivity for one family.
    pub fn status(&self, family: Family, now: Instant) -> Status {
        let table = self.table(family);
        let (good, _, _, _) = table.stats(now);
        if good > 0 {
            Status::Connected
        } else if table.node_count() > 0 {
            Status::Connecting
        } else {
            Status::Disconnected
        }
    }

    /// `(good, dubious, cached, incoming)` for one family.
    pub fn nodes_stats(&self, family: Family, now: Instant) -> (usize, usize, usize, usize) {
        self.table(family).stats(now)
    }

    /// `(total bytes, total values)` currently stored.
    pub fn store_size(&self) -> (usize, usize) {
        (self.total_store_size, self.total_values)
    }

    /// Update the storage quota. Values above a lowered limit are not
    /// evicted, but no new writes are admitted until usage drops.
    pub fn set_storage_limit(&mut self, limit: usize) {
        self.max_store_size = limit;
    }

    pub fn register_type(&mut self, value_type: ValueType) {
        self.types.register(value_type);
    }

    /// Our externally observed addresses, most reported first.
    pub fn public_address(&self, family: Option<Family>) -> Vec<SocketAddr> {
        let mut votes: Vec<(u32, SocketAddr)> = self
            .reported_addrs
            .iter()
            .filter(|(_, a)| family.map_or(true, |f| Family::of(a) == f))
            .copied()
            .collect();
        votes.sort_by(|a, b| b.0.cmp(&a.0));
        votes.into_iter().map(|(_, a)| a).collect()
    }

    // === Main loop ===

    /// Feed one parsed inbound datagram (if any) and run all due jobs.
    /// Returns the instant the host should call back at the latest.
    pub fn periodic(
        &mut self,
        packet: Option<(Message, SocketAddr)>,
        now: Instant,
    ) -> Instant {
        if let Some((message, from)) = packet {
            self.process_message(message, from, now);
        }

        while let Some(job) = self.scheduler.pop_due(now) {
            self.run_job(job, now);
        }

        self.scheduler
            .next_due()
            .unwrap_or(now + Duration::from_secs(10))
    }

    // === Operations ===

    /// Iteratively fetch every value stored under `key`, on both address
    /// families. `get_cb` streams matching values as they arrive; `done_cb`
    /// fires once when the lookup terminates.
    pub fn get(
        &mut self,
        key: InfoHash,
        get_cb: GetCallback,
        done_cb: Option<DoneCallback>,
        filter: Option<Filter>,
        now: Instant,
    ) -> Result<()> {
        self.check_operational()?;
        let filter = filter.unwrap_or_else(all_filter);

        struct GetState {
            seen: HashSet<ValueId>,
            ok: bool,
            pending: u8,
            cancelled: bool,
            done_cb: Option<DoneCallback>,
        }
        let state = Rc::new(RefCell::new(GetState {
            seen: HashSet::new(),
            ok: false,
            pending: 2,
            cancelled: false,
            done_cb,
        }));

        // Local values are delivered synchronously, before the network round.
        let local = self.get_local(&key, Some(&filter));
        if !local.is_empty() {
            let mut st = state.borrow_mut();
            for v in &local {
                st.seen.insert(v.id);
            }
            drop(st);
            if !get_cb(&local) {
                if let Some(cb) = state.borrow_mut().done_cb.take() {
                    cb(true, &[]);
                }
                return Ok(());
            }
        }

        for family in [Family::V4, Family::V6] {
            let cb = {
                let state = state.clone();
                let user_cb = get_cb.clone();
                let cb: GetCallback = Rc::new(move |values: &[Rc<Value>]| {
                    let mut st = state.borrow_mut();
                    if st.cancelled {
                        return false;
                    }
                    let fresh: Vec<Rc<Value>> = values
                        .iter()
                        .filter(|v| st.seen.insert(v.id))
                        .cloned()
                        .collect();
                    drop(st);
                    if fresh.is_empty() {
                        return true;
                    }
                    let more = user_cb(&fresh);
                    if !more {
                        state.borrow_mut().cancelled = true;
                    }
                    more
                });
                cb
            };
            let done = {
                let state = state.clone();
                let done: DoneCallback = Box::new(move |ok, nodes| {
                    let mut st = state.borrow_mut();
                    st.ok |= ok;
                    st.pending -= 1;
                    if st.pending == 0 {
                        if let Some(cb) = st.done_cb.take() {
                            let ok = st.ok;
                            drop(st);
                            cb(ok, nodes);
                        }
                    }
                });
                done
            };

            let sr = self.ensure_search(key, family, now);
            sr.done = false;
            sr.callbacks.push(Get {
                start: now,
                filter: filter.clone(),
                get_cb: cb,
                done_cb: Some(done),
            });
            self.schedule_search_step(family, key, now);
        }
        Ok(())
    }

    /// Announce a value under `key` on both families and keep re-announcing
    /// it until [Dht::cancel_put]. The value is also admitted to local
    /// storage immediately. `done_cb` fires when the first announce round
    /// completes.
    pub fn put(
        &mut self,
        key: InfoHash,
        value: Value,
        done_cb: Option<DoneCallback>,
        created: Option<Instant>,
        now: Instant,
    ) -> Result<()> {
        self.check_operational()?;
        let value = Rc::new(value);
        let created = created.unwrap_or(now).min(now);

        self.storage_store(key, value.clone(), created, now);

        struct PutState {
            ok: bool,
            pending: u8,
            done_cb: Option<DoneCallback>,
        }
        let state = Rc::new(RefCell::new(PutState {
            ok: false,
            pending: 2,
            done_cb,
        }));

        for family in [Family::V4, Family::V6] {
            let done: DoneCallback = {
                let state = state.clone();
                Box::new(move |ok, nodes| {
                    let mut st = state.borrow_mut();
                    st.ok |= ok;
                    st.pending -= 1;
                    if st.pending == 0 {
                        if let Some(cb) = st.done_cb.take() {
                            let ok = st.ok;
                            drop(st);
                            cb(ok, nodes);
                        }
                    }
                })
            };
            self.announce(key, family, value.clone(), Some(done), created, now);
        }
        Ok(())
    }

    /// Stop re-announcing `(key, vid)`. Returns whether a put was active.
    pub fn cancel_put(&mut self, key: &InfoHash, vid: ValueId) -> bool {
        let mut cancelled = false;
        for searches in [&mut self.searches4, &mut self.searches6] {
            if let Some(sr) = searches.get_mut(key) {
                let before = sr.announces.len();
                sr.announces.retain(|a| a.value.id != vid);
                cancelled |= sr.announces.len() < before;
            }
        }
        cancelled
    }

    /// Values this node is currently putting at `key`.
    pub fn get_put(&self, key: &InfoHash) -> Vec<Rc<Value>> {
        self.searches4
            .get(key)
            .into_iter()
            .flat_map(|sr| sr.announces.iter().map(|a| a.value.clone()))
            .collect()
    }

    pub fn get_put_value(&self, key: &InfoHash, vid: ValueId) -> Option<Rc<Value>> {
        self.get_put(key).into_iter().find(|v| v.id == vid)
    }

    /// Subscribe to values under `key`, both from the network and from local
    /// stores. Returns a token for [Dht::cancel_listen].
    pub fn listen(
        &mut self,
        key: InfoHash,
        get_cb: GetCallback,
        filter: Option<Filter>,
        now: Instant,
    ) -> Result<usize> {
        self.check_operational()?;
        let filter = filter.unwrap_or_else(all_filter);
        self.listener_token += 1;
        let token = self.listener_token;

        // Several listened nodes push the same values; deliver each value
        // once, and again only when its payload actually changed.
        let get_cb: GetCallback = {
            let seen: Rc<RefCell<HashMap<ValueId, Rc<Value>>>> =
                Rc::new(RefCell::new(HashMap::new()));
            let user_cb = get_cb;
            Rc::new(move |values: &[Rc<Value>]| {
                let mut seen = seen.borrow_mut();
                let fresh: Vec<Rc<Value>> = values
                    .iter()
                    .filter(|v| seen.get(&v.id).map_or(true, |old| old.as_ref() != v.as_ref()))
                    .cloned()
                    .collect();
                for v in &fresh {
                    seen.insert(v.id, v.clone());
                }
                drop(seen);
                if fresh.is_empty() {
                    return true;
                }
                user_cb(&fresh)
            })
        };

        // Local side: watch the storage, and deliver what is already there.
        if let Some(index) = self.find_or_create_storage(key, now) {
            let st = &mut self.store[index];
            st.local_listeners.insert(
                token,
                storage::LocalListener {
                    filter: filter.clone(),
                    get_cb: get_cb.clone(),
                },
            );
            let current = st.get(Some(&filter));
            if !current.is_empty() {
                get_cb(&current);
            }
        }

        for family in [Family::V4, Family::V6] {
            let rid = self.next_rid;
            let sr = self.ensure_search(key, family, now);
            sr.done = false;
            if sr.listen_rid.is_none() {
                sr.listen_rid = Some(rid);
            }
            let rid = sr.listen_rid.unwrap();
            sr.listeners.insert(
                token,
                SearchListener {
                    filter: filter.clone(),
                    get_cb: get_cb.clone(),
                },
            );
            self.listen_rids.insert(rid, (family, key));
            if rid == self.next_rid {
                self.next_rid += 1;
            }
            self.schedule_search_step(family, key, now);
        }

        self.listeners.insert(token, key);
        Ok(token)
    }

    /// Tear down a [Dht::listen] subscription.
    pub fn cancel_listen(&mut self, key: &InfoHash, token: usize) -> bool {
        if self.listeners.remove(&token).is_none() {
            return false;
        }
        if let Some(index) = self.find_storage(key) {
            self.store[index].local_listeners.remove(&token);
        }
        for searches in [&mut self.searches4, &mut self.searches6] {
            if let Some(sr) = searches.get_mut(key) {
                sr.listeners.remove(&token);
            }
        }
        true
    }

    /// Locally stored values under `key`.
    pub fn get_local(&self, key: &InfoHash, filter: Option<&Filter>) -> Vec<Rc<Value>> {
        match self.find_storage(key) {
            Some(index) => self.store[index].get(filter),
            None => Vec::new(),
        }
    }

    pub fn get_local_by_id(&self, key: &InfoHash, vid: ValueId) -> Option<Rc<Value>> {
        self.find_storage(key)
            .and_then(|index| self.store[index].get_by_id(vid))
    }

    /// Insert a known node without pinging it; for efficient bootstrap from
    /// persisted state.
    pub fn insert_node(&mut self, export: NodeExport, now: Instant) {
        let node = self.cache.resolve(&export.id, export.addr, now, Confirm::None);
        self.routing_insert(&node, false, now);
    }

    /// Ping an address we know nothing about yet; its pong will teach us its
    /// id and insert it properly.
    pub fn ping_node(&mut self, addr: SocketAddr, now: Instant) {
        let node = Rc::new(crate::common::Node::new(InfoHash::ZERO, addr));
        self.engine
            .send_request(&mut self.scheduler, node, RequestKind::Ping, Purpose::Ping, now);
    }

    /// Tell the node the lower layers changed (new interface, new address).
    /// Bad nodes get a fresh chance and every search re-proves its shortlist.
    pub fn connectivity_changed(&mut self, now: Instant) {
        info!("connectivity changed");
        self.cache.clear_bad_nodes(Family::V4);
        self.cache.clear_bad_nodes(Family::V6);
        self.blacklist.clear();
        self.next_blacklisted = 0;
        self.reported_addrs.clear();
        self.tokens.rotate();

        let keys: Vec<(Family, InfoHash)> = self
            .searches4
            .keys()
            .map(|k| (Family::V4, *k))
            .chain(self.searches6.keys().map(|k| (Family::V6, *k)))
            .collect();
        for (family, key) in keys {
            let table = match family {
                Family::V4 => &self.buckets4,
                Family::V6 => &self.buckets6,
            };
            let searches = match family {
                Family::V4 => &mut self.searches4,
                Family::V6 => &mut self.searches6,
            };
            if let Some(sr) = searches.get_mut(&key) {
                sr.reset_for_reconnect();
                sr.bootstrap(table, now);
            }
            self.schedule_search_step(family, key, now);
        }
    }

    /// Good nodes of both families, ordered for fast re-join: buckets
    /// round-robin, freshest reply first within each bucket.
    pub fn export_nodes(&self, now: Instant) -> Vec<NodeExport> {
        let mut out = Vec::new();
        for table in [&self.buckets4, &self.buckets6] {
            let mut per_bucket: Vec<Vec<&NodeRef>> = table
                .buckets()
                .map(|b| {
                    let mut nodes: Vec<&NodeRef> =
                        b.nodes.iter().filter(|n| n.is_good(now)).collect();
                    nodes.sort_by(|a, b| b.last_reply().cmp(&a.last_reply()));
                    nodes
                })
                .collect();
            let mut round = 0;
            loop {
                let mut emitted = false;
                for bucket in &mut per_bucket {
                    if let Some(n) = bucket.get(round) {
                        out.push(n.export());
                        emitted = true;
                    }
                }
                if !emitted {
                    break;
                }
                round += 1;
            }
        }
        out
    }

    /// Serialize all stored values for persistence across restarts.
    pub fn export_values(&self, now: Instant) -> Vec<ValuesExport> {
        let mut out = Vec::new();
        for st in &self.store {
            if st.is_empty() {
                continue;
            }
            let records: Vec<StoredRecord> = st
                .values()
                .iter()
                .map(|v| StoredRecord {
                    id: v.data.id,
                    value_type: v.data.value_type,
                    data: v.data.data.to_vec(),
                    age_secs: now.saturating_duration_since(v.time).as_secs(),
                })
                .collect();
            match serde_bencode::to_bytes(&records) {
                Ok(blob) => out.push((st.id, blob)),
                Err(e) => warn!(key = %st.id, error = %e, "failed to serialize storage"),
            }
        }
        out
    }

    /// Re-admit previously exported values. Returns how many were stored.
    pub fn import_values(&mut self, exports: &[ValuesExport], now: Instant) -> Result<usize> {
        let mut imported = 0;
        for (key, blob) in exports {
            let records: Vec<StoredRecord> = serde_bencode::from_bytes(blob)?;
            for record in records {
                let value = Rc::new(Value::new(record.id, record.value_type, record.data));
                let created = now
                    .checked_sub(Duration::from_secs(record.age_secs))
                    .unwrap_or(now);
                if self.storage_store(*key, value, created, now) {
                    imported += 1;
                }
            }
        }
        Ok(imported)
    }

    /// Drain pending work: stop accepting operations, force one last
    /// announce pass for unexpired values, then fire `cb` from a scheduled
    /// job.
    pub fn shutdown(&mut self, cb: ShutdownCallback, now: Instant) {
        info!("shutting down");
        self.shutting_down = true;
        let remaining = Rc::new(Cell::new(0usize));

        let ids: Vec<InfoHash> = self.store.iter().map(|st| st.id).collect();
        for id in ids {
            self.maintain_storage(id, true, Some(remaining.clone()), now);
        }

        self.shutdown = Some(ShutdownState {
            remaining,
            callback: Some(cb),
            deadline: now + SHUTDOWN_DEADLINE,
        });
        self.scheduler.add(now, Job::ShutdownDrain);
    }

    /// Add an address to the blacklist ring; its datagrams are dropped.
    pub fn blacklist_node(&mut self, addr: SocketAddr) {
        if self.blacklist.len() < BLACKLISTED_MAX {
            self.blacklist.push(addr);
        } else {
            self.blacklist[self.next_blacklisted] = addr;
        }
        self.next_blacklisted = (self.next_blacklisted + 1) % BLACKLISTED_MAX;
    }

    // === Diagnostics ===

    /// Human-readable storage summary.
    pub fn storage_log(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        for st in &self.store {
            let _ = writeln!(
                out,
                "{}: {} values ({} bytes), {} listeners",
                st.id,
                st.value_count(),
                st.total_size(),
                st.listeners.len() + st.local_listeners.len()
            );
        }
        let _ = writeln!(
            out,
            "total {} values, {} bytes, limit {}",
            self.total_values, self.total_store_size, self.max_store_size
        );
        out
    }

    /// Human-readable routing table dump for one family.
    pub fn tables_log(&self, family: Family, now: Instant) -> String {
        use std::fmt::Write;
        let table = self.table(family);
        let mut out = String::new();
        for (i, b) in table.buckets().enumerate() {
            let _ = writeln!(
                out,
                "bucket {} first {} depth {} nodes {} cached {}",
                i,
                b.first,
                table.depth(i),
                b.nodes.len(),
                b.cached.is_some()
            );
            for n in &b.nodes {
                let _ = writeln!(
                    out,
                    "  {} {} {}",
                    n.id(),
                    n.addr(),
                    if n.is_good(now) {
                        "good"
                    } else if n.is_expired() {
                        "expired"
                    } else {
                        "dubious"
                    }
                );
            }
        }
        out
    }

    /// Human-readable search dump for one family.
    pub fn searches_log(&self, family: Family, now: Instant) -> String {
        use std::fmt::Write;
        let searches = match family {
            Family::V4 => &self.searches4,
            Family::V6 => &self.searches6,
        };
        let mut out = String::new();
        for sr in searches.values() {
            let _ = writeln!(
                out,
                "search {} nodes {} synced {} done {} expired {} gets {} puts {} listeners {}",
                sr.id,
                sr.nodes.len(),
                sr.is_synced(now),
                sr.done,
                sr.expired,
                sr.callbacks.len(),
                sr.announces.len(),
                sr.listeners.len()
            );
        }
        out
    }

    // === Message processing ===

    fn process_message(&mut self, message: Message, from: SocketAddr, now: Instant) {
        if is_martian(&from) {
            trace!(%from, "dropping martian datagram");
            return;
        }
        if self.blacklist.contains(&from) {
            trace!(%from, "dropping blacklisted datagram");
            return;
        }
        if *message.author() == self.myid {
            trace!(%from, "dropping datagram claiming our own id");
            return;
        }

        match self.engine.process(message, from, now) {
            Some(NetEvent::Request {
                from,
                tid,
                id,
                kind,
            }) => self.handle_request(from, tid, id, kind, now),
            Some(NetEvent::Reply {
                request,
                from,
                author,
                answer,
            }) => self.handle_reply(request, from, author, answer, now),
            Some(NetEvent::RequestError { request, code }) => {
                self.handle_request_error(request, code, now)
            }
            Some(NetEvent::ListenPush { rid, values, .. }) => {
                self.handle_listen_push(rid, values)
            }
            None => {}
        }
    }

    fn handle_request(
        &mut self,
        from: SocketAddr,
        tid: Tid,
        id: InfoHash,
        kind: RequestKind,
        now: Instant,
    ) {
        let node = self.cache.resolve(&id, from, now, Confirm::Seen);
        self.routing_insert(&node, false, now);

        match kind {
            RequestKind::Ping => {
                trace!(%from, "ping");
                let mut answer = ReplyArguments::new();
                answer.token = Some(self.tokens.make_token(&from, false));
                answer.requester_addr = Some(from);
                self.engine.send_reply(from, tid, answer);
            }
            RequestKind::FindNode { target, want } => {
                trace!(%from, %target, "find_node");
                let mut answer = self.closest_nodes_answer(&target, want);
                answer.requester_addr = Some(from);
                self.engine.send_reply(from, tid, answer);
            }
            RequestKind::GetValues { hash, want } => {
                trace!(%from, key = %hash, "get_values");
                let mut answer = self.closest_nodes_answer(&hash, want);
                if let Some(index) = self.find_storage(&hash) {
                    answer.values = self.store[index]
                        .get(None)
                        .iter()
                        .map(|v| (**v).clone())
                        .collect();
                }
                answer.token = Some(self.tokens.make_token(&from, false));
                answer.requester_addr = Some(from);
                self.engine.send_reply(from, tid, answer);
            }
            RequestKind::Listen { hash, token, rid } => {
                if !self.tokens.token_match(&token, &from) {
                    debug!(%from, key = %hash, "listen with wrong token");
                    self.engine.send_error(from, tid, error_code::WRONG_TOKEN);
                    return;
                }
                match self.find_or_create_storage(hash, now) {
                    Some(index) => {
                        self.store[index].add_listener(id, from, rid, now);
                        debug!(%from, key = %hash, rid, "registered listener");
                    }
                    None => debug!(key = %hash, "cannot track more keys, listener dropped"),
                }
                let mut answer = self.closest_nodes_answer(&hash, Want::Both);
                if let Some(index) = self.find_storage(&hash) {
                    answer.values = self.store[index]
                        .get(None)
                        .iter()
                        .map(|v| (**v).clone())
                        .collect();
                }
                answer.token = Some(self.tokens.make_token(&from, false));
                answer.rid = Some(rid);
                self.engine.send_reply(from, tid, answer);
            }
            RequestKind::AnnounceValues {
                hash,
                token,
                values,
                created,
            } => {
                if !self.tokens.token_match(&token, &from) {
                    debug!(%from, key = %hash, "announce with wrong token");
                    self.engine.send_error(from, tid, error_code::WRONG_TOKEN);
                    return;
                }
                let created = created.unwrap_or(now).min(now);
                for value in values {
                    self.storage_store(hash, Rc::new(value), created, now);
                }
                // Ack unconditionally; a quota rejection is not the peer's
                // business and turning it into an error invites amplification.
                let mut answer = ReplyArguments::new();
                answer.requester_addr = Some(from);
                self.engine.send_reply(from, tid, answer);
            }
        }
    }

    fn handle_reply(
        &mut self,
        request: RequestRef,
        from: SocketAddr,
        author: InfoHash,
        answer: ReplyArguments,
        now: Instant,
    ) {
        // The responder proved itself alive under its claimed id.
        let node = self.cache.resolve(&author, from, now, Confirm::Replied);
        self.routing_insert(&node, true, now);

        if let Some(addr) = answer.requester_addr {
            self.reported_addr(addr);
        }

        // Hearsay nodes feed the routing tables and any search in range.
        for export in answer.nodes4.iter().chain(answer.nodes6.iter()) {
            if is_martian(&export.addr) || export.id == self.myid {
                continue;
            }
            let n = self.cache.resolve(&export.id, export.addr, now, Confirm::None);
            self.routing_insert(&n, false, now);
            self.try_search_insert(&n, now);
        }

        let values: Vec<Rc<Value>> = answer.values.into_iter().map(Rc::new).collect();

        match request.borrow().purpose() {
            Purpose::Ping | Purpose::MaintenanceFindNode { .. } => {}
            Purpose::SearchGet { family, target } => {
                let searches = match family {
                    Family::V4 => &mut self.searches4,
                    Family::V6 => &mut self.searches6,
                };
                if let Some(sr) = searches.get_mut(&target) {
                    sr.insert_node(node.clone(), now, answer.token.as_ref());
                    sr.deliver_values(&values);
                    self.schedule_search_step(family, target, now);
                }
            }
            Purpose::SearchListen { family, target } => {
                let searches = match family {
                    Family::V4 => &mut self.searches4,
                    Family::V6 => &mut self.searches6,
                };
                if let Some(sr) = searches.get_mut(&target) {
                    sr.deliver_values(&values);
                    self.schedule_search_step(family, target, now);
                }
            }
            Purpose::SearchAnnounce {
                family, target, ..
            } => {
                self.schedule_search_step(family, target, now);
            }
        }
    }

    fn handle_request_error(&mut self, request: RequestRef, code: u16, now: Instant) {
        let (purpose, node) = {
            let req = request.borrow();
            (req.purpose(), req.node().clone())
        };
        match purpose {
            Purpose::SearchAnnounce { family, target, .. }
            | Purpose::SearchListen { family, target } => {
                if code == error_code::WRONG_TOKEN {
                    // Our token aged out mid-flight; drop it so the next get
                    // fetches a fresh one before we retry the write.
                    let searches = match family {
                        Family::V4 => &mut self.searches4,
                        Family::V6 => &mut self.searches6,
                    };
                    if let Some(sr) = searches.get_mut(&target) {
                        if let Some(sn) =
                            sr.nodes.iter_mut().find(|sn| sn.node.id() == node.id())
                        {
                            debug!(node = %node.id(), key = %target, "token rejected, clearing");
                            sn.token = None;
                            sn.last_get_reply = None;
                        }
                    }
                }
                self.schedule_search_step(family, target, now);
            }
            Purpose::SearchGet { family, target } => {
                self.schedule_search_step(family, target, now);
            }
            Purpose::Ping | Purpose::MaintenanceFindNode { .. } => {}
        }
    }

    fn handle_listen_push(&mut self, rid: ListenId, values: Vec<Value>) {
        let Some(&(family, target)) = self.listen_rids.get(&rid) else {
            trace!(rid, "push for unknown listen id");
            return;
        };
        let values: Vec<Rc<Value>> = values.into_iter().map(Rc::new).collect();
        let searches = match family {
            Family::V4 => &mut self.searches4,
            Family::V6 => &mut self.searches6,
        };
        if let Some(sr) = searches.get_mut(&target) {
            debug!(key = %target, count = values.len(), "listen push");
            sr.deliver_values(&values);
        }
    }

    // === Jobs ===

    fn run_job(&mut self, job: Job, now: Instant) {
        match job {
            Job::SearchStep { family, target } => self.run_search_step(family, target, now),
            Job::RequestTimeout { tid } => self.run_request_timeout(tid, now),
            Job::ConfirmNodes => self.run_confirm_nodes(now),
            Job::RotateSecrets => {
                self.tokens.rotate();
                self.scheduler
                    .add(now + SECRET_ROTATE_INTERVAL, Job::RotateSecrets);
            }
            Job::ExpireState => self.run_expire_state(now),
            Job::DataPersistence => self.run_data_persistence(now),
            Job::ShutdownDrain => self.run_shutdown_drain(now),
        }
    }

    fn run_search_step(&mut self, family: Family, target: InfoHash, now: Instant) {
        let searches = match family {
            Family::V4 => &mut self.searches4,
            Family::V6 => &mut self.searches6,
        };
        let Some(mut sr) = searches.remove(&target) else {
            return;
        };

        {
            let table = match family {
                Family::V4 => &self.buckets4,
                Family::V6 => &self.buckets6,
            };
            let mut ctx = SearchCtx {
                engine: &mut self.engine,
                scheduler: &mut self.scheduler,
                types: &self.types,
                table,
                now,
            };
            sr.step(&mut ctx);
        }

        let searches = match family {
            Family::V4 => &mut self.searches4,
            Family::V6 => &mut self.searches6,
        };
        searches.insert(target, sr);
    }

    fn run_request_timeout(&mut self, tid: Tid, now: Instant) {
        let Some(request) = self.engine.timeout(&mut self.scheduler, tid, now) else {
            return;
        };
        let purpose = request.borrow().purpose();
        match purpose {
            Purpose::SearchGet { family, target }
            | Purpose::SearchListen { family, target }
            | Purpose::SearchAnnounce { family, target, .. } => {
                // The search will backtrack to the next candidate.
                self.schedule_search_step(family, target, now);
            }
            Purpose::Ping | Purpose::MaintenanceFindNode { .. } => {}
        }
    }

    fn run_confirm_nodes(&mut self, now: Instant) {
        for family in [Family::V4, Family::V6] {
            self.bucket_maintenance(family, now);
            self.neighbourhood_maintenance(family, now);
        }
        self.scheduler.add(
            now + jitter(CONFIRM_NODES_MIN, CONFIRM_NODES_MAX),
            Job::ConfirmNodes,
        );
    }

    fn run_expire_state(&mut self, now: Instant) {
        // Buckets: drop dead nodes, and give their cached replacements a
        // chance to take the vacancy.
        let pings: Vec<SocketAddr> = {
            let mut pings = self.buckets4.expire();
            pings.extend(self.buckets6.expire());
            pings
        };
        for addr in pings {
            self.ping_node(addr, now);
        }

        self.expire_storage(now);
        self.expire_searches(now);

        self.scheduler.add(
            now + jitter(EXPIRE_STATE_MIN, EXPIRE_STATE_MAX),
            Job::ExpireState,
        );
    }

    fn run_data_persistence(&mut self, now: Instant) {
        let due: Vec<InfoHash> = self
            .store
            .iter()
            .filter(|st| st.maintenance_time <= now)
            .map(|st| st.id)
            .collect();
        for id in due {
            self.maintain_storage(id, false, None, now);
        }
        let next = self
            .store
            .iter()
            .map(|st| st.maintenance_time)
            .min()
            .unwrap_or(now + MAX_STORAGE_MAINTENANCE_EXPIRE_TIME);
        self.scheduler
            .add(next.max(now + Duration::from_secs(60)), Job::DataPersistence);
    }

    fn run_shutdown_drain(&mut self, now: Instant) {
        let Some(state) = &mut self.shutdown else {
            return;
        };
        if state.remaining.get() == 0 || now >= state.deadline {
            if let Some(cb) = state.callback.take() {
                cb();
            }
            self.shutdown = None;
        } else {
            self.scheduler.add(now + SHUTDOWN_POLL, Job::ShutdownDrain);
        }
    }

    // === Nodes and routing ===

    fn table(&self, family: Family) -> &RoutingTable {
        match family {
            Family::V4 => &self.buckets4,
            Family::V6 => &self.buckets6,
        }
    }

    fn routing_insert(&mut self, node: &NodeRef, reply: bool, now: Instant) {
        if *node.id() == self.myid {
            return;
        }
        let myid = self.myid;
        let is_bootstrap = self.is_bootstrap;
        let table = match node.family() {
            Family::V4 => &mut self.buckets4,
            Family::V6 => &mut self.buckets6,
        };
        if let InsertOutcome::Full { ping: Some(dubious) } =
            table.on_heard(node, &myid, is_bootstrap, reply, now)
        {
            // Probe the dubious occupant; if it stays silent the cached
            // address takes its place at the next expiry pass.
            self.engine.send_request(
                &mut self.scheduler,
                dubious,
                RequestKind::Ping,
                Purpose::Ping,
                now,
            );
        }
    }

    /// Offer a freshly heard-of node to every search it is relevant to.
    fn try_search_insert(&mut self, node: &NodeRef, now: Instant) {
        let family = node.family();
        let searches = match family {
            Family::V4 => &mut self.searches4,
            Family::V6 => &mut self.searches6,
        };
        let mut woken = Vec::new();
        for sr in searches.values_mut() {
            if !sr.expired && sr.insert_node(node.clone(), now, None) {
                woken.push(sr.id);
            }
        }
        for target in woken {
            self.schedule_search_step(family, target, now);
        }
    }

    fn reported_addr(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.reported_addrs.iter_mut().find(|(_, a)| *a == addr) {
            entry.0 += 1;
        } else {
            self.reported_addrs.push((1, addr));
        }
    }

    fn closest_nodes_answer(&self, target: &InfoHash, want: Want) -> ReplyArguments {
        let mut answer = ReplyArguments::new();
        if want.v4() {
            answer.nodes4 = self
                .buckets4
                .find_closest_nodes(target, TARGET_NODES)
                .iter()
                .map(|n| n.export())
                .collect();
        }
        if want.v6() {
            answer.nodes6 = self
                .buckets6
                .find_closest_nodes(target, TARGET_NODES)
                .iter()
                .map(|n| n.export())
                .collect();
        }
        answer
    }

    // === Searches ===

    fn ensure_search(&mut self, key: InfoHash, family: Family, now: Instant) -> &mut Search {
        let table = match family {
            Family::V4 => &self.buckets4,
            Family::V6 => &self.buckets6,
        };
        let searches = match family {
            Family::V4 => &mut self.searches4,
            Family::V6 => &mut self.searches6,
        };

        if !searches.contains_key(&key) && searches.len() >= MAX_SEARCHES {
            // Evict the longest-idle search with no pending work.
            let evict = searches
                .values()
                .filter(|sr| !sr.has_work())
                .min_by_key(|sr| sr.step_time)
                .map(|sr| sr.id);
            if let Some(id) = evict {
                if let Some(sr) = searches.remove(&id) {
                    if let Some(job) = sr.next_step_job {
                        self.scheduler.cancel(job);
                    }
                    if let Some(rid) = sr.listen_rid {
                        self.listen_rids.remove(&rid);
                    }
                }
            }
        }

        let searches = match family {
            Family::V4 => &mut self.searches4,
            Family::V6 => &mut self.searches6,
        };
        let sr = searches.entry(key).or_insert_with(|| {
            debug!(%key, ?family, "new search");
            Search::new(key, family)
        });
        if sr.nodes.is_empty() {
            sr.bootstrap(table, now);
        }
        sr
    }

    fn schedule_search_step(&mut self, family: Family, target: InfoHash, at: Instant) {
        let scheduler = &mut self.scheduler;
        let searches = match family {
            Family::V4 => &mut self.searches4,
            Family::V6 => &mut self.searches6,
        };
        if let Some(sr) = searches.get_mut(&target) {
            sr.next_step_job = Some(match sr.next_step_job.take() {
                Some(job) => scheduler.advance(job, at),
                None => scheduler.add(at, Job::SearchStep { family, target }),
            });
        }
    }

    /// Register an announce on one family's search.
    fn announce(
        &mut self,
        key: InfoHash,
        family: Family,
        value: Rc<Value>,
        done_cb: Option<DoneCallback>,
        created: Instant,
        now: Instant,
    ) {
        let vid = value.id;
        let sr = self.ensure_search(key, family, now);
        sr.done = false;
        if let Some(a) = sr.announces.iter_mut().find(|a| a.value.id == vid) {
            // Same value id: replace the payload and re-arm the callback.
            a.value = value;
            a.created = created;
            if done_cb.is_some() {
                a.done_cb = done_cb;
            }
        } else {
            sr.announces.push(Announce {
                value,
                created,
                done_cb,
            });
        }
        // A fresh announce must reach even nodes that acked the old payload.
        for sn in &mut sr.nodes {
            sn.acked.remove(&vid);
        }
        self.schedule_search_step(family, key, now);
    }

    fn expire_searches(&mut self, now: Instant) {
        let scheduler = &mut self.scheduler;
        let listen_rids = &mut self.listen_rids;
        for searches in [&mut self.searches4, &mut self.searches6] {
            searches.retain(|_, sr| {
                let idle = sr
                    .step_time
                    .map_or(false, |t| t + SEARCH_EXPIRE_TIME <= now);
                let keep = sr.has_work() || !(idle || sr.expired);
                if !keep {
                    debug!(key = %sr.id, family = ?sr.family, "dropping idle search");
                    if let Some(job) = sr.next_step_job.take() {
                        scheduler.cancel(job);
                    }
                    if let Some(rid) = sr.listen_rid {
                        listen_rids.remove(&rid);
                    }
                }
                keep
            });
        }
    }

    // === Storage ===

    fn find_storage(&self, id: &InfoHash) -> Option<usize> {
        self.store.iter().position(|st| st.id == *id)
    }

    fn find_or_create_storage(&mut self, id: InfoHash, now: Instant) -> Option<usize> {
        match self.find_storage(&id) {
            Some(index) => Some(index),
            None if self.store.len() < MAX_HASHES => {
                self.store.push(Storage::new(id, now));
                Some(self.store.len() - 1)
            }
            None => None,
        }
    }

    /// Admit a value to local storage, honoring quotas and type policies,
    /// and fan out to listeners when the payload changed.
    fn storage_store(
        &mut self,
        id: InfoHash,
        value: Rc<Value>,
        created: Instant,
        now: Instant,
    ) -> bool {
        let Some(index) = self.find_or_create_storage(id, now) else {
            debug!(key = %id, "cannot track more keys, store rejected");
            return false;
        };
        let size_left = self.max_store_size as isize - self.total_store_size as isize;
        match self.store[index].store(&self.types, value.clone(), created, size_left) {
            Ok(change) => {
                self.total_store_size = (self.total_store_size as isize + change.size_delta)
                    as usize;
                self.total_values = (self.total_values as isize + change.count_delta) as usize;
                trace!(key = %id, vid = value.id, changed = change.changed, "value stored");
                if change.changed {
                    self.storage_changed(index, value);
                }
                true
            }
            Err(StoreError::QuotaExceeded) => {
                debug!(key = %id, vid = value.id, "store rejected: quota exceeded");
                false
            }
            Err(e) => {
                debug!(key = %id, vid = value.id, error = ?e, "store rejected");
                false
            }
        }
    }

    /// Fan a changed value out to local and foreign listeners of its key.
    fn storage_changed(&mut self, index: usize, value: Rc<Value>) {
        let st = &self.store[index];
        for listener in st.local_listeners.values() {
            if (listener.filter)(&value) {
                (listener.get_cb)(&[value.clone()]);
            }
        }
        for listener in &st.listeners {
            trace!(key = %st.id, to = %listener.addr, rid = listener.rid, "pushing value");
            self.engine
                .push_values(listener.addr, listener.rid, vec![(*value).clone()]);
        }
    }

    fn expire_storage(&mut self, now: Instant) {
        let mut freed_size = 0;
        let mut freed_count = 0;
        let types = &self.types;
        self.store.retain_mut(|st| {
            let (size, count) = st.expire(types, now);
            freed_size += size;
            freed_count += count;
            st.expire_listeners(now);
            !st.is_empty() || !st.listeners.is_empty() || !st.local_listeners.is_empty()
        });
        self.total_store_size -= freed_size;
        self.total_values -= freed_count;
        if freed_count > 0 {
            debug!(freed_count, freed_size, "expired storage");
        }
    }

    /// Re-announce a storage's values when this node is no longer among the
    /// key's closest, or when forced (shutdown). Returns announce count.
    fn maintain_storage(
        &mut self,
        id: InfoHash,
        force: bool,
        remaining: Option<Rc<Cell<usize>>>,
        now: Instant,
    ) -> usize {
        let Some(index) = self.find_storage(&id) else {
            return 0;
        };
        let mut announced = 0;

        for family in [Family::V4, Family::V6] {
            let closest = self.table(family).find_closest_nodes(&id, TARGET_NODES);
            let Some(farthest) = closest.last() else {
                continue;
            };
            // Drifted away: the farthest of the key's closest peers is still
            // closer to it than we are.
            let drifted =
                closest.len() >= TARGET_NODES && id.xor_cmp(farthest.id(), &self.myid).is_lt();
            if !(force || drifted) {
                continue;
            }

            let values: Vec<(Rc<Value>, Instant)> = self.store[index]
                .values()
                .iter()
                .map(|v| (v.data.clone(), v.time))
                .collect();
            for (value, time) in values {
                let expiration = self.types.get(value.value_type).expiration;
                if force || time + expiration > now + MAX_STORAGE_MAINTENANCE_EXPIRE_TIME {
                    let done: Option<DoneCallback> = remaining.clone().map(|r| {
                        r.set(r.get() + 1);
                        Box::new(move |_ok: bool, _nodes: &[NodeRef]| {
                            r.set(r.get() - 1);
                        }) as DoneCallback
                    });
                    self.announce(id, family, value, done, time, now);
                    announced += 1;
                }
            }
        }

        if let Some(index) = self.find_storage(&id) {
            self.store[index].maintenance_time = now + MAX_STORAGE_MAINTENANCE_EXPIRE_TIME;
        }
        announced
    }

    // === Maintenance ===

    /// Refresh stale buckets with a lookup for a random id inside them.
    fn bucket_maintenance(&mut self, family: Family, now: Instant) {
        let mut lookups: Vec<(InfoHash, NodeRef)> = Vec::new();
        {
            let table = self.table(family);
            for index in 0..table.bucket_count() {
                let bucket = table.bucket(index);
                let stale = bucket
                    .time
                    .map_or(true, |t| t + BUCKET_REFRESH_TIME <= now);
                if !stale {
                    continue;
                }
                if let Some(node) = bucket.random_node() {
                    if node.should_ping(now) {
                        lookups.push((table.random_id(index), node.clone()));
                    }
                }
            }
        }
        for (target, node) in lookups {
            trace!(%target, node = %node.id(), "bucket maintenance lookup");
            self.engine.send_request(
                &mut self.scheduler,
                node,
                RequestKind::FindNode {
                    target,
                    want: Want::Both,
                },
                Purpose::MaintenanceFindNode { family },
                now,
            );
        }
    }

    /// Keep the neighbourhood of our own id populated.
    fn neighbourhood_maintenance(&mut self, family: Family, now: Instant) {
        let lookup = {
            let table = self.table(family);
            let index = table.find_bucket(&self.myid);
            let target = table.random_id(index);
            let node = table
                .bucket(index)
                .random_node()
                .or_else(|| {
                    (index + 1 < table.bucket_count())
                        .then(|| table.bucket(index + 1).random_node())
                        .flatten()
                })
                .or_else(|| {
                    (index > 0)
                        .then(|| table.bucket(index - 1).random_node())
                        .flatten()
                });
            node.map(|n| (target, n.clone()))
        };
        if let Some((target, node)) = lookup {
            trace!(%target, node = %node.id(), "neighbourhood lookup");
            self.engine.send_request(
                &mut self.scheduler,
                node,
                RequestKind::FindNode {
                    target,
                    want: Want::Both,
                },
                Purpose::MaintenanceFindNode { family },
                now,
            );
        }
    }

    fn check_operational(&self) -> Result<()> {
        if self.shutting_down {
            return Err(Error::ShuttingDown);
        }
        if self.is_bootstrap {
            return Err(Error::BootstrapOnly);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Dht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht")
            .field("myid", &self.myid)
            .field("nodes4", &self.buckets4.node_count())
            .field("nodes6", &self.buckets6.node_count())
            .field("searches4", &self.searches4.len())
            .field("searches6", &self.searches6.len())
            .field("store", &self.store.len())
            .finish()
    }
}

fn jitter(min: Duration, max: Duration) -> Duration {
    let spread = (max - min).as_millis() as u64;
    min + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

/// Reserved or plainly invalid sender addresses are dropped before any state
/// is touched.
fn is_martian(addr: &SocketAddr) -> bool {
    if addr.port() == 0 {
        return true;
    }
    match addr.ip() {
        IpAddr::V4(ip) => {
            let octets = ip.octets();
            ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() || octets[0] == 0
        }
        IpAddr::V6(ip) => ip.is_unspecified() || ip.is_multicast(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_dht(id: u8) -> (Dht, flume::Receiver<(SocketAddr, Message)>, Instant) {
        let (tx, rx) = flume::unbounded();
        let now = Instant::now();
        let mut node_id = InfoHash::ZERO;
        node_id.0[0] = id;
        (
            Dht::new(Config::default().with_node_id(node_id), tx, now),
            rx,
            now,
        )
    }

    #[test]
    fn local_put_get() {
        let (mut dht, _rx, now) = new_dht(0xaa);
        let key = InfoHash([0xaa; 20]);
        let value = Value::new(1, 0, &b"x"[..]);

        dht.put(key, value.clone(), None, None, now).unwrap();
        assert_eq!(dht.get_local_by_id(&key, 1).unwrap().data, value.data);

        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        dht.get(
            key,
            Rc::new(move |values: &[Rc<Value>]| {
                got2.borrow_mut().extend(values.iter().map(|v| v.id));
                true
            }),
            None,
            None,
            now,
        )
        .unwrap();
        assert_eq!(*got.borrow(), vec![1]);
    }

    #[test]
    fn storage_quota_counts_two_of_three() {
        let (mut dht, _rx, now) = new_dht(1);
        dht.set_storage_limit(1024);

        let key = |b: u8| {
            let mut k = InfoHash::ZERO;
            k.0[0] = b;
            k
        };
        for (i, k) in [1u8, 2, 3].into_iter().enumerate() {
            let value = Value::new(i as u64 + 1, 0, vec![0u8; 400 - 32]);
            dht.storage_store(key(k), Rc::new(value), now, now);
        }

        assert_eq!(dht.store_size(), (800, 2));
    }

    #[test]
    fn bootstrap_node_refuses_operations() {
        let (tx, _rx) = flume::unbounded();
        let now = Instant::now();
        let mut dht = Dht::new(Config::default().with_bootstrap_mode(true), tx, now);

        let err = dht
            .put(InfoHash::random(), Value::new(1, 0, &b"x"[..]), None, None, now)
            .unwrap_err();
        assert!(matches!(err, Error::BootstrapOnly));
    }

    #[test]
    fn values_export_import_round_trip() {
        let (mut dht, _rx, now) = new_dht(2);
        let key = InfoHash::random();
        dht.storage_store(key, Rc::new(Value::new(7, 0, &b"payload"[..])), now, now);

        let exported = dht.export_values(now);
        assert_eq!(exported.len(), 1);

        let (mut other, _rx2, t2) = new_dht(3);
        let imported = other.import_values(&exported, t2).unwrap();
        assert_eq!(imported, 1);
        assert_eq!(&other.get_local_by_id(&key, 7).unwrap().data[..], b"payload");
    }

    #[test]
    fn listen_sees_local_stores() {
        let (mut dht, _rx, now) = new_dht(4);
        let key = InfoHash::random();

        let got = Rc::new(RefCell::new(Vec::new()));
        let got2 = got.clone();
        dht.listen(
            key,
            Rc::new(move |values: &[Rc<Value>]| {
                got2.borrow_mut().extend(values.iter().map(|v| v.id));
                true
            }),
            None,
            now,
        )
        .unwrap();

        dht.storage_store(key, Rc::new(Value::new(42, 0, &b"v"[..])), now, now);
        assert_eq!(*got.borrow(), vec![42]);

        // Same payload again: no change, no callback.
        dht.storage_store(key, Rc::new(Value::new(42, 0, &b"v"[..])), now, now);
        assert_eq!(*got.borrow(), vec![42]);
    }

    #[test]
    fn cancel_put_stops_reannouncing() {
        let (mut dht, _rx, now) = new_dht(6);
        let key = InfoHash::random();

        dht.put(key, Value::new(9, 0, &b"x"[..]), None, None, now).unwrap();
        assert_eq!(dht.get_put(&key).len(), 1);
        assert!(dht.get_put_value(&key, 9).is_some());

        assert!(dht.cancel_put(&key, 9));
        assert!(dht.get_put(&key).is_empty());
        assert!(!dht.cancel_put(&key, 9));
    }

    #[test]
    fn cancel_listen_removes_all_sides() {
        let (mut dht, _rx, now) = new_dht(7);
        let key = InfoHash::random();

        let token = dht.listen(key, Rc::new(|_| true), None, now).unwrap();
        assert!(dht.cancel_listen(&key, token));
        assert!(!dht.cancel_listen(&key, token));

        // A store after cancellation reaches nobody.
        let heard = Rc::new(Cell::new(0u32));
        {
            let heard = heard.clone();
            let t = dht
                .listen(
                    key,
                    Rc::new(move |_| {
                        heard.set(heard.get() + 1);
                        true
                    }),
                    None,
                    now,
                )
                .unwrap();
            dht.cancel_listen(&key, t);
        }
        dht.storage_store(key, Rc::new(Value::new(1, 0, &b"v"[..])), now, now);
        assert_eq!(heard.get(), 0);
    }

    #[test]
    fn shutdown_fires_callback_and_blocks_operations() {
        let (mut dht, _rx, now) = new_dht(8);
        let fired = Rc::new(Cell::new(false));
        {
            let fired = fired.clone();
            dht.shutdown(Box::new(move || fired.set(true)), now);
        }

        assert!(matches!(
            dht.get(InfoHash::random(), Rc::new(|_| true), None, None, now),
            Err(Error::ShuttingDown)
        ));

        dht.periodic(None, now);
        assert!(fired.get());
    }

    #[test]
    fn blacklist_ring_is_bounded() {
        let (mut dht, _rx, _now) = new_dht(5);
        for i in 0..20u16 {
            dht.blacklist_node(SocketAddr::from(([10, 0, 0, 1], 1000 + i)));
        }
        assert_eq!(dht.blacklist.len(), BLACKLISTED_MAX);
    }

    #[test]
    fn martian_addresses() {
        assert!(is_martian(&SocketAddr::from(([10, 0, 0, 1], 0))));
        assert!(is_martian(&SocketAddr::from(([0, 0, 0, 0], 42))));
        assert!(is_martian(&SocketAddr::from(([224, 0, 0, 1], 42))));
        assert!(!is_martian(&SocketAddr::from(([10, 0, 0, 1], 42))));
    }
}
