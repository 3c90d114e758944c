//! End-to-end scenarios over an in-memory datagram router.
//!
//! Each node's outbound channel is drained into a shared in-flight queue and
//! delivered to the destination node's `periodic`, with the clock advanced
//! manually, so whole multi-node exchanges run deterministically.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::str::FromStr;
use std::time::{Duration, Instant};

use kadmos::messages::Message;
use kadmos::{Config, Dht, Family, InfoHash, Status, Value};

struct TestNode {
    addr: SocketAddr,
    dht: Dht,
    rx: flume::Receiver<(SocketAddr, Message)>,
}

struct TestNet {
    nodes: Vec<TestNode>,
    in_flight: Vec<(SocketAddr, SocketAddr, Message)>,
    now: Instant,
}

impl TestNet {
    fn new() -> TestNet {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        TestNet {
            nodes: Vec::new(),
            in_flight: Vec::new(),
            now: Instant::now(),
        }
    }

    fn add_node(&mut self, id: InfoHash, last_octet: u8) -> SocketAddr {
        let addr = SocketAddr::from(([10, 0, 0, last_octet], 4000));
        let (tx, rx) = flume::unbounded();
        let dht = Dht::new(Config::default().with_node_id(id), tx, self.now);
        self.nodes.push(TestNode { addr, dht, rx });
        addr
    }

    fn dht(&mut self, addr: SocketAddr) -> &mut Dht {
        &mut self
            .nodes
            .iter_mut()
            .find(|n| n.addr == addr)
            .expect("unknown node")
            .dht
    }

    /// Move freshly sent messages into the in-flight queue.
    fn pump(&mut self) {
        for node in &self.nodes {
            for (to, message) in node.rx.try_iter() {
                self.in_flight.push((node.addr, to, message));
            }
        }
    }

    /// Deliver matching in-flight messages once, at the current time.
    fn deliver_where(&mut self, keep: impl Fn(&SocketAddr, &SocketAddr, &Message) -> bool) {
        let (deliver, hold): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|(from, to, m)| keep(from, to, m));
        self.in_flight = hold;
        let now = self.now;
        for (from, to, message) in deliver {
            if let Some(node) = self.nodes.iter_mut().find(|n| n.addr == to) {
                node.dht.periodic(Some((message, from)), now);
            }
        }
    }

    /// Pump and deliver until the network is quiet.
    fn settle(&mut self) {
        for _ in 0..64 {
            self.pump();
            if self.in_flight.is_empty() {
                return;
            }
            self.deliver_where(|_, _, _| true);
        }
        panic!("network did not settle");
    }

    /// Advance the clock, run every node's due jobs, settle the traffic.
    fn tick(&mut self, dt: Duration) {
        self.now += dt;
        let now = self.now;
        for node in &mut self.nodes {
            node.dht.periodic(None, now);
        }
        self.settle();
    }
}

fn id_with_first_byte(b: u8) -> InfoHash {
    let mut id = InfoHash::ZERO;
    id.0[0] = b;
    id
}

/// S1: a ping to a bootstrap address populates the routing table.
#[test]
fn bootstrap_ping_connects() {
    let mut net = TestNet::new();
    let a_id = InfoHash::ZERO;
    let b_id = id_with_first_byte(0x80);
    let a = net.add_node(a_id, 1);
    let b = net.add_node(b_id, 2);

    let now = net.now;
    net.dht(a).ping_node(b, now);
    net.settle();

    let now = net.now;
    assert_eq!(net.dht(a).status(Family::V4, now), Status::Connected);
    assert_eq!(net.dht(a).nodes_stats(Family::V4, now).0, 1);
    // One bucket, containing B.
    let log = net.dht(a).tables_log(Family::V4, now);
    assert_eq!(log.matches("bucket ").count(), 1);
    assert!(log.contains(&b_id.to_string()));
}

/// S2: put and get on a single node go through local storage synchronously.
#[test]
fn put_get_same_node() {
    let mut net = TestNet::new();
    let a = net.add_node(id_with_first_byte(0xaa), 1);
    let key = InfoHash([0xaa; 20]);
    let value = Value::new(1, 0, &b"x"[..]);

    let now = net.now;
    net.dht(a).put(key, value.clone(), None, None, now).unwrap();
    assert_eq!(net.dht(a).get_local_by_id(&key, 1).unwrap().data, value.data);

    let got = Rc::new(RefCell::new(Vec::new()));
    let got2 = got.clone();
    net.dht(a)
        .get(
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

/// S3: a get on one node fetches a value stored on another.
#[test]
fn two_node_get() {
    let mut net = TestNet::new();
    let a_id = InfoHash::ZERO;
    let b_id = InfoHash([0xff; 20]);
    let a = net.add_node(a_id, 1);
    let b = net.add_node(b_id, 2);
    let key = id_with_first_byte(0xf0);

    // A holds the value; B knows A.
    let now = net.now;
    net.dht(a)
        .put(key, Value::new(1, 0, &b"payload"[..]), None, None, now)
        .unwrap();
    net.settle();
    net.dht(b).ping_node(a, now);
    net.settle();

    let got = Rc::new(RefCell::new(Vec::new()));
    let done = Rc::new(Cell::new(None::<bool>));
    {
        let got = got.clone();
        let done = done.clone();
        let now = net.now;
        net.dht(b)
            .get(
                key,
                Rc::new(move |values: &[Rc<Value>]| {
                    got.borrow_mut()
                        .extend(values.iter().map(|v| (v.id, v.data.clone())));
                    true
                }),
                Some(Box::new(move |ok, _nodes| done.set(Some(ok)))),
                None,
                now,
            )
            .unwrap();
    }

    net.tick(Duration::from_millis(10));
    net.tick(Duration::from_secs(1));

    assert_eq!(got.borrow().len(), 1);
    assert_eq!(got.borrow()[0].0, 1);
    assert_eq!(&got.borrow()[0].1[..], b"payload");
    assert_eq!(done.get(), Some(true));
}

/// S4: a token invalidated by two secret rotations is renegotiated
/// transparently before the announce succeeds.
#[test]
fn token_expiry_renegotiation() {
    let mut net = TestNet::new();
    let a_id = InfoHash([0xff; 20]);
    let b_id = InfoHash::ZERO;
    let a = net.add_node(a_id, 1);
    let b = net.add_node(b_id, 2);
    let key = id_with_first_byte(0xf8);

    let t0 = net.now;
    net.dht(b).ping_node(a, t0);
    net.settle();

    let done = Rc::new(Cell::new(None::<bool>));
    {
        let done = done.clone();
        net.dht(b)
            .put(
                key,
                Value::new(1, 0, &b"v"[..]),
                Some(Box::new(move |ok, _| done.set(Some(ok)))),
                None,
                t0,
            )
            .unwrap();
    }

    // Run the token handshake but hold B's announce back.
    net.dht(b).periodic(None, t0);
    for _ in 0..8 {
        net.pump();
        net.deliver_where(|_, _, m| {
            !matches!(
                m,
                Message::Request {
                    kind: kadmos::messages::RequestKind::AnnounceValues { .. },
                    ..
                }
            )
        });
    }
    net.pump();
    assert!(
        !net.in_flight.is_empty(),
        "expected an announce to be held in flight"
    );

    // A's secrets rotate twice while the announce is on the wire.
    let far = t0 + Duration::from_secs(11 * 60);
    net.dht(a).periodic(None, far);
    for node in &net.nodes {
        // Drop A's own maintenance traffic; only the held announce matters.
        node.rx.try_iter().for_each(drop);
    }

    // The stale announce is rejected, B renegotiates and retries.
    net.now += Duration::from_millis(100);
    net.deliver_where(|_, _, _| true);
    net.settle();
    net.tick(Duration::from_secs(4));
    net.tick(Duration::from_secs(4));

    assert!(net.dht(a).get_local_by_id(&key, 1).is_some());
    assert_eq!(done.get(), Some(true));
}

/// S5: a value announced by a third node is pushed to a listener.
#[test]
fn listener_receives_push() {
    let mut net = TestNet::new();
    let a = net.add_node(id_with_first_byte(0x10), 1);
    let b = net.add_node(InfoHash([0xff; 20]), 2);
    let c = net.add_node(id_with_first_byte(0x20), 3);
    let key = id_with_first_byte(0xf0);

    let now = net.now;
    net.dht(a).ping_node(b, now);
    net.dht(c).ping_node(b, now);
    net.settle();

    let heard = Rc::new(RefCell::new(Vec::new()));
    {
        let heard = heard.clone();
        let now = net.now;
        net.dht(a)
            .listen(
                key,
                Rc::new(move |values: &[Rc<Value>]| {
                    heard.borrow_mut().extend(values.iter().map(|v| v.id));
                    true
                }),
                None,
                now,
            )
            .unwrap();
    }
    // Let A sync with B and subscribe.
    net.tick(Duration::from_millis(10));
    net.tick(Duration::from_secs(1));

    // C announces under the key; B pushes to A.
    let now = net.now;
    net.dht(c)
        .put(key, Value::new(7, 0, &b"fresh"[..]), None, None, now)
        .unwrap();
    net.tick(Duration::from_millis(10));
    net.tick(Duration::from_secs(1));

    assert!(net.dht(b).get_local_by_id(&key, 7).is_some());
    assert_eq!(*heard.borrow(), vec![7]);
}

/// S6: the storage quota admits two 400-byte values out of three.
#[test]
fn storage_quota() {
    let mut net = TestNet::new();
    let a = net.add_node(id_with_first_byte(1), 1);
    let now = net.now;

    net.dht(a).set_storage_limit(1024);
    for i in 1u8..=3 {
        // 368-byte payload plus the fixed per-value overhead is 400 bytes.
        let value = Value::new(i as u64, 0, vec![i; 368]);
        net.dht(a)
            .put(id_with_first_byte(i), value, None, None, now)
            .unwrap();
    }

    assert_eq!(net.dht(a).store_size(), (800, 2));
}

/// Properties 1 and 2: routing table ranges stay contiguous and buckets
/// bounded while a swarm of nodes cross-pings.
#[test]
fn swarm_routing_tables_stay_consistent() {
    let mut net = TestNet::new();
    let mut addrs = Vec::new();
    for i in 0..12u8 {
        let id = InfoHash::from_str(&format!("{:02x}{}", i * 21, "00".repeat(19))).unwrap();
        addrs.push(net.add_node(id, i + 1));
    }

    let first = addrs[0];
    for &addr in &addrs[1..] {
        let now = net.now;
        net.dht(addr).ping_node(first, now);
    }
    net.settle();
    for _ in 0..5 {
        net.tick(Duration::from_secs(60));
    }

    let now = net.now;
    for &addr in &addrs {
        let log = net.dht(addr).tables_log(Family::V4, now);
        assert!(net.dht(addr).status(Family::V4, now) >= Status::Connecting);
        // No bucket ever exceeds its capacity.
        for line in log.lines().filter(|l| l.starts_with("bucket ")) {
            let nodes: usize = line
                .split("nodes ")
                .nth(1)
                .and_then(|s| s.split(' ').next())
                .and_then(|s| s.parse().ok())
                .unwrap();
            assert!(nodes <= 8, "overfull bucket: {line}");
        }
    }
}
