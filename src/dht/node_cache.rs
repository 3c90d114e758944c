//! Weak-reference dedup of [Node] objects per address family.
//!
//! The cache guarantees one canonical `Node` per `(id, family)` for as long
//! as anything strong holds it, so liveness updates are visible from the
//! routing table and every search at once. Dead entries are swept whenever
//! the cache is consulted.

use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::common::{Confirm, Family, InfoHash, Node, NodeRef};

#[derive(Debug, Default)]
pub(crate) struct NodeCache {
    cache4: Vec<Weak<Node>>,
    cache6: Vec<Weak<Node>>,
}

impl NodeCache {
    pub fn new() -> NodeCache {
        NodeCache::default()
    }

    /// The live node with this id in this family, if any holder keeps it
    /// alive.
    pub fn get_node(&mut self, id: &InfoHash, family: Family) -> Option<NodeRef> {
        let cache = self.family_mut(family);
        cache.retain(|w| w.strong_count() > 0);
        cache
            .iter()
            .filter_map(Weak::upgrade)
            .find(|n| n.id() == id)
    }

    /// Resolve `(id, addr)` to the canonical node, constructing and caching
    /// a fresh one when none is alive. An address change collapses onto the
    /// existing node, the newer address winning.
    pub fn resolve(
        &mut self,
        id: &InfoHash,
        addr: SocketAddr,
        now: Instant,
        confirm: Confirm,
    ) -> NodeRef {
        let family = Family::of(&addr);
        let node = match self.get_node(id, family) {
            Some(node) => {
                if node.addr() != addr {
                    node.set_addr(addr);
                }
                node
            }
            None => {
                let node = Rc::new(Node::new(*id, addr));
                self.put_node(&node);
                node
            }
        };
        node.received(now, confirm);
        node
    }

    pub fn put_node(&mut self, node: &NodeRef) {
        self.family_mut(node.family()).push(Rc::downgrade(node));
    }

    /// Reset the connectivity state of every live node, giving expired ones
    /// a new chance. For use on connectivity changes.
    pub fn clear_bad_nodes(&mut self, family: Family) {
        let cache = self.family_mut(family);
        cache.retain(|w| w.strong_count() > 0);
        for node in cache.iter().filter_map(Weak::upgrade) {
            node.reset_liveness();
        }
    }

    fn family_mut(&mut self, family: Family) -> &mut Vec<Weak<Node>> {
        match family {
            Family::V4 => &mut self.cache4,
            Family::V6 => &mut self.cache6,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn resolve_dedups_by_id() {
        let mut cache = NodeCache::new();
        let id = InfoHash::random();
        let now = Instant::now();

        let a = cache.resolve(&id, addr(1000), now, Confirm::Seen);
        let b = cache.resolve(&id, addr(2000), now, Confirm::Seen);

        assert!(Rc::ptr_eq(&a, &b));
        // Newer address wins.
        assert_eq!(a.addr(), addr(2000));
    }

    #[test]
    fn dead_entries_are_swept() {
        let mut cache = NodeCache::new();
        let id = InfoHash::random();
        let now = Instant::now();

        let node = cache.resolve(&id, addr(1000), now, Confirm::Seen);
        drop(node);

        assert!(cache.get_node(&id, Family::V4).is_none());
        assert!(cache.cache4.is_empty());
    }

    #[test]
    fn clear_bad_nodes_resets_liveness() {
        let mut cache = NodeCache::new();
        let now = Instant::now();
        let node = cache.resolve(&InfoHash::random(), addr(1000), now, Confirm::Seen);

        for _ in 0..3 {
            node.requested(now);
        }
        assert!(node.is_expired());

        cache.clear_bad_nodes(Family::V4);
        assert!(!node.is_expired());
    }
}
