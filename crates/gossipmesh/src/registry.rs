//! Node registry: the authoritative view of known peers.
//!
//! Two views over one set of records: a name index for O(1) lookup and an
//! ordered sequence used for round-robin probing and random sampling. The
//! sequence is the arena; the index holds positions into it and is rebuilt
//! whenever the sequence is shuffled. Records are mutated in place under
//! the registry lock, never copied out for mutation.

use crate::node::{Node, NodeState, NodeStateRecord};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;

/// Thread-safe registry of peer state records.
///
/// All reads take the shared lock; every mutation goes through the
/// exclusive lock. Callers must not perform network I/O or acquire the
/// ack-table mutex while holding either guard.
pub struct NodeRegistry {
    inner: RwLock<RegistryInner>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                index: HashMap::new(),
                nodes: Vec::new(),
            }),
        }
    }

    /// Acquire the shared read guard.
    pub fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read()
    }

    /// Acquire the exclusive write guard.
    pub fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry contents, only reachable through the registry lock.
pub struct RegistryInner {
    /// Name to sequence-position index. Dead peers are unlinked from here
    /// while their record stays in the sequence until the next sweep.
    index: HashMap<String, usize>,

    /// Probe sequence; deliberately kept in randomized order.
    nodes: Vec<NodeStateRecord>,
}

impl RegistryInner {
    /// Length of the probe sequence, including not-yet-reaped dead records.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of peers currently linked in the name index (alive or
    /// suspect).
    pub fn num_linked(&self) -> usize {
        self.index.len()
    }

    pub fn get(&self, name: &str) -> Option<&NodeStateRecord> {
        self.index.get(name).map(|&pos| &self.nodes[pos])
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut NodeStateRecord> {
        let pos = *self.index.get(name)?;
        self.nodes.get_mut(pos)
    }

    /// Record at a sequence position, used by the round-robin prober.
    pub fn get_at(&self, pos: usize) -> Option<&NodeStateRecord> {
        self.nodes.get(pos)
    }

    /// Insert a record for a peer seen for the first time.
    ///
    /// The record is appended and then swapped with a uniformly random
    /// slot. Inserting at the tail unconditionally would make every member
    /// probe newcomers last and stretch the failure-detection bound for
    /// them to a full rotation of the whole cluster.
    pub fn insert(&mut self, record: NodeStateRecord) {
        let name = record.node.name.clone();
        if self.index.contains_key(&name) {
            return;
        }

        let n = self.nodes.len();
        self.nodes.push(record);
        self.index.insert(name, n);

        if n > 0 {
            let offset = rand::thread_rng().gen_range(0..n);
            self.nodes.swap(offset, n);
            for pos in [offset, n] {
                let moved = self.nodes[pos].node.name.clone();
                if let Some(slot) = self.index.get_mut(&moved) {
                    *slot = pos;
                }
            }
        }
    }

    /// Remove a peer from the name index, leaving its record in the
    /// sequence until the next rotation sweep.
    pub fn unlink(&mut self, name: &str) {
        self.index.remove(name);
    }

    /// Reap dead records from the sequence and reshuffle the survivors.
    /// Invoked when the probe cursor wraps around.
    pub fn rotate_and_compact(&mut self) {
        self.nodes.retain(|record| record.state != NodeState::Dead);

        let mut rng = rand::thread_rng();
        self.nodes.shuffle(&mut rng);

        self.index.clear();
        for (pos, record) in self.nodes.iter().enumerate() {
            self.index.insert(record.node.name.clone(), pos);
        }
    }

    /// Up to `k` distinct alive peers whose names are not in `excludes`,
    /// drawn uniformly without replacement.
    pub fn k_random_nodes(&self, k: usize, excludes: &[&str]) -> Vec<Node> {
        let mut candidates: Vec<&NodeStateRecord> = self
            .nodes
            .iter()
            .filter(|record| record.state == NodeState::Alive)
            .filter(|record| !excludes.contains(&record.node.name.as_str()))
            .collect();

        let mut rng = rand::thread_rng();
        candidates.shuffle(&mut rng);
        candidates
            .into_iter()
            .take(k)
            .map(|record| record.node.clone())
            .collect()
    }

    /// Snapshot of every peer currently linked in the index.
    pub fn linked_members(&self) -> Vec<Node> {
        self.index
            .values()
            .map(|&pos| self.nodes[pos].node.clone())
            .collect()
    }

    /// Snapshot of every record in the sequence, dead ones included, for
    /// the push/pull state exchange.
    pub fn snapshot(&self) -> Vec<NodeStateRecord> {
        self.nodes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use chrono::Utc;

    fn record(name: &str, state: NodeState) -> NodeStateRecord {
        NodeStateRecord {
            node: Node {
                name: name.to_string(),
                addr: "127.0.0.1:7946".parse().unwrap(),
                meta: Vec::new(),
            },
            incarnation: 1,
            state,
            state_change: Utc::now(),
        }
    }

    #[test]
    fn test_insert_keeps_views_consistent() {
        let registry = NodeRegistry::new();
        let mut inner = registry.write();
        for i in 0..32 {
            inner.insert(record(&format!("node-{}", i), NodeState::Alive));
        }

        assert_eq!(inner.len(), 32);
        assert_eq!(inner.num_linked(), 32);
        for i in 0..32 {
            let name = format!("node-{}", i);
            let found = inner.get(&name).expect("record reachable via index");
            assert_eq!(found.node.name, name);
        }
    }

    #[test]
    fn test_insert_is_idempotent_per_name() {
        let registry = NodeRegistry::new();
        let mut inner = registry.write();
        inner.insert(record("node-a", NodeState::Alive));
        inner.insert(record("node-a", NodeState::Alive));
        assert_eq!(inner.len(), 1);
    }

    #[test]
    fn test_unlinked_dead_record_stays_in_sequence() {
        let registry = NodeRegistry::new();
        let mut inner = registry.write();
        inner.insert(record("node-a", NodeState::Alive));
        inner.get_mut("node-a").unwrap().state = NodeState::Dead;
        inner.unlink("node-a");

        assert_eq!(inner.len(), 1);
        assert_eq!(inner.num_linked(), 0);
        assert!(inner.get("node-a").is_none());
        assert_eq!(inner.get_at(0).unwrap().state, NodeState::Dead);
    }

    #[test]
    fn test_rotate_and_compact_reaps_dead() {
        let registry = NodeRegistry::new();
        let mut inner = registry.write();
        for i in 0..8 {
            inner.insert(record(&format!("node-{}", i), NodeState::Alive));
        }
        for i in 0..4 {
            let name = format!("node-{}", i);
            inner.get_mut(&name).unwrap().state = NodeState::Dead;
            inner.unlink(&name);
        }

        inner.rotate_and_compact();

        assert_eq!(inner.len(), 4);
        assert_eq!(inner.num_linked(), 4);
        for i in 4..8 {
            let name = format!("node-{}", i);
            assert_eq!(inner.get(&name).unwrap().node.name, name);
        }
    }

    #[test]
    fn test_k_random_nodes_excludes_and_bounds() {
        let registry = NodeRegistry::new();
        let mut inner = registry.write();
        for i in 0..10 {
            inner.insert(record(&format!("node-{}", i), NodeState::Alive));
        }
        inner.insert(record("suspect", NodeState::Suspect));

        let sample = inner.k_random_nodes(4, &["node-0", "node-1"]);
        assert_eq!(sample.len(), 4);
        for node in &sample {
            assert_ne!(node.name, "node-0");
            assert_ne!(node.name, "node-1");
            assert_ne!(node.name, "suspect");
        }

        let names: std::collections::HashSet<_> =
            sample.iter().map(|n| n.name.clone()).collect();
        assert_eq!(names.len(), 4, "sampling must be without replacement");
    }

    #[test]
    fn test_k_random_nodes_short_cluster() {
        let registry = NodeRegistry::new();
        let mut inner = registry.write();
        inner.insert(record("node-a", NodeState::Alive));
        inner.insert(record("node-b", NodeState::Alive));

        let sample = inner.k_random_nodes(5, &["node-a"]);
        assert_eq!(sample.len(), 1);
        assert_eq!(sample[0].name, "node-b");
    }
}
