//! Node identity and per-peer state records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Identity of a cluster member as disseminated over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique, operator-chosen name
    pub name: String,

    /// Advertised address for both datagrams and state exchanges
    pub addr: SocketAddr,

    /// Opaque metadata supplied by the local delegate
    pub meta: Vec<u8>,
}

/// Liveness state of a peer as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Peer answered its most recent probe, or gossip says it is live
    Alive,
    /// Peer failed a direct and indirect probe and is on a death timer
    Suspect,
    /// Peer is confirmed dead and awaits reaping from the probe sequence
    Dead,
}

impl NodeState {
    /// Precedence used to break ties between observations carrying the
    /// same incarnation number; higher wins.
    pub fn precedence(&self) -> u8 {
        match self {
            NodeState::Alive => 0,
            NodeState::Suspect => 1,
            NodeState::Dead => 2,
        }
    }
}

/// Everything the local node tracks about one peer.
#[derive(Debug, Clone)]
pub struct NodeStateRecord {
    /// Peer identity
    pub node: Node,

    /// Highest incarnation number accepted for this peer
    pub incarnation: u32,

    /// Current liveness state
    pub state: NodeState,

    /// When the state last changed; used as a witness by suspicion timers
    pub state_change: DateTime<Utc>,
}

impl NodeStateRecord {
    /// Create a record for a peer we have just learned about.
    ///
    /// New records start out `Dead` with incarnation zero so that the first
    /// accepted `Alive` message performs a real transition and fires the
    /// join event, regardless of which path delivered it.
    pub fn new(node: Node) -> Self {
        Self {
            node,
            incarnation: 0,
            state: NodeState::Dead,
            state_change: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_precedence_ordering() {
        assert!(NodeState::Alive.precedence() < NodeState::Suspect.precedence());
        assert!(NodeState::Suspect.precedence() < NodeState::Dead.precedence());
    }

    #[test]
    fn test_new_record_starts_dead() {
        let node = Node {
            name: "node-a".to_string(),
            addr: "127.0.0.1:7946".parse().unwrap(),
            meta: Vec::new(),
        };
        let record = NodeStateRecord::new(node);
        assert_eq!(record.state, NodeState::Dead);
        assert_eq!(record.incarnation, 0);
    }
}
