//! Delegate seams for membership events and user state.

use crate::node::Node;
use tokio::sync::mpsc;

/// Receives membership change notifications.
///
/// Calls for the same subject node arrive in the order the state machine
/// committed them; no ordering is guaranteed across subjects. Handlers
/// run on the protocol path and must not block.
pub trait EventDelegate: Send + Sync {
    /// A peer transitioned into the cluster view.
    fn notify_join(&self, node: &Node);

    /// A peer died or left and dropped out of the cluster view.
    fn notify_leave(&self, node: &Node);
}

/// Hooks user-level state into the protocol.
pub trait Delegate: Send + Sync {
    /// Opaque metadata gossiped alongside this node's identity; must not
    /// exceed `limit` bytes.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// Opaque local state shipped with every push/pull exchange.
    fn local_state(&self) -> Vec<u8>;

    /// Remote user state received from a push/pull exchange.
    fn merge_remote_state(&self, state: &[u8]);
}

/// Kind of membership change reported to a [`ChannelEventDelegate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberEventKind {
    Join,
    Leave,
}

/// A membership change paired with the subject node.
#[derive(Debug, Clone)]
pub struct MemberEvent {
    pub kind: MemberEventKind,
    pub node: Node,
}

/// Event delegate that forwards notifications onto an unbounded channel,
/// useful for tests and for decoupling consumers from the protocol path.
pub struct ChannelEventDelegate {
    tx: mpsc::UnboundedSender<MemberEvent>,
}

impl ChannelEventDelegate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemberEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventDelegate for ChannelEventDelegate {
    fn notify_join(&self, node: &Node) {
        let _ = self.tx.send(MemberEvent {
            kind: MemberEventKind::Join,
            node: node.clone(),
        });
    }

    fn notify_leave(&self, node: &Node) {
        let _ = self.tx.send(MemberEvent {
            kind: MemberEventKind::Leave,
            node: node.clone(),
        });
    }
}
