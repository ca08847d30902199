//! The membership state machine: alive, suspect, and dead handling.
//!
//! All three handlers hold the registry write lock for their full
//! duration and never suspend under it. Incarnation comparisons are
//! deliberately asymmetric: `Alive` requires a strictly greater
//! incarnation, while `Suspect` and `Dead` accept an equal one so a peer
//! observation can escalate the state of the incarnation we already know.

use crate::membership::Membership;
use crate::message::{Alive, Dead, MessageKind, PushNodeState, Suspect};
use crate::node::{Node, NodeState, NodeStateRecord};
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a node may sit in `Suspect` before it is declared dead,
/// scaled logarithmically with cluster size.
pub(crate) fn suspicion_timeout(
    suspicion_mult: u32,
    cluster_size: usize,
    probe_interval: Duration,
) -> Duration {
    let scale = ((cluster_size.max(1) + 1) as f64).log10();
    probe_interval.mul_f64(suspicion_mult as f64 * scale)
}

impl Membership {
    /// Process a claim that `alive.node` is alive at `alive.incarnation`.
    pub(crate) fn alive_node(&self, alive: Alive) {
        let mut registry = self.registry.write();

        // A queued alive message about ourselves must not undo a leave in
        // progress.
        if self.leaving.load(Ordering::SeqCst) && alive.node == self.config.name {
            return;
        }

        if registry.get(&alive.node).is_none() {
            registry.insert(NodeStateRecord::new(Node {
                name: alive.node.clone(),
                addr: alive.addr,
                meta: alive.meta.clone(),
            }));
        }

        let Some(state) = registry.get_mut(&alive.node) else {
            return;
        };

        // Do not overwrite an established name-to-address binding.
        if state.node.addr != alive.addr {
            warn!(
                "{}: conflicting address for {} (mine: {}, theirs: {})",
                self.config.name, alive.node, state.node.addr, alive.addr
            );
            return;
        }

        if alive.incarnation <= state.incarnation {
            return;
        }

        self.broadcast_message(&alive.node, MessageKind::Alive, &alive, None);

        let old_state = state.state;
        state.incarnation = alive.incarnation;
        if state.state != NodeState::Alive {
            state.state = NodeState::Alive;
            state.state_change = Utc::now();
        }

        if old_state == NodeState::Dead {
            info!("{}: member {} joined", self.config.name, state.node.name);
            if let Some(events) = &self.events {
                events.notify_join(&state.node);
            }
        }
    }

    /// Process a claim that `suspect.node` failed its probes.
    pub(crate) fn suspect_node(&self, suspect: Suspect) {
        let mut registry = self.registry.write();
        let cluster_size = registry.len();

        let Some(state) = registry.get_mut(&suspect.node) else {
            return;
        };

        if suspect.incarnation < state.incarnation {
            return;
        }
        if state.state != NodeState::Alive {
            return;
        }

        if suspect.node == self.config.name {
            self.refute(state, suspect.incarnation);
            return;
        }

        self.broadcast_message(&suspect.node, MessageKind::Suspect, &suspect, None);
        info!("{}: marking {} as suspect", self.config.name, suspect.node);

        state.incarnation = suspect.incarnation;
        state.state = NodeState::Suspect;
        let change_time = Utc::now();
        state.state_change = change_time;

        // Armed before the lock is released; the callback re-acquires it
        // and checks the change-time witness so a refutation or
        // re-suspicion in between cannot double-fire.
        let timeout = suspicion_timeout(
            self.config.suspicion_mult,
            cluster_size,
            self.config.probe_interval,
        );
        let weak = self.weak_self.clone();
        let node_name = suspect.node.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(membership) = weak.upgrade() {
                membership.suspicion_expired(&node_name, change_time);
            }
        });
    }

    /// Fired when a suspicion timer expires; confirms the record is still
    /// the one the timer was armed against before declaring death.
    fn suspicion_expired(&self, name: &str, witness: DateTime<Utc>) {
        let dead = {
            let registry = self.registry.read();
            match registry.get(name) {
                Some(state)
                    if state.state == NodeState::Suspect && state.state_change == witness =>
                {
                    Some(Dead {
                        incarnation: state.incarnation,
                        node: name.to_string(),
                    })
                }
                _ => None,
            }
        };

        if let Some(dead) = dead {
            debug!(
                "{}: suspicion timeout for {} expired",
                self.config.name, name
            );
            self.dead_node(dead);
        }
    }

    /// Process a claim that `dead.node` is dead.
    pub(crate) fn dead_node(&self, dead: Dead) {
        let mut registry = self.registry.write();

        let Some(state) = registry.get_mut(&dead.node) else {
            return;
        };

        if dead.incarnation < state.incarnation {
            return;
        }
        if state.state == NodeState::Dead {
            return;
        }

        if dead.node == self.config.name {
            // Someone thinks we are dead. Unless we are leaving, they are
            // wrong.
            if !self.leaving.load(Ordering::SeqCst) {
                self.refute(state, dead.incarnation);
                return;
            }

            // We are leaving: confirm it, and let `leave()` observe the
            // dissemination through the queue notifier.
            let notify = self.leave_notify.lock().take();
            self.broadcast_message(&dead.node, MessageKind::Dead, &dead, notify);
        } else {
            self.broadcast_message(&dead.node, MessageKind::Dead, &dead, None);
        }

        info!("{}: marking {} as dead", self.config.name, dead.node);
        state.incarnation = dead.incarnation;
        state.state = NodeState::Dead;
        state.state_change = Utc::now();
        let node = state.node.clone();

        // The record leaves the name map now but stays in the probe
        // sequence until the next rotation sweep.
        registry.unlink(&dead.node);

        if let Some(events) = &self.events {
            events.notify_leave(&node);
        }
    }

    /// Counter a rumour about our own death or suspicion: claim a fresh
    /// incarnation strictly above the accusation and gossip it.
    fn refute(&self, state: &mut NodeStateRecord, accused_incarnation: u32) {
        let mut incarnation = self.next_incarnation();
        while accused_incarnation >= incarnation {
            incarnation = self.next_incarnation();
        }
        state.incarnation = incarnation;

        let alive = Alive {
            incarnation,
            node: state.node.name.clone(),
            addr: state.node.addr,
            meta: state.node.meta.clone(),
        };
        info!(
            "{}: refuting rumour with incarnation {}",
            self.config.name, incarnation
        );
        self.broadcast_message(&alive.node, MessageKind::Alive, &alive, None);
    }

    /// Merge a remote membership snapshot from a push/pull exchange.
    pub(crate) fn merge_state(&self, remote: Vec<PushNodeState>) {
        for entry in remote {
            let same_state = {
                let registry = self.registry.read();
                registry
                    .get(&entry.node)
                    .map(|local| local.state == entry.state && entry.node != self.config.name)
                    .unwrap_or(false)
            };
            if same_state {
                continue;
            }

            match entry.state {
                NodeState::Alive => self.alive_node(Alive {
                    incarnation: entry.incarnation,
                    node: entry.node,
                    addr: entry.addr,
                    meta: entry.meta,
                }),
                // Another node's word alone is not enough to declare a
                // death; downgrade to suspicion and let the timer decide.
                NodeState::Suspect | NodeState::Dead => self.suspect_node(Suspect {
                    incarnation: entry.incarnation,
                    node: entry.node,
                }),
            }
        }
    }
}
