//! The anti-entropy driver: gossip fan-out and push/pull exchanges.

use crate::broadcast::transmit_limit;
use crate::error::Result;
use crate::membership::Membership;
use crate::message::{make_compound, COMPOUND_HEADER_OVERHEAD, COMPOUND_PART_OVERHEAD, UDP_SEND_BUF};
use std::net::SocketAddr;
use tracing::warn;

impl Membership {
    /// One gossip round: pack pending broadcasts into a compound datagram
    /// for each of `gossip_nodes` random live peers, stopping early once
    /// the queue runs dry.
    pub(crate) async fn gossip_tick(&self) {
        let (peers, limit) = {
            let registry = self.registry.read();
            (
                registry.k_random_nodes(self.config.gossip_nodes, &[self.config.name.as_str()]),
                transmit_limit(self.config.retransmit_mult, registry.len()),
            )
        };

        let bytes_available = UDP_SEND_BUF - COMPOUND_HEADER_OVERHEAD;
        for peer in peers {
            let messages =
                self.broadcasts
                    .get_broadcasts(COMPOUND_PART_OVERHEAD, bytes_available, limit);
            if messages.is_empty() {
                return;
            }

            let datagram = make_compound(&messages);
            if let Err(err) = self.transport.send_packet(peer.addr, datagram).await {
                warn!(
                    "{}: failed to gossip to {}: {}",
                    self.config.name, peer.name, err
                );
            }
        }
    }

    /// One anti-entropy round: full state exchange with a single random
    /// live peer.
    pub(crate) async fn push_pull_tick(&self) {
        let peer = {
            let registry = self.registry.read();
            registry
                .k_random_nodes(1, &[self.config.name.as_str()])
                .into_iter()
                .next()
        };
        let Some(peer) = peer else {
            return;
        };

        if let Err(err) = self.push_pull_node(peer.addr).await {
            warn!(
                "{}: push/pull with {} failed: {}",
                self.config.name, peer.name, err
            );
        }
    }

    /// Exchange full state with the peer at `addr` and merge its view.
    pub(crate) async fn push_pull_node(&self, addr: SocketAddr) -> Result<()> {
        let local = self.local_push_pull();
        let remote = self.transport.exchange_state(addr, local).await?;
        self.merge_push_pull(remote);
        Ok(())
    }
}
