//! The failure detector: one direct-plus-indirect probe per tick.

use crate::membership::Membership;
use crate::message::{IndirectPingReq, MessageKind, Ping, Suspect};
use crate::node::{NodeState, NodeStateRecord};
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum ProbeStep {
    /// The cursor ran off the end; sweep and retry.
    Wrap,
    /// Record is the local node, dead, or already reaped; advance.
    Skip,
    /// Probe this peer and end the tick.
    Probe(NodeStateRecord),
    /// Every slot was considered; nothing to probe this tick.
    Exhausted,
}

impl Membership {
    /// One round of failure detection: advance the round-robin cursor to
    /// the next probeable peer and probe it. The retry loop is bounded by
    /// the sequence length so an empty or all-dead cluster cannot spin.
    pub(crate) async fn probe_tick(&self) {
        let mut checked = 0;
        loop {
            let step = {
                let registry = self.registry.read();
                if checked >= registry.len() {
                    ProbeStep::Exhausted
                } else {
                    let mut cursor = self.probe_cursor.lock();
                    if *cursor >= registry.len() {
                        ProbeStep::Wrap
                    } else {
                        let record = registry.get_at(*cursor).cloned();
                        *cursor += 1;
                        match record {
                            Some(record)
                                if record.node.name != self.config.name
                                    && record.state != NodeState::Dead =>
                            {
                                ProbeStep::Probe(record)
                            }
                            _ => ProbeStep::Skip,
                        }
                    }
                }
            };

            match step {
                ProbeStep::Exhausted => return,
                ProbeStep::Wrap => {
                    self.registry.write().rotate_and_compact();
                    *self.probe_cursor.lock() = 0;
                    checked += 1;
                }
                ProbeStep::Skip => checked += 1,
                ProbeStep::Probe(record) => {
                    self.probe_node(&record).await;
                    return;
                }
            }
        }
    }

    /// Probe a single peer: direct ping, then indirect fan-out, all
    /// waiting on one completion channel. The ack-table timeout delivers
    /// `false` on the same channel, which is what ends the indirect wait.
    pub(crate) async fn probe_node(&self, target: &NodeStateRecord) {
        let seq_no = self.next_seq_no();
        let (tx, mut rx) = mpsc::channel(self.config.indirect_checks + 1);
        self.ack_table
            .register_channel(seq_no, tx, self.config.probe_interval);

        let ping = Ping { seq_no };
        if let Err(err) = self
            .send_message(target.node.addr, MessageKind::Ping, &ping)
            .await
        {
            warn!(
                "{}: failed to ping {}: {}",
                self.config.name, target.node.name, err
            );
            return;
        }

        match tokio::time::timeout(self.config.probe_timeout, rx.recv()).await {
            Ok(Some(true)) => return,
            // Timed out, or the outer deadline already delivered false;
            // either way, fall through to indirect probing.
            Ok(Some(false)) | Ok(None) | Err(_) => {}
        }

        let peers = {
            let registry = self.registry.read();
            registry.k_random_nodes(
                self.config.indirect_checks,
                &[self.config.name.as_str(), target.node.name.as_str()],
            )
        };

        let indirect = IndirectPingReq {
            seq_no,
            target: target.node.addr,
        };
        for peer in &peers {
            if let Err(err) = self
                .send_message(peer.addr, MessageKind::IndirectPing, &indirect)
                .await
            {
                warn!(
                    "{}: failed to send indirect ping via {}: {}",
                    self.config.name, peer.name, err
                );
            }
        }

        // An indirect ack that arrives after the direct window still wins,
        // as long as it beats the outer probe deadline.
        loop {
            match rx.recv().await {
                Some(true) => return,
                Some(false) | None => break,
            }
        }

        debug!(
            "{}: no ack from {} within the probe window",
            self.config.name, target.node.name
        );
        self.suspect_node(Suspect {
            incarnation: target.incarnation,
            node: target.node.name.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::testing::{fast_config, mock_member};
    use crate::message::{self, Alive, Message};
    use std::sync::Arc;
    use std::time::Duration;

    fn peer_alive(name: &str, port: u16) -> Alive {
        Alive {
            incarnation: 1,
            node: name.to_string(),
            addr: format!("127.0.0.1:{}", port).parse().unwrap(),
            meta: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_probe_tick_with_no_peers_sends_nothing() {
        let (m, transport) = mock_member(fast_config("node-a", 9000), None);

        m.probe_tick().await;
        m.probe_tick().await;

        assert!(transport.sent_packets().is_empty());
    }

    #[tokio::test]
    async fn test_probe_tick_skips_self_and_dead() {
        let (m, transport) = mock_member(fast_config("node-a", 9000), None);
        m.alive_node(peer_alive("node-b", 9101));
        m.alive_node(peer_alive("node-c", 9102));
        m.dead_node(crate::message::Dead {
            incarnation: 1,
            node: "node-c".to_string(),
        });

        m.probe_tick().await;

        let pings: Vec<_> = transport
            .sent_packets()
            .into_iter()
            .filter(|(_, buf)| matches!(message::decode(buf), Ok(Message::Ping(_))))
            .collect();
        assert_eq!(pings.len(), 1, "exactly one peer is probed per tick");
        assert_eq!(pings[0].0, "127.0.0.1:9101".parse().unwrap());
    }

    #[tokio::test]
    async fn test_probe_tick_wrap_compacts_and_retries() {
        let (m, transport) = mock_member(fast_config("node-a", 9000), None);
        m.alive_node(peer_alive("node-b", 9101));

        // Force the cursor past the end; the sweep resets it and the peer
        // is reachable again within two rounds at most, without the retry
        // loop ever spinning.
        *m.probe_cursor.lock() = 10;
        m.probe_tick().await;
        m.probe_tick().await;

        let pings = transport
            .sent_packets()
            .into_iter()
            .filter(|(addr, buf)| {
                *addr == "127.0.0.1:9101".parse().unwrap()
                    && matches!(message::decode(buf), Ok(Message::Ping(_)))
            })
            .count();
        assert!(pings >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_marks_suspect() {
        let (m, _transport) = mock_member(fast_config("node-a", 9000), None);
        m.alive_node(peer_alive("node-b", 9101));
        let target = m.registry.read().get("node-b").cloned().unwrap();

        // Nothing ever answers on the mock transport.
        m.probe_node(&target).await;

        let record = m.registry.read().get("node-b").cloned().unwrap();
        assert_eq!(record.state, NodeState::Suspect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_ack_keeps_node_alive() {
        let (m, transport) = mock_member(fast_config("node-a", 9000), None);
        m.alive_node(peer_alive("node-b", 9101));
        let target = m.registry.read().get("node-b").cloned().unwrap();

        let member = Arc::clone(&m);
        let prober = tokio::spawn(async move { member.probe_node(&target).await });

        // Wait for the ping to leave, then answer it.
        let seq_no = loop {
            tokio::task::yield_now().await;
            let sent = transport.sent_packets();
            if let Some((_, buf)) = sent.last() {
                if let Ok(Message::Ping(ping)) = message::decode(buf) {
                    break ping.seq_no;
                }
            }
        };
        m.ack_table.invoke(seq_no);

        prober.await.unwrap();
        let record = m.registry.read().get("node-b").cloned().unwrap();
        assert_eq!(record.state, NodeState::Alive);
    }

    #[tokio::test(start_paused = true)]
    async fn test_indirect_ack_saves_target() {
        let (m, transport) = mock_member(fast_config("node-a", 9000), None);
        m.alive_node(peer_alive("node-b", 9101));
        m.alive_node(peer_alive("node-c", 9102));
        let target = m.registry.read().get("node-b").cloned().unwrap();

        let member = Arc::clone(&m);
        let prober = tokio::spawn(async move { member.probe_node(&target).await });

        // Let the prober send its ping and park on the direct-ack wait,
        // then lapse the direct window so the indirect fan-out happens.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(m.config.probe_timeout + Duration::from_millis(1)).await;

        let seq_no = loop {
            tokio::task::yield_now().await;
            let sent = transport.sent_packets();
            if let Some(req) = sent.iter().find_map(|(_, buf)| {
                match message::decode(buf) {
                    Ok(Message::IndirectPing(req)) => Some(req),
                    _ => None,
                }
            }) {
                break req.seq_no;
            }
        };

        // Indirect pings go to the helper, not the target.
        assert!(transport
            .sent_packets()
            .iter()
            .any(|(addr, buf)| *addr == "127.0.0.1:9102".parse().unwrap()
                && matches!(message::decode(buf), Ok(Message::IndirectPing(_)))));

        // A relayed ack arrives within the probe window.
        m.ack_table.invoke(seq_no);

        prober.await.unwrap();
        let record = m.registry.read().get("node-b").cloned().unwrap();
        assert_eq!(record.state, NodeState::Alive, "indirect ack must save the target");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_eventually_declares_death() {
        let (m, _transport) = mock_member(fast_config("node-a", 9000), None);
        m.alive_node(peer_alive("node-b", 9101));
        let target = m.registry.read().get("node-b").cloned().unwrap();

        m.probe_node(&target).await;
        assert_eq!(
            m.registry.read().get("node-b").unwrap().state,
            NodeState::Suspect
        );

        // Once the suspicion window lapses the node drops out of the view.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(m.registry.read().get("node-b").is_none());
        assert_eq!(m.num_members(), 1);
    }
}
