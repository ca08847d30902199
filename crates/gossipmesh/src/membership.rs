//! The membership handle: lifecycle, scheduling, and inbound dispatch.

use crate::ack::AckTable;
use crate::broadcast::BroadcastQueue;
use crate::config::MembershipConfig;
use crate::delegate::{Delegate, EventDelegate};
use crate::error::{MembershipError, Result};
use crate::message::{
    self, AckResp, Alive, Dead, IndirectPingReq, Message, MessageKind, Ping, PushNodeState,
    PushPull,
};
use crate::node::Node;
use crate::registry::NodeRegistry;
use crate::transport::{read_push_pull, write_push_pull, InboundPacket, NetTransport, Transport};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Depth of the inbound datagram channel between the transport reader and
/// the dispatcher.
const PACKET_QUEUE_DEPTH: usize = 1024;

/// Depth of the inbound state-exchange channel.
const STREAM_QUEUE_DEPTH: usize = 32;

/// Upper bound on delegate-supplied node metadata.
pub const META_MAX_SIZE: usize = 512;

struct TickerSet {
    stop: Option<watch::Sender<bool>>,
    handles: Vec<JoinHandle<()>>,
}

/// A running cluster member.
///
/// Create with [`Membership::create`], then [`join`](Membership::join) one
/// or more existing members. The handle is shared; all background tasks
/// hold clones of the same `Arc`.
pub struct Membership {
    pub(crate) config: MembershipConfig,
    pub(crate) registry: NodeRegistry,
    pub(crate) ack_table: AckTable,
    pub(crate) broadcasts: BroadcastQueue,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) events: Option<Arc<dyn EventDelegate>>,
    pub(crate) delegate: Option<Arc<dyn Delegate>>,

    /// Back-reference handed to timer tasks so they cannot keep a
    /// shut-down membership alive.
    pub(crate) weak_self: Weak<Membership>,

    /// Address peers should reach us at.
    advertise: SocketAddr,

    /// Probe sequence-number source.
    seq_no: AtomicU32,

    /// Incarnation source for the local node.
    incarnation: AtomicU32,

    /// Set for the duration of a graceful leave.
    pub(crate) leaving: AtomicBool,

    shutdown_flag: AtomicBool,

    /// Armed by `leave()`; taken by the state machine when it broadcasts
    /// our own death notice.
    pub(crate) leave_notify: Mutex<Option<oneshot::Sender<()>>>,

    /// Round-robin position of the failure detector.
    pub(crate) probe_cursor: Mutex<usize>,

    tickers: Mutex<TickerSet>,
    shutdown_tx: watch::Sender<bool>,
}

impl Membership {
    /// Create a member with no delegates attached.
    pub async fn create(config: MembershipConfig) -> Result<Arc<Self>> {
        Self::create_with(config, None, None).await
    }

    /// Create a member, bind its transport, register the local record as
    /// alive, and start the protocol tasks.
    pub async fn create_with(
        config: MembershipConfig,
        events: Option<Arc<dyn EventDelegate>>,
        delegate: Option<Arc<dyn Delegate>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_DEPTH);
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_QUEUE_DEPTH);

        let transport =
            NetTransport::bind(config.bind_addr, packet_tx, stream_tx, shutdown_rx.clone())
                .await?;
        let advertise = transport.local_addr();

        let membership = Self::build(
            config,
            Arc::new(transport),
            advertise,
            events,
            delegate,
            shutdown_tx,
        );
        membership.set_alive()?;

        tokio::spawn(Arc::clone(&membership).packet_loop(packet_rx, shutdown_rx.clone()));
        tokio::spawn(Arc::clone(&membership).stream_loop(stream_rx, shutdown_rx));
        membership.schedule();

        info!(
            "{}: membership started at {}",
            membership.config.name, advertise
        );
        Ok(membership)
    }

    fn build(
        config: MembershipConfig,
        transport: Arc<dyn Transport>,
        advertise: SocketAddr,
        events: Option<Arc<dyn EventDelegate>>,
        delegate: Option<Arc<dyn Delegate>>,
        shutdown_tx: watch::Sender<bool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            registry: NodeRegistry::new(),
            ack_table: AckTable::new(),
            broadcasts: BroadcastQueue::new(),
            transport,
            events,
            delegate,
            weak_self: weak.clone(),
            advertise,
            seq_no: AtomicU32::new(0),
            incarnation: AtomicU32::new(0),
            leaving: AtomicBool::new(false),
            shutdown_flag: AtomicBool::new(false),
            leave_notify: Mutex::new(None),
            probe_cursor: Mutex::new(0),
            tickers: Mutex::new(TickerSet {
                stop: None,
                handles: Vec::new(),
            }),
            shutdown_tx,
        })
    }

    /// Register the local record through the normal alive path so the
    /// first transition also fires a join event for ourselves.
    fn set_alive(&self) -> Result<()> {
        let meta = match &self.delegate {
            Some(delegate) => {
                let meta = delegate.node_meta(META_MAX_SIZE);
                if meta.len() > META_MAX_SIZE {
                    return Err(MembershipError::InvalidConfiguration(format!(
                        "node metadata of {} bytes exceeds the {} byte limit",
                        meta.len(),
                        META_MAX_SIZE
                    )));
                }
                meta
            }
            None => Vec::new(),
        };

        let alive = Alive {
            incarnation: self.next_incarnation(),
            node: self.config.name.clone(),
            addr: self.advertise,
            meta,
        };
        self.alive_node(alive);
        Ok(())
    }

    /// Fresh probe sequence number.
    pub(crate) fn next_seq_no(&self) -> u32 {
        self.seq_no.fetch_add(1, Ordering::SeqCst).wrapping_add(1)
    }

    /// Fresh incarnation number for the local node.
    pub(crate) fn next_incarnation(&self) -> u32 {
        self.incarnation
            .fetch_add(1, Ordering::SeqCst)
            .wrapping_add(1)
    }

    /// Contact the given seed members and pull their cluster state.
    /// Succeeds if at least one exchange completed.
    pub async fn join(&self, peers: &[SocketAddr]) -> Result<usize> {
        if self.shutdown_flag.load(Ordering::SeqCst) {
            return Err(MembershipError::Shutdown);
        }
        if peers.is_empty() {
            return Err(MembershipError::NoPeers);
        }

        let mut joined = 0;
        let mut last_error = None;
        for &addr in peers {
            match self.push_pull_node(addr).await {
                Ok(()) => joined += 1,
                Err(err) => {
                    warn!("{}: failed to join via {}: {}", self.config.name, addr, err);
                    last_error = Some(err);
                }
            }
        }

        if joined == 0 {
            let reason = last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no contact succeeded".to_string());
            return Err(MembershipError::JoinFailed(reason));
        }
        info!("{}: joined cluster via {} contact(s)", self.config.name, joined);
        Ok(joined)
    }

    /// Broadcast our own death notice and wait until it has been handed
    /// to the cluster, bounded by `timeout`.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        if self.shutdown_flag.load(Ordering::SeqCst) {
            return Err(MembershipError::Shutdown);
        }
        if self.leaving.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("{}: leaving the cluster", self.config.name);

        let (tx, rx) = oneshot::channel();
        *self.leave_notify.lock() = Some(tx);

        let incarnation = self
            .registry
            .read()
            .get(&self.config.name)
            .map(|state| state.incarnation)
            .unwrap_or_else(|| self.incarnation.load(Ordering::SeqCst));
        self.dead_node(Dead {
            incarnation,
            node: self.config.name.clone(),
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(MembershipError::Timeout(
                "leave broadcast was not disseminated in time".to_string(),
            )),
        }
    }

    /// Stop tickers, transport readers, and pending ack handlers. Safe to
    /// call multiple times.
    pub fn shutdown(&self) {
        if self.shutdown_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("{}: shutting down", self.config.name);
        self.deschedule();
        let _ = self.shutdown_tx.send(true);
        self.ack_table.clear();
    }

    /// Number of members in the current view, the local node included.
    pub fn num_members(&self) -> usize {
        self.registry.read().num_linked()
    }

    /// Snapshot of the current members, the local node included.
    pub fn members(&self) -> Vec<Node> {
        self.registry.read().linked_members()
    }

    /// The local node's identity as currently advertised.
    pub fn local_node(&self) -> Node {
        self.registry
            .read()
            .get(&self.config.name)
            .map(|state| state.node.clone())
            .unwrap_or_else(|| Node {
                name: self.config.name.clone(),
                addr: self.advertise,
                meta: Vec::new(),
            })
    }

    /// Address peers can reach this member at.
    pub fn advertise_addr(&self) -> SocketAddr {
        self.advertise
    }

    /// Start the protocol tickers. Idempotent.
    pub(crate) fn schedule(&self) {
        let mut tickers = self.tickers.lock();
        if tickers.stop.is_some() {
            return;
        }
        let Some(membership) = self.weak_self.upgrade() else {
            return;
        };

        let (stop_tx, stop_rx) = watch::channel(false);

        if !self.config.probe_interval.is_zero() {
            let m = Arc::clone(&membership);
            let mut stop = stop_rx.clone();
            let period = self.config.probe_interval;
            tickers.handles.push(tokio::spawn(async move {
                let mut interval = ticker(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => m.probe_tick().await,
                        _ = stop.changed() => break,
                    }
                }
            }));
        }

        if !self.config.gossip_interval.is_zero() && self.config.gossip_nodes > 0 {
            let m = Arc::clone(&membership);
            let mut stop = stop_rx.clone();
            let period = self.config.gossip_interval;
            tickers.handles.push(tokio::spawn(async move {
                let mut interval = ticker(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => m.gossip_tick().await,
                        _ = stop.changed() => break,
                    }
                }
            }));
        }

        if !self.config.push_pull_interval.is_zero() {
            let m = Arc::clone(&membership);
            let mut stop = stop_rx.clone();
            let period = self.config.push_pull_interval;
            tickers.handles.push(tokio::spawn(async move {
                let mut interval = ticker(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => m.push_pull_tick().await,
                        _ = stop.changed() => break,
                    }
                }
            }));
        }

        tickers.stop = Some(stop_tx);
    }

    /// Stop the protocol tickers. Idempotent.
    pub(crate) fn deschedule(&self) {
        let mut tickers = self.tickers.lock();
        if let Some(stop) = tickers.stop.take() {
            let _ = stop.send(true);
        }
        tickers.handles.clear();
    }

    async fn packet_loop(
        self: Arc<Self>,
        mut packets: mpsc::Receiver<InboundPacket>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = packets.recv() => match maybe {
                    Some(packet) => self.handle_packet(packet.from, &packet.payload).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("{}: packet dispatcher stopped", self.config.name);
    }

    pub(crate) async fn handle_packet(&self, from: SocketAddr, payload: &[u8]) {
        match message::decode(payload) {
            Ok(Message::Compound(parts)) => {
                for part in parts {
                    match message::decode(&part) {
                        Ok(Message::Compound(_)) => {
                            warn!("{}: ignoring nested compound from {}", self.config.name, from)
                        }
                        Ok(msg) => self.handle_message(from, msg).await,
                        Err(err) => warn!(
                            "{}: failed to decode compound part from {}: {}",
                            self.config.name, from, err
                        ),
                    }
                }
            }
            Ok(msg) => self.handle_message(from, msg).await,
            Err(err) => warn!(
                "{}: failed to decode datagram from {}: {}",
                self.config.name, from, err
            ),
        }
    }

    pub(crate) async fn handle_message(&self, from: SocketAddr, msg: Message) {
        match msg {
            Message::Ping(ping) => {
                let ack = AckResp {
                    seq_no: ping.seq_no,
                };
                if let Err(err) = self.send_message(from, MessageKind::AckResp, &ack).await {
                    debug!("{}: failed to ack {}: {}", self.config.name, from, err);
                }
            }
            Message::IndirectPing(req) => self.handle_indirect_ping(from, req).await,
            Message::AckResp(ack) => self.ack_table.invoke(ack.seq_no),
            Message::Alive(alive) => self.alive_node(alive),
            Message::Suspect(suspect) => self.suspect_node(suspect),
            Message::Dead(dead) => self.dead_node(dead),
            Message::PushPull(_) => {
                debug!(
                    "{}: ignoring push/pull datagram from {}",
                    self.config.name, from
                )
            }
            Message::Compound(_) => {
                warn!("{}: ignoring nested compound from {}", self.config.name, from)
            }
        }
    }

    /// Probe `req.target` on behalf of `origin` and relay a positive ack
    /// back under the origin's sequence number.
    async fn handle_indirect_ping(&self, origin: SocketAddr, req: IndirectPingReq) {
        let local_seq = self.next_seq_no();

        let transport = Arc::clone(&self.transport);
        let reply = AckResp {
            seq_no: req.seq_no,
        };
        self.ack_table.register_callback(
            local_seq,
            move || {
                tokio::spawn(async move {
                    match message::encode(MessageKind::AckResp, &reply) {
                        Ok(buf) => {
                            if let Err(err) = transport.send_packet(origin, buf).await {
                                debug!("failed to relay ack to {}: {}", origin, err);
                            }
                        }
                        Err(err) => warn!("failed to encode relayed ack: {}", err),
                    }
                });
            },
            self.config.probe_timeout,
        );

        let ping = Ping { seq_no: local_seq };
        if let Err(err) = self
            .send_message(req.target, MessageKind::Ping, &ping)
            .await
        {
            warn!(
                "{}: failed to relay ping to {}: {}",
                self.config.name, req.target, err
            );
        }
    }

    async fn stream_loop(
        self: Arc<Self>,
        mut streams: mpsc::Receiver<TcpStream>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                maybe = streams.recv() => match maybe {
                    Some(stream) => {
                        let m = Arc::clone(&self);
                        tokio::spawn(async move { m.handle_stream(stream).await });
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("{}: stream dispatcher stopped", self.config.name);
    }

    /// Serve one inbound push/pull exchange: read the remote snapshot,
    /// reply with ours, then merge theirs.
    async fn handle_stream(&self, mut stream: TcpStream) {
        let remote = match read_push_pull(&mut stream).await {
            Ok(remote) => remote,
            Err(err) => {
                warn!(
                    "{}: failed to read remote state: {}",
                    self.config.name, err
                );
                return;
            }
        };

        let local = self.local_push_pull();
        if let Err(err) = write_push_pull(&mut stream, &local).await {
            warn!("{}: failed to send local state: {}", self.config.name, err);
            return;
        }

        self.merge_push_pull(remote);
    }

    /// Snapshot of our full state for a push/pull exchange, dead records
    /// included so deaths keep propagating until reaped.
    pub(crate) fn local_push_pull(&self) -> PushPull {
        let nodes = self
            .registry
            .read()
            .snapshot()
            .into_iter()
            .map(|record| PushNodeState {
                node: record.node.name,
                addr: record.node.addr,
                meta: record.node.meta,
                incarnation: record.incarnation,
                state: record.state,
            })
            .collect();

        let user_state = self
            .delegate
            .as_ref()
            .map(|delegate| delegate.local_state())
            .unwrap_or_default();

        PushPull { nodes, user_state }
    }

    /// Merge a remote push/pull snapshot and hand its user payload to the
    /// delegate.
    pub(crate) fn merge_push_pull(&self, remote: PushPull) {
        self.merge_state(remote.nodes);
        if !remote.user_state.is_empty() {
            if let Some(delegate) = &self.delegate {
                delegate.merge_remote_state(&remote.user_state);
            }
        }
    }

    /// Encode and send a single message to a peer, best effort.
    pub(crate) async fn send_message<T: Serialize>(
        &self,
        addr: SocketAddr,
        kind: MessageKind,
        payload: &T,
    ) -> Result<()> {
        let buf = message::encode(kind, payload)?;
        self.transport.send_packet(addr, buf).await
    }

    /// Encode a message and queue it for gossip dissemination, keyed by
    /// the subject node.
    pub(crate) fn broadcast_message<T: Serialize>(
        &self,
        subject: &str,
        kind: MessageKind,
        payload: &T,
        notify: Option<oneshot::Sender<()>>,
    ) {
        match message::encode(kind, payload) {
            Ok(buf) => self.broadcasts.enqueue(subject, buf, notify),
            Err(err) => warn!(
                "{}: failed to encode {:?} broadcast for {}: {}",
                self.config.name, kind, subject, err
            ),
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transport::testing::MockTransport;

    /// Build a membership over a capturing mock transport, with the local
    /// record registered alive and no background tasks running.
    pub(crate) fn mock_member(
        config: MembershipConfig,
        events: Option<Arc<dyn EventDelegate>>,
    ) -> (Arc<Membership>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new(config.bind_addr));
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let membership = Membership::build(
            config,
            Arc::<MockTransport>::clone(&transport),
            transport.local_addr(),
            events,
            None,
            shutdown_tx,
        );
        membership.set_alive().expect("set_alive");
        (membership, transport)
    }

    pub(crate) fn fast_config(name: &str, port: u16) -> MembershipConfig {
        let mut config = MembershipConfig::new(
            name,
            format!("127.0.0.1:{}", port).parse().unwrap(),
        );
        config.probe_interval = Duration::from_millis(100);
        config.probe_timeout = Duration::from_millis(30);
        config.gossip_interval = Duration::from_millis(20);
        config.push_pull_interval = Duration::from_millis(200);
        config.suspicion_mult = 2;
        config
    }
}
