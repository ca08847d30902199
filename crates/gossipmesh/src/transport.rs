//! Network transport: best-effort UDP datagrams and reliable TCP state
//! exchanges.
//!
//! The transport is deliberately thin. It moves bytes and hands inbound
//! traffic to the membership dispatcher over bounded channels; all
//! protocol interpretation stays in the core.

use crate::error::{MembershipError, Result};
use crate::message::{
    decode_push_pull_payload, frame_push_pull, parse_push_pull_header, PushPull,
    PUSH_PULL_HEADER_LEN,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Receive buffer for a single datagram.
const UDP_RECV_BUF: usize = 65536;

/// Deadline for a complete push/pull exchange, connect included.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

/// A datagram received from a peer.
#[derive(Debug)]
pub struct InboundPacket {
    pub from: SocketAddr,
    pub payload: Bytes,
}

/// Byte-moving contract consumed by the membership core.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort datagram send; losses are expected and absorbed by the
    /// failure detector.
    async fn send_packet(&self, addr: SocketAddr, packet: Bytes) -> Result<()>;

    /// Reliable bidirectional state exchange: ship `local`, return the
    /// peer's snapshot.
    async fn exchange_state(&self, addr: SocketAddr, local: PushPull) -> Result<PushPull>;

    /// The address this transport is reachable at.
    fn local_addr(&self) -> SocketAddr;
}

/// Production transport: one UDP socket plus a TCP listener on the same
/// port, with reader tasks feeding the dispatcher channels until the
/// shutdown watch flips.
pub struct NetTransport {
    udp: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl NetTransport {
    /// Bind both sockets and spawn the reader tasks. Binding to port 0
    /// picks one ephemeral port shared by TCP and UDP.
    pub async fn bind(
        bind_addr: SocketAddr,
        packet_tx: mpsc::Sender<InboundPacket>,
        stream_tx: mpsc::Sender<TcpStream>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let udp = Arc::new(UdpSocket::bind(local_addr).await?);

        tokio::spawn(udp_read_loop(
            Arc::clone(&udp),
            packet_tx,
            shutdown.clone(),
        ));
        tokio::spawn(tcp_accept_loop(listener, stream_tx, shutdown));

        Ok(Self { udp, local_addr })
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn send_packet(&self, addr: SocketAddr, packet: Bytes) -> Result<()> {
        self.udp.send_to(&packet, addr).await?;
        Ok(())
    }

    async fn exchange_state(&self, addr: SocketAddr, local: PushPull) -> Result<PushPull> {
        let exchange = async move {
            let mut stream = TcpStream::connect(addr).await?;
            write_push_pull(&mut stream, &local).await?;
            read_push_pull(&mut stream).await
        };
        tokio::time::timeout(EXCHANGE_TIMEOUT, exchange)
            .await
            .map_err(|_| {
                MembershipError::Timeout(format!("push/pull with {} timed out", addr))
            })?
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn udp_read_loop(
    udp: Arc<UdpSocket>,
    packet_tx: mpsc::Sender<InboundPacket>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; UDP_RECV_BUF];
    loop {
        tokio::select! {
            result = udp.recv_from(&mut buf) => match result {
                Ok((len, from)) => {
                    let packet = InboundPacket {
                        from,
                        payload: Bytes::copy_from_slice(&buf[..len]),
                    };
                    if packet_tx.send(packet).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("failed to receive datagram: {}", err);
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("udp reader stopped");
}

async fn tcp_accept_loop(
    listener: TcpListener,
    stream_tx: mpsc::Sender<TcpStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, _)) => {
                    if stream_tx.send(stream).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("failed to accept state exchange: {}", err);
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("tcp acceptor stopped");
}

/// Write one framed push/pull snapshot to a stream.
pub(crate) async fn write_push_pull(stream: &mut TcpStream, push_pull: &PushPull) -> Result<()> {
    let frame = frame_push_pull(push_pull)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one framed push/pull snapshot from a stream.
pub(crate) async fn read_push_pull(stream: &mut TcpStream) -> Result<PushPull> {
    let mut header = [0u8; PUSH_PULL_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let (len, checksum) = parse_push_pull_header(&header)?;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    decode_push_pull_payload(&payload, checksum)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Transport that records outbound packets instead of sending them.
    pub(crate) struct MockTransport {
        pub(crate) sent: Mutex<Vec<(SocketAddr, Bytes)>>,
        local_addr: SocketAddr,
    }

    impl MockTransport {
        pub(crate) fn new(local_addr: SocketAddr) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                local_addr,
            }
        }

        pub(crate) fn sent_packets(&self) -> Vec<(SocketAddr, Bytes)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn send_packet(&self, addr: SocketAddr, packet: Bytes) -> Result<()> {
            self.sent.lock().push((addr, packet));
            Ok(())
        }

        async fn exchange_state(&self, addr: SocketAddr, _local: PushPull) -> Result<PushPull> {
            Err(MembershipError::PushPull(format!(
                "mock transport has no peer at {}",
                addr
            )))
        }

        fn local_addr(&self) -> SocketAddr {
            self.local_addr
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{self, MessageKind, Ping};

    struct TestTransport {
        transport: NetTransport,
        packets: mpsc::Receiver<InboundPacket>,
        streams: mpsc::Receiver<TcpStream>,
        _shutdown: watch::Sender<bool>,
    }

    async fn bind_test_transport() -> TestTransport {
        let (packet_tx, packets) = mpsc::channel(16);
        let (stream_tx, streams) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = NetTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            packet_tx,
            stream_tx,
            shutdown_rx,
        )
        .await
        .unwrap();
        TestTransport {
            transport,
            packets,
            streams,
            _shutdown: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let a = bind_test_transport().await;
        let mut b = bind_test_transport().await;

        let ping = message::encode(MessageKind::Ping, &Ping { seq_no: 42 }).unwrap();
        a.transport
            .send_packet(b.transport.local_addr(), ping.clone())
            .await
            .unwrap();

        let received = b.packets.recv().await.unwrap();
        assert_eq!(received.payload, ping);
        assert_eq!(received.from.port(), a.transport.local_addr().port());
    }

    #[tokio::test]
    async fn test_state_exchange_roundtrip() {
        let a = bind_test_transport().await;
        let mut b = bind_test_transport().await;

        let b_addr = b.transport.local_addr();
        // Minimal peer: echo back a canned snapshot.
        tokio::spawn(async move {
            let mut stream = b.streams.recv().await.unwrap();
            let _remote = read_push_pull(&mut stream).await.unwrap();
            let reply = PushPull {
                nodes: Vec::new(),
                user_state: vec![7],
            };
            write_push_pull(&mut stream, &reply).await.unwrap();
        });

        let local = PushPull {
            nodes: Vec::new(),
            user_state: Vec::new(),
        };
        let remote = a.transport.exchange_state(b_addr, local).await.unwrap();
        assert_eq!(remote.user_state, vec![7]);
    }
}
