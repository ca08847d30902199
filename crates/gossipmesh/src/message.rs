//! Wire message types and binary codec.
//!
//! Every datagram starts with a one-byte kind tag followed by a bincode
//! payload. Small membership deltas travel packed into a compound
//! datagram; the full push/pull state exchange travels over TCP in a
//! length-prefixed, checksummed frame.

use crate::error::{MembershipError, Result};
use crate::node::NodeState;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Largest datagram the gossip path will emit.
pub const UDP_SEND_BUF: usize = 1400;

/// Compound framing cost: kind tag plus part count.
pub const COMPOUND_HEADER_OVERHEAD: usize = 2;

/// Per-part framing cost inside a compound datagram.
pub const COMPOUND_PART_OVERHEAD: usize = 2;

/// Push/pull frame header: kind tag, payload length, crc32 checksum.
pub const PUSH_PULL_HEADER_LEN: usize = 9;

/// Upper bound on a push/pull payload; a snapshot larger than this is
/// rejected rather than buffered.
pub const PUSH_PULL_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Message kind tags.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ping = 0x01,
    IndirectPing = 0x02,
    AckResp = 0x03,
    Suspect = 0x04,
    Alive = 0x05,
    Dead = 0x06,
    PushPull = 0x07,
    Compound = 0x08,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(MessageKind::Ping),
            0x02 => Some(MessageKind::IndirectPing),
            0x03 => Some(MessageKind::AckResp),
            0x04 => Some(MessageKind::Suspect),
            0x05 => Some(MessageKind::Alive),
            0x06 => Some(MessageKind::Dead),
            0x07 => Some(MessageKind::PushPull),
            0x08 => Some(MessageKind::Compound),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Direct probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub seq_no: u32,
}

/// Request that a peer probe `target` on our behalf and relay the ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndirectPingReq {
    pub seq_no: u32,
    pub target: SocketAddr,
}

/// Positive acknowledgement of a direct or relayed probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResp {
    pub seq_no: u32,
}

/// Gossip: a node is alive at the given incarnation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alive {
    pub incarnation: u32,
    pub node: String,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
}

/// Gossip: a node failed its probes at the given incarnation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspect {
    pub incarnation: u32,
    pub node: String,
}

/// Gossip: a node is confirmed dead at the given incarnation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dead {
    pub incarnation: u32,
    pub node: String,
}

/// One peer's record inside a push/pull snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushNodeState {
    pub node: String,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
    pub incarnation: u32,
    pub state: NodeState,
}

/// Full state exchanged over TCP during anti-entropy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPull {
    pub nodes: Vec<PushNodeState>,
    pub user_state: Vec<u8>,
}

/// Decoded inbound message, dispatched by tag.
#[derive(Debug)]
pub enum Message {
    Ping(Ping),
    IndirectPing(IndirectPingReq),
    AckResp(AckResp),
    Alive(Alive),
    Suspect(Suspect),
    Dead(Dead),
    PushPull(PushPull),
    Compound(Vec<Bytes>),
}

/// Encode a single message with its kind tag.
pub fn encode<T: Serialize>(kind: MessageKind, payload: &T) -> Result<Bytes> {
    let body = bincode::serialize(payload)?;
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(kind.to_u8());
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Decode a datagram into a message.
pub fn decode(mut buf: &[u8]) -> Result<Message> {
    if buf.is_empty() {
        return Err(MembershipError::InvalidMessage("empty datagram".to_string()));
    }

    let tag = buf.get_u8();
    let kind = MessageKind::from_u8(tag)
        .ok_or_else(|| MembershipError::InvalidMessage(format!("unknown message tag: {}", tag)))?;

    let message = match kind {
        MessageKind::Ping => Message::Ping(bincode::deserialize(buf)?),
        MessageKind::IndirectPing => Message::IndirectPing(bincode::deserialize(buf)?),
        MessageKind::AckResp => Message::AckResp(bincode::deserialize(buf)?),
        MessageKind::Suspect => Message::Suspect(bincode::deserialize(buf)?),
        MessageKind::Alive => Message::Alive(bincode::deserialize(buf)?),
        MessageKind::Dead => Message::Dead(bincode::deserialize(buf)?),
        MessageKind::PushPull => Message::PushPull(bincode::deserialize(buf)?),
        MessageKind::Compound => Message::Compound(split_compound(buf)?),
    };
    Ok(message)
}

/// Pack already-encoded messages into one compound datagram.
pub fn make_compound(parts: &[Bytes]) -> Bytes {
    debug_assert!(parts.len() <= u8::MAX as usize);

    let body_len: usize = parts.iter().map(|p| COMPOUND_PART_OVERHEAD + p.len()).sum();
    let mut buf = BytesMut::with_capacity(COMPOUND_HEADER_OVERHEAD + body_len);
    buf.put_u8(MessageKind::Compound.to_u8());
    buf.put_u8(parts.len() as u8);
    for part in parts {
        buf.put_u16(part.len() as u16);
    }
    for part in parts {
        buf.put_slice(part);
    }
    buf.freeze()
}

fn split_compound(mut buf: &[u8]) -> Result<Vec<Bytes>> {
    if buf.is_empty() {
        return Err(MembershipError::InvalidMessage(
            "compound datagram missing part count".to_string(),
        ));
    }
    let count = buf.get_u8() as usize;

    if buf.remaining() < count * COMPOUND_PART_OVERHEAD {
        return Err(MembershipError::InvalidMessage(
            "compound datagram truncated length table".to_string(),
        ));
    }
    let mut lengths = Vec::with_capacity(count);
    for _ in 0..count {
        lengths.push(buf.get_u16() as usize);
    }

    let mut parts = Vec::with_capacity(count);
    for len in lengths {
        if buf.remaining() < len {
            return Err(MembershipError::InvalidMessage(
                "compound datagram truncated part".to_string(),
            ));
        }
        parts.push(Bytes::copy_from_slice(&buf[..len]));
        buf.advance(len);
    }
    Ok(parts)
}

/// Frame a push/pull snapshot for the TCP exchange.
pub fn frame_push_pull(push_pull: &PushPull) -> Result<Bytes> {
    let body = bincode::serialize(push_pull)?;
    let checksum = crc32fast::hash(&body);

    let mut buf = BytesMut::with_capacity(PUSH_PULL_HEADER_LEN + body.len());
    buf.put_u8(MessageKind::PushPull.to_u8());
    buf.put_u32(body.len() as u32);
    buf.put_u32(checksum);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Parse a push/pull frame header, returning the expected payload length
/// and checksum.
pub fn parse_push_pull_header(header: &[u8; PUSH_PULL_HEADER_LEN]) -> Result<(usize, u32)> {
    let mut buf = &header[..];
    let tag = buf.get_u8();
    if tag != MessageKind::PushPull.to_u8() {
        return Err(MembershipError::InvalidMessage(format!(
            "expected push/pull frame, got tag {}",
            tag
        )));
    }
    let len = buf.get_u32() as usize;
    if len > PUSH_PULL_MAX_PAYLOAD {
        return Err(MembershipError::InvalidMessage(format!(
            "push/pull payload of {} bytes exceeds limit",
            len
        )));
    }
    let checksum = buf.get_u32();
    Ok((len, checksum))
}

/// Decode a push/pull payload after verifying its checksum.
pub fn decode_push_pull_payload(payload: &[u8], checksum: u32) -> Result<PushPull> {
    if crc32fast::hash(payload) != checksum {
        return Err(MembershipError::ChecksumMismatch);
    }
    bincode::deserialize(payload).map_err(Into::into)
}
