//! Protocol message types and payload bodies
//!
//! Every wire message carries a fixed header (subprotocol tag, declared
//! payload length, timestamp, message id, original message id) followed by a
//! bincode-encoded body. Bodies are typed structs defined here; the framing
//! itself lives in `wire.rs`.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subprotocol tag identifying the semantic type of a wire message.
///
/// Kept as an open newtype over the raw u32 so that unknown tags survive
/// framing and are rejected (or ignored) at the dispatch layer instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subprotocol(pub u32);

impl Subprotocol {
    pub const STATUS: Subprotocol = Subprotocol(0x01);
    pub const GO_AWAY: Subprotocol = Subprotocol(0x02);
    pub const PING: Subprotocol = Subprotocol(0x03);
    pub const PONG: Subprotocol = Subprotocol(0x04);
    pub const GET_BLOCKS_REQUEST: Subprotocol = Subprotocol(0x10);
    pub const GET_BLOCKS_RESPONSE: Subprotocol = Subprotocol(0x11);
    pub const NEW_BLOCK_NOTICE: Subprotocol = Subprotocol(0x12);

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Subprotocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Subprotocol::STATUS => "status",
            Subprotocol::GO_AWAY => "go_away",
            Subprotocol::PING => "ping",
            Subprotocol::PONG => "pong",
            Subprotocol::GET_BLOCKS_REQUEST => "get_blocks_request",
            Subprotocol::GET_BLOCKS_RESPONSE => "get_blocks_response",
            Subprotocol::NEW_BLOCK_NOTICE => "new_block_notice",
            Subprotocol(other) => return write!(f, "unknown({:#x})", other),
        };
        f.write_str(name)
    }
}

/// 128-bit message identifier, used to correlate requests with responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgId(pub [u8; 16]);

impl MsgId {
    /// Zero id, used as `original_id` for messages that are not replies.
    pub const ZERO: MsgId = MsgId([0u8; 16]);

    pub fn generate() -> Self {
        MsgId(*Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        MsgId(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Uuid::from_bytes(self.0).fmt(f)
    }
}

/// A framed protocol message.
///
/// Invariant: `length == payload.len()` and `length <= MAX_PAYLOAD_LENGTH`.
/// The wire writer re-validates both before putting bytes on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subprotocol: Subprotocol,
    pub id: MsgId,
    /// Id of the request this message answers; zero when not a reply.
    pub original_id: MsgId,
    /// Sender-side creation time, unix nanoseconds.
    pub timestamp: i64,
    /// Declared payload byte count.
    pub length: u32,
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a fresh (non-reply) message with a generated id.
    pub fn new(subprotocol: Subprotocol, payload: Vec<u8>) -> Self {
        Message {
            subprotocol,
            id: MsgId::generate(),
            original_id: MsgId::ZERO,
            timestamp: now_nanos(),
            length: payload.len() as u32,
            payload,
        }
    }

    /// Create a reply correlated to `original`.
    pub fn reply_to(original: &Message, subprotocol: Subprotocol, payload: Vec<u8>) -> Self {
        Message {
            subprotocol,
            id: MsgId::generate(),
            original_id: original.id,
            timestamp: now_nanos(),
            length: payload.len() as u32,
            payload,
        }
    }
}

fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis().saturating_mul(1_000_000))
}

/// 32-byte peer identity derived from the node key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Abbreviated form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for PeerId {
    type Err = PeerIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| PeerIdParseError)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| PeerIdParseError)?;
        Ok(PeerId(arr))
    }
}

/// Returned when a stored peer identity string cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("malformed peer id string")]
pub struct PeerIdParseError;

/// Opaque byte-encoded chain identity. Two peers may form a session only if
/// their encodings are byte-for-byte equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainId(Vec<u8>);

impl ChainId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ChainId(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// Network address record a peer advertises about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// IP address or DNS name, without port.
    pub address: String,
    pub port: u16,
    pub peer_id: PeerId,
}

impl PeerAddress {
    /// Well-formedness check used during handshake: the address must be a
    /// parseable IP or a plausible DNS name, and the port must be nonzero.
    pub fn is_well_formed(&self) -> bool {
        if self.port == 0 || self.address.is_empty() {
            return false;
        }
        if self.address.parse::<IpAddr>().is_ok() {
            return true;
        }
        // DNS name: labels of alphanumerics and hyphens, dot-separated.
        self.address.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.address, self.port, self.peer_id.short())
    }
}

/// Handshake payload: everything a peer needs to decide whether to keep the
/// session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub chain_id: ChainId,
    pub sender: PeerAddress,
    pub best_block_hash: Vec<u8>,
    pub best_height: u64,
}

/// Polite connection-refusal notice carrying the decline reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoAwayNotice {
    pub message: String,
}

pub type BlockHash = [u8; 32];

/// A block as carried in chunked get-blocks responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub hash: BlockHash,
    pub body: Vec<u8>,
}

impl BlockData {
    /// Serialized size used against the max-block-size limit.
    pub fn encoded_len(&self) -> usize {
        self.hash.len() + self.body.len()
    }
}

/// Result status of a request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultStatus {
    Ok,
    NotFound,
    InternalError,
}

/// Request for a batch of blocks, in the exact order they should come back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksRequest {
    pub hashes: Vec<BlockHash>,
}

/// One chunk of a multi-part get-blocks response. `has_next` tells the
/// requester whether more chunks will follow under the same original id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksResponse {
    pub status: ResultStatus,
    pub blocks: Vec<BlockData>,
    pub has_next: bool,
}

/// Encode a typed body into wire payload bytes.
pub fn encode_payload<T: Serialize>(body: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(body)
}

/// Decode wire payload bytes into a typed body.
pub fn decode_payload<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_id_zero_and_generate() {
        assert!(MsgId::ZERO.is_zero());
        let id = MsgId::generate();
        assert!(!id.is_zero());
        assert_ne!(id, MsgId::generate());
    }

    #[test]
    fn peer_id_round_trips_through_string() {
        let id = PeerId([7u8; 32]);
        let parsed: PeerId = id.to_string().parse().expect("parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn peer_id_rejects_malformed_strings() {
        assert!("not-hex".parse::<PeerId>().is_err());
        assert!("abcd".parse::<PeerId>().is_err()); // too short
    }

    #[test]
    fn peer_address_validation() {
        let mut addr = PeerAddress {
            address: "192.168.0.5".to_string(),
            port: 7846,
            peer_id: PeerId([1u8; 32]),
        };
        assert!(addr.is_well_formed());

        addr.address = "node-3.lumen.example".to_string();
        assert!(addr.is_well_formed());

        addr.address = "bad host!".to_string();
        assert!(!addr.is_well_formed());

        addr.address = "10.0.0.1".to_string();
        addr.port = 0;
        assert!(!addr.is_well_formed());
    }

    #[test]
    fn status_payload_round_trip() {
        let status = Status {
            chain_id: ChainId::from_bytes(b"lumen-main".to_vec()),
            sender: PeerAddress {
                address: "10.1.2.3".to_string(),
                port: 7846,
                peer_id: PeerId([9u8; 32]),
            },
            best_block_hash: vec![0xab; 32],
            best_height: 42,
        };
        let bytes = encode_payload(&status).expect("encode");
        let decoded: Status = decode_payload(&bytes).expect("decode");
        assert_eq!(decoded, status);
    }

    #[test]
    fn reply_carries_original_id() {
        let req = Message::new(Subprotocol::PING, Vec::new());
        let resp = Message::reply_to(&req, Subprotocol::PONG, Vec::new());
        assert_eq!(resp.original_id, req.id);
        assert_ne!(resp.id, req.id);
    }
}
