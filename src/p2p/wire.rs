//! Binary wire framing
//!
//! Fixed 48-byte big-endian header followed by the payload:
//! subprotocol (4) | length (4) | timestamp (8) | id (16) | original id (16).
//!
//! One reader and one writer per connection; reads are serialized with reads
//! and writes with writes, but the two directions may run concurrently.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::p2p::message::{Message, MsgId, Subprotocol};

/// Header size in bytes.
pub const MSG_HEADER_LENGTH: usize = 48;

/// Hard cap on payload size; anything larger is a protocol violation.
pub const MAX_PAYLOAD_LENGTH: u32 = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("oversized payload: {0} bytes")]
    OversizedPayload(u32),
    #[error("payload length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reads framed messages off a byte stream. Single-reader use only.
pub struct WireReader<R> {
    rd: R,
    head_buf: [u8; MSG_HEADER_LENGTH],
    trace: bool,
}

impl<R: AsyncRead + Unpin> WireReader<R> {
    pub fn new(rd: R) -> Self {
        WireReader {
            rd,
            head_buf: [0u8; MSG_HEADER_LENGTH],
            trace: false,
        }
    }

    /// Variant that logs per-phase read latency at TRACE level.
    pub fn traceable(rd: R) -> Self {
        let mut r = Self::new(rd);
        r.trace = true;
        r
    }

    /// Block until one complete message is available or the stream errors.
    pub async fn read_message(&mut self) -> Result<Message, WireError> {
        let start = std::time::Instant::now();
        self.rd.read_exact(&mut self.head_buf).await?;
        let lap_head = start.elapsed();

        let mut msg = parse_header(&self.head_buf);
        if msg.length > MAX_PAYLOAD_LENGTH {
            return Err(WireError::OversizedPayload(msg.length));
        }
        let mut payload = vec![0u8; msg.length as usize];
        self.rd.read_exact(&mut payload).await?;
        msg.payload = payload;

        if self.trace {
            trace!(
                target: "lumen_node::p2p::wire",
                "[rd] msg_id={} sub={} head_ns={} payload_ns={}",
                msg.id,
                msg.subprotocol,
                lap_head.as_nanos(),
                start.elapsed().as_nanos()
            );
        }
        Ok(msg)
    }
}

/// Writes framed messages onto a byte stream. Single-writer use only.
pub struct WireWriter<W> {
    wr: W,
    head_buf: [u8; MSG_HEADER_LENGTH],
    trace: bool,
}

impl<W: AsyncWrite + Unpin> WireWriter<W> {
    pub fn new(wr: W) -> Self {
        WireWriter {
            wr,
            head_buf: [0u8; MSG_HEADER_LENGTH],
            trace: false,
        }
    }

    pub fn traceable(wr: W) -> Self {
        let mut w = Self::new(wr);
        w.trace = true;
        w
    }

    /// Block until the full header and payload are flushed or the stream
    /// errors.
    pub async fn write_message(&mut self, msg: &Message) -> Result<(), WireError> {
        if msg.length as usize != msg.payload.len() {
            return Err(WireError::LengthMismatch {
                declared: msg.length,
                actual: msg.payload.len(),
            });
        }
        if msg.length > MAX_PAYLOAD_LENGTH {
            return Err(WireError::OversizedPayload(msg.length));
        }
        let start = std::time::Instant::now();
        marshal_header(&mut self.head_buf, msg);
        self.wr.write_all(&self.head_buf).await?;
        let lap_head = start.elapsed();
        self.wr.write_all(&msg.payload).await?;
        self.wr.flush().await?;

        if self.trace {
            trace!(
                target: "lumen_node::p2p::wire",
                "[wr] msg_id={} sub={} head_ns={} payload_ns={}",
                msg.id,
                msg.subprotocol,
                lap_head.as_nanos(),
                start.elapsed().as_nanos()
            );
        }
        Ok(())
    }
}

fn parse_header(buf: &[u8; MSG_HEADER_LENGTH]) -> Message {
    let subprotocol = Subprotocol(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]));
    let length = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let timestamp = i64::from_be_bytes([
        buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
    ]);
    let mut id = [0u8; 16];
    id.copy_from_slice(&buf[16..32]);
    let mut original_id = [0u8; 16];
    original_id.copy_from_slice(&buf[32..48]);
    Message {
        subprotocol,
        id: MsgId::from_bytes(id),
        original_id: MsgId::from_bytes(original_id),
        timestamp,
        length,
        payload: Vec::new(),
    }
}

fn marshal_header(buf: &mut [u8; MSG_HEADER_LENGTH], msg: &Message) {
    buf[0..4].copy_from_slice(&msg.subprotocol.as_u32().to_be_bytes());
    buf[4..8].copy_from_slice(&msg.length.to_be_bytes());
    buf[8..16].copy_from_slice(&msg.timestamp.to_be_bytes());
    buf[16..32].copy_from_slice(msg.id.as_bytes());
    buf[32..48].copy_from_slice(msg.original_id.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn sample_message(payload: Vec<u8>) -> Message {
        Message::new(Subprotocol::GET_BLOCKS_REQUEST, payload)
    }

    #[tokio::test]
    async fn round_trips_message() {
        let (client, server) = duplex(1 << 16);
        let mut writer = WireWriter::new(client);
        let mut reader = WireReader::new(server);

        let msg = sample_message(vec![0xde, 0xad, 0xbe, 0xef]);
        writer.write_message(&msg).await.expect("write");
        let got = reader.read_message().await.expect("read");

        assert_eq!(got.subprotocol, msg.subprotocol);
        assert_eq!(got.id, msg.id);
        assert_eq!(got.original_id, msg.original_id);
        assert_eq!(got.timestamp, msg.timestamp);
        assert_eq!(got.length, msg.length);
        assert_eq!(got.payload, msg.payload);
    }

    #[tokio::test]
    async fn traceable_codec_frames_identically() {
        let (client, server) = duplex(1 << 16);
        let mut writer = WireWriter::traceable(client);
        let mut reader = WireReader::traceable(server);

        let msg = sample_message(vec![7u8; 128]);
        writer.write_message(&msg).await.expect("write");
        let got = reader.read_message().await.expect("read");
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn round_trips_empty_payload() {
        let (client, server) = duplex(256);
        let mut writer = WireWriter::new(client);
        let mut reader = WireReader::new(server);

        let msg = sample_message(Vec::new());
        writer.write_message(&msg).await.expect("write");
        let got = reader.read_message().await.expect("read");
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn write_rejects_length_mismatch() {
        let (client, _server) = duplex(256);
        let mut writer = WireWriter::new(client);

        let mut msg = sample_message(vec![1, 2, 3]);
        msg.length = 2;
        match writer.write_message(&msg).await {
            Err(WireError::LengthMismatch { declared, actual }) => {
                assert_eq!(declared, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("expected length mismatch, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn write_rejects_oversized_payload() {
        let (client, _server) = duplex(256);
        let mut writer = WireWriter::new(client);

        let mut msg = sample_message(Vec::new());
        msg.length = MAX_PAYLOAD_LENGTH + 1;
        msg.payload = Vec::new();
        // force the declared length through the mismatch check
        msg.payload.resize((MAX_PAYLOAD_LENGTH + 1) as usize, 0);
        assert!(matches!(
            writer.write_message(&msg).await,
            Err(WireError::OversizedPayload(_))
        ));
    }

    #[tokio::test]
    async fn read_rejects_oversized_declared_length() {
        let (client, server) = duplex(256);
        let mut reader = WireReader::new(server);

        // hand-craft a header declaring a payload over the cap
        let mut msg = sample_message(Vec::new());
        msg.length = MAX_PAYLOAD_LENGTH + 1;
        let mut head = [0u8; MSG_HEADER_LENGTH];
        marshal_header(&mut head, &msg);

        let mut raw = client;
        tokio::io::AsyncWriteExt::write_all(&mut raw, &head)
            .await
            .expect("raw write");

        assert!(matches!(
            reader.read_message().await,
            Err(WireError::OversizedPayload(_))
        ));
    }

    #[tokio::test]
    async fn read_surfaces_truncated_stream() {
        let (client, server) = duplex(256);
        let mut reader = WireReader::new(server);

        // write a valid header but only half the payload, then close
        let msg = sample_message(vec![9u8; 64]);
        let mut head = [0u8; MSG_HEADER_LENGTH];
        marshal_header(&mut head, &msg);
        let mut raw = client;
        tokio::io::AsyncWriteExt::write_all(&mut raw, &head)
            .await
            .expect("head");
        tokio::io::AsyncWriteExt::write_all(&mut raw, &msg.payload[..32])
            .await
            .expect("partial payload");
        drop(raw);

        assert!(matches!(reader.read_message().await, Err(WireError::Io(_))));
    }
}
