//! Status handshake
//!
//! Two entry roles, outbound initiator and inbound acceptor, converging on
//! the same negotiated result: the remote peer's `Status`. Any framing
//! error, chain mismatch, decode failure, or cancellation terminates the
//! handshake; the caller owns connection teardown.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::p2p::message::{
    decode_payload, encode_payload, ChainId, GoAwayNotice, Message, PeerAddress, PeerId, Status,
    Subprotocol,
};
use crate::p2p::wire::{WireError, WireReader, WireWriter};
use crate::p2p::CancelToken;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("unexpected message type: {0}")]
    UnexpectedMessage(Subprotocol),
    #[error("remote peer refused handshake: {0}")]
    PeerRejected(String),
    #[error("different chain id: {0}")]
    ChainMismatch(ChainId),
    #[error("invalid peer address: {0}")]
    InvalidPeerAddress(PeerAddress),
    #[error("failed to decode handshake payload: {0}")]
    Decode(#[source] bincode::Error),
    #[error("handshake cancelled")]
    Cancelled,
}

/// Exchanges status messages over a fresh connection and verifies chain
/// identity. Consumes the connection halves and hands them back on success
/// so the session can keep using the same codec.
pub struct Handshaker<R, W> {
    local_status: Status,
    peer_id: PeerId,
    reader: WireReader<R>,
    writer: WireWriter<W>,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Handshaker<R, W> {
    pub fn new(local_status: Status, peer_id: PeerId, rd: R, wr: W) -> Self {
        Handshaker {
            local_status,
            peer_id,
            reader: WireReader::new(rd),
            writer: WireWriter::new(wr),
        }
    }

    /// Handshake with a peer we dialed: send our status, then wait for the
    /// peer's status in reply.
    pub async fn outbound(&mut self, cancel: &CancelToken) -> Result<Status, HandshakeError> {
        debug!(
            target: "lumen_node::p2p::handshake",
            "[HANDSHAKE] starting outbound handshake with {}",
            self.peer_id.short()
        );
        self.send_local_status().await?;
        check_cancel(cancel)?;

        let data = self.reader.read_message().await?;
        check_cancel(cancel)?;

        let remote = self.parse_remote_status(&data)?;
        self.validate_remote(remote)
    }

    /// Handshake with a peer that dialed us: wait for the peer's status
    /// first, validate it, then answer with ours.
    pub async fn inbound(&mut self, cancel: &CancelToken) -> Result<Status, HandshakeError> {
        debug!(
            target: "lumen_node::p2p::handshake",
            "[HANDSHAKE] starting inbound handshake with {}",
            self.peer_id.short()
        );
        let data = self.reader.read_message().await?;
        check_cancel(cancel)?;

        let remote = self.parse_remote_status(&data)?;
        let remote = self.validate_remote(remote)?;

        self.send_local_status().await?;
        check_cancel(cancel)?;
        Ok(remote)
    }

    /// Reclaim the connection halves for the established session.
    pub fn into_parts(self) -> (WireReader<R>, WireWriter<W>) {
        (self.reader, self.writer)
    }

    async fn send_local_status(&mut self) -> Result<(), HandshakeError> {
        let payload = encode_payload(&self.local_status).map_err(HandshakeError::Decode)?;
        let msg = Message::new(Subprotocol::STATUS, payload);
        self.writer.write_message(&msg).await?;
        Ok(())
    }

    fn parse_remote_status(&self, data: &Message) -> Result<Status, HandshakeError> {
        if data.subprotocol != Subprotocol::STATUS {
            if data.subprotocol == Subprotocol::GO_AWAY {
                return Err(self.handle_go_away(data));
            }
            return Err(HandshakeError::UnexpectedMessage(data.subprotocol));
        }
        decode_payload::<Status>(&data.payload).map_err(HandshakeError::Decode)
    }

    fn validate_remote(&self, remote: Status) -> Result<Status, HandshakeError> {
        if remote.chain_id.as_bytes() != self.local_status.chain_id.as_bytes() {
            return Err(HandshakeError::ChainMismatch(remote.chain_id));
        }
        if !remote.sender.is_well_formed() {
            return Err(HandshakeError::InvalidPeerAddress(remote.sender));
        }
        info!(
            target: "lumen_node::p2p::handshake",
            "[HANDSHAKE] negotiated session with {} at height {}",
            remote.sender.peer_id.short(),
            remote.best_height
        );
        Ok(remote)
    }

    fn handle_go_away(&self, data: &Message) -> HandshakeError {
        match decode_payload::<GoAwayNotice>(&data.payload) {
            Ok(notice) => HandshakeError::PeerRejected(notice.message),
            Err(err) => HandshakeError::Decode(err),
        }
    }
}

fn check_cancel(cancel: &CancelToken) -> Result<(), HandshakeError> {
    if cancel.is_cancelled() {
        Err(HandshakeError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn status_for(chain: &[u8], addr: &str, id_byte: u8) -> Status {
        Status {
            chain_id: ChainId::from_bytes(chain.to_vec()),
            sender: PeerAddress {
                address: addr.to_string(),
                port: 7846,
                peer_id: PeerId([id_byte; 32]),
            },
            best_block_hash: vec![id_byte; 32],
            best_height: 100,
        }
    }

    #[tokio::test]
    async fn outbound_and_inbound_agree() {
        let (a, b) = duplex(1 << 16);
        let (a_rd, a_wr) = tokio::io::split(a);
        let (b_rd, b_wr) = tokio::io::split(b);

        let local = status_for(b"chain-main", "10.0.0.1", 1);
        let remote = status_for(b"chain-main", "10.0.0.2", 2);

        let mut dialer = Handshaker::new(local.clone(), PeerId([2u8; 32]), a_rd, a_wr);
        let mut acceptor = Handshaker::new(remote.clone(), PeerId([1u8; 32]), b_rd, b_wr);

        let cancel = CancelToken::new();
        let (got_out, got_in) = tokio::join!(dialer.outbound(&cancel), acceptor.inbound(&cancel));

        assert_eq!(got_out.expect("outbound"), remote);
        assert_eq!(got_in.expect("inbound"), local);
    }

    #[tokio::test]
    async fn chain_mismatch_rejects_session() {
        let (a, b) = duplex(1 << 16);
        let (a_rd, a_wr) = tokio::io::split(a);
        let (_b_rd, b_wr) = tokio::io::split(b);

        let local = status_for(b"chain-main", "10.0.0.1", 1);
        let remote = status_for(b"chain-test", "10.0.0.2", 2);

        let mut dialer = Handshaker::new(local, PeerId([2u8; 32]), a_rd, a_wr);
        let reply = Message::new(
            Subprotocol::STATUS,
            encode_payload(&remote).expect("encode"),
        );
        let mut wire = WireWriter::new(b_wr);

        let cancel = CancelToken::new();
        let (result, _) = tokio::join!(dialer.outbound(&cancel), async {
            wire.write_message(&reply).await.expect("reply write");
        });

        assert!(matches!(result, Err(HandshakeError::ChainMismatch(_))));
    }

    #[tokio::test]
    async fn go_away_surfaces_decline_reason() {
        let (a, b) = duplex(1 << 16);
        let (a_rd, a_wr) = tokio::io::split(a);
        let (_b_rd, b_wr) = tokio::io::split(b);

        let local = status_for(b"chain-main", "10.0.0.1", 1);
        let mut dialer = Handshaker::new(local, PeerId([2u8; 32]), a_rd, a_wr);

        // remote refuses instead of answering with a status
        let notice = GoAwayNotice {
            message: "address is banned".to_string(),
        };
        let refusal = Message::new(
            Subprotocol::GO_AWAY,
            encode_payload(&notice).expect("encode"),
        );
        let mut wire = WireWriter::new(b_wr);

        let cancel = CancelToken::new();
        let (result, _) = tokio::join!(dialer.outbound(&cancel), async {
            wire.write_message(&refusal).await.expect("refusal write");
        });

        match result {
            Err(HandshakeError::PeerRejected(reason)) => assert_eq!(reason, "address is banned"),
            other => panic!("expected rejection, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn invalid_advertised_address_rejects_session() {
        let (a, b) = duplex(1 << 16);
        let (a_rd, a_wr) = tokio::io::split(a);
        let (_b_rd, b_wr) = tokio::io::split(b);

        let local = status_for(b"chain-main", "10.0.0.1", 1);
        let mut bad_remote = status_for(b"chain-main", "not a host!", 2);
        bad_remote.sender.port = 0;

        let mut dialer = Handshaker::new(local, PeerId([2u8; 32]), a_rd, a_wr);
        let reply = Message::new(
            Subprotocol::STATUS,
            encode_payload(&bad_remote).expect("encode"),
        );
        let mut wire = WireWriter::new(b_wr);

        let cancel = CancelToken::new();
        let (result, _) = tokio::join!(dialer.outbound(&cancel), async {
            wire.write_message(&reply).await.expect("reply write");
        });

        assert!(matches!(result, Err(HandshakeError::InvalidPeerAddress(_))));
    }

    #[tokio::test]
    async fn cancellation_aborts_between_operations() {
        let (a, b) = duplex(1 << 16);
        let (a_rd, a_wr) = tokio::io::split(a);
        let (_b_rd, b_wr) = tokio::io::split(b);

        let local = status_for(b"chain-main", "10.0.0.1", 1);
        let remote = status_for(b"chain-main", "10.0.0.2", 2);

        let mut dialer = Handshaker::new(local, PeerId([2u8; 32]), a_rd, a_wr);
        let reply = Message::new(
            Subprotocol::STATUS,
            encode_payload(&remote).expect("encode"),
        );
        let mut wire = WireWriter::new(b_wr);

        let cancel = CancelToken::new();
        cancel.cancel();
        let (result, _) = tokio::join!(dialer.outbound(&cancel), async {
            // reply may or may not be consumed; the dialer must abort at its
            // first checkpoint either way
            let _ = wire.write_message(&reply).await;
        });

        assert!(matches!(result, Err(HandshakeError::Cancelled)));
    }
}
