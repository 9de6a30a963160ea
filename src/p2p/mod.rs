//! P2P networking core
//!
//! Session establishment (wire framing + handshake), chunked block retrieval,
//! and the peer audit/blacklist subsystem that protects the node from
//! misbehaving peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

pub mod audit;
pub mod block_receiver;
pub mod handshake;
pub mod message;
pub mod server;
pub mod wire;

use message::{BlockData, Message, MsgId, PeerId};

use crate::p2p::block_receiver::ChunkError;

/// Maximum serialized size of a single block accepted from a peer.
pub const MAX_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Cooperative cancellation signal, checked between network operations
/// (never mid-I/O). One-way: once cancelled it stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to an established remote peer session, as seen by protocol logic.
///
/// `send_message` is fire-and-forget into the per-connection writer task;
/// `consume_request` releases a request token reserved for a multi-part
/// response exchange.
pub trait RemotePeer: Send + Sync {
    fn id(&self) -> PeerId;
    fn address(&self) -> String;
    fn send_message(&self, msg: Message);
    fn consume_request(&self, msg_id: MsgId);
}

/// Result messages the core reports upstream, actor style.
#[derive(Debug)]
pub enum SyncEvent {
    /// Final outcome of one block-chunk request: either the full ordered
    /// block array or the specific failure.
    BlockChunks {
        from: PeerId,
        result: Result<Vec<BlockData>, ChunkError>,
    },
}

/// Fire-and-forget delivery of typed result messages to the sync layer.
#[derive(Debug, Clone)]
pub struct ActorHandle {
    tx: mpsc::UnboundedSender<SyncEvent>,
}

impl ActorHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ActorHandle { tx }, rx)
    }

    /// Deliver an event; a gone receiver is not this layer's problem.
    pub fn tell(&self, event: SyncEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_one_way() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }
}
