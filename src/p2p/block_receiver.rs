//! Chunked block retrieval
//!
//! Drives one outbound get-blocks request against one peer and assembles the
//! ordered result from however many response chunks the peer sends back.
//! Faults never cross the async boundary: the receiver converts every
//! outcome into exactly one upstream `SyncEvent` (or silence after its
//! deadline) and releases its request token exactly once.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::p2p::message::{
    encode_payload, BlockData, BlockHash, GetBlocksRequest, GetBlocksResponse, Message, MsgId,
    ResultStatus, Subprotocol,
};
use crate::p2p::{ActorHandle, RemotePeer, SyncEvent, MAX_BLOCK_SIZE};

/// Block-chunk specific failures, each reported upstream at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("remote peer returned error")]
    RemotePeerFail,
    #[error("some block hash not found")]
    MissingHash,
    #[error("unexpected blocks in response")]
    UnexpectedBlock,
    #[error("too few blocks received than expected")]
    TooFewBlocks,
    #[error("too many blocks received than expected")]
    TooManyBlocks,
    #[error("block size limit exceeded")]
    TooBigBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverStatus {
    Waiting,
    Canceled,
    Finished,
}

/// Tracks one in-flight multi-message block request.
///
/// `receive_resp` must be invoked strictly from the single reader task of
/// the owning connection; no internal locking is done.
pub struct BlocksChunkReceiver {
    request_id: MsgId,
    peer: Arc<dyn RemotePeer>,
    actor: ActorHandle,

    block_hashes: Vec<BlockHash>,
    deadline: Instant,
    status: ReceiverStatus,

    got: Vec<Option<BlockData>>,
    offset: usize,
    sender_finished: Option<Arc<Notify>>,
    max_block_size: usize,
}

impl BlocksChunkReceiver {
    pub fn new(
        actor: ActorHandle,
        peer: Arc<dyn RemotePeer>,
        block_hashes: Vec<BlockHash>,
        ttl: Duration,
    ) -> Self {
        let expected = block_hashes.len();
        BlocksChunkReceiver {
            request_id: MsgId::ZERO,
            peer,
            actor,
            block_hashes,
            deadline: Instant::now() + ttl,
            status: ReceiverStatus::Waiting,
            got: (0..expected).map(|_| None).collect(),
            offset: 0,
            sender_finished: None,
            max_block_size: MAX_BLOCK_SIZE,
        }
    }

    /// Send the request and record the token used to correlate responses.
    pub fn start_get(&mut self) -> Result<MsgId, bincode::Error> {
        let req = GetBlocksRequest {
            hashes: self.block_hashes.clone(),
        };
        let msg = Message::new(Subprotocol::GET_BLOCKS_REQUEST, encode_payload(&req)?);
        self.request_id = msg.id;
        self.peer.send_message(msg);
        Ok(self.request_id)
    }

    pub fn request_id(&self) -> MsgId {
        self.request_id
    }

    /// True once this receiver needs no further responses and can be
    /// dropped from the dispatch table.
    pub fn finished(&self) -> bool {
        self.status == ReceiverStatus::Finished
    }

    /// Handle one incoming response correlated to this request. `body` is
    /// `None` when the payload did not decode as a get-blocks response.
    pub fn receive_resp(&mut self, msg: &Message, body: Option<&GetBlocksResponse>) {
        match self.status {
            ReceiverStatus::Waiting => self.handle_in_waiting(msg, body),
            ReceiverStatus::Canceled => self.handle_in_canceled(body),
            ReceiverStatus::Finished => {}
        }
    }

    fn handle_in_waiting(&mut self, _msg: &Message, body: Option<&GetBlocksResponse>) {
        // the original caller dropped its wait already; just free the token
        if Instant::now() > self.deadline {
            self.finish_receiver();
            return;
        }
        // undecodable body or explicit failure status
        let body = match body {
            Some(b) if b.status == ResultStatus::Ok => b,
            _ => {
                self.report(Err(ChunkError::RemotePeerFail));
                self.finish_receiver();
                return;
            }
        };
        if body.blocks.is_empty() {
            self.report(Err(ChunkError::MissingHash));
            self.finish_receiver();
            return;
        }

        for block in &body.blocks {
            // a response with more blocks than requested is an error too
            if self.offset >= self.got.len() {
                self.report(Err(ChunkError::TooManyBlocks));
                self.cancel_receiving(body.has_next);
                return;
            }
            if self.block_hashes[self.offset] != block.hash {
                self.report(Err(ChunkError::UnexpectedBlock));
                self.cancel_receiving(body.has_next);
                return;
            }
            if block.encoded_len() > self.max_block_size {
                self.report(Err(ChunkError::TooBigBlock));
                self.cancel_receiving(body.has_next);
                return;
            }
            self.got[self.offset] = Some(block.clone());
            self.offset += 1;
        }

        if !body.has_next {
            if self.offset < self.got.len() {
                self.report(Err(ChunkError::TooFewBlocks));
            } else {
                let blocks = self.got.drain(..).flatten().collect();
                self.report(Ok(blocks));
            }
            self.finish_receiver();
        }
    }

    /// Cancel mid-exchange while further responses may still be on the way.
    /// The request token stays reserved until the peer signals the last
    /// chunk or the deadline elapses, whichever comes first.
    fn cancel_receiving(&mut self, has_next: bool) {
        self.status = ReceiverStatus::Canceled;
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if !has_next || remaining.is_zero() {
            // nothing more will arrive; same as a finish
            self.finish_receiver();
            return;
        }
        debug!(
            target: "lumen_node::p2p::sync",
            "[CHUNK] canceled request {} to {}, draining for up to {:?}",
            self.request_id,
            self.peer.id().short(),
            remaining
        );
        let notify = Arc::new(Notify::new());
        self.sender_finished = Some(notify.clone());
        let peer = self.peer.clone();
        let request_id = self.request_id;
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = notify.notified() => {}
            }
            peer.consume_request(request_id);
        });
    }

    fn finish_receiver(&mut self) {
        self.status = ReceiverStatus::Finished;
        self.peer.consume_request(self.request_id);
    }

    /// While canceled, responses are only inspected for the last-chunk
    /// signal so the token can be released early; anything else is dropped.
    /// The last chunk (or the deadline) also finishes the receiver so the
    /// owner's dispatch table can evict it; the token release itself stays
    /// with the background wait.
    fn handle_in_canceled(&mut self, body: Option<&GetBlocksResponse>) {
        if Instant::now() > self.deadline {
            self.status = ReceiverStatus::Finished;
            return;
        }
        if let Some(body) = body {
            if !body.has_next {
                if let Some(notify) = &self.sender_finished {
                    notify.notify_one();
                }
                self.status = ReceiverStatus::Finished;
            }
        }
    }

    fn report(&self, result: Result<Vec<BlockData>, ChunkError>) {
        self.actor.tell(SyncEvent::BlockChunks {
            from: self.peer.id(),
            result,
        });
    }
}
