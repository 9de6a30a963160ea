//! Peer server and session management
//!
//! Owns the listening socket, performs ban admission and the status
//! handshake for every connection, and runs one reader task, one writer task,
//! and one result-forwarding task per established session. All protocol
//! dispatch happens on the session's single reader task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::p2p::audit::auditor::{ExceedListener, PeerAuditor};
use crate::p2p::audit::blacklist::BlacklistManager;
use crate::p2p::audit::{penalty_for, BlameKind};
use crate::p2p::block_receiver::BlocksChunkReceiver;
use crate::p2p::handshake::{HandshakeError, Handshaker};
use crate::p2p::message::{
    decode_payload, encode_payload, BlockHash, ChainId, GetBlocksResponse, GoAwayNotice, Message,
    MsgId, PeerId, ResultStatus, Status, Subprotocol,
};
use crate::p2p::wire::{WireReader, WireWriter};
use crate::p2p::{ActorHandle, CancelToken, RemotePeer, SyncEvent};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("peer is banned (until {until:?})")]
    Banned { until: Option<DateTime<Utc>> },
    #[error("no active session for peer {0}")]
    UnknownPeer(PeerId),
    #[error("failed to encode request: {0}")]
    Encode(#[source] bincode::Error),
}

/// Established peer session as the protocol logic sees it. Writes go through
/// the per-connection writer task; request tokens for in-flight multi-part
/// exchanges live here so they survive receiver cancellation.
pub struct PeerSession {
    peer_id: PeerId,
    address: String,
    out_tx: mpsc::UnboundedSender<Message>,
    reserved: Mutex<HashSet<MsgId>>,
}

impl PeerSession {
    /// Number of request tokens currently held. Diagnostic only.
    pub fn reserved_requests(&self) -> usize {
        self.reserved.lock().len()
    }
}

impl RemotePeer for PeerSession {
    fn id(&self) -> PeerId {
        self.peer_id
    }

    fn address(&self) -> String {
        self.address.clone()
    }

    fn send_message(&self, msg: Message) {
        if msg.subprotocol == Subprotocol::GET_BLOCKS_REQUEST {
            self.reserved.lock().insert(msg.id);
        }
        // a closed channel means the session is tearing down; drop silently
        if self.out_tx.send(msg).is_err() {
            debug!(
                target: "lumen_node::p2p::server",
                "[SESSION] dropping message to closed session {}",
                self.peer_id.short()
            );
        }
    }

    fn consume_request(&self, msg_id: MsgId) {
        self.reserved.lock().remove(&msg_id);
    }
}

/// Closes the session when its auditor flags the peer.
struct DisconnectOnExceed {
    shutdown: Arc<Notify>,
}

impl ExceedListener for DisconnectOnExceed {
    fn on_exceed(&self, auditor: &dyn PeerAuditor, cause: &str) {
        warn!(
            target: "lumen_node::p2p::server",
            "[SESSION] disconnecting peer {} at {}: score exceeded ({})",
            auditor.peer_id().short(),
            auditor.ip_address(),
            cause
        );
        self.shutdown.notify_one();
    }
}

struct ActivePeer {
    session: Arc<PeerSession>,
    auditor: Arc<dyn PeerAuditor>,
    receivers: Mutex<HashMap<MsgId, BlocksChunkReceiver>>,
    shutdown: Arc<Notify>,
    /// Receivers report here; the forwarding task applies penalties and
    /// relays upstream.
    actor: ActorHandle,
    block_fetch_ttl: std::time::Duration,
}

impl ActivePeer {
    fn request_blocks(&self, hashes: Vec<BlockHash>) -> Result<MsgId, ServerError> {
        let mut receiver = BlocksChunkReceiver::new(
            self.actor.clone(),
            self.session.clone() as Arc<dyn RemotePeer>,
            hashes,
            self.block_fetch_ttl,
        );
        let request_id = receiver.start_get().map_err(ServerError::Encode)?;
        self.receivers.lock().insert(request_id, receiver);
        Ok(request_id)
    }

    /// Dispatch one inbound message. Returns false when the session must
    /// close.
    fn handle_message(&self, msg: &Message) -> bool {
        match msg.subprotocol {
            Subprotocol::PING => {
                self.session
                    .send_message(Message::reply_to(msg, Subprotocol::PONG, Vec::new()));
            }
            Subprotocol::PONG => {}
            Subprotocol::GO_AWAY => {
                let reason = decode_payload::<GoAwayNotice>(&msg.payload)
                    .map(|notice| notice.message)
                    .unwrap_or_else(|_| "<undecodable>".to_string());
                info!(
                    target: "lumen_node::p2p::server",
                    "[SESSION] peer {} sent go-away: {}",
                    self.session.peer_id.short(),
                    reason
                );
                return false;
            }
            Subprotocol::GET_BLOCKS_RESPONSE => {
                let body = decode_payload::<GetBlocksResponse>(&msg.payload).ok();
                let mut receivers = self.receivers.lock();
                match receivers.get_mut(&msg.original_id) {
                    Some(receiver) => {
                        receiver.receive_resp(msg, body.as_ref());
                        if receiver.finished() {
                            receivers.remove(&msg.original_id);
                        }
                    }
                    None => {
                        debug!(
                            target: "lumen_node::p2p::server",
                            "[SESSION] unsolicited block response {} from {}",
                            msg.original_id,
                            self.session.peer_id.short()
                        );
                        drop(receivers);
                        return self.auditor.add_penalty(penalty_for(BlameKind::Format));
                    }
                }
            }
            Subprotocol::GET_BLOCKS_REQUEST => {
                // this node does not serve block bodies yet
                let resp = GetBlocksResponse {
                    status: ResultStatus::NotFound,
                    blocks: Vec::new(),
                    has_next: false,
                };
                if let Ok(payload) = encode_payload(&resp) {
                    self.session.send_message(Message::reply_to(
                        msg,
                        Subprotocol::GET_BLOCKS_RESPONSE,
                        payload,
                    ));
                }
            }
            Subprotocol::NEW_BLOCK_NOTICE | Subprotocol::STATUS => {
                debug!(
                    target: "lumen_node::p2p::server",
                    "[SESSION] ignoring {} from {}",
                    msg.subprotocol,
                    self.session.peer_id.short()
                );
            }
            other => {
                debug!(
                    target: "lumen_node::p2p::server",
                    "[SESSION] unknown subprotocol {} from {}",
                    other,
                    self.session.peer_id.short()
                );
                return self.auditor.add_penalty(penalty_for(BlameKind::Format));
            }
        }
        true
    }
}

pub struct PeerServer {
    conf: NetworkConfig,
    local_status: Status,
    blacklist: Arc<dyn BlacklistManager>,
    actor: ActorHandle,
    peers: Mutex<HashMap<PeerId, Arc<ActivePeer>>>,
}

impl PeerServer {
    pub fn new(
        conf: NetworkConfig,
        local_status: Status,
        blacklist: Arc<dyn BlacklistManager>,
        actor: ActorHandle,
    ) -> Arc<Self> {
        Arc::new(PeerServer {
            conf,
            local_status,
            blacklist,
            actor,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Accept loop; runs until the listener socket fails.
    pub async fn listen(self: &Arc<Self>) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.conf.listen_addr).await?;
        info!(
            target: "lumen_node::p2p::server",
            "[SERVER] listening on {}", self.conf.listen_addr
        );
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                let ip = addr.ip().to_string();
                let (rd, wr) = tokio::io::split(stream);
                if let Err(err) = server.accept_session(rd, wr, ip.clone()).await {
                    debug!(
                        target: "lumen_node::p2p::server",
                        "[SERVER] inbound session from {} failed: {}", ip, err
                    );
                }
            });
        }
    }

    /// Dial a remote peer and establish an outbound session.
    pub async fn connect(self: &Arc<Self>, addr: &str) -> Result<PeerId, ServerError> {
        let stream = TcpStream::connect(addr).await?;
        let ip = stream.peer_addr()?.ip().to_string();
        let (rd, wr) = tokio::io::split(stream);
        self.dial_session(rd, wr, ip).await
    }

    /// Inbound admission: refuse banned addresses before any handshake
    /// bytes, then handshake under a timeout, then re-check the identity
    /// the peer proved.
    pub async fn accept_session<R, W>(
        self: &Arc<Self>,
        rd: R,
        wr: W,
        ip: String,
    ) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (banned, until) = self.blacklist.is_banned_addr(&ip);
        if banned {
            refuse(wr, "address is banned").await;
            return Err(ServerError::Banned { until });
        }

        let cancel = CancelToken::new();
        let mut hs = Handshaker::new(self.local_status.clone(), PeerId([0u8; 32]), rd, wr);
        let remote = match tokio::time::timeout(
            self.conf.handshake_timeout(),
            hs.inbound(&cancel),
        )
        .await
        {
            Ok(Ok(remote)) => remote,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                cancel.cancel();
                return Err(ServerError::HandshakeTimeout);
            }
        };

        let (reader, mut writer) = hs.into_parts();
        let (banned, until) = self.blacklist.is_banned_peer(remote.sender.peer_id);
        if banned {
            let notice = GoAwayNotice {
                message: "peer is banned".to_string(),
            };
            if let Ok(payload) = encode_payload(&notice) {
                let _ = writer
                    .write_message(&Message::new(Subprotocol::GO_AWAY, payload))
                    .await;
            }
            return Err(ServerError::Banned { until });
        }

        self.start_session(reader, writer, remote, ip);
        Ok(())
    }

    /// Outbound counterpart of [`accept_session`](Self::accept_session).
    pub async fn dial_session<R, W>(
        self: &Arc<Self>,
        rd: R,
        wr: W,
        ip: String,
    ) -> Result<PeerId, ServerError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (banned, until) = self.blacklist.is_banned_addr(&ip);
        if banned {
            return Err(ServerError::Banned { until });
        }

        let cancel = CancelToken::new();
        let mut hs = Handshaker::new(self.local_status.clone(), PeerId([0u8; 32]), rd, wr);
        let remote = match tokio::time::timeout(
            self.conf.handshake_timeout(),
            hs.outbound(&cancel),
        )
        .await
        {
            Ok(Ok(remote)) => remote,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                cancel.cancel();
                return Err(ServerError::HandshakeTimeout);
            }
        };

        let peer_id = remote.sender.peer_id;
        let (banned, until) = self.blacklist.is_banned_peer(peer_id);
        if banned {
            return Err(ServerError::Banned { until });
        }

        let (reader, writer) = hs.into_parts();
        self.start_session(reader, writer, remote, ip);
        Ok(peer_id)
    }

    /// Fetch a batch of blocks from an established session. The final
    /// outcome arrives as a [`SyncEvent::BlockChunks`] on the server's
    /// upstream channel.
    pub fn request_blocks(
        &self,
        peer_id: PeerId,
        hashes: Vec<BlockHash>,
    ) -> Result<MsgId, ServerError> {
        let active = self
            .peers
            .lock()
            .get(&peer_id)
            .cloned()
            .ok_or(ServerError::UnknownPeer(peer_id))?;
        active.request_blocks(hashes)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Current audit score sum of an active session. Diagnostic only.
    pub fn audit_score(&self, peer_id: PeerId) -> Option<f64> {
        let active = self.peers.lock().get(&peer_id).cloned()?;
        Some(active.auditor.score_sum())
    }

    fn start_session<R, W>(
        self: &Arc<Self>,
        reader: WireReader<R>,
        writer: WireWriter<W>,
        remote: Status,
        ip: String,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let peer_id = remote.sender.peer_id;
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let session = Arc::new(PeerSession {
            peer_id,
            address: ip.clone(),
            out_tx,
            reserved: Mutex::new(HashSet::new()),
        });
        let shutdown = Arc::new(Notify::new());
        let auditor = self.blacklist.new_peer_auditor(
            &ip,
            peer_id,
            Arc::new(DisconnectOnExceed {
                shutdown: shutdown.clone(),
            }),
        );
        let (internal, mut internal_rx) = ActorHandle::channel();
        let active = Arc::new(ActivePeer {
            session,
            auditor: auditor.clone(),
            receivers: Mutex::new(HashMap::new()),
            shutdown: shutdown.clone(),
            actor: internal,
            block_fetch_ttl: self.conf.block_fetch_ttl(),
        });

        // one live session per identity; the newer connection wins
        if let Some(prev) = self.peers.lock().insert(peer_id, active.clone()) {
            debug!(
                target: "lumen_node::p2p::server",
                "[SERVER] replacing existing session for {}", peer_id.short()
            );
            prev.shutdown.notify_one();
        }

        // forwarding task: penalize chunk faults, then relay upstream
        let upstream = self.actor.clone();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                while let Some(event) = internal_rx.recv().await {
                    let SyncEvent::BlockChunks { result, .. } = &event;
                    if let Err(err) = result {
                        if !auditor.add_penalty(penalty_for(err.blame())) {
                            shutdown.notify_one();
                        }
                    }
                    upstream.tell(event);
                }
            });
        }

        // writer task
        let mut writer = writer;
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(err) = writer.write_message(&msg).await {
                    debug!(
                        target: "lumen_node::p2p::server",
                        "[SESSION] write failed, closing: {}", err
                    );
                    break;
                }
            }
        });

        // reader task, owns all dispatch
        let server = self.clone();
        let mut reader = reader;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!(
                            target: "lumen_node::p2p::server",
                            "[SESSION] shutdown signalled for {}", peer_id.short()
                        );
                        break;
                    }
                    read = reader.read_message() => match read {
                        Ok(msg) => {
                            if !active.handle_message(&msg) {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(
                                target: "lumen_node::p2p::server",
                                "[SESSION] read from {} failed: {}", peer_id.short(), err
                            );
                            break;
                        }
                    }
                }
            }
            server.drop_peer(peer_id, &active);
        });

        info!(
            target: "lumen_node::p2p::server",
            "[SERVER] session established with {} at {}:{} (height {})",
            peer_id.short(),
            remote.sender.address,
            remote.sender.port,
            remote.best_height
        );
    }

    fn drop_peer(&self, peer_id: PeerId, active: &Arc<ActivePeer>) {
        let mut peers = self.peers.lock();
        // only remove our own entry; a replacement session may already be in
        if let Some(current) = peers.get(&peer_id) {
            if Arc::ptr_eq(current, active) {
                peers.remove(&peer_id);
                info!(
                    target: "lumen_node::p2p::server",
                    "[SERVER] session with {} closed ({} requests still reserved)",
                    peer_id.short(),
                    active.session.reserved_requests()
                );
            }
        }
    }

    pub fn chain_id(&self) -> &ChainId {
        &self.local_status.chain_id
    }
}

async fn refuse<W: AsyncWrite + Unpin>(wr: W, reason: &str) {
    let mut writer = WireWriter::new(wr);
    let notice = GoAwayNotice {
        message: reason.to_string(),
    };
    if let Ok(payload) = encode_payload(&notice) {
        let _ = writer
            .write_message(&Message::new(Subprotocol::GO_AWAY, payload))
            .await;
    }
}
