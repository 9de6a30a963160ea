//! Lumen node core
//!
//! P2P networking for a blockchain node: framed wire codec, status
//! handshake, chunked block retrieval, and a peer audit/blacklist subsystem
//! with persistent escalating bans.

pub mod config;
pub mod p2p;
