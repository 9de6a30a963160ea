//! Process-wide blacklist registry
//!
//! Keeps ban status per remote address and per peer identity, persists it
//! across restarts, and hands out per-session peer auditors whose exceed
//! notifications feed back into the ban score. Constructed once per node;
//! an audit-disabled configuration swaps in a no-op variant behind the same
//! trait so call sites never change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::AuditConfig;
use crate::p2p::audit::auditor::{DefaultAuditor, ExceedListener, NoopAuditor, PeerAuditor};
use crate::p2p::audit::banstatus::{BanEvent, BanStatus};
use crate::p2p::audit::decay::{default_decay_cache, DecayCache};
use crate::p2p::audit::DEFAULT_PEER_EXCEED_THRESHOLD;
use crate::p2p::message::PeerId;

pub const BLACKLIST_FILE: &str = "blacklist.json";
const TEMP_FILE_SUFFIX: &str = ".tmp";

const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_PRUNE_TTL_DAYS: i64 = 730;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ban status not found")]
pub struct NotFoundError;

/// Registry of ban state consulted at connection-admission time.
pub trait BlacklistManager: Send + Sync {
    /// Load persisted state and launch the periodic pruning task.
    fn start(&self);
    /// Stop the pruning task and persist current state.
    fn stop(&self);

    /// Build an auditor for a new peer session. On exceed, the returned
    /// auditor first feeds the ban registry, then forwards to `listener`.
    fn new_peer_auditor(
        &self,
        address: &str,
        peer_id: PeerId,
        listener: Arc<dyn ExceedListener>,
    ) -> Arc<dyn PeerAuditor>;

    /// Record one ban event against the address and/or identity (each only
    /// if non-empty), escalating their ban durations.
    fn add_ban_score(&self, addr: &str, peer_id: Option<PeerId>, why: &str);

    fn is_banned(&self, addr: &str, peer_id: Option<PeerId>) -> (bool, Option<DateTime<Utc>>);
    fn is_banned_addr(&self, addr: &str) -> (bool, Option<DateTime<Utc>>);
    fn is_banned_peer(&self, peer_id: PeerId) -> (bool, Option<DateTime<Utc>>);

    fn get_status_by_id(&self, peer_id: PeerId) -> Result<BanStatus, NotFoundError>;
    fn get_status_by_addr(&self, addr: &str) -> Result<BanStatus, NotFoundError>;

    /// Human-readable dump of current ban scores for diagnostics.
    fn summary(&self) -> serde_json::Value;
}

/// Construct the configured variant: the real registry, or the no-op one
/// when auditing is disabled.
pub fn new_blacklist_manager(
    conf: &AuditConfig,
    auth_dir: impl Into<PathBuf>,
) -> Arc<dyn BlacklistManager> {
    if !conf.enable_audit {
        return Arc::new(NoopBlacklistManager);
    }
    Arc::new(DefaultBlacklistManager::new(conf, auth_dir))
}

struct Registry {
    addr_map: HashMap<String, BanStatus>,
    id_map: HashMap<PeerId, BanStatus>,
}

/// State shared with the prune task and exceed-listener wrappers.
struct Shared {
    registry: RwLock<Registry>,
}

impl Shared {
    fn add_ban_score(&self, addr: &str, peer_id: Option<PeerId>, why: &str) {
        let now = Utc::now();
        let event = BanEvent {
            when: now,
            why: why.to_string(),
        };
        let mut registry = self.registry.write();
        if !addr.is_empty() {
            let status = registry
                .addr_map
                .entry(addr.to_string())
                .or_insert_with(|| BanStatus::new(addr));
            status.add_event(event.clone());
        }
        if let Some(pid) = peer_id {
            let status = registry
                .id_map
                .entry(pid)
                .or_insert_with(|| BanStatus::new(pid.to_string()));
            status.add_event(event);
        }
    }

    fn prune_old_events(&self, ttl_days: i64) {
        let cutoff = Utc::now() - chrono::Duration::days(ttl_days);
        let mut registry = self.registry.write();
        // pruning skips records still banned as of the cutoff
        for status in registry.addr_map.values_mut() {
            if !status.banned(cutoff) {
                status.prune_old_events(cutoff);
            }
        }
        for status in registry.id_map.values_mut() {
            if !status.banned(cutoff) {
                status.prune_old_events(cutoff);
            }
        }
    }
}

pub struct DefaultBlacklistManager {
    shared: Arc<Shared>,
    auth_dir: PathBuf,
    decay_cache: Arc<DecayCache>,
    runtime_audit: bool,
    prune_interval: Duration,
    prune_ttl_days: i64,
    stop_tx: watch::Sender<bool>,
}

impl DefaultBlacklistManager {
    pub fn new(conf: &AuditConfig, auth_dir: impl Into<PathBuf>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let prune_interval = if conf.prune_interval_secs > 0 {
            Duration::from_secs(conf.prune_interval_secs)
        } else {
            DEFAULT_PRUNE_INTERVAL
        };
        let prune_ttl_days = if conf.prune_ttl_days > 0 {
            conf.prune_ttl_days
        } else {
            DEFAULT_PRUNE_TTL_DAYS
        };
        DefaultBlacklistManager {
            shared: Arc::new(Shared {
                registry: RwLock::new(Registry {
                    addr_map: HashMap::new(),
                    id_map: HashMap::new(),
                }),
            }),
            auth_dir: auth_dir.into(),
            decay_cache: default_decay_cache(),
            runtime_audit: conf.runtime_audit,
            prune_interval,
            prune_ttl_days,
            stop_tx,
        }
    }

    fn blacklist_path(&self) -> PathBuf {
        self.auth_dir.join(BLACKLIST_FILE)
    }

    fn load_blacklist_file(&self, path: &Path) {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(
                    target: "lumen_node::p2p::audit",
                    "[BLACKLIST] no persisted blacklist at {}: {}",
                    path.display(),
                    err
                );
                return;
            }
        };
        let snapshot: BlacklistSnapshot = match serde_json::from_slice(&raw) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(
                    target: "lumen_node::p2p::audit",
                    "[BLACKLIST] failed to decode blacklist file {}: {}",
                    path.display(),
                    err
                );
                return;
            }
        };

        let mut registry = self.shared.registry.write();
        registry.addr_map = HashMap::with_capacity(snapshot.addrs.len());
        registry.id_map = HashMap::with_capacity(snapshot.ids.len());
        for info in snapshot.addrs {
            let events = info
                .events
                .into_iter()
                .map(|e| BanEvent {
                    when: e.when,
                    why: e.why,
                })
                .collect();
            let status =
                BanStatus::from_parts(info.addr.clone(), info.ban_score, info.ban_until, events);
            registry.addr_map.insert(info.addr, status);
        }
        for info in snapshot.ids {
            let pid = match PeerId::from_str(&info.id) {
                Ok(pid) => pid,
                Err(err) => {
                    warn!(
                        target: "lumen_node::p2p::audit",
                        "[BLACKLIST] skipping undecodable peer id {:?}: {}",
                        info.id,
                        err
                    );
                    continue;
                }
            };
            let events = info
                .events
                .into_iter()
                .map(|e| BanEvent {
                    when: e.when,
                    why: e.why,
                })
                .collect();
            let status =
                BanStatus::from_parts(info.id, info.ban_score, info.ban_until, events);
            registry.id_map.insert(pid, status);
        }
        info!(
            target: "lumen_node::p2p::audit",
            "[BLACKLIST] loaded {} addresses and {} identities (saved {})",
            registry.addr_map.len(),
            registry.id_map.len(),
            snapshot.save_time
        );
    }

    fn save_blacklist_file(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(
                    target: "lumen_node::p2p::audit",
                    "[BLACKLIST] failed to create auth directory {}: {}",
                    parent.display(),
                    err
                );
            }
        }
        let snapshot = {
            let registry = self.shared.registry.read();
            snapshot_of(&registry)
        };
        let encoded = match serde_json::to_vec_pretty(&snapshot) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(
                    target: "lumen_node::p2p::audit",
                    "[BLACKLIST] failed to encode blacklist: {}", err
                );
                return;
            }
        };
        // write-to-temp-then-rename keeps the snapshot atomic
        let tmp_path = path.with_extension(format!("json{TEMP_FILE_SUFFIX}"));
        if let Err(err) = std::fs::write(&tmp_path, &encoded) {
            warn!(
                target: "lumen_node::p2p::audit",
                "[BLACKLIST] failed to write temporary blacklist file {}: {}",
                tmp_path.display(),
                err
            );
            return;
        }
        if let Err(err) = std::fs::rename(&tmp_path, path) {
            warn!(
                target: "lumen_node::p2p::audit",
                "[BLACKLIST] failed to replace blacklist file {}: {}",
                path.display(),
                err
            );
        }
    }
}

impl BlacklistManager for DefaultBlacklistManager {
    fn start(&self) {
        debug!(target: "lumen_node::p2p::audit", "[BLACKLIST] starting up blacklist manager");
        self.load_blacklist_file(&self.blacklist_path());

        let shared = self.shared.clone();
        let interval = self.prune_interval;
        let ttl_days = self.prune_ttl_days;
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        shared.prune_old_events(ttl_days);
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(target: "lumen_node::p2p::audit", "[BLACKLIST] prune task stopped");
        });
    }

    fn stop(&self) {
        debug!(target: "lumen_node::p2p::audit", "[BLACKLIST] stopping blacklist manager");
        let _ = self.stop_tx.send(true);
        self.save_blacklist_file(&self.blacklist_path());
    }

    fn new_peer_auditor(
        &self,
        address: &str,
        peer_id: PeerId,
        listener: Arc<dyn ExceedListener>,
    ) -> Arc<dyn PeerAuditor> {
        if !self.runtime_audit {
            return Arc::new(NoopAuditor::new(peer_id, address.to_string()));
        }
        let wrapped = Arc::new(ListenWrapper {
            shared: self.shared.clone(),
            inner: listener,
        });
        Arc::new(DefaultAuditor::new(
            peer_id,
            address.to_string(),
            DEFAULT_PEER_EXCEED_THRESHOLD,
            &self.decay_cache,
            wrapped,
        ))
    }

    fn add_ban_score(&self, addr: &str, peer_id: Option<PeerId>, why: &str) {
        info!(
            target: "lumen_node::p2p::audit",
            "[BLACKLIST] ban event for addr={:?} peer={:?}: {}",
            addr,
            peer_id.map(|p| p.short()),
            why
        );
        self.shared.add_ban_score(addr, peer_id, why);
    }

    fn is_banned(&self, addr: &str, peer_id: Option<PeerId>) -> (bool, Option<DateTime<Utc>>) {
        let (banned, until) = self.is_banned_addr(addr);
        if banned {
            return (banned, until);
        }
        match peer_id {
            Some(pid) => self.is_banned_peer(pid),
            None => (false, None),
        }
    }

    fn is_banned_addr(&self, addr: &str) -> (bool, Option<DateTime<Utc>>) {
        if addr.is_empty() {
            return (false, None);
        }
        let registry = self.shared.registry.read();
        match registry.addr_map.get(addr) {
            Some(status) if status.banned(Utc::now()) => (true, status.ban_until()),
            _ => (false, None),
        }
    }

    fn is_banned_peer(&self, peer_id: PeerId) -> (bool, Option<DateTime<Utc>>) {
        let registry = self.shared.registry.read();
        match registry.id_map.get(&peer_id) {
            Some(status) if status.banned(Utc::now()) => (true, status.ban_until()),
            _ => (false, None),
        }
    }

    fn get_status_by_id(&self, peer_id: PeerId) -> Result<BanStatus, NotFoundError> {
        let registry = self.shared.registry.read();
        registry.id_map.get(&peer_id).cloned().ok_or(NotFoundError)
    }

    fn get_status_by_addr(&self, addr: &str) -> Result<BanStatus, NotFoundError> {
        let registry = self.shared.registry.read();
        registry.addr_map.get(addr).cloned().ok_or(NotFoundError)
    }

    fn summary(&self) -> serde_json::Value {
        let registry = self.shared.registry.read();
        let mut id_ban = serde_json::Map::new();
        let mut addr_ban = serde_json::Map::new();
        for status in registry.id_map.values() {
            id_ban.insert(status.id().to_string(), summary_line(status));
        }
        for status in registry.addr_map.values() {
            addr_ban.insert(status.id().to_string(), summary_line(status));
        }
        json!({ "bannedID": id_ban, "bannedAddr": addr_ban })
    }
}

fn summary_line(status: &BanStatus) -> serde_json::Value {
    let until = match status.ban_until() {
        Some(until) => until.to_rfc3339(),
        None => "never".to_string(),
    };
    json!(format!("score:{:4}, till {}", status.ban_score(), until))
}

/// Exceed listener that feeds the ban registry before forwarding to the
/// session's own listener. The registry write happens off the caller's
/// thread, as the caller may be deep inside connection handling.
struct ListenWrapper {
    shared: Arc<Shared>,
    inner: Arc<dyn ExceedListener>,
}

impl ExceedListener for ListenWrapper {
    fn on_exceed(&self, auditor: &dyn PeerAuditor, cause: &str) {
        let shared = self.shared.clone();
        let addr = auditor.ip_address().to_string();
        let peer_id = auditor.peer_id();
        let why = cause.to_string();
        std::thread::spawn(move || {
            shared.add_ban_score(&addr, Some(peer_id), &why);
        });
        self.inner.on_exceed(auditor, cause);
    }
}

/// Audit-disabled variant: nobody is ever banned and auditors never reject.
pub struct NoopBlacklistManager;

impl BlacklistManager for NoopBlacklistManager {
    fn start(&self) {}

    fn stop(&self) {}

    fn new_peer_auditor(
        &self,
        address: &str,
        peer_id: PeerId,
        _listener: Arc<dyn ExceedListener>,
    ) -> Arc<dyn PeerAuditor> {
        Arc::new(NoopAuditor::new(peer_id, address.to_string()))
    }

    fn add_ban_score(&self, _addr: &str, _peer_id: Option<PeerId>, _why: &str) {}

    fn is_banned(&self, _addr: &str, _peer_id: Option<PeerId>) -> (bool, Option<DateTime<Utc>>) {
        (false, None)
    }

    fn is_banned_addr(&self, _addr: &str) -> (bool, Option<DateTime<Utc>>) {
        (false, None)
    }

    fn is_banned_peer(&self, _peer_id: PeerId) -> (bool, Option<DateTime<Utc>>) {
        (false, None)
    }

    fn get_status_by_id(&self, _peer_id: PeerId) -> Result<BanStatus, NotFoundError> {
        Err(NotFoundError)
    }

    fn get_status_by_addr(&self, _addr: &str) -> Result<BanStatus, NotFoundError> {
        Err(NotFoundError)
    }

    fn summary(&self) -> serde_json::Value {
        json!({ "bannedID": {}, "bannedAddr": {} })
    }
}

// ---------------------------------------------------------------------------
// Persistence schema
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlacklistSnapshot {
    save_time: DateTime<Utc>,
    addrs: Vec<AddrBanInfo>,
    ids: Vec<IdBanInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddrBanInfo {
    addr: String,
    ban_score: u32,
    ban_until: Option<DateTime<Utc>>,
    events: Vec<EventInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdBanInfo {
    id: String,
    ban_score: u32,
    ban_until: Option<DateTime<Utc>>,
    events: Vec<EventInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EventInfo {
    when: DateTime<Utc>,
    why: String,
}

fn snapshot_of(registry: &Registry) -> BlacklistSnapshot {
    let addrs = registry
        .addr_map
        .iter()
        .map(|(addr, status)| AddrBanInfo {
            addr: addr.clone(),
            ban_score: status.ban_score(),
            ban_until: status.ban_until(),
            events: event_infos(status),
        })
        .collect();
    let ids = registry
        .id_map
        .iter()
        .map(|(pid, status)| IdBanInfo {
            id: pid.to_string(),
            ban_score: status.ban_score(),
            ban_until: status.ban_until(),
            events: event_infos(status),
        })
        .collect();
    BlacklistSnapshot {
        save_time: Utc::now(),
        addrs,
        ids,
    }
}

fn event_infos(status: &BanStatus) -> Vec<EventInfo> {
    status
        .events()
        .iter()
        .map(|ev| EventInfo {
            when: ev.when,
            why: ev.why.clone(),
        })
        .collect()
}
