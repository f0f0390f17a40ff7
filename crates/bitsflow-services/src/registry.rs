//! Peer registry: who is connected right now.
//!
//! One read/write lock guards the map. Registration hands back a
//! [`PeerGuard`]; dropping the guard unregisters the peer, so every exit path
//! of a session undoes its registration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use bitsflow_core::wire::{Frame, PeerInfo};

use crate::error::FsError;

/// A connected peer as seen by the rest of the node.
#[derive(Debug)]
pub struct Peer {
    id: String,
    version: AtomicU32,
    node_id: RwLock<String>,
    info: RwLock<Option<PeerInfo>>,
    outbound: mpsc::Sender<Frame>,
    connected_at: Instant,
}

/// Serializable view of a peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSummary {
    pub id: String,
    pub node_id: String,
    pub version: u32,
    pub listen: u16,
    pub root: String,
    pub files: u64,
    pub leafs: u64,
    pub connected_secs: u64,
}

impl Peer {
    pub fn new(id: impl Into<String>, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            id: id.into(),
            version: AtomicU32::new(0),
            node_id: RwLock::new(String::new()),
            info: RwLock::new(None),
            outbound,
            connected_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Negotiated protocol version. 0 until the handshake completes.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn set_version(&self, version: u32) {
        self.version.store(version, Ordering::Release);
    }

    pub fn node_id(&self) -> String {
        self.node_id.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_node_id(&self, node_id: String) {
        *self.node_id.write().unwrap_or_else(PoisonError::into_inner) = node_id;
    }

    pub fn info(&self) -> Option<PeerInfo> {
        self.info.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the cached peer info.
    pub fn set_info(&self, info: PeerInfo) {
        *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(info);
    }

    /// Queue a frame for this peer's writer. Never blocks; a full queue drops
    /// the frame.
    pub fn send(&self, frame: Frame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                tracing::warn!(peer = %self.id, code = frame.code, "outbound queue full, frame dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn summary(&self) -> PeerSummary {
        let info = self.info().unwrap_or_default();
        PeerSummary {
            id: self.id.clone(),
            node_id: self.node_id(),
            version: self.version(),
            listen: info.listen,
            root: info.root,
            files: info.files,
            leafs: info.leafs,
            connected_secs: self.connected_at.elapsed().as_secs(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    joined: AtomicU64,
    left: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Peer>>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Peer>>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a peer. A second session under the same id is refused.
    pub fn register(self: &Arc<Self>, peer: Arc<Peer>) -> Result<PeerGuard, FsError> {
        {
            let mut peers = self.write();
            if peers.contains_key(peer.id()) {
                return Err(FsError::Protocol(format!("peer {} already connected", peer.id())));
            }
            peers.insert(peer.id().to_string(), peer.clone());
        }
        self.joined.fetch_add(1, Ordering::Relaxed);
        tracing::info!(peer = %peer.id(), "peer registered");
        Ok(PeerGuard {
            registry: self.clone(),
            peer,
        })
    }

    /// Remove `peer` if it is still the registered session for its id.
    fn unregister(&self, peer: &Arc<Peer>) {
        let removed = {
            let mut peers = self.write();
            match peers.get(peer.id()) {
                Some(current) if Arc::ptr_eq(current, peer) => peers.remove(peer.id()).is_some(),
                _ => false,
            }
        };
        if removed {
            self.left.fetch_add(1, Ordering::Relaxed);
            tracing::info!(peer = %peer.id(), "peer unregistered");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Peer>> {
        self.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.read().values().cloned().collect()
    }

    /// Queue `frame` to every handshaken peer. Returns how many accepted it.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|p| p.version() > 0)
            .filter(|p| p.send(frame.clone()))
            .count()
    }

    /// Peers ever registered.
    pub fn joined(&self) -> u64 {
        self.joined.load(Ordering::Relaxed)
    }

    /// Peers ever unregistered.
    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }
}

/// Keeps a peer registered for as long as it lives.
pub struct PeerGuard {
    registry: Arc<PeerRegistry>,
    peer: Arc<Peer>,
}

impl PeerGuard {
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.peer);
    }
}
