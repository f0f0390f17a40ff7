//! The node: one explicit instance holding every shared piece of state.
//!
//! Built once by the entry point and handed around as `Arc<Node>`. Owns the
//! peer registry, the dedup tunnel, the seen-set and the scheduler's inbox,
//! and holds the collaborators behind their traits. Every long-lived task
//! it starts is tracked, so [`Node::shutdown`] can drain before closing.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use bitsflow_core::config::{BitsflowConfig, Mode};
use bitsflow_core::hash::{is_hex_address, normalize};
use bitsflow_core::wire::{PeerInfo, PROTOCOL_NAME, PROTOCOL_VERSION};

use crate::collaborator::{Ledger, Swarm, TorrentListing};
use crate::error::{FsError, Result};
use crate::registry::{PeerRegistry, PeerSummary};
use crate::scheduler::{Fetch, NeedEvent, Scheduler};
use crate::seen::SeenSet;
use crate::session;
use crate::status::ArtifactStatus;
use crate::tunnel::DedupTunnel;

/// Size requested for seed-list and tunnel fetches.
pub const WHOLE_ARTIFACT: u64 = 1024 * 1024 * 1024;

/// Metadata a node publishes about itself.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub protocol: String,
    pub version: u32,
    pub node_id: String,
    pub dht: bool,
    pub tcp: bool,
    pub utp: bool,
    pub port: u16,
    pub root: String,
    pub files: usize,
    pub active: usize,
    pub nominee: usize,
    pub leafs: u64,
    pub number: u64,
    pub max_message_size: u32,
    pub neighbours: usize,
    pub received: u64,
    pub sent: u64,
    pub peers_in: u64,
    pub peers_out: u64,
    pub pending: usize,
    pub tunnel: usize,
    pub worm: Vec<String>,
}

pub struct Node {
    pub(crate) config: BitsflowConfig,
    node_id: String,
    pub(crate) swarm: Arc<dyn Swarm>,
    pub(crate) ledger: Arc<dyn Ledger>,
    pub(crate) registry: Arc<PeerRegistry>,
    pub(crate) tunnel: DedupTunnel,
    pub(crate) seen: SeenSet,
    good: HashSet<String>,
    need_tx: mpsc::Sender<NeedEvent>,
    pending: Arc<AtomicUsize>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: TaskTracker,
    stopping: AtomicBool,
    teardown: OnceCell<()>,
    pub(crate) sent: Arc<AtomicU64>,
    received: AtomicU64,
    transport_peers: OnceLock<Arc<AtomicUsize>>,
}

impl Node {
    /// Build the node, start the scheduler and queue the seed list.
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: BitsflowConfig,
        swarm: Arc<dyn Swarm>,
        ledger: Arc<dyn Ledger>,
    ) -> Arc<Self> {
        let (need_tx, need_rx) = mpsc::channel(config.scheduler.need_queue.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let good = config
            .scheduler
            .good_hashes
            .iter()
            .filter(|h| is_hex_address(h))
            .map(|h| normalize(h))
            .collect();

        let node = Arc::new(Self {
            node_id: config.identity.resolve_node_id(),
            tunnel: DedupTunnel::new(config.scheduler.tunnel_ttl()),
            swarm,
            ledger,
            registry: Arc::new(PeerRegistry::new()),
            seen: SeenSet::new(),
            good,
            need_tx,
            pending: pending.clone(),
            shutdown: shutdown.clone(),
            tasks: TaskTracker::new(),
            stopping: AtomicBool::new(false),
            teardown: OnceCell::new(),
            sent: Arc::new(AtomicU64::new(0)),
            received: AtomicU64::new(0),
            transport_peers: OnceLock::new(),
            config,
        });

        let scheduler = Scheduler::new(&node.config.scheduler, need_rx, pending, shutdown);
        node.tasks.spawn(scheduler.run(node.clone()));
        node.queue_seed_list();

        tracing::info!(
            node_id = %node.node_id,
            mode = ?node.config.scheduler.mode,
            good = node.good.len(),
            "node started"
        );
        node
    }

    /// When the ledger has not reached the checkpoint, fetch the configured
    /// seed artifacts whole.
    fn queue_seed_list(&self) {
        let scheduler = &self.config.scheduler;
        if scheduler.mode == Mode::Lazy || scheduler.seed_hashes.is_empty() {
            return;
        }
        if self.ledger.get_root(scheduler.checkpoint_block).is_some() {
            tracing::debug!(block = scheduler.checkpoint_block, "checkpoint present, seed list skipped");
            return;
        }

        let seeds: Vec<String> = scheduler
            .seed_hashes
            .iter()
            .filter(|h| is_hex_address(h))
            .map(|h| normalize(h))
            .collect();
        tracing::info!(count = seeds.len(), "queueing seed list");

        let tx = self.need_tx.clone();
        let cancel = self.shutdown.clone();
        self.tasks.spawn(async move {
            for hash in seeds {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(NeedEvent::new(hash, WHOLE_ARTIFACT)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &BitsflowConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn tunnel(&self) -> &DedupTunnel {
        &self.tunnel
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    /// Deferred needs waiting for a fast tick.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Token cancelled once shutdown begins. Transports select on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Let the transport report its own peer count.
    pub fn set_transport_peer_counter(&self, counter: Arc<AtomicUsize>) {
        if self.transport_peers.set(counter).is_err() {
            tracing::warn!("transport peer counter already set");
        }
    }

    /// Live neighbour count.
    pub fn neighbors(&self) -> usize {
        match self.transport_peers.get() {
            Some(counter) => counter.load(Ordering::Relaxed),
            None => self.registry.len(),
        }
    }

    pub(crate) fn count_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Run a peer session on `stream` as a tracked task. Returns false after
    /// shutdown has begun, in which case the stream is dropped.
    pub fn spawn_peer<S>(self: &Arc<Self>, id: impl Into<String>, stream: S) -> bool
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.is_shut_down() {
            return false;
        }
        let id = id.into();
        let node = self.clone();
        self.tasks.spawn(async move {
            match session::handle_peer(node, id.clone(), stream).await {
                Ok(()) => tracing::debug!(peer = %id, "session closed"),
                Err(e) if e.is_protocol() => {
                    tracing::warn!(peer = %id, error = %e, "session terminated")
                }
                Err(e) => tracing::debug!(peer = %id, error = %e, "session ended"),
            }
        });
        true
    }

    /// What this node tells its neighbours.
    pub fn local_info(&self) -> PeerInfo {
        PeerInfo {
            listen: self.swarm.local_port(),
            root: self.ledger.root(),
            files: self.swarm.congress() as u64,
            leafs: self.ledger.blocks(),
        }
    }

    pub fn node_info(&self) -> NodeInfo {
        let network = &self.config.network;
        NodeInfo {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION,
            node_id: self.node_id.clone(),
            dht: !network.disable_dht,
            tcp: !network.disable_tcp,
            utp: !network.disable_utp,
            port: self.swarm.local_port(),
            root: self.ledger.root(),
            files: self.swarm.congress(),
            active: self.swarm.candidate(),
            nominee: self.swarm.nominee(),
            leafs: self.ledger.blocks(),
            number: self.ledger.current_number(),
            max_message_size: network.max_message_size,
            neighbours: self.neighbors(),
            received: self.received.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            peers_in: self.registry.joined(),
            peers_out: self.registry.left(),
            pending: self.pending(),
            tunnel: self.tunnel.len(),
            worm: self.seen.snapshot(),
        }
    }

    pub fn peer_info(&self, id: &str) -> Option<PeerSummary> {
        self.registry.get(id).map(|p| p.summary())
    }

    pub fn peers(&self) -> Vec<PeerSummary> {
        let mut out: Vec<PeerSummary> = self.registry.snapshot().iter().map(|p| p.summary()).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn is_good(&self, hash: &str) -> bool {
        self.good.contains(hash)
    }

    /// Raise a need without waiting. Used from peer loops, which must not
    /// block on the scheduler.
    pub fn wakeup(&self, hash: &str, request: u64) -> bool {
        match self.need_tx.try_send(NeedEvent::new(hash, request)) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                tracing::warn!(hash = %ev.hash, "need queue full, wake-up dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Hand a need to the scheduler, waiting for room in its inbox.
    pub async fn download(&self, hash: &str, request: u64) -> Result<()> {
        if !is_hex_address(hash) {
            return Err(bitsflow_core::hash::InvalidHash(hash.to_string()).into());
        }
        let event = NeedEvent::new(normalize(hash), request);
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(FsError::Closed),
            sent = self.need_tx.send(event) => sent.map_err(|_| FsError::Closed),
        }
    }

    pub fn status(&self, hash: &str) -> ArtifactStatus {
        ArtifactStatus::probe(self.swarm.as_ref(), &normalize(hash))
    }

    pub fn list_all_torrents(&self) -> BTreeMap<String, TorrentListing> {
        self.swarm.list_all_torrents()
    }

    pub fn pause_local_seed(&self, hash: &str) -> Result<()> {
        Ok(self.swarm.pause_local_seed_file(&normalize(hash))?)
    }

    pub fn resume_local_seed(&self, hash: &str) -> Result<()> {
        Ok(self.swarm.resume_local_seed_file(&normalize(hash))?)
    }

    /// Stop everything and release shared resources.
    ///
    /// The first call cancels every loop. Every call waits for tracked tasks
    /// to finish and for the collaborators to be closed and the tunnel
    /// drained, which happens exactly once.
    pub async fn shutdown(&self) {
        if !self.stopping.swap(true, Ordering::AcqRel) {
            tracing::info!(peers = self.registry.len(), "shutting down");
            self.shutdown.cancel();
            self.tasks.close();
        }

        self.tasks.wait().await;

        self.teardown
            .get_or_init(|| async {
                if let Err(e) = self.swarm.close() {
                    tracing::warn!(error = %e, "swarm close failed");
                }
                if let Err(e) = self.ledger.close() {
                    tracing::warn!(error = %e, "ledger close failed");
                }
                let drained = self.tunnel.drain();
                tracing::info!(drained, "shutdown complete");
            })
            .await;
    }
}

#[async_trait]
impl Fetch for Node {
    fn is_good(&self, hash: &str) -> bool {
        Node::is_good(self, hash)
    }

    async fn fetch(&self, hash: &str, request: u64) -> Result<()> {
        Node::fetch(self, hash, request).await
    }
}

/// Construct-once holder for the process's node.
#[derive(Default)]
pub struct NodeSlot {
    inner: OnceLock<Arc<Node>>,
}

impl NodeSlot {
    pub const fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Start a node, or return the one already started. The arguments are
    /// ignored on the second call.
    pub fn get_or_start(
        &self,
        config: BitsflowConfig,
        swarm: Arc<dyn Swarm>,
        ledger: Arc<dyn Ledger>,
    ) -> Arc<Node> {
        self.inner
            .get_or_init(|| Node::start(config, swarm, ledger))
            .clone()
    }

    pub fn get(&self) -> Option<Arc<Node>> {
        self.inner.get().cloned()
    }
}
