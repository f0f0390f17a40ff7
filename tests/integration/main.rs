//! Bitsflow integration test harness.
//!
//! Tests drive a real `Node` over in-memory duplex streams. The swarm
//! collaborator is scripted so tests can set availability flags, drop files
//! in place and observe every search the node issues.
//!
//! Tests that depend on timers use `start_paused = true` and let tokio
//! auto-advance the clock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

use bitsflow_core::config::BitsflowConfig;
use bitsflow_core::wire::{codes, decode_payload, Frame, Hello, PeerInfo, PROTOCOL_VERSION};
use bitsflow_services::session::read_frame;
use bitsflow_services::{JsonLedger, Node, Swarm, TorrentListing};

mod protocol;
mod scheduling;
mod shutdown;

// ── Scripted swarm ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ScriptedSwarm {
    searches: Mutex<Vec<(String, u64)>>,
    files: Mutex<HashMap<(String, String), Bytes>>,
    present: Mutex<HashSet<String>>,
    pending: Mutex<HashSet<String>>,
    downloading: Mutex<HashSet<String>>,
    seeding: Mutex<HashSet<String>>,
    local_seeds: Mutex<HashSet<String>>,
    dropped: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

impl ScriptedSwarm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn searches(&self) -> Vec<(String, u64)> {
        self.searches.lock().unwrap().clone()
    }

    pub fn searched(&self, hash: &str) -> Vec<u64> {
        self.searches()
            .into_iter()
            .filter(|(h, _)| h == hash)
            .map(|(_, s)| s)
            .collect()
    }

    pub fn put_file(&self, hash: &str, subpath: &str, data: &[u8]) {
        self.files.lock().unwrap().insert(
            (hash.to_string(), subpath.to_string()),
            Bytes::copy_from_slice(data),
        );
    }

    /// Make `exists` answer true for `hash`.
    pub fn mark_present(&self, hash: &str) {
        self.present.lock().unwrap().insert(hash.to_string());
    }

    pub fn set_flags(&self, hash: &str, pending: bool, downloading: bool, seeding: bool) {
        for (set, on) in [
            (&self.pending, pending),
            (&self.downloading, downloading),
            (&self.seeding, seeding),
        ] {
            let mut set = set.lock().unwrap();
            if on {
                set.insert(hash.to_string());
            } else {
                set.remove(hash);
            }
        }
    }

    pub fn dropped(&self) -> Vec<String> {
        self.dropped.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Swarm for ScriptedSwarm {
    fn exists(&self, hash: &str, _size: u64) -> bool {
        self.present.lock().unwrap().contains(hash)
    }

    async fn search(&self, hash: &str, size: u64) -> Result<()> {
        self.searches.lock().unwrap().push((hash.to_string(), size));
        Ok(())
    }

    async fn get_file(&self, hash: &str, subpath: &str) -> Result<Option<Bytes>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .get(&(hash.to_string(), subpath.to_string()))
            .cloned())
    }

    fn add_local_seed_file(&self, hash: &str) -> bool {
        self.local_seeds.lock().unwrap().insert(hash.to_string())
    }

    fn pause_local_seed_file(&self, _hash: &str) -> Result<()> {
        Ok(())
    }

    fn resume_local_seed_file(&self, _hash: &str) -> Result<()> {
        Ok(())
    }

    fn is_pending(&self, hash: &str) -> bool {
        self.pending.lock().unwrap().contains(hash)
    }

    fn is_downloading(&self, hash: &str) -> bool {
        self.downloading.lock().unwrap().contains(hash)
    }

    fn is_seeding(&self, hash: &str) -> bool {
        self.seeding.lock().unwrap().contains(hash)
    }

    fn list_all_torrents(&self) -> BTreeMap<String, TorrentListing> {
        self.searches()
            .into_iter()
            .map(|(h, s)| {
                (
                    h,
                    TorrentListing {
                        requested: s,
                        ..TorrentListing::default()
                    },
                )
            })
            .collect()
    }

    fn drop_torrent(&self, hash: &str) -> Result<()> {
        self.dropped.lock().unwrap().push(hash.to_string());
        Ok(())
    }

    fn local_port(&self) -> u16 {
        40404
    }

    fn congress(&self) -> usize {
        self.seeding.lock().unwrap().len()
    }

    fn candidate(&self) -> usize {
        self.pending.lock().unwrap().len() + self.downloading.lock().unwrap().len()
    }

    fn nominee(&self) -> usize {
        self.local_seeds.lock().unwrap().len()
    }

    fn data_dir(&self) -> PathBuf {
        std::env::temp_dir()
    }

    fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Node helpers ─────────────────────────────────────────────────────────────

pub struct Harness {
    pub node: Arc<Node>,
    pub swarm: Arc<ScriptedSwarm>,
    pub ledger: Arc<JsonLedger>,
}

pub fn test_config() -> BitsflowConfig {
    let mut config = BitsflowConfig::default();
    config.identity.node_id = "test-node".into();
    config
}

pub fn start_with(config: BitsflowConfig, ledger: JsonLedger) -> Harness {
    let swarm = ScriptedSwarm::new();
    let ledger = Arc::new(ledger);
    let node = Node::start(config, swarm.clone(), ledger.clone());
    Harness {
        node,
        swarm,
        ledger,
    }
}

pub fn start_node() -> Harness {
    start_with(test_config(), JsonLedger::new())
}

/// Canonical 40-char hash built from one repeated byte.
pub fn hash(n: u8) -> String {
    format!("{:02x}", n).repeat(20)
}

/// Fresh empty directory under the system temp dir.
pub fn scratch_dir(tag: &str) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "bitsflow-it-{tag}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> Option<T> {
    tokio::time::timeout(limit, fut).await.ok()
}

// ── Peer client ──────────────────────────────────────────────────────────────

/// The far end of a peer session, driven by the test.
pub struct PeerClient {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    buf: Vec<u8>,
}

impl PeerClient {
    /// Open a session to `node` without handshaking.
    pub fn open(node: &Arc<Node>, id: &str) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        assert!(node.spawn_peer(id, server), "node refused the peer");
        let (reader, writer) = tokio::io::split(client);
        Self {
            reader,
            writer,
            buf: Vec::new(),
        }
    }

    /// Open a session and complete the handshake at `version`.
    pub async fn connect(node: &Arc<Node>, id: &str, version: u32) -> (Self, Hello) {
        let mut client = Self::open(node, id);
        let hello = Hello {
            version,
            node_id: format!("remote-{id}"),
            info: PeerInfo {
                listen: 7000,
                root: "remote-root".into(),
                files: 1,
                leafs: 2,
            },
        };
        client.send(codes::HANDSHAKE, &hello).await;
        let (code, payload) = client.recv().await.expect("server hello");
        assert_eq!(code, codes::HANDSHAKE);
        let theirs: Hello = decode_payload(&payload).unwrap();
        (client, theirs)
    }

    pub async fn connect_current(node: &Arc<Node>, id: &str) -> Self {
        Self::connect(node, id, PROTOCOL_VERSION).await.0
    }

    pub async fn send<T: Serialize>(&mut self, code: u16, value: &T) {
        let frame = Frame::encode(code, value).unwrap();
        self.send_raw(&frame.to_bytes()).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        // The server may already have hung up; tests check that separately.
        let _ = self.writer.write_all(bytes).await;
    }

    /// Next frame, or `None` on EOF or error.
    pub async fn recv(&mut self) -> Option<(u16, Vec<u8>)> {
        match read_frame(&mut self.reader, &mut self.buf, u32::MAX).await {
            Ok(Some(code)) => Some((code, std::mem::take(&mut self.buf))),
            _ => None,
        }
    }

    /// Next frame with `code`, skipping the periodic Status frames.
    pub async fn recv_code(&mut self, code: u16) -> Option<Vec<u8>> {
        loop {
            let (got, payload) = self.recv().await?;
            if got == code {
                return Some(payload);
            }
            assert_eq!(got, codes::STATUS, "unexpected frame code {got:#x}");
        }
    }

    /// True once the server closes the stream.
    pub async fn closed(&mut self) -> bool {
        loop {
            match self.recv().await {
                None => return true,
                Some((codes::STATUS, _)) => continue,
                Some((code, _)) => panic!("unexpected frame code {code:#x} while waiting for close"),
            }
        }
    }
}
