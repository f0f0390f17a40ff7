//! Collaborator seams: the swarm engine that moves bytes and the ledger that
//! remembers what was asked for.
//!
//! Hashes crossing these traits are always in canonical form (lowercase hex,
//! no prefix).

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One row of [`Swarm::list_all_torrents`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentListing {
    /// Largest size anyone asked for.
    pub requested: u64,
    /// Bytes available locally.
    pub completed: u64,
    pub paused: bool,
    pub local_seed: bool,
}

/// The transfer engine: piece selection and chunked transfer live behind it.
#[async_trait]
pub trait Swarm: Send + Sync {
    /// Whether the artifact is present with at least `size` bytes.
    fn exists(&self, hash: &str, size: u64) -> bool;

    /// Begin or continue looking for the artifact at `size` bytes.
    /// A size of 0 means the whole artifact.
    async fn search(&self, hash: &str, size: u64) -> anyhow::Result<()>;

    /// Read `subpath` inside a stored artifact. `Ok(None)` when absent.
    async fn get_file(&self, hash: &str, subpath: &str) -> anyhow::Result<Option<Bytes>>;

    /// Mark a materialized artifact as locally seeded. Returns false if it
    /// already was.
    fn add_local_seed_file(&self, hash: &str) -> bool;
    fn pause_local_seed_file(&self, hash: &str) -> anyhow::Result<()>;
    fn resume_local_seed_file(&self, hash: &str) -> anyhow::Result<()>;

    fn is_pending(&self, hash: &str) -> bool;
    fn is_downloading(&self, hash: &str) -> bool;
    fn is_seeding(&self, hash: &str) -> bool;

    fn list_all_torrents(&self) -> BTreeMap<String, TorrentListing>;
    fn drop_torrent(&self, hash: &str) -> anyhow::Result<()>;

    fn local_port(&self) -> u16;
    /// Artifacts fully available and offered.
    fn congress(&self) -> usize;
    /// Artifacts still being fetched.
    fn candidate(&self) -> usize;
    /// Artifacts seeded from local files.
    fn nominee(&self) -> usize;

    /// Managed storage directory. Artifacts live at `<data_dir>/<hash>`.
    fn data_dir(&self) -> PathBuf;

    fn close(&self) -> anyhow::Result<()>;
}

/// Download progress and chain checkpoints.
pub trait Ledger: Send + Sync {
    /// Recorded request size, `None` if the hash was never requested.
    fn get_torrent_progress(&self, hash: &str) -> anyhow::Result<Option<u64>>;

    /// Merge a request into the ledger. Returns `(old, new)` where `new` is
    /// the size callers should fetch at; it never shrinks.
    fn set_torrent_progress(&self, hash: &str, requested: u64) -> anyhow::Result<(u64, u64)>;

    fn get_root(&self, number: u64) -> Option<String>;
    /// Root of the latest known block, empty when there is none.
    fn root(&self) -> String;
    /// Number of known blocks.
    fn blocks(&self) -> u64;
    fn current_number(&self) -> u64;

    fn close(&self) -> anyhow::Result<()>;
}
