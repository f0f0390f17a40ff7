//! Filesystem-backed swarm collaborator.
//!
//! Artifacts live under the managed data directory, one entry per content
//! hash:
//!   <data_dir>/<hash>/...
//!
//! The entry is either a directory written by the seeding pipeline or a
//! symlink to the seeder's own files. This type tracks per-artifact state
//! and serves reads; it does not move bytes between peers. A transfer engine
//! drives state through [`LocalSwarm::set_state`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use memmap2::Mmap;

use bitsflow_core::hash::is_hex_address;

use crate::collaborator::{Swarm, TorrentListing};

/// Where an artifact is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TorrentState {
    /// Known, no transfer started.
    #[default]
    Pending,
    Downloading,
    /// Complete and offered to peers.
    Seeding,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    state: TorrentState,
    requested: u64,
    completed: u64,
    paused: bool,
    local_seed: bool,
}

pub struct LocalSwarm {
    root: PathBuf,
    port: u16,
    entries: DashMap<String, Entry>,
    closed: AtomicBool,
}

impl LocalSwarm {
    /// Open the managed directory, registering anything already stored there
    /// as seeding.
    pub fn new(root: impl Into<PathBuf>, port: u16) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create data dir: {}", root.display()))?;

        let swarm = Self {
            root,
            port,
            entries: DashMap::new(),
            closed: AtomicBool::new(false),
        };

        let mut restored = 0usize;
        if let Ok(dir) = fs::read_dir(&swarm.root) {
            for entry in dir.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !is_hex_address(&name) {
                    continue;
                }
                let completed = tree_size(&entry.path());
                swarm.entries.insert(
                    name,
                    Entry {
                        state: TorrentState::Seeding,
                        completed,
                        ..Entry::default()
                    },
                );
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::info!(count = restored, root = %swarm.root.display(), "restored stored artifacts");
        }
        Ok(swarm)
    }

    /// Where an artifact is (or would be) materialized.
    pub fn artifact_path(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    /// Transfer-engine hook.
    pub fn set_state(&self, hash: &str, state: TorrentState) {
        let completed = if state == TorrentState::Seeding {
            tree_size(&self.artifact_path(hash))
        } else {
            0
        };
        let mut entry = self.entries.entry(hash.to_string()).or_default();
        entry.state = state;
        if state == TorrentState::Seeding {
            entry.completed = completed;
        }
    }

    pub fn state(&self, hash: &str) -> Option<TorrentState> {
        self.entries.get(hash).map(|e| e.state)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("swarm is closed");
        }
        Ok(())
    }

    fn count(&self, pred: impl Fn(&Entry) -> bool) -> usize {
        self.entries.iter().filter(|e| pred(e.value())).count()
    }
}

#[async_trait]
impl Swarm for LocalSwarm {
    fn exists(&self, hash: &str, size: u64) -> bool {
        self.entries
            .get(hash)
            .map(|e| e.state == TorrentState::Seeding || (size > 0 && e.completed >= size))
            .unwrap_or(false)
    }

    async fn search(&self, hash: &str, size: u64) -> Result<()> {
        self.ensure_open()?;
        let on_disk = self.artifact_path(hash).exists();
        let completed = if on_disk {
            tree_size(&self.artifact_path(hash))
        } else {
            0
        };

        let mut entry = self.entries.entry(hash.to_string()).or_default();
        entry.requested = entry.requested.max(size);
        if on_disk && entry.state != TorrentState::Seeding {
            entry.state = TorrentState::Seeding;
            entry.completed = completed;
            tracing::debug!(hash, bytes = completed, "artifact found on disk");
        } else {
            tracing::trace!(hash, size, state = ?entry.state, "search");
        }
        Ok(())
    }

    async fn get_file(&self, hash: &str, subpath: &str) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        let rel = Path::new(subpath);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(anyhow!("sub-path escapes artifact directory: {subpath}"));
        }

        let path = self.artifact_path(hash).join(rel);
        if !path.is_file() {
            return Ok(None);
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open artifact file: {}", path.display()))?;
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }

        // Safety: file is opened read-only and we don't mutate the mmap
        let mmap = unsafe {
            Mmap::map(&file)
                .with_context(|| format!("failed to mmap artifact file: {}", path.display()))?
        };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    fn add_local_seed_file(&self, hash: &str) -> bool {
        let completed = tree_size(&self.artifact_path(hash));
        let mut entry = self.entries.entry(hash.to_string()).or_default();
        let fresh = !entry.local_seed;
        entry.local_seed = true;
        entry.state = TorrentState::Seeding;
        entry.completed = completed;
        fresh
    }

    fn pause_local_seed_file(&self, hash: &str) -> Result<()> {
        match self.entries.get_mut(hash) {
            Some(mut e) if e.local_seed => {
                e.paused = true;
                Ok(())
            }
            _ => Err(anyhow!("{hash} is not a local seed")),
        }
    }

    fn resume_local_seed_file(&self, hash: &str) -> Result<()> {
        match self.entries.get_mut(hash) {
            Some(mut e) if e.local_seed => {
                e.paused = false;
                Ok(())
            }
            _ => Err(anyhow!("{hash} is not a local seed")),
        }
    }

    fn is_pending(&self, hash: &str) -> bool {
        self.state(hash) == Some(TorrentState::Pending)
    }

    fn is_downloading(&self, hash: &str) -> bool {
        self.state(hash) == Some(TorrentState::Downloading)
    }

    fn is_seeding(&self, hash: &str) -> bool {
        self.state(hash) == Some(TorrentState::Seeding)
    }

    fn list_all_torrents(&self) -> BTreeMap<String, TorrentListing> {
        self.entries
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    TorrentListing {
                        requested: e.requested,
                        completed: e.completed,
                        paused: e.paused,
                        local_seed: e.local_seed,
                    },
                )
            })
            .collect()
    }

    fn drop_torrent(&self, hash: &str) -> Result<()> {
        self.entries
            .remove(hash)
            .map(|_| ())
            .ok_or_else(|| anyhow!("unknown artifact {hash}"))
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn congress(&self) -> usize {
        self.count(|e| e.state == TorrentState::Seeding)
    }

    fn candidate(&self) -> usize {
        self.count(|e| e.state != TorrentState::Seeding)
    }

    fn nominee(&self) -> usize {
        self.count(|e| e.local_seed)
    }

    fn data_dir(&self) -> PathBuf {
        self.root.clone()
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            bail!("swarm already closed");
        }
        tracing::info!(artifacts = self.entries.len(), "swarm closed");
        Ok(())
    }
}

/// Total bytes of regular files under `path`, following symlinks.
fn tree_size(path: &Path) -> u64 {
    let Ok(meta) = fs::metadata(path) else {
        return 0;
    };
    if meta.is_file() {
        return meta.len();
    }
    let mut total = 0u64;
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            total += tree_size(&entry.path());
        }
    }
    total
}
