//! JSON-file progress ledger.
//!
//! Keeps `hash → requested size` and `block number → root`. When built with
//! a persist path, the whole state is rewritten on every mutation and on
//! close, and reloaded on startup.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::collaborator::Ledger;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerState {
    progress: BTreeMap<String, u64>,
    roots: BTreeMap<u64, String>,
}

pub struct JsonLedger {
    state: Mutex<LedgerState>,
    persist_path: Option<PathBuf>,
    /// Serializes snapshot, write and rename of the ledger file.
    write: Mutex<()>,
    closed: AtomicBool,
}

impl Default for JsonLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonLedger {
    /// In-memory only.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
            persist_path: None,
            write: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a ledger persisted at `path`, loading it if present.
    pub fn with_persistence(path: PathBuf) -> Self {
        let ledger = Self {
            state: Mutex::new(LedgerState::default()),
            persist_path: Some(path),
            write: Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        ledger.load_from_disk();
        ledger
    }

    /// Record the root of an imported block.
    pub fn record_root(&self, number: u64, root: impl Into<String>) {
        self.lock().roots.insert(number, root.into());
        self.persist();
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self) {
        if let Err(e) = self.save_to_disk() {
            tracing::warn!(error = %e, "failed to persist ledger");
        }
    }

    fn save_to_disk(&self) -> Result<()> {
        let Some(path) = self.persist_path.as_ref() else {
            return Ok(());
        };
        let _write = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let json = {
            let state = self.lock();
            serde_json::to_string_pretty(&*state).context("failed to serialize ledger")?
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }

    fn load_from_disk(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read ledger");
                return;
            }
        };
        match serde_json::from_str::<LedgerState>(&text) {
            Ok(loaded) => {
                tracing::info!(
                    artifacts = loaded.progress.len(),
                    blocks = loaded.roots.len(),
                    path = %path.display(),
                    "loaded ledger"
                );
                *self.lock() = loaded;
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse ledger");
            }
        }
    }
}

impl Ledger for JsonLedger {
    fn get_torrent_progress(&self, hash: &str) -> Result<Option<u64>> {
        Ok(self.lock().progress.get(hash).copied())
    }

    fn set_torrent_progress(&self, hash: &str, requested: u64) -> Result<(u64, u64)> {
        if self.closed.load(Ordering::Acquire) {
            bail!("ledger is closed");
        }
        let (old, new) = {
            let mut state = self.lock();
            let slot = state.progress.entry(hash.to_string()).or_insert(0);
            let old = *slot;
            *slot = old.max(requested);
            (old, *slot)
        };
        if new != old {
            self.persist();
        }
        Ok((old, new))
    }

    fn get_root(&self, number: u64) -> Option<String> {
        self.lock().roots.get(&number).cloned()
    }

    fn root(&self) -> String {
        self.lock()
            .roots
            .last_key_value()
            .map(|(_, r)| r.clone())
            .unwrap_or_default()
    }

    fn blocks(&self) -> u64 {
        self.lock().roots.len() as u64
    }

    fn current_number(&self) -> u64 {
        self.lock().roots.keys().next_back().copied().unwrap_or(0)
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            bail!("ledger already closed");
        }
        self.save_to_disk()
    }
}
