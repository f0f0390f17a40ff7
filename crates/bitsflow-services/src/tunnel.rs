//! Dedup tunnel: short-horizon memory of needs already announced.
//!
//! Maps a content hash to the largest size announced for it and an expiry.
//! A new announcement is let through only when no live entry covers it.
//! Expiry is passive: stale entries are ignored and swept on the next write,
//! nothing is retried when they lapse.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct TunnelEntry {
    value: u64,
    expires: Instant,
}

pub struct DedupTunnel {
    ttl: Duration,
    entries: DashMap<String, TunnelEntry>,
}

impl Default for DedupTunnel {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl DedupTunnel {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Decide whether a need for `hash` at `size` should be announced.
    ///
    /// Returns false when a live entry already covers `size`. Otherwise the
    /// entry becomes `size` with a fresh TTL and the call returns true.
    pub fn offer(&self, hash: &str, size: u64) -> bool {
        let now = Instant::now();
        // Sweep before taking the entry guard; retain locks every shard.
        self.entries.retain(|_, e| e.expires > now);

        let fresh = TunnelEntry {
            value: size,
            expires: now + self.ttl,
        };
        match self.entries.entry(hash.to_string()) {
            Entry::Occupied(mut slot) => {
                let live = slot.get();
                if live.expires > now && live.value >= size {
                    return false;
                }
                slot.insert(fresh);
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
            }
        }
        true
    }

    /// Live value for `hash`, if any.
    pub fn get(&self, hash: &str) -> Option<u64> {
        let now = Instant::now();
        self.entries
            .get(hash)
            .filter(|e| e.expires > now)
            .map(|e| e.value)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.expires > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry. Returns how many were live.
    pub fn drain(&self) -> usize {
        let now = Instant::now();
        let mut live = 0;
        self.entries.retain(|_, e| {
            if e.expires > now {
                live += 1;
            }
            false
        });
        live
    }
}
