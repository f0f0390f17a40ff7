//! Seen-set: content hashes this node has already taken note of.
//!
//! Append-only for the life of the process.

use dashmap::DashSet;

#[derive(Default)]
pub struct SeenSet {
    hashes: DashSet<String>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `hash`. Returns true on first sighting.
    pub fn encounter(&self, hash: &str) -> bool {
        self.hashes.insert(hash.to_string())
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// Sorted snapshot for node metadata.
    pub fn snapshot(&self) -> Vec<String> {
        let mut out: Vec<String> = self.hashes.iter().map(|h| h.key().clone()).collect();
        out.sort();
        out
    }
}
