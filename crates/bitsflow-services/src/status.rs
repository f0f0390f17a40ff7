//! Artifact availability, computed fresh from swarm flags on every call.

use serde::Serialize;

use crate::collaborator::Swarm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ArtifactStatus {
    Seeding = 0,
    Pending = 1,
    Downloading = 2,
    Missing = 3,
}

impl ArtifactStatus {
    /// Pending wins over Downloading, which wins over Seeding.
    pub fn probe(swarm: &dyn Swarm, hash: &str) -> Self {
        if swarm.is_pending(hash) {
            ArtifactStatus::Pending
        } else if swarm.is_downloading(hash) {
            ArtifactStatus::Downloading
        } else if swarm.is_seeding(hash) {
            ArtifactStatus::Seeding
        } else {
            ArtifactStatus::Missing
        }
    }

    /// Numeric code used by API clients.
    pub fn code(self) -> u8 {
        self as u8
    }
}
