//! Service-level errors.

use std::path::PathBuf;

use bitsflow_core::descriptor::DescriptorError;
use bitsflow_core::hash::InvalidHash;
use bitsflow_core::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// Unknown code, malformed payload or bad hash from a peer. Session-fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Frame-level violation (oversize, bad version). Session-fatal.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Not available locally yet. A background fetch has been started.
    #[error("artifact {0} not available yet")]
    NotFound(String),

    #[error("artifact {hash} is {actual} bytes, expected at most {max}")]
    Oversize { hash: String, actual: u64, max: u64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Link-mode seeding target already present.
    #[error("{0} already exists")]
    AlreadyExists(PathBuf),

    #[error(transparent)]
    InvalidHash(#[from] InvalidHash),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("node is shut down")]
    Closed,

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    /// Failure reported by the swarm or ledger collaborator.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl FsError {
    /// Errors that must terminate a peer session.
    pub fn is_protocol(&self) -> bool {
        matches!(self, FsError::Protocol(_) | FsError::Wire(_))
    }
}

pub type Result<T, E = FsError> = std::result::Result<T, E>;
