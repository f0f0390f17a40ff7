//! bitsflow-services: the node, its peer protocol and demand scheduler, and
//! local implementations of the swarm and ledger collaborators.

pub mod collaborator;
pub mod dispatch;
pub mod error;
pub mod fetch;
pub mod ledger;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod seeding;
pub mod seen;
pub mod session;
pub mod status;
pub mod swarm;
pub mod tunnel;

pub use collaborator::{Ledger, Swarm, TorrentListing};
pub use error::FsError;
pub use ledger::JsonLedger;
pub use node::{Node, NodeInfo, NodeSlot, WHOLE_ARTIFACT};
pub use registry::{Peer, PeerRegistry, PeerSummary};
pub use scheduler::{Fetch, NeedEvent, PendingQueue};
pub use seeding::{SeedMode, Seeded};
pub use status::ArtifactStatus;
pub use swarm::{LocalSwarm, TorrentState};
pub use tunnel::DedupTunnel;
