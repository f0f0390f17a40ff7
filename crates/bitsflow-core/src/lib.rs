//! bitsflow-core: wire format, content hashes, descriptors and configuration.
//! All other Bitsflow crates depend on this one.

pub mod config;
pub mod descriptor;
pub mod hash;
pub mod wire;

pub use hash::{is_hex_address, normalize, ContentHash};
