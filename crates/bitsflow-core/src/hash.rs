//! Content hashes: the permanent identifier of an artifact.
//!
//! A content hash is 20 bytes: the leading 20 bytes of the BLAKE3 hash of
//! the artifact descriptor's info bytes. On the wire and in storage paths it
//! is 40 lowercase hex characters with no prefix. Inputs from peers and
//! callers may carry a `0x` prefix and mixed case.

use std::fmt;
use std::str::FromStr;

/// Byte width of a content hash.
pub const HASH_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash descriptor info bytes into a content hash.
    pub fn of_info(info_bytes: &[u8]) -> Self {
        let digest = blake3::hash(info_bytes);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&digest.as_bytes()[..HASH_LEN]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Canonical form: lowercase hex, no prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = InvalidHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_hex_address(s) {
            return Err(InvalidHash(s.to_string()));
        }
        let mut out = [0u8; HASH_LEN];
        hex::decode_to_slice(strip_prefix(s), &mut out).map_err(|_| InvalidHash(s.to_string()))?;
        Ok(Self(out))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a content hash: {0:?}")]
pub struct InvalidHash(pub String);

fn strip_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Syntactic check: optional `0x` prefix, then exactly 40 hex characters.
pub fn is_hex_address(s: &str) -> bool {
    let body = strip_prefix(s);
    body.len() == HASH_LEN * 2 && body.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Canonical lowercase, prefix-free form of a hash string.
///
/// Does not validate; callers that need a well-formed hash check
/// [`is_hex_address`] first.
pub fn normalize(s: &str) -> String {
    strip_prefix(s).to_ascii_lowercase()
}
