//! Bitsflow wire format: application frames exchanged between peers.
//!
//! Every message is an 8-byte `FrameHeader` followed by `length` bytes of
//! JSON payload. The header is the only fixed-layout part of the protocol;
//! payload shapes are the serde structs below and may gain optional fields
//! without a version bump.
//!
//! Multi-byte header fields are big-endian. The header type derives the
//! zerocopy traits, so encoding and decoding are plain byte views with no
//! unsafe code.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Precedes every payload on a peer connection.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FrameHeader {
    /// Application message code. See [`codes`].
    pub code: U16<BigEndian>,

    /// Frame format version. Currently 0x01.
    /// Anything else is a protocol error.
    pub version: u8,

    /// Reserved, must be zero.
    pub flags: u8,

    /// Payload length in bytes, not including this header.
    pub length: U32<BigEndian>,
}

assert_eq_size!(FrameHeader, [u8; 8]);

/// Header size in bytes.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

impl FrameHeader {
    pub fn new(code: u16, length: u32) -> Self {
        Self {
            code: U16::new(code),
            version: FRAME_VERSION,
            flags: 0,
            length: U32::new(length),
        }
    }

    /// Parse a header from exactly `HEADER_LEN` bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        FrameHeader::read_from(bytes).ok_or(WireError::ShortHeader(bytes.len()))
    }

    pub fn code(&self) -> u16 {
        self.code.get()
    }

    pub fn length(&self) -> u32 {
        self.length.get()
    }

    /// Check version, flags and the size cap. Returns the payload length.
    pub fn validate(&self, max_message_size: u32) -> Result<usize, WireError> {
        if self.version != FRAME_VERSION {
            return Err(WireError::UnknownVersion(self.version));
        }
        if self.flags != 0 {
            return Err(WireError::ReservedFlagsSet(self.flags));
        }
        let length = self.length();
        if length > max_message_size {
            return Err(WireError::PayloadTooLarge {
                length,
                max: max_message_size,
            });
        }
        Ok(length as usize)
    }
}

// ── Message Codes ────────────────────────────────────────────────────────────

/// Application-level message codes.
pub mod codes {
    /// Peer info snapshot. Replaces the session's cached info.
    pub const STATUS: u16 = 0x00;
    /// Request for an artifact by content hash. Protocol >= 4.
    pub const QUERY: u16 = 0x01;
    /// Free-form informational text. Protocol > 4.
    pub const MSG: u16 = 0x02;
    /// First frame of a session in both directions. Illegal afterwards.
    pub const HANDSHAKE: u16 = 0x10;
}

// ── Payloads ─────────────────────────────────────────────────────────────────

/// What a node tells its neighbours about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Swarm listening port.
    pub listen: u16,
    /// Current chain root (hex).
    pub root: String,
    /// Number of artifacts being seeded.
    pub files: u64,
    /// Number of ledger leaves (blocks).
    pub leafs: u64,
}

/// Handshake payload, sent once by each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: u32,
    pub node_id: String,
    pub info: PeerInfo,
}

/// Ask a neighbour to look for an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgInfo {
    pub desc: String,
}

// ── Frame ────────────────────────────────────────────────────────────────────

/// A complete outbound message: code plus encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode `value` as the JSON payload of a frame with `code`.
    pub fn encode<T: Serialize>(code: u16, value: &T) -> Result<Self, WireError> {
        let payload =
            serde_json::to_vec(value).map_err(|e| WireError::Malformed(e.to_string()))?;
        if payload.len() > u32::MAX as usize {
            return Err(WireError::PayloadTooLarge {
                length: u32::MAX,
                max: u32::MAX,
            });
        }
        Ok(Self { code, payload })
    }

    /// Header followed by payload, ready to write to a stream.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = FrameHeader::new(self.code, self.payload.len() as u32);
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Decode a JSON payload into `T`.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(payload).map_err(|e| WireError::Malformed(e.to_string()))
}

// ── Constants ────────────────────────────────────────────────────────────────

/// Protocol name advertised in node metadata.
pub const PROTOCOL_NAME: &str = "nas";

/// Application protocol version spoken by this node.
pub const PROTOCOL_VERSION: u32 = 5;

/// Oldest protocol version accepted at handshake.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Query frames are honoured from this version on.
pub const QUERY_MIN_VERSION: u32 = 4;

/// Msg frames are honoured strictly above this version.
pub const MSG_AFTER_VERSION: u32 = 4;

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Default cap on a single frame's payload.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Default handshake timeout in seconds.
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 5;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame header needs {} bytes, got {0}", HEADER_LEN)]
    ShortHeader(usize),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("payload length {length} exceeds maximum {max}")]
    PayloadTooLarge { length: u32, max: u32 },

    #[error("malformed payload: {0}")]
    Malformed(String),
}
