//! Routes one inbound frame by code. Any error returned here ends the
//! session.

use bitsflow_core::hash::{is_hex_address, normalize};
use bitsflow_core::wire::{
    codes, decode_payload, MsgInfo, PeerInfo, Query, MSG_AFTER_VERSION, QUERY_MIN_VERSION,
};

use crate::error::{FsError, Result};
use crate::node::Node;
use crate::registry::Peer;

pub fn dispatch(node: &Node, peer: &Peer, code: u16, payload: &[u8]) -> Result<()> {
    match code {
        codes::STATUS => {
            let info: PeerInfo = decode_payload(payload)?;
            tracing::trace!(peer = %peer.id(), root = %info.root, files = info.files, "peer status");
            peer.set_info(info);
        }

        codes::QUERY => {
            if peer.version() < QUERY_MIN_VERSION {
                tracing::trace!(peer = %peer.id(), version = peer.version(), "query ignored");
                return Ok(());
            }
            let query: Query = decode_payload(payload)?;
            if !is_hex_address(&query.hash) {
                return Err(FsError::Protocol(format!("invalid hash {:?}", query.hash)));
            }
            let hash = normalize(&query.hash);
            let size = query.size.unwrap_or(0);
            tracing::debug!(peer = %peer.id(), hash = %hash, size, "peer query");
            node.wakeup(&hash, size);
        }

        codes::MSG => {
            if peer.version() <= MSG_AFTER_VERSION {
                return Ok(());
            }
            let msg: MsgInfo = decode_payload(payload)?;
            tracing::debug!(peer = %peer.id(), desc = %msg.desc, "peer message");
        }

        other => return Err(FsError::Protocol(format!("invalid code 0x{other:02x}"))),
    }
    Ok(())
}
