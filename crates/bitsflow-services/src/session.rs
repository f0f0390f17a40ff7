//! Peer session: handshake, then one frame at a time until the stream ends,
//! a protocol error occurs, or the node shuts down.
//!
//! Layout of a session's tasks:
//!   - the caller's task reads and dispatches frames in arrival order
//!   - a writer task drains the peer's bounded outbound queue
//!   - a status announcer sends local peer info on a timer
//!
//! The auxiliary tasks hang off a child cancellation token that is
//! cancelled when the session returns, whichever way it returns.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use bitsflow_core::wire::{
    codes, decode_payload, Frame, FrameHeader, Hello, HEADER_LEN, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};

use crate::dispatch::dispatch;
use crate::error::{FsError, Result};
use crate::node::Node;
use crate::registry::Peer;

/// Frames a peer may have queued before new ones are dropped.
pub const OUTBOUND_QUEUE: usize = 64;

/// Read buffer capacity kept between frames.
const RETAINED_BUFFER: usize = 64 * 1024;

/// Run one peer session to completion.
pub async fn handle_peer<S>(node: Arc<Node>, id: String, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
    let peer = Arc::new(Peer::new(id, tx));

    let _registration = node.registry.register(peer.clone())?;

    let session = node.shutdown.child_token();
    let _stop = session.clone().drop_guard();
    node.tasks.spawn(write_frames(writer, rx, session.clone()));

    handshake(&node, &peer, &mut reader, &session).await?;
    tracing::info!(peer = %peer.id(), version = peer.version(), node_id = %peer.node_id(), "handshake complete");

    node.tasks
        .spawn(announce_status(node.clone(), peer.clone(), session.clone()));

    message_loop(&node, &peer, &mut reader, &session).await
}

/// Exchange Hello frames. Our Hello is queued first, then the peer's must
/// arrive within the handshake timeout.
async fn handshake<R>(
    node: &Node,
    peer: &Peer,
    reader: &mut R,
    session: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let hello = Hello {
        version: PROTOCOL_VERSION,
        node_id: node.node_id().to_string(),
        info: node.local_info(),
    };
    peer.send(Frame::encode(codes::HANDSHAKE, &hello)?);

    let limit = node.config.network.handshake_timeout();
    let max = node.config.network.max_message_size;
    let mut buf = Vec::new();

    let code = tokio::select! {
        _ = session.cancelled() => return Err(FsError::Closed),
        read = timeout(limit, read_frame(reader, &mut buf, max)) => match read {
            Err(_) => return Err(FsError::Timeout(format!("handshake after {limit:?}"))),
            Ok(frame) => frame?,
        },
    };

    match code {
        Some(codes::HANDSHAKE) => {}
        Some(other) => {
            return Err(FsError::Protocol(format!(
                "expected handshake, got code 0x{other:02x}"
            )))
        }
        None => return Err(FsError::Protocol("closed during handshake".into())),
    }

    let theirs: Hello = decode_payload(&buf)?;
    if theirs.version < MIN_PROTOCOL_VERSION {
        return Err(FsError::Protocol(format!(
            "unsupported protocol version {}",
            theirs.version
        )));
    }
    node.count_received();
    peer.set_node_id(theirs.node_id);
    peer.set_info(theirs.info);
    peer.set_version(theirs.version.min(PROTOCOL_VERSION));
    Ok(())
}

async fn message_loop<R>(
    node: &Node,
    peer: &Peer,
    reader: &mut R,
    session: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let max = node.config.network.max_message_size;
    let mut buf = Vec::new();

    loop {
        let code = tokio::select! {
            _ = session.cancelled() => return Ok(()),
            frame = read_frame(reader, &mut buf, max) => match frame? {
                Some(code) => code,
                None => return Ok(()),
            },
        };
        node.count_received();

        let result = dispatch(node, peer, code, &buf);

        // Discard the payload before the next read.
        buf.clear();
        buf.shrink_to(RETAINED_BUFFER);

        result?;
    }
}

/// Read one frame into `buf`. Returns the code, or `None` on a clean EOF
/// at a frame boundary. The size cap is checked before the payload is read.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, max: u32) -> Result<Option<u16>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = FrameHeader::parse(&header)?;
    let len = header.validate(max)?;

    buf.clear();
    buf.resize(len, 0);
    reader.read_exact(buf).await?;
    Ok(Some(header.code()))
}

/// Drain queued frames onto the stream. Frames already queued when the
/// session ends are still written.
async fn write_frames<W>(writer: W, mut rx: mpsc::Receiver<Frame>, session: CancellationToken)
where
    W: AsyncWrite + Send + Unpin,
{
    let mut writer = writer;
    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = session.cancelled() => None,
        };
        let Some(frame) = frame else { break };
        let bytes = frame.to_bytes();

        tokio::select! {
            biased;
            written = writer.write_all(&bytes) => {
                if let Err(e) = written {
                    tracing::debug!(error = %e, "peer write failed");
                    break;
                }
            }
            _ = session.cancelled() => break,
        }
    }
    let _ = writer.shutdown().await;
}

/// Send local peer info now and then every status interval.
async fn announce_status(node: Arc<Node>, peer: Arc<Peer>, session: CancellationToken) {
    let mut ticker = interval(node.config.network.status_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            _ = ticker.tick() => {
                match Frame::encode(codes::STATUS, &node.local_info()) {
                    Ok(frame) => {
                        peer.send(frame);
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to encode status"),
                }
            }
        }
    }
}
