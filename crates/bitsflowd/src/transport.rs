//! TCP transport: accepts inbound peers and dials bootstrap peers.
//!
//! Every connection is wrapped in a [`CountedStream`] so the node can report
//! the live transport-level peer count.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use bitsflow_services::Node;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PeerListener {
    listener: TcpListener,
    node: Arc<Node>,
    connected: Arc<AtomicUsize>,
}

impl PeerListener {
    pub fn new(listener: TcpListener, node: Arc<Node>, connected: Arc<AtomicUsize>) -> Self {
        Self {
            listener,
            node,
            connected,
        }
    }

    pub async fn run(self) -> Result<()> {
        let shutdown = self.node.shutdown_token();
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "peer listener started");
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("peer listener shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(%addr, "inbound connection");
                        attach(&self.node, addr.to_string(), stream, &self.connected);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

/// Dial each bootstrap peer once.
pub async fn dial_bootstrap(node: Arc<Node>, peers: Vec<String>, connected: Arc<AtomicUsize>) {
    for addr in peers {
        match timeout(DIAL_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                tracing::info!(peer = %addr, "connected to bootstrap peer");
                attach(&node, addr, stream, &connected);
            }
            Ok(Err(e)) => tracing::warn!(peer = %addr, error = %e, "bootstrap dial failed"),
            Err(_) => tracing::warn!(peer = %addr, "bootstrap dial timed out"),
        }
    }
}

fn attach(node: &Arc<Node>, id: String, stream: TcpStream, connected: &Arc<AtomicUsize>) {
    let _ = stream.set_nodelay(true);
    let stream = CountedStream::new(stream, connected.clone());
    if !node.spawn_peer(id.clone(), stream) {
        tracing::debug!(peer = %id, "node shutting down, connection dropped");
    }
}

/// A TCP stream that holds one slot of the connection counter.
pub struct CountedStream {
    inner: TcpStream,
    counter: Arc<AtomicUsize>,
}

impl CountedStream {
    fn new(inner: TcpStream, counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { inner, counter }
    }
}

impl Drop for CountedStream {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

impl AsyncRead for CountedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
