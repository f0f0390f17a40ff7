//! Fetch path, neighbour announcements and the blocking read used by the
//! compute consumer.

use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, timeout};

use bitsflow_core::hash::{is_hex_address, normalize};
use bitsflow_core::wire::{codes, Frame, Query};

use crate::error::{FsError, Result};
use crate::node::{Node, WHOLE_ARTIFACT};

impl Node {
    /// Record the request, announce it if the artifact is not already here,
    /// and ask the swarm to search. Only the search can fail the call.
    pub async fn fetch(&self, hash: &str, request: u64) -> Result<()> {
        let hash = normalize(hash);
        let (_, size) = self.ledger.set_torrent_progress(&hash, request)?;

        if !self.swarm.exists(&hash, size) {
            self.announce(&hash, size);
        }

        self.swarm.search(&hash, size).await?;
        tracing::debug!(hash = %hash, request, size, "search issued");
        Ok(())
    }

    /// Tunnel decision: should a need for `hash` at `size` go out to
    /// neighbours? Invalid hashes never do.
    pub fn broadcast(&self, hash: &str, size: u64) -> bool {
        if !is_hex_address(hash) {
            return false;
        }
        self.tunnel.offer(&normalize(hash), size)
    }

    /// If the tunnel lets it through, send a Query to every peer from a
    /// short-lived task. Best effort.
    fn announce(&self, hash: &str, size: u64) {
        if !self.broadcast(hash, size) {
            tracing::trace!(hash, size, "announcement suppressed");
            return;
        }
        let frame = match Frame::encode(
            codes::QUERY,
            &Query {
                hash: hash.to_string(),
                size: Some(size),
            },
        ) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(hash, error = %e, "failed to encode query");
                return;
            }
        };

        let registry = self.registry.clone();
        let sent = self.sent.clone();
        let hash = hash.to_string();
        self.tasks.spawn(async move {
            let reached = registry.broadcast(&frame);
            sent.fetch_add(reached as u64, Ordering::Relaxed);
            tracing::debug!(hash = %hash, size, reached, "need announced");
        });
    }

    /// Resume from the ledger in the background: if a size was recorded for
    /// `hash`, search at that size.
    fn wake_from_ledger(&self, hash: &str) {
        let swarm = self.swarm.clone();
        let ledger = self.ledger.clone();
        let hash = hash.to_string();
        self.tasks.spawn(async move {
            match ledger.get_torrent_progress(&hash) {
                Ok(Some(size)) => {
                    if let Err(e) = swarm.search(&hash, size).await {
                        tracing::warn!(hash = %hash, error = %e, "background wake failed");
                    }
                }
                Ok(None) => tracing::trace!(hash = %hash, "no recorded progress"),
                Err(e) => tracing::warn!(hash = %hash, error = %e, "ledger lookup failed"),
            }
        });
    }

    /// Read `subpath` of an artifact, refusing anything larger than
    /// `max_size`.
    ///
    /// On a miss a background wake is started. Good hashes are then polled
    /// until they appear or `deadline` passes. Other hashes fail right away
    /// with [`FsError::NotFound`].
    pub async fn get_file_with_size(
        &self,
        hash: &str,
        max_size: u64,
        subpath: &str,
        deadline: Duration,
    ) -> Result<Bytes> {
        let hash = normalize(hash);

        if let Some(bytes) = self.swarm.get_file(&hash, subpath).await? {
            check_size(&hash, &bytes, max_size)?;
            if !self.is_good(&hash) && self.seen.encounter(&hash) {
                tracing::debug!(hash = %hash, "first contact");
            }
            return Ok(bytes);
        }

        self.wake_from_ledger(&hash);
        if !self.is_good(&hash) {
            return Err(FsError::NotFound(hash));
        }

        let scheduler = &self.config.scheduler;
        let (initial, every) = (scheduler.poll_initial(), scheduler.poll_interval());
        let poll = async {
            sleep(initial).await;
            loop {
                match self.swarm.get_file(&hash, subpath).await {
                    Ok(Some(bytes)) => return Ok(bytes),
                    Ok(None) => {}
                    Err(e) => tracing::trace!(hash = %hash, error = %e, "poll read failed"),
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(FsError::Closed),
                    _ = sleep(every) => {}
                }
            }
        };

        let bytes = timeout(deadline, poll)
            .await
            .map_err(|_| FsError::Timeout(format!("waiting for {hash}")))??;
        check_size(&hash, &bytes, max_size)?;
        Ok(bytes)
    }

    /// Search for the whole artifact right now, bypassing the scheduler.
    pub async fn tunnel_fetch(&self, hash: &str) -> Result<()> {
        if !is_hex_address(hash) {
            return Err(bitsflow_core::hash::InvalidHash(hash.to_string()).into());
        }
        Ok(self.swarm.search(&normalize(hash), WHOLE_ARTIFACT).await?)
    }

    /// Forget an artifact in the swarm.
    pub fn drop_artifact(&self, hash: &str) -> Result<()> {
        Ok(self.swarm.drop_torrent(&normalize(hash))?)
    }
}

fn check_size(hash: &str, bytes: &Bytes, max_size: u64) -> Result<()> {
    let actual = bytes.len() as u64;
    if actual > max_size {
        return Err(FsError::Oversize {
            hash: hash.to_string(),
            actual,
            max: max_size,
        });
    }
    Ok(())
}
