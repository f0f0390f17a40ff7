//! Demand scheduler: the single consumer of need-events.
//!
//! Four sources feed one `select!` loop: shutdown, incoming need-events, a
//! fast tick that retries one deferred need, and a slow tick that only logs.
//! A need is fetched right away when its hash is on the good list or it
//! carries an explicit size. Anything else waits in a bounded
//! [`PendingQueue`] for the next fast tick.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use bitsflow_core::config::SchedulerConfig;

use crate::error::Result;

/// Something should be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeedEvent {
    pub hash: String,
    /// Requested size in bytes. 0 = no explicit size.
    pub request: u64,
}

impl NeedEvent {
    pub fn new(hash: impl Into<String>, request: u64) -> Self {
        Self {
            hash: hash.into(),
            request,
        }
    }
}

/// What the scheduler drives.
#[async_trait]
pub trait Fetch: Send + Sync + 'static {
    /// Hashes worth fetching without an explicit size.
    fn is_good(&self, hash: &str) -> bool;

    async fn fetch(&self, hash: &str, request: u64) -> Result<()>;
}

/// Bounded FIFO of deferred needs.
pub struct PendingQueue {
    items: VecDeque<NeedEvent>,
    capacity: usize,
    len: Arc<AtomicUsize>,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self::with_counter(capacity, Arc::new(AtomicUsize::new(0)))
    }

    /// `len` mirrors the queue length for observers outside the loop.
    pub fn with_counter(capacity: usize, len: Arc<AtomicUsize>) -> Self {
        len.store(0, Ordering::Relaxed);
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            len,
        }
    }

    /// Append. Returns false, leaving the queue unchanged, when full.
    pub fn push(&mut self, event: NeedEvent) -> bool {
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push_back(event);
        self.len.store(self.items.len(), Ordering::Relaxed);
        true
    }

    pub fn pop(&mut self) -> Option<NeedEvent> {
        let event = self.items.pop_front();
        self.len.store(self.items.len(), Ordering::Relaxed);
        event
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct Scheduler {
    rx: mpsc::Receiver<NeedEvent>,
    pending: PendingQueue,
    fast_tick: Duration,
    status_tick: Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        rx: mpsc::Receiver<NeedEvent>,
        pending_len: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            pending: PendingQueue::with_counter(config.pending_capacity, pending_len),
            fast_tick: config.fast_tick(),
            status_tick: config.status_tick(),
            cancel,
        }
    }

    /// Run until shutdown or until every sender is gone.
    pub async fn run<F: Fetch>(mut self, target: Arc<F>) {
        tracing::info!(
            fast_tick_ms = self.fast_tick.as_millis() as u64,
            status_tick_secs = self.status_tick.as_secs(),
            "scheduler started"
        );

        let fast = sleep(self.fast_tick);
        tokio::pin!(fast);
        let mut status = interval_at(Instant::now() + self.status_tick, self.status_tick);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut fetched = 0u64;
        let mut deferred = 0u64;
        let mut dropped = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    if target.is_good(&event.hash) || event.request > 0 {
                        if !self.run_fetch(target.as_ref(), &event).await {
                            break;
                        }
                        fetched += 1;
                    } else if self.pending.push(event.clone()) {
                        deferred += 1;
                        tracing::trace!(hash = %event.hash, pending = self.pending.len(), "need deferred");
                    } else {
                        dropped += 1;
                        tracing::warn!(hash = %event.hash, "pending queue full, need dropped");
                    }
                }

                () = &mut fast => {
                    if let Some(event) = self.pending.pop() {
                        if !self.run_fetch(target.as_ref(), &event).await {
                            break;
                        }
                        fetched += 1;
                    }
                    fast.as_mut().reset(Instant::now() + self.fast_tick);
                }

                _ = status.tick() => {
                    tracing::info!(
                        pending = self.pending.len(),
                        fetched,
                        deferred,
                        dropped,
                        "scheduler status"
                    );
                }
            }
        }

        tracing::info!(pending = self.pending.len(), "scheduler stopped");
    }

    /// Returns false if shutdown interrupted the fetch.
    async fn run_fetch<F: Fetch>(&self, target: &F, event: &NeedEvent) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            result = target.fetch(&event.hash, event.request) => {
                if let Err(e) = result {
                    tracing::warn!(hash = %event.hash, request = event.request, error = %e, "fetch failed");
                }
                true
            }
        }
    }
}
