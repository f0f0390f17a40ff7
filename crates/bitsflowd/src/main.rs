//! bitsflowd: Bitsflow peer-to-peer artifact distribution daemon.
//!
//! Usage: bitsflowd [--seed <path>]... [--seed-link <path>]...

use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;

use bitsflow_core::config::BitsflowConfig;
use bitsflow_services::{JsonLedger, Ledger, LocalSwarm, Node, SeedMode, Swarm};

mod status;
mod transport;

/// Local paths to publish at startup.
fn seed_args() -> Result<Vec<(PathBuf, SeedMode)>> {
    let mut out = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mode = match arg.as_str() {
            "--seed" => SeedMode::Copy,
            "--seed-link" => SeedMode::Link,
            other => bail!("unknown argument: {other}"),
        };
        let Some(path) = args.next() else {
            bail!("{arg} needs a path");
        };
        out.push((PathBuf::from(path), mode));
    }
    Ok(out)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let seeds = seed_args()?;

    // Load config
    if let Err(e) = BitsflowConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BitsflowConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BitsflowConfig::default()
    });

    // Transport
    let bind = format!("{}:{}", config.network.listen_addr, config.network.port);
    let listener = if config.network.disable_tcp {
        tracing::warn!("tcp disabled, node will not accept or dial peers");
        None
    } else {
        Some(
            TcpListener::bind(&bind)
                .await
                .with_context(|| format!("failed to bind peer listener on {bind}"))?,
        )
    };
    let port = match &listener {
        Some(l) => l.local_addr()?.port(),
        None => config.network.port,
    };

    // Collaborators
    let swarm: Arc<dyn Swarm> = Arc::new(
        LocalSwarm::new(&config.storage.data_dir, port).context("failed to open data dir")?,
    );
    let ledger: Arc<dyn Ledger> =
        Arc::new(JsonLedger::with_persistence(config.storage.ledger_path.clone()));
    tracing::info!(
        data_dir = %config.storage.data_dir.display(),
        ledger = %config.storage.ledger_path.display(),
        "storage ready"
    );

    let api_port = config.network.api_port;
    let bootstrap = config.network.bootstrap_peers.clone();
    let node = Node::start(config, swarm, ledger);

    let connected = Arc::new(AtomicUsize::new(0));
    node.set_transport_peer_counter(connected.clone());

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let listener_task = listener.map(|l| {
        tokio::spawn(transport::PeerListener::new(l, node.clone(), connected.clone()).run())
    });

    if listener_task.is_some() && !bootstrap.is_empty() {
        tokio::spawn(transport::dial_bootstrap(node.clone(), bootstrap, connected.clone()));
    }

    if api_port != 0 {
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = status::serve(node, api_port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    for (path, mode) in seeds {
        match node.seed_local(&path, mode).await {
            Ok(seeded) => tracing::info!(path = %path.display(), hash = %seeded.hash, "seeded"),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "seeding failed"),
        }
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    match listener_task {
        Some(task) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
                r = task => tracing::error!("peer listener exited: {:?}", r),
            }
        }
        None => {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
        }
    }

    node.shutdown().await;
    Ok(())
}
