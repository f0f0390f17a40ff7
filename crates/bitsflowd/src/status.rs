//! HTTP status endpoint: read-only JSON views of the node.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use bitsflow_core::hash::{is_hex_address, normalize};
use bitsflow_services::{ArtifactStatus, Node, NodeInfo, PeerSummary, TorrentListing};

type AppState = Arc<Node>;

// ── /status ──────────────────────────────────────────────────────────────────

async fn handle_status(State(node): State<AppState>) -> Json<NodeInfo> {
    Json(node.node_info())
}

// ── /peers ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeersResponse {
    pub neighbours: usize,
    pub peers: Vec<PeerSummary>,
}

async fn handle_peers(State(node): State<AppState>) -> Json<PeersResponse> {
    Json(PeersResponse {
        neighbours: node.neighbors(),
        peers: node.peers(),
    })
}

async fn handle_peer(
    State(node): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PeerSummary>, StatusCode> {
    node.peer_info(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

// ── /artifacts/{hash} ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ArtifactResponse {
    pub hash: String,
    pub status: ArtifactStatus,
    pub code: u8,
}

async fn handle_artifact(
    State(node): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<ArtifactResponse>, StatusCode> {
    if !is_hex_address(&hash) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let status = node.status(&hash);
    Ok(Json(ArtifactResponse {
        hash: normalize(&hash),
        status,
        code: status.code(),
    }))
}

// ── /torrents ────────────────────────────────────────────────────────────────

async fn handle_torrents(State(node): State<AppState>) -> Json<BTreeMap<String, TorrentListing>> {
    Json(node.list_all_torrents())
}

// ── Router ───────────────────────────────────────────────────────────────────

pub fn router(node: Arc<Node>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/status", get(handle_status))
        .route("/peers", get(handle_peers))
        .route("/peers/{id}", get(handle_peer))
        .route("/artifacts/{hash}", get(handle_artifact))
        .route("/torrents", get(handle_torrents))
        .with_state(node)
        .layer(cors)
}

pub async fn serve(node: Arc<Node>, port: u16) -> anyhow::Result<()> {
    let shutdown = node.shutdown_token();
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(node))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
