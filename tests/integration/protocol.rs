// Peer protocol: handshake, dispatch and termination rules.

use crate::*;

use bitsflow_core::wire::{MsgInfo, Query};

const LIMIT: Duration = Duration::from_secs(5);

fn status(root: &str) -> PeerInfo {
    PeerInfo {
        listen: 9000,
        root: root.into(),
        files: 7,
        leafs: 9,
    }
}

async fn root_becomes(h: &Harness, id: &str, root: &str) -> bool {
    wait_until(LIMIT, || {
        h.node
            .peer_info(id)
            .map_or(false, |p| p.root == root)
    })
    .await
}

// ── Handshake ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_registers_peer() {
    let h = start_node();
    let (client, theirs) = PeerClient::connect(&h.node, "p1", PROTOCOL_VERSION).await;

    assert_eq!(theirs.version, PROTOCOL_VERSION);
    assert_eq!(theirs.node_id, "test-node");
    assert_eq!(theirs.info.listen, 40404);

    assert!(
        wait_until(LIMIT, || h
            .node
            .peer_info("p1")
            .map_or(false, |p| p.version == PROTOCOL_VERSION))
        .await
    );
    let summary = h.node.peer_info("p1").unwrap();
    assert_eq!(summary.node_id, "remote-p1");
    assert_eq!(summary.root, "remote-root");
    assert_eq!(summary.leafs, 2);
    assert_eq!(h.node.neighbors(), 1);

    drop(client);
    assert!(wait_until(LIMIT, || h.node.registry().is_empty()).await);
    assert_eq!(h.node.node_info().peers_out, 1);
    h.node.shutdown().await;
}

#[tokio::test]
async fn older_peer_negotiates_down() {
    let h = start_node();
    let _client = PeerClient::connect(&h.node, "old", 3).await;

    assert!(
        wait_until(LIMIT, || h
            .node
            .peer_info("old")
            .map_or(false, |p| p.version == 3))
        .await
    );
    h.node.shutdown().await;
}

#[tokio::test]
async fn version_zero_is_refused() {
    let h = start_node();
    let (mut client, _) = PeerClient::connect(&h.node, "ancient", 0).await;

    assert_eq!(within(LIMIT, client.closed()).await, Some(true));
    assert!(wait_until(LIMIT, || h.node.registry().is_empty()).await);
    h.node.shutdown().await;
}

#[tokio::test]
async fn first_frame_must_be_handshake() {
    let h = start_node();
    let mut client = PeerClient::open(&h.node, "rude");
    client.send(codes::STATUS, &status("early")).await;

    let (code, _) = client.recv().await.expect("server hello");
    assert_eq!(code, codes::HANDSHAKE);
    assert_eq!(within(LIMIT, client.recv()).await, Some(None));
    h.node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out() {
    let h = start_node();
    let mut client = PeerClient::open(&h.node, "mute");

    let (code, _) = client.recv().await.expect("server hello");
    assert_eq!(code, codes::HANDSHAKE);

    let started = tokio::time::Instant::now();
    assert_eq!(within(Duration::from_secs(30), client.recv()).await, Some(None));
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(wait_until(LIMIT, || h.node.registry().is_empty()).await);
    h.node.shutdown().await;
}

#[tokio::test]
async fn duplicate_peer_id_is_refused() {
    let h = start_node();
    let _first = PeerClient::connect_current(&h.node, "same").await;

    let mut second = PeerClient::open(&h.node, "same");
    assert_eq!(within(LIMIT, second.recv()).await, Some(None));
    assert_eq!(h.node.registry().len(), 1);
    h.node.shutdown().await;
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn status_updates_peer_info() {
    let h = start_node();
    let mut client = PeerClient::connect_current(&h.node, "p1").await;

    client.send(codes::STATUS, &status("abc")).await;
    assert!(root_becomes(&h, "p1", "abc").await);

    let summary = h.node.peer_info("p1").unwrap();
    assert_eq!(summary.listen, 9000);
    assert_eq!(summary.files, 7);
    assert!(h.node.node_info().received >= 2);
    h.node.shutdown().await;
}

#[tokio::test]
async fn query_raises_a_need_and_is_relayed() {
    let h = start_node();
    let mut client = PeerClient::connect_current(&h.node, "p1").await;
    let target = hash(0xab);

    client
        .send(
            codes::QUERY,
            &Query {
                hash: format!("0x{}", target.to_uppercase()),
                size: Some(42),
            },
        )
        .await;

    assert!(wait_until(LIMIT, || h.swarm.searched(&target) == vec![42]).await);

    // Not present locally, so the need goes out to every neighbour.
    let payload = within(LIMIT, client.recv_code(codes::QUERY))
        .await
        .flatten()
        .expect("relayed query");
    let relayed: Query = decode_payload(&payload).unwrap();
    assert_eq!(relayed.hash, target);
    assert_eq!(relayed.size, Some(42));
    h.node.shutdown().await;
}

#[tokio::test]
async fn query_is_ignored_below_version_four() {
    let h = start_node();
    let (mut client, _) = PeerClient::connect(&h.node, "v3", 3).await;

    client
        .send(
            codes::QUERY,
            &Query {
                hash: "not-a-hash".into(),
                size: None,
            },
        )
        .await;
    client.send(codes::STATUS, &status("still-here")).await;

    assert!(root_becomes(&h, "v3", "still-here").await);
    assert!(h.swarm.searches().is_empty());
    h.node.shutdown().await;
}

#[tokio::test]
async fn msg_is_accepted_at_current_version() {
    let h = start_node();
    let mut client = PeerClient::connect_current(&h.node, "p1").await;

    client
        .send(codes::MSG, &MsgInfo { desc: "hello".into() })
        .await;
    client.send(codes::STATUS, &status("after-msg")).await;

    assert!(root_becomes(&h, "p1", "after-msg").await);
    h.node.shutdown().await;
}

// ── Termination ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_code_terminates_session() {
    let h = start_node();
    let mut client = PeerClient::connect_current(&h.node, "p1").await;

    client.send(0x7f, &status("x")).await;

    assert_eq!(within(LIMIT, client.closed()).await, Some(true));
    assert!(wait_until(LIMIT, || h.node.registry().is_empty()).await);
    h.node.shutdown().await;
}

#[tokio::test]
async fn malformed_hash_terminates_session() {
    let h = start_node();
    let mut client = PeerClient::connect_current(&h.node, "p1").await;

    client
        .send(
            codes::QUERY,
            &Query {
                hash: "xyz".into(),
                size: Some(1),
            },
        )
        .await;

    assert_eq!(within(LIMIT, client.closed()).await, Some(true));
    assert!(h.swarm.searches().is_empty());
    h.node.shutdown().await;
}

#[tokio::test]
async fn undecodable_payload_terminates_session() {
    let h = start_node();
    let mut client = PeerClient::connect_current(&h.node, "p1").await;

    let frame = Frame {
        code: codes::STATUS,
        payload: b"not json".to_vec(),
    };
    client.send_raw(&frame.to_bytes()).await;

    assert_eq!(within(LIMIT, client.closed()).await, Some(true));
    h.node.shutdown().await;
}

#[tokio::test]
async fn oversize_frame_terminates_session() {
    let mut config = test_config();
    config.network.max_message_size = 1024;
    let h = start_with(config, JsonLedger::new());
    let mut client = PeerClient::connect_current(&h.node, "p1").await;

    // STATUS header, frame version 1, announcing a 4096-byte payload.
    let mut header = vec![0x00, 0x00, 0x01, 0x00];
    header.extend_from_slice(&4096u32.to_be_bytes());
    client.send_raw(&header).await;

    assert_eq!(within(LIMIT, client.closed()).await, Some(true));
    assert!(wait_until(LIMIT, || h.node.registry().is_empty()).await);
    h.node.shutdown().await;
}
