// Shutdown and the construct-once node slot.

use crate::*;

use bitsflow_services::{FsError, Ledger, NodeSlot};

const LIMIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn shutdown_drains_peers_and_releases_resources() {
    let h = start_node();
    let mut a = PeerClient::connect_current(&h.node, "a").await;
    let mut b = PeerClient::connect_current(&h.node, "b").await;
    assert!(h.node.broadcast(&hash(1), 10));
    assert_eq!(h.node.tunnel().len(), 1);

    h.node.shutdown().await;

    assert!(h.node.is_shut_down());
    assert!(h.node.registry().is_empty());
    assert!(h.node.tunnel().is_empty());
    assert_eq!(h.swarm.closes(), 1);
    assert!(h.ledger.set_torrent_progress(&hash(1), 1).is_err());

    assert_eq!(within(LIMIT, a.closed()).await, Some(true));
    assert_eq!(within(LIMIT, b.closed()).await, Some(true));
}

#[tokio::test]
async fn second_shutdown_is_harmless() {
    let h = start_node();
    h.node.shutdown().await;
    h.node.shutdown().await;

    assert_eq!(h.swarm.closes(), 1);
}

#[tokio::test]
async fn concurrent_shutdowns_close_once() {
    let h = start_node();
    let (n1, n2) = (h.node.clone(), h.node.clone());

    tokio::join!(n1.shutdown(), n2.shutdown());

    assert_eq!(h.swarm.closes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_shutdown_caller_sees_teardown_finished() {
    for round in 0..200u32 {
        let h = start_node();
        assert!(h.node.broadcast(&hash((round % 250) as u8), 10));

        let node = h.node.clone();
        let other = tokio::spawn(async move { node.shutdown().await });
        h.node.shutdown().await;

        assert!(h.node.tunnel().is_empty(), "round {round}: tunnel not drained");
        assert_eq!(h.swarm.closes(), 1, "round {round}: swarm not closed");
        assert!(h.ledger.set_torrent_progress(&hash(1), 1).is_err());

        other.await.unwrap();
        assert!(h.node.tunnel().is_empty());
        assert_eq!(h.swarm.closes(), 1);
    }
}

#[tokio::test]
async fn nothing_new_starts_after_shutdown() {
    let h = start_node();
    h.node.shutdown().await;

    let (_client, server) = tokio::io::duplex(1024);
    assert!(!h.node.spawn_peer("late", server));
    assert!(matches!(
        h.node.download(&hash(2), 0).await,
        Err(FsError::Closed)
    ));
    assert!(!h.node.wakeup(&hash(2), 1));
}

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_deferred_needs() {
    let h = start_node();
    h.node.download(&hash(3), 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.node.pending(), 1);

    h.node.shutdown().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(h.swarm.searches().is_empty());
}

#[tokio::test]
async fn node_slot_starts_one_node() {
    let slot = NodeSlot::new();
    assert!(slot.get().is_none());

    let first = slot.get_or_start(test_config(), ScriptedSwarm::new(), Arc::new(JsonLedger::new()));
    let mut other = test_config();
    other.identity.node_id = "ignored".into();
    let second = slot.get_or_start(other, ScriptedSwarm::new(), Arc::new(JsonLedger::new()));

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.node_id(), "test-node");
    assert!(Arc::ptr_eq(&first, &slot.get().unwrap()));
    first.shutdown().await;
}
