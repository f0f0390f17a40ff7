// Demand scheduling: immediate versus deferred fetches and the startup seed list.

use crate::*;

use bitsflow_core::config::Mode;
use bitsflow_services::WHOLE_ARTIFACT;

#[tokio::test(start_paused = true)]
async fn unsized_need_waits_for_fast_tick() {
    let h = start_node();
    let target = hash(1);

    h.node.download(&target, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(h.swarm.searches().is_empty());
    assert_eq!(h.node.pending(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(h.swarm.searched(&target), vec![0]);
    assert_eq!(h.node.pending(), 0);
    h.node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sized_need_is_fetched_at_once() {
    let h = start_node();
    let target = hash(2);

    h.node.download(&target, 512).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.swarm.searched(&target), vec![512]);
    assert_eq!(h.node.pending(), 0);
    h.node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn good_hash_skips_the_queue() {
    let mut config = test_config();
    let target = hash(3);
    config.scheduler.good_hashes = vec![format!("0x{}", target.to_uppercase())];
    let h = start_with(config, JsonLedger::new());

    assert!(h.node.is_good(&target));
    h.node.download(&target, 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.swarm.searched(&target), vec![0]);
    h.node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn deferred_needs_drain_one_per_tick() {
    let h = start_node();
    for n in 10..13 {
        h.node.download(&hash(n), 0).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.node.pending(), 3);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.swarm.searches().len(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    let order: Vec<String> = h.swarm.searches().into_iter().map(|(key, _)| key).collect();
    assert_eq!(order, vec![hash(10), hash(11), hash(12)]);
    h.node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_pending_queue_drops_new_needs() {
    let mut config = test_config();
    config.scheduler.pending_capacity = 2;
    let h = start_with(config, JsonLedger::new());

    for n in 20..24 {
        h.node.download(&hash(n), 0).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.node.pending(), 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let order: Vec<String> = h.swarm.searches().into_iter().map(|(key, _)| key).collect();
    assert_eq!(order, vec![hash(20), hash(21)]);
    h.node.shutdown().await;
}

#[tokio::test]
async fn download_rejects_invalid_hash() {
    let h = start_node();
    assert!(h.node.download("zz", 1).await.is_err());
    h.node.shutdown().await;
}

// ── Seed list ────────────────────────────────────────────────────────────────

fn seeded_config(mode: Mode) -> BitsflowConfig {
    let mut config = test_config();
    config.scheduler.mode = mode;
    config.scheduler.seed_hashes = vec![hash(0x51), hash(0x52), "bogus".into()];
    config
}

#[tokio::test(start_paused = true)]
async fn seed_list_is_fetched_whole_when_ledger_is_behind() {
    let h = start_with(seeded_config(Mode::Full), JsonLedger::new());
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        h.swarm.searches(),
        vec![(hash(0x51), WHOLE_ARTIFACT), (hash(0x52), WHOLE_ARTIFACT)]
    );
    h.node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn seed_list_is_skipped_in_lazy_mode() {
    let h = start_with(seeded_config(Mode::Lazy), JsonLedger::new());
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(h.swarm.searches().is_empty());
    h.node.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn seed_list_is_skipped_past_checkpoint() {
    let config = seeded_config(Mode::Full);
    let ledger = JsonLedger::new();
    ledger.record_root(config.scheduler.checkpoint_block, "checkpoint-root");

    let h = start_with(config, ledger);
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert!(h.swarm.searches().is_empty());
    h.node.shutdown().await;
}
