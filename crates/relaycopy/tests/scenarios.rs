//! End-to-end sessions between two nodes over an in-memory connection.

use std::time::{Duration, Instant};

use relaycopy::sync::{SyncError, MAX_CHUNK};
use relaycopy::{NodeConfig, NodeError, NodeOur};
use relaycopy_testkit::fixtures::{connect, fast_config, fast_session, init_tracing, NodePair};
use relaycopy_testkit::random_payload;

const MIB: usize = 1 << 20;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_transfer_is_delivered_and_acknowledged() -> anyhow::Result<()> {
    init_tracing();
    let pair = NodePair::new().await?;
    let payload = random_payload(1, 10 * MIB);
    let hash = pair.queue_a_to_b(100, "big.bin", payload.clone()).await?;
    let size = pair.a.outbound(&pair.b_id()).await?[0].size;

    let (caller, answerer) = pair.session().await;
    let (caller, answerer) = (caller?, answerer?);

    assert_eq!(caller.acknowledged, vec![hash]);
    assert_eq!(caller.bytes_tx, size);
    assert_eq!(answerer.received, vec![hash]);
    assert_eq!(answerer.bytes_rx, size);
    assert_eq!(answerer.integrity_failures, 0);
    assert!(pair.a.outbound(&pair.b_id()).await?.is_empty());

    let received = pair.b.received(&pair.a_id()).await?;
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].hash, hash);
    assert_eq!(received[0].size, size);

    let opened = pair.b.open_received(&pair.a_id(), &hash).await?;
    assert_eq!(opened.sender, pair.a_id());
    assert_eq!(opened.packet.path, b"big.bin");
    assert!(opened.payload == payload);
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seen_content_is_acknowledged_without_transfer() -> anyhow::Result<()> {
    init_tracing();
    let pair = NodePair::new().await?;
    let hash = pair.queue_a_to_b(100, "old.txt", b"delivered long ago".to_vec()).await?;
    pair.b.spool().mark_seen(&pair.a_id(), &hash).await?;

    let (caller, answerer) = pair.session().await;
    let (caller, answerer) = (caller?, answerer?);

    assert_eq!(caller.acknowledged, vec![hash]);
    assert_eq!(caller.bytes_tx, 0);
    assert_eq!(answerer.bytes_rx, 0);
    assert!(answerer.received.is_empty());
    assert!(pair.a.outbound(&pair.b_id()).await?.is_empty());
    assert!(pair.b.received(&pair.a_id()).await?.is_empty());
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_content_larger_than_free_space_is_skipped() -> anyhow::Result<()> {
    init_tracing();
    let pair = NodePair::with_configs(fast_config(), fast_config().with_spool_capacity(1000)).await?;
    let hash = pair.queue_a_to_b(100, "large.bin", random_payload(2, 10_000)).await?;

    let (caller, answerer) = pair.session().await;
    let (caller, answerer) = (caller?, answerer?);

    assert_eq!(answerer.skipped_for_space, 1);
    assert_eq!(caller.bytes_tx, 0);
    assert!(caller.acknowledged.is_empty());
    assert_eq!(pair.a.outbound(&pair.b_id()).await?[0].hash, hash);
    assert!(!pair.b.spool().part_path(&pair.a_id(), &hash).exists());
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_caller_is_refused() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::TempDir::new()?;
    let stranger = NodeOur::generate();
    let answerer = relaycopy_testkit::identity(9);
    let answerer_pub = answerer.their().clone();
    let answerer_id = answerer.id();

    let stranger = relaycopy::Node::open(stranger, [answerer_pub], dir.path().join("s"), fast_config()).await?;
    let answerer = relaycopy::Node::open(answerer, Vec::<relaycopy::NodeTheir>::new(), dir.path().join("a"), fast_config()).await?;

    let (conn_s, conn_a) = connect();
    let (called, served) = tokio::join!(stranger.call(conn_s, &answerer_id), answerer.serve(conn_a));

    assert!(matches!(served, Err(NodeError::Sync(SyncError::UnknownPeer(_)))));
    assert!(called.is_err());
    stranger.shutdown().await;
    answerer.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partial_file_is_resumed() -> anyhow::Result<()> {
    init_tracing();
    let pair = NodePair::new().await?;
    let hash = pair.queue_a_to_b(50, "resume.bin", random_payload(3, 700_000)).await?;
    let blob = tokio::fs::read(pair.a.spool().tx_path(&pair.b_id(), &hash)).await?;

    // An earlier session got this far before the link dropped.
    let have = 300_001;
    tokio::fs::create_dir_all(pair.b.spool().rx_dir(&pair.a_id())).await?;
    tokio::fs::write(pair.b.spool().part_path(&pair.a_id(), &hash), &blob[..have]).await?;

    let (caller, answerer) = pair.session().await;
    let (caller, answerer) = (caller?, answerer?);

    assert_eq!(caller.bytes_tx, (blob.len() - have) as u64);
    assert_eq!(answerer.received, vec![hash]);
    let landed = tokio::fs::read(pair.b.spool().rx_path(&pair.a_id(), &hash)).await?;
    assert!(landed == blob);
    assert!(!pair.b.spool().part_path(&pair.a_id(), &hash).exists());
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_partial_file_is_discarded() -> anyhow::Result<()> {
    init_tracing();
    let pair = NodePair::new().await?;
    let hash = pair.queue_a_to_b(50, "bad.bin", random_payload(4, 200_000)).await?;

    tokio::fs::create_dir_all(pair.b.spool().rx_dir(&pair.a_id())).await?;
    tokio::fs::write(pair.b.spool().part_path(&pair.a_id(), &hash), vec![0u8; 1000]).await?;

    let (caller, answerer) = pair.session().await;
    let (caller, answerer) = (caller?, answerer?);

    assert_eq!(answerer.integrity_failures, 1);
    assert!(answerer.received.is_empty());
    assert!(caller.acknowledged.is_empty());
    assert!(!pair.b.spool().has_complete(&pair.a_id(), &hash).await);
    assert!(!pair.b.spool().part_path(&pair.a_id(), &hash).exists());
    assert_eq!(pair.a.outbound(&pair.b_id()).await?.len(), 1);
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deferred_checks_still_acknowledge() -> anyhow::Result<()> {
    init_tracing();
    let deferred = NodeConfig::default().with_session(fast_session().with_defer_checks(true));
    let pair = NodePair::with_configs(fast_config(), deferred).await?;
    let hash = pair.queue_a_to_b(10, "later.txt", random_payload(5, 150_000)).await?;

    let (caller, answerer) = pair.session().await;
    let (caller, answerer) = (caller?, answerer?);

    assert_eq!(answerer.received, vec![hash]);
    assert_eq!(caller.acknowledged, vec![hash]);
    assert!(pair.b.spool().has_complete(&pair.a_id(), &hash).await);
    assert!(!pair.b.spool().has_nock(&pair.a_id(), &hash).await);
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_list_only_requests_nothing() -> anyhow::Result<()> {
    init_tracing();
    let listing = NodeConfig::default().with_session(fast_session().with_list_only(true));
    let pair = NodePair::with_configs(fast_config(), listing).await?;
    pair.queue_a_to_b(10, "look.txt", b"just looking".to_vec()).await?;

    let (caller, answerer) = pair.session().await;
    let (caller, answerer) = (caller?, answerer?);

    assert_eq!(caller.bytes_tx, 0);
    assert_eq!(answerer.bytes_rx, 0);
    assert_eq!(pair.a.outbound(&pair.b_id()).await?.len(), 1);
    assert!(pair.b.received(&pair.a_id()).await?.is_empty());
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nice_floor_and_allow_list_limit_the_session() -> anyhow::Result<()> {
    init_tracing();
    let pair = NodePair::new().await?;
    let urgent = pair.queue_a_to_b(5, "urgent", b"now".to_vec()).await?;
    let bulk = pair.queue_a_to_b(200, "bulk", b"whenever".to_vec()).await?;
    let other = pair.queue_a_to_b(5, "other", b"not this one".to_vec()).await?;

    // Reopen A's spool with a session that only offers what is urgent and
    // explicitly allowed.
    let picky = NodeConfig::default().with_session(fast_session().with_nice(100).with_only([urgent, bulk]));
    let a = relaycopy::Node::open(
        relaycopy_testkit::identity(1),
        [pair.b.our().their().clone()],
        pair.dir().join("a"),
        picky,
    )
    .await?;
    assert_eq!(a.id(), pair.a_id());

    let (conn_a, conn_b) = connect();
    let b_id = pair.b_id();
    let (caller, answerer) = tokio::join!(a.call(conn_a, &b_id), pair.b.serve(conn_b));
    let (caller, answerer) = (caller?, answerer?);

    assert_eq!(caller.acknowledged, vec![urgent]);
    assert_eq!(answerer.received, vec![urgent]);
    let left: Vec<_> = pair.a.outbound(&pair.b_id()).await?.into_iter().map(|e| e.hash).collect();
    assert_eq!(left.len(), 2);
    assert!(left.contains(&bulk));
    assert!(left.contains(&other));
    a.shutdown().await;
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_both_directions_in_one_session() -> anyhow::Result<()> {
    init_tracing();
    let pair = NodePair::new().await?;
    let to_b = pair.queue_a_to_b(20, "to-b", random_payload(6, 400_000)).await?;
    let to_a = pair.queue_b_to_a(20, "to-a", random_payload(7, 90_000)).await?;

    let (caller, answerer) = pair.session().await;
    let (caller, answerer) = (caller?, answerer?);

    assert_eq!(caller.received, vec![to_a]);
    assert_eq!(caller.acknowledged, vec![to_b]);
    assert_eq!(answerer.received, vec![to_b]);
    assert_eq!(answerer.acknowledged, vec![to_a]);

    let opened = pair.a.open_received(&pair.b_id(), &to_a).await?;
    assert_eq!(opened.packet.path, b"to-a");
    assert!(pair.a.spool().is_seen(&pair.b_id(), &to_a).await);
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unchecked_content_from_earlier_session_is_committed() -> anyhow::Result<()> {
    init_tracing();
    let pair = NodePair::new().await?;
    let hash = pair.queue_a_to_b(30, "crashed.bin", random_payload(10, 300_000)).await?;
    let blob = tokio::fs::read(pair.a.spool().tx_path(&pair.b_id(), &hash)).await?;

    // The process died after the last chunk but before the checksum ran.
    tokio::fs::create_dir_all(pair.b.spool().rx_dir(&pair.a_id())).await?;
    tokio::fs::write(pair.b.spool().nock_path(&pair.a_id(), &hash), &blob).await?;

    let (caller, answerer) = pair.session().await;
    let (caller, answerer) = (caller?, answerer?);

    assert_eq!(caller.bytes_tx, 0);
    assert_eq!(answerer.bytes_rx, 0);
    assert_eq!(caller.acknowledged, vec![hash]);
    assert!(pair.b.spool().has_complete(&pair.a_id(), &hash).await);
    assert!(!pair.b.spool().has_nock(&pair.a_id(), &hash).await);
    assert!(pair.a.outbound(&pair.b_id()).await?.is_empty());
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_online_time_ends_a_busy_session() -> anyhow::Result<()> {
    init_tracing();
    let cap = Duration::from_millis(500);
    let capped = fast_session()
        .with_online_deadline(Duration::from_secs(10))
        .with_max_online_time(cap)
        .with_rates(0, 5);
    let config = NodeConfig::default().with_session(capped);
    let pair = NodePair::with_configs(config.clone(), config).await?;
    let hash = pair.queue_a_to_b(10, "slow.bin", random_payload(11, 2 * MIB)).await?;
    let size = pair.a.outbound(&pair.b_id()).await?[0].size;

    let started = Instant::now();
    let (caller, answerer) = pair.session().await;
    let elapsed = started.elapsed();
    let (caller, answerer) = (caller?, answerer?);

    assert!(elapsed >= cap, "ended after {:?}", elapsed);
    assert!(elapsed < cap + Duration::from_secs(1), "ended after {:?}", elapsed);
    assert!(caller.bytes_tx > 0);
    assert!(caller.bytes_tx < size);
    assert!(caller.acknowledged.is_empty());
    assert!(answerer.received.is_empty());
    assert!(pair.b.spool().part_path(&pair.a_id(), &hash).exists());
    assert_eq!(pair.a.outbound(&pair.b_id()).await?.len(), 1);
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tx_rate_spaces_out_chunks() -> anyhow::Result<()> {
    init_tracing();
    let slow = NodeConfig::default().with_session(fast_session().with_rates(0, 10));
    let pair = NodePair::with_configs(slow, fast_config()).await?;
    let hash = pair.queue_a_to_b(10, "paced.bin", random_payload(12, 5 * MAX_CHUNK)).await?;
    let size = pair.a.outbound(&pair.b_id()).await?[0].size;
    let chunks = ((size + MAX_CHUNK as u64 - 1) / MAX_CHUNK as u64) as u32;
    assert!(chunks >= 6);

    let (caller, answerer) = pair.session().await;
    let (caller, answerer) = (caller?, answerer?);

    assert_eq!(caller.acknowledged, vec![hash]);
    assert_eq!(answerer.received, vec![hash]);
    assert_eq!(caller.bytes_tx, size);
    // One pause between consecutive chunks, then the idle deadline.
    let floor = Duration::from_millis(100) * (chunks - 1) + Duration::from_millis(600);
    assert!(caller.duration >= floor, "{:?} < {:?}", caller.duration, floor);
    pair.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pings_alone_do_not_keep_a_session_open() -> anyhow::Result<()> {
    init_tracing();
    let pair = NodePair::new().await?;

    let started = Instant::now();
    let (caller, answerer) = tokio::time::timeout(Duration::from_secs(5), pair.session()).await?;
    let elapsed = started.elapsed();
    let (caller, answerer) = (caller?, answerer?);

    // Pings go out every 200 ms, the deadline is 600 ms.
    assert!(elapsed >= Duration::from_millis(600), "ended after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1800), "ended after {:?}", elapsed);
    assert_eq!(caller.bytes_tx + answerer.bytes_tx, 0);
    pair.shutdown().await;
    Ok(())
}
