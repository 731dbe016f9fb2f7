//! Transaction tests: two-phase commit, lock ordering, deadlines

use bytes::Bytes;
use partcache::common::{key_hash, timestamp_now_millis};
use partcache::grid::protocol::{PeerRequest, PeerResponse, TxWrite};
use partcache::{
    AbortReason, CacheConfig, Config, Error, Grid, GridConfig, GridEvent, TxId, TxIsolation, TxState,
};
use std::time::{Duration, Instant};

fn config(cache: CacheConfig) -> Config {
    Config {
        grid: GridConfig {
            grid_count: 3,
            client_count: 1,
            partitions: 64,
            ..Default::default()
        },
        cache,
        ..Default::default()
    }
}

fn b(s: &str) -> Option<Bytes> {
    Some(Bytes::copy_from_slice(s.as_bytes()))
}

/// Two keys sorted by the order transactions lock them in
fn ordered_pair(grid: &Grid, cache: &str, a: &str, b: &str) -> (String, String) {
    let map = grid.partition_map(cache).unwrap();
    let order = |k: &str| (map.partition_of(k), key_hash(k), k.to_string());
    if order(a) < order(b) {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commit_is_visible_everywhere() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;
    let cache = grid.cache(3, name).unwrap();
    cache.put("A", "0").await.unwrap();
    cache.put("B", "0").await.unwrap();

    // Warm every near cache with the old values
    for id in grid.node_ids() {
        grid.cache(id, name).unwrap().get("A").await.unwrap();
    }

    let mut tx = cache.tx_start();
    assert_eq!(tx.state(), TxState::Active);
    assert_eq!(tx.get_for_update("A").await.unwrap(), b("0"));
    tx.put("A", "1").await.unwrap();
    tx.put("B", "1").await.unwrap();
    // Own writes are visible inside the transaction
    assert_eq!(tx.get("A").await.unwrap(), b("1"));
    tx.commit().await.unwrap();

    for id in grid.node_ids() {
        let cache = grid.cache(id, name).unwrap();
        assert_eq!(cache.get("A").await.unwrap(), b("1"), "node {}", id);
        assert_eq!(cache.get("B").await.unwrap(), b("1"), "node {}", id);
    }
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rollback_discards_writes() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let cache = grid.cache(1, &cfg.cache.name).unwrap();
    cache.put("A", "0").await.unwrap();
    let mut events = grid.subscribe_events();

    let mut tx = cache.tx_start();
    let id = tx.id();
    tx.put("A", "1").await.unwrap();
    assert!(tx.remove("A").await.unwrap());
    tx.rollback().await.unwrap();
    assert_eq!(cache.get("A").await.unwrap(), b("0"));

    let record = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    match record.event {
        GridEvent::TransactionRolledBack { tx, reason, .. } => {
            assert_eq!(tx, id);
            assert_eq!(reason, AbortReason::Explicit);
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Dropping an open transaction releases its locks too
    {
        let mut tx = cache.tx_start();
        tx.put("A", "dropped").await.unwrap();
    }
    cache.put("A", "2").await.unwrap();
    assert_eq!(cache.get("A").await.unwrap(), b("2"));
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_lock_order_does_not_deadlock() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;
    let (lo, hi) = ordered_pair(&grid, name, "left", "right");

    let mut tx1 = grid.cache(1, name).unwrap().tx_start();
    let mut tx2 = grid.cache(2, name).unwrap().tx_start();
    tx1.put(&lo, "t1").await.unwrap();
    tx2.put(&hi, "t2").await.unwrap();

    // tx2 goes back for the lower key while tx1 holds it
    let (lo2, hi2) = (lo.clone(), hi.clone());
    let second = tokio::spawn(async move {
        tx2.put(&lo2, "t2").await?;
        tx2.commit().await
    });

    tx1.put(&hi, "t1").await.unwrap();
    tx1.commit().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .expect("transactions deadlocked")
        .unwrap()
        .unwrap();

    let cache = grid.cache(0, name).unwrap();
    assert_eq!(cache.get(&lo).await.unwrap(), b("t2"));
    assert_eq!(cache.get(&hi2).await.unwrap(), b("t2"));
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reordered_read_aborts_when_version_changed() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;
    let (lo, hi) = ordered_pair(&grid, name, "left", "right");
    grid.cache(0, name).unwrap().put(&hi, "0").await.unwrap();

    let mut tx1 = grid.cache(1, name).unwrap().tx_start();
    let mut tx2 = grid.cache(2, name).unwrap().tx_start();
    tx1.put(&lo, "t1").await.unwrap();
    assert_eq!(tx2.get_for_update(&hi).await.unwrap(), b("0"));

    let lo2 = lo.clone();
    let second = tokio::spawn(async move { tx2.put(&lo2, "t2").await });

    tx1.put(&hi, "t1").await.unwrap();
    tx1.commit().await.unwrap();

    let err = second.await.unwrap().unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::VersionChanged), "{}", err);
    assert_eq!(err.conflicting_key(), Some(hi.as_str()));

    let cache = grid.cache(0, name).unwrap();
    assert_eq!(cache.get(&lo).await.unwrap(), b("t1"));
    assert_eq!(cache.get(&hi).await.unwrap(), b("t1"));
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_primary_fails_prepare() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;
    let key = grid.key_with_primary(name, "A", 0).unwrap();
    let cache = grid.cache(1, name).unwrap();
    cache.put(&key, "0").await.unwrap();

    let mut tx = cache.tx_start();
    tx.put(&key, "1").await.unwrap();
    grid.disconnect(0);

    let err = tx.commit().await.unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::NodeUnreachable), "{}", err);
    assert_eq!(err.conflicting_key(), Some(key.as_str()));

    grid.reconnect(0);
    assert_eq!(grid.cache(2, name).unwrap().get(&key).await.unwrap(), b("0"));
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deadline_rolls_back() {
    let cfg = config(CacheConfig {
        tx_timeout_ms: 150,
        ..Default::default()
    });
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let cache = grid.cache(2, &cfg.cache.name).unwrap();

    let mut tx = cache.tx_start();
    tx.put("A", "late").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(tx.state(), TxState::RolledBack(AbortReason::Deadline));

    let err = tx.commit().await.unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::Deadline));
    assert_eq!(cache.get("A").await.unwrap(), None);

    // The lock went with the transaction
    cache.put("A", "next").await.unwrap();
    assert_eq!(cache.get("A").await.unwrap(), b("next"));
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocked_waiter_gives_up() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;

    let mut holder = grid.cache(1, name).unwrap().tx_start();
    holder.put("A", "holder").await.unwrap();

    let start = Instant::now();
    let mut waiter = grid
        .cache(2, name)
        .unwrap()
        .tx_start_with_timeout(TxIsolation::RepeatableRead, Duration::from_millis(300));
    let err = waiter.put("A", "waiter").await.unwrap_err();
    assert!(start.elapsed() >= Duration::from_millis(250));
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(
        matches!(
            err.abort_reason(),
            Some(AbortReason::LockConflict) | Some(AbortReason::Deadline)
        ),
        "{}",
        err
    );
    assert!(matches!(waiter.state(), TxState::RolledBack(_)));
    assert!(waiter.commit().await.is_err());

    holder.commit().await.unwrap();
    assert_eq!(grid.cache(0, name).unwrap().get("A").await.unwrap(), b("holder"));
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_direct_write_waits_for_lock() {
    let cfg = config(CacheConfig {
        tx_enabled: false,
        ..Default::default()
    });
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;

    let mut tx = grid.cache(1, name).unwrap().tx_start();
    tx.put("A", "tx").await.unwrap();

    let direct = grid.cache(2, name).unwrap();
    let handle = tokio::spawn(async move { direct.put("A", "direct").await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!handle.is_finished());

    tx.commit().await.unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(grid.cache(0, name).unwrap().get("A").await.unwrap(), b("direct"));
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_committed_sees_new_commits() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;
    let cache = grid.cache(1, name).unwrap();
    cache.put("A", "0").await.unwrap();

    let mut rc = cache.tx_start_with(TxIsolation::ReadCommitted);
    assert_eq!(rc.isolation(), TxIsolation::ReadCommitted);
    assert_eq!(rc.get("A").await.unwrap(), b("0"));

    // Read-committed reads take no lock
    grid.cache(2, name).unwrap().put("A", "1").await.unwrap();
    assert_eq!(rc.get("A").await.unwrap(), b("1"));
    rc.commit().await.unwrap();

    let mut rr = cache.tx_start_with(TxIsolation::RepeatableRead);
    assert_eq!(rr.get("A").await.unwrap(), b("1"));
    assert_eq!(rr.get("A").await.unwrap(), b("1"));
    rr.commit().await.unwrap();
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalid_key_keeps_transaction_open() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let cache = grid.cache(0, &cfg.cache.name).unwrap();

    let mut tx = cache.tx_start();
    tx.put("A", "1").await.unwrap();
    tx.rollback().await.unwrap();

    let mut tx = cache.tx_start();
    assert!(matches!(tx.put("", "x").await, Err(Error::InvalidKey(_))));
    tx.commit().await.unwrap();
    assert_eq!(grid.node(0).unwrap().tx_manager().active_count(), 0);
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_prepare_leaves_every_primary_untouched() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;
    let on_zero = grid.key_with_primary(name, "A", 0).unwrap();
    let on_one = grid.key_with_primary(name, "B", 1).unwrap();
    let cache = grid.cache(3, name).unwrap();
    cache.put(&on_zero, "0").await.unwrap();
    cache.put(&on_one, "0").await.unwrap();

    let mut tx = cache.tx_start();
    tx.put(&on_zero, "1").await.unwrap();
    tx.put(&on_one, "1").await.unwrap();
    // Node 0 prepares, node 1 cannot be reached
    grid.disconnect(1);

    let err = tx.commit().await.unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::NodeUnreachable), "{}", err);
    grid.reconnect(1);

    for id in grid.node_ids() {
        let reader = grid.cache(id, name).unwrap();
        assert_eq!(reader.get(&on_zero).await.unwrap(), b("0"), "node {}", id);
        assert_eq!(reader.get(&on_one).await.unwrap(), b("0"), "node {}", id);
    }

    // The prepared primary let go of its lock
    let start = Instant::now();
    grid.cache(2, name).unwrap().put(&on_zero, "2").await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_uncommitted_writes_are_invisible() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;
    let key = grid.key_with_primary(name, "A", 0).unwrap();
    grid.cache(0, name).unwrap().put(&key, "0").await.unwrap();

    // Active: locked and buffered
    let mut tx = grid.cache(1, name).unwrap().tx_start();
    tx.put(&key, "1").await.unwrap();
    for id in [0, 2, 3] {
        assert_eq!(grid.cache(id, name).unwrap().get(&key).await.unwrap(), b("0"), "node {}", id);
    }
    tx.rollback().await.unwrap();

    // Preparing: staged at the primary, not yet applied
    let node = grid.node(2).unwrap();
    let id = TxId::new_v4();
    let locked = node
        .request(
            0,
            &PeerRequest::Lock {
                cache: name.clone(),
                tx: id,
                key: key.clone(),
                deadline_ms: timestamp_now_millis() + 10_000,
                wait_ms: 1_000,
            },
        )
        .await
        .unwrap();
    let expected = match locked {
        PeerResponse::Locked { entry } => entry.map(|e| e.version),
        other => panic!("unexpected lock response {:?}", other),
    };
    assert!(expected.is_some());
    let prepared = node
        .request(
            0,
            &PeerRequest::Prepare {
                cache: name.clone(),
                tx: id,
                writes: vec![TxWrite {
                    key: key.clone(),
                    value: b("staged"),
                    ttl_ms: None,
                    expected,
                }],
            },
        )
        .await
        .unwrap();
    assert!(matches!(prepared, PeerResponse::Prepared));

    for id in grid.node_ids() {
        assert_eq!(grid.cache(id, name).unwrap().get(&key).await.unwrap(), b("0"), "node {}", id);
    }

    node.request(0, &PeerRequest::Rollback { cache: name.clone(), tx: id })
        .await
        .unwrap();
    assert_eq!(grid.cache(3, name).unwrap().get(&key).await.unwrap(), b("0"));
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_commit_refused_after_lease_expired() {
    let mut cfg = config(CacheConfig::default());
    // Leases outlive the deadline by two request timeouts
    cfg.grid.request_timeout_ms = 50;
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;
    let key = grid.key_with_primary(name, "A", 0).unwrap();
    let node = grid.node(1).unwrap();
    let id = TxId::new_v4();

    node.request(
        0,
        &PeerRequest::Lock {
            cache: name.clone(),
            tx: id,
            key: key.clone(),
            deadline_ms: timestamp_now_millis(),
            wait_ms: 0,
        },
    )
    .await
    .unwrap();
    let prepare = PeerRequest::Prepare {
        cache: name.clone(),
        tx: id,
        writes: vec![TxWrite {
            key: key.clone(),
            value: b("late"),
            ttl_ms: None,
            expected: None,
        }],
    };
    assert!(matches!(node.request(0, &prepare).await.unwrap(), PeerResponse::Prepared));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let err = node
        .request(0, &PeerRequest::CommitApply { cache: name.clone(), tx: id })
        .await
        .unwrap_err();
    assert_eq!(err.abort_reason(), Some(AbortReason::Deadline), "{}", err);
    assert_eq!(grid.cache(2, name).unwrap().get(&key).await.unwrap(), None);
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_redelivered_commit_applies_once() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;
    let key = grid.key_with_primary(name, "A", 0).unwrap();
    let node = grid.node(1).unwrap();
    let id = TxId::new_v4();

    node.request(
        0,
        &PeerRequest::Lock {
            cache: name.clone(),
            tx: id,
            key: key.clone(),
            deadline_ms: timestamp_now_millis() + 10_000,
            wait_ms: 0,
        },
    )
    .await
    .unwrap();
    let prepare = PeerRequest::Prepare {
        cache: name.clone(),
        tx: id,
        writes: vec![TxWrite {
            key: key.clone(),
            value: b("v"),
            ttl_ms: None,
            expected: None,
        }],
    };
    node.request(0, &prepare).await.unwrap();

    let commit = PeerRequest::CommitApply { cache: name.clone(), tx: id };
    assert!(matches!(
        node.request(0, &commit).await.unwrap(),
        PeerResponse::Committed { changes: 1 }
    ));
    assert!(matches!(
        node.request(0, &commit).await.unwrap(),
        PeerResponse::Committed { changes: 0 }
    ));
    assert_eq!(grid.cache(2, name).unwrap().get(&key).await.unwrap(), b("v"));
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_expiry_after_lock_does_not_abort() {
    let cfg = config(CacheConfig::default());
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = &cfg.cache.name;
    let key = grid.key_with_primary(name, "A", 0).unwrap();
    grid.cache(1, name)
        .unwrap()
        .put_with_ttl(&key, "short", Duration::from_millis(150))
        .await
        .unwrap();

    let cache = grid.cache(2, name).unwrap();
    let mut tx = cache.tx_start();
    assert_eq!(tx.get_for_update(&key).await.unwrap(), b("short"));
    tx.put(&key, "long").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    tx.commit().await.unwrap();
    assert_eq!(cache.get(&key).await.unwrap(), b("long"));
    grid.shutdown();
}
