//! Bulk loading tests

use bytes::Bytes;
use partcache::{CacheConfig, Config, Error, Grid, GridConfig};

fn config(tx: bool) -> Config {
    Config {
        grid: GridConfig {
            grid_count: 3,
            client_count: 1,
            partitions: 64,
            ..Default::default()
        },
        cache: CacheConfig {
            tx_enabled: tx,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_updates_after_load_reach_near_caches() {
    for tx in [true, false] {
        let cfg = config(tx);
        let grid = Grid::start_with_cache(&cfg).await.unwrap();
        let name = &cfg.cache.name;

        let mut streamer = grid.cache(0, name).unwrap().streamer().buffer_size(16);
        for i in 0..100 {
            streamer.add_data(&format!("key-{}", i), "loaded").await.unwrap();
        }
        let report = streamer.close().await.unwrap();
        assert_eq!(report.applied, 100);
        assert_eq!(report.skipped, 0);

        // The client node caches every key
        let reader = grid.cache(3, name).unwrap();
        for i in 0..100 {
            assert_eq!(
                reader.get(&format!("key-{}", i)).await.unwrap(),
                Some(Bytes::from("loaded"))
            );
        }
        assert_eq!(reader.near_size(), 100);

        let writer = grid.cache(1, name).unwrap();
        for i in 0..100 {
            writer.put(&format!("key-{}", i), "updated").await.unwrap();
        }
        for i in 0..100 {
            assert_eq!(
                reader.get(&format!("key-{}", i)).await.unwrap(),
                Some(Bytes::from("updated")),
                "tx={} key-{}",
                tx,
                i
            );
        }
        grid.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overwrite_policy() {
    let cfg = config(true);
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let cache = grid.cache(2, &cfg.cache.name).unwrap();
    cache.put("key-0", "existing").await.unwrap();

    let mut streamer = cache.streamer();
    streamer.add_data("key-0", "streamed").await.unwrap();
    streamer.add_data("key-1", "streamed").await.unwrap();
    let report = streamer.close().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(cache.get("key-0").await.unwrap(), Some(Bytes::from("existing")));
    assert_eq!(cache.get("key-1").await.unwrap(), Some(Bytes::from("streamed")));

    let mut streamer = cache.streamer().allow_overwrite(true);
    streamer.add_data("key-0", "overwritten").await.unwrap();
    assert_eq!(streamer.report().applied, 0);
    let report = streamer.close().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(cache.get("key-0").await.unwrap(), Some(Bytes::from("overwritten")));
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejects_invalid_keys() {
    let cfg = config(false);
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let mut streamer = grid.cache(0, &cfg.cache.name).unwrap().streamer();
    assert!(matches!(streamer.add_data("", "x").await, Err(Error::InvalidKey(_))));
    assert_eq!(streamer.close().await.unwrap().applied, 0);
    grid.shutdown();
}
