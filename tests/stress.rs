//! Stress test for a partcache grid: concurrent writers, latency, throughput

use bytes::Bytes;
use partcache::{CacheConfig, Config, Grid, GridConfig};
use std::time::Instant;

async fn write_read(grid_count: usize, keys_per_node: usize, tx: bool) {
    let cfg = Config {
        grid: GridConfig {
            grid_count,
            client_count: 1,
            partitions: 256,
            ..Default::default()
        },
        cache: CacheConfig {
            tx_enabled: tx,
            ..Default::default()
        },
        ..Default::default()
    };
    let grid = Grid::start_with_cache(&cfg).await.unwrap();
    let name = cfg.cache.name.clone();
    let nodes = grid.node_ids();

    let start = Instant::now();
    let mut writers = Vec::new();
    for node in &nodes {
        let cache = grid.cache(*node, &name).unwrap();
        let node = *node;
        writers.push(tokio::spawn(async move {
            for i in 0..keys_per_node {
                cache
                    .put(&format!("key_{}_{}", node, i), "stress_value")
                    .await
                    .unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }
    let write_time = start.elapsed();

    let start = Instant::now();
    for reader in &nodes {
        let cache = grid.cache(*reader, &name).unwrap();
        for node in &nodes {
            for i in 0..keys_per_node {
                assert_eq!(
                    cache.get(&format!("key_{}_{}", node, i)).await.unwrap(),
                    Some(Bytes::from("stress_value"))
                );
            }
        }
    }
    let read_time = start.elapsed();

    let total = keys_per_node * nodes.len();
    assert_eq!(grid.cache(0, &name).unwrap().size().await.unwrap(), total);
    println!("Write {} keys (tx={}): {:?}", total, tx, write_time);
    println!("Read {} keys from {} nodes: {:?}", total, nodes.len(), read_time);
    assert!(write_time.as_secs_f64() < 30.0, "Write too slow");
    assert!(read_time.as_secs_f64() < 30.0, "Read too slow");
    grid.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stress_write_read() {
    write_read(3, 250, true).await;
    write_read(3, 250, false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[cfg_attr(not(feature = "heavy-tests"), ignore)]
async fn stress_write_read_heavy() {
    write_read(8, 5_000, true).await;
}
