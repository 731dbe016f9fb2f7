//! partcache binary: run an in-process grid and exercise it

use clap::{Parser, Subcommand};
use partcache::{ops, Config, Grid, NodeRole};
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "partcache")]
#[command(about = "Partitioned, replicated, transactional cache grid", version = partcache::VERSION)]
struct Cli {
    /// Config file (defaults to ./partcache.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the number of server nodes
    #[arg(long, global = true)]
    grid_count: Option<usize>,

    /// Override the number of backups per partition
    #[arg(long, global = true)]
    backups: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load keys, read them back from every node, run a transfer transaction
    Smoke {
        #[arg(long, default_value = "1000")]
        keys: usize,
    },
    /// Load keys and check that every backup matches its primary
    Verify {
        #[arg(long, default_value = "1000")]
        keys: usize,
    },
    /// Load keys, stop a server, and check every key is still readable
    Failover {
        #[arg(long, default_value = "1000")]
        keys: usize,
        /// Node to stop
        #[arg(long, default_value = "0")]
        node: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(n) = cli.grid_count {
        config.grid.grid_count = n;
    }
    if let Some(n) = cli.backups {
        config.cache.backups = n;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let grid = Grid::start_with_cache(&config).await?;
    let name = config.cache.name.clone();

    match cli.command {
        Commands::Smoke { keys } => smoke(&grid, &name, keys).await?,
        Commands::Verify { keys } => {
            load(&grid, &name, keys).await?;
            let report = ops::verify_cache(&grid, &name).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_healthy() {
                anyhow::bail!("cache '{}' failed verification", name);
            }
        }
        Commands::Failover { keys, node } => {
            load(&grid, &name, keys).await?;
            grid.stop_node(node)?;
            let reader = grid
                .node_ids()
                .first()
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no live node left"))?;
            let cache = grid.cache(reader, &name)?;
            let mut missing = 0;
            for i in 0..keys {
                if cache.get(&format!("key-{}", i)).await?.is_none() {
                    missing += 1;
                }
            }
            println!("stopped node {}: {} of {} keys missing", node, missing, keys);
            if missing > 0 {
                anyhow::bail!("{} keys lost after failover", missing);
            }
        }
    }

    println!("{}", partcache::common::METRICS.to_prometheus());
    grid.shutdown();
    Ok(())
}

async fn load(grid: &Grid, name: &str, keys: usize) -> anyhow::Result<()> {
    let cache = grid.cache(0, name)?;
    let start = Instant::now();
    let mut streamer = cache.streamer().allow_overwrite(true);
    for i in 0..keys {
        streamer.add_data(&format!("key-{}", i), format!("value-{}", i)).await?;
    }
    let report = streamer.close().await?;
    println!("loaded {} keys in {:?}", report.applied, start.elapsed());
    Ok(())
}

async fn smoke(grid: &Grid, name: &str, keys: usize) -> anyhow::Result<()> {
    load(grid, name, keys).await?;

    let client = grid.join(NodeRole::Client);
    for id in grid.node_ids() {
        let cache = grid.cache(id, name)?;
        let start = Instant::now();
        for i in 0..keys {
            let expected = format!("value-{}", i);
            let got = cache.get(&format!("key-{}", i)).await?;
            if got.as_deref() != Some(expected.as_bytes()) {
                anyhow::bail!("node {} read {:?} for key-{}", id, got, i);
            }
        }
        println!(
            "node {}{}: read {} keys in {:?}",
            id,
            if id == client { " (client)" } else { "" },
            keys,
            start.elapsed()
        );
    }

    let cache = grid.cache(client, name)?;
    cache.put("balance-a", "100").await?;
    cache.put("balance-b", "0").await?;
    let mut tx = cache.tx_start();
    tx.get_for_update("balance-a").await?;
    tx.put("balance-a", "60").await?;
    tx.put("balance-b", "40").await?;
    tx.commit().await?;
    println!(
        "transfer committed: a={:?} b={:?}",
        cache.get("balance-a").await?,
        cache.get("balance-b").await?
    );
    println!("cache size: {}", cache.size().await?);
    Ok(())
}
