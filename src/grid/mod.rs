//! The grid: node membership, partition maps and node lifecycle.
//!
//! A `Grid` is the in-process equivalent of a cluster. It owns the shared
//! context every node sees (transport, registry, partition maps, events) and
//! the handles of the node tasks. Starting a grid spawns one dispatcher and
//! one maintenance task per node; stopping a node removes it from the
//! registry and republishes the partition maps of every cache.

pub mod node;
pub mod partition_map;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use node::{Node, NodeCache};
pub use partition_map::{Owners, PartitionMap, PartitionRole};
pub use registry::{NodeInfo, NodeRegistry, NodeRole};

use crate::cache::Cache;
use crate::common::{
    CacheConfig, Config, Error, EventBus, EventRecord, GridConfig, GridEvent, Result, METRICS,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use transport::Transport;

pub type NodeId = u32;
pub type PartitionId = u32;

/// State shared by every node of a grid
pub(crate) struct GridContext {
    pub config: GridConfig,
    pub transport: Arc<Transport>,
    pub registry: RwLock<NodeRegistry>,
    pub caches: RwLock<HashMap<String, CacheConfig>>,
    pub maps: RwLock<HashMap<String, Arc<PartitionMap>>>,
    pub events: EventBus,
}

impl GridContext {
    pub fn map(&self, cache: &str) -> Result<Arc<PartitionMap>> {
        self.maps
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(cache)
            .cloned()
            .ok_or_else(|| Error::CacheNotFound(cache.to_string()))
    }

    pub fn live_servers(&self) -> Vec<NodeId> {
        self.registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .live_servers()
    }
}

struct NodeHandle {
    node: Arc<Node>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    fn shutdown(self) {
        self.node.stop();
        for task in self.tasks {
            task.abort();
        }
    }
}

pub struct Grid {
    ctx: Arc<GridContext>,
    nodes: RwLock<HashMap<NodeId, NodeHandle>>,
}

impl Grid {
    /// Start `grid_count` servers and `client_count` clients with no caches
    pub async fn start(config: GridConfig) -> Result<Grid> {
        config.validate()?;
        let ctx = Arc::new(GridContext {
            transport: Arc::new(Transport::new(config.request_timeout())),
            registry: RwLock::new(NodeRegistry::new()),
            caches: RwLock::new(HashMap::new()),
            maps: RwLock::new(HashMap::new()),
            events: EventBus::new(),
            config,
        });
        let grid = Grid {
            ctx,
            nodes: RwLock::new(HashMap::new()),
        };

        for _ in 0..grid.ctx.config.grid_count {
            grid.spawn_node(NodeRole::Server);
        }
        for _ in 0..grid.ctx.config.client_count {
            grid.spawn_node(NodeRole::Client);
        }

        tracing::info!(
            servers = grid.ctx.config.grid_count,
            clients = grid.ctx.config.client_count,
            partitions = grid.ctx.config.partitions,
            "Grid started"
        );
        Ok(grid)
    }

    /// Start a grid and create the configured cache on it
    pub async fn start_with_cache(config: &Config) -> Result<Grid> {
        config.validate()?;
        let grid = Grid::start(config.grid.clone()).await?;
        grid.create_cache(config.cache.clone())?;
        Ok(grid)
    }

    fn spawn_node(&self, role: NodeRole) -> NodeId {
        let id = self
            .ctx
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(role);

        let node = Node::new(id, role, Arc::clone(&self.ctx));
        for config in self.cache_configs().into_values() {
            node.open_cache(config);
        }

        let (tx, rx) = mpsc::channel(self.ctx.config.mailbox_capacity);
        self.ctx.transport.register(id, tx);
        let tasks = vec![node.spawn_dispatcher(rx), node.spawn_maintenance()];

        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, NodeHandle { node, tasks });
        METRICS.live_nodes.inc();
        id
    }

    fn cache_configs(&self) -> HashMap<String, CacheConfig> {
        self.ctx
            .caches
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn live_nodes(&self) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|h| Arc::clone(&h.node))
            .collect();
        nodes.sort_by_key(|n| n.id());
        nodes
    }

    pub fn create_cache(&self, config: CacheConfig) -> Result<()> {
        config.validate()?;
        {
            let mut caches = self.ctx.caches.write().unwrap_or_else(|e| e.into_inner());
            if caches.contains_key(&config.name) {
                return Err(Error::CacheExists(config.name));
            }
            caches.insert(config.name.clone(), config.clone());
        }

        for node in self.live_nodes() {
            node.open_cache(config.clone());
        }
        self.publish_map(&config, &[]);

        tracing::info!(
            cache = %config.name,
            backups = config.backups,
            near = config.near_enabled,
            tx = config.tx_enabled,
            write_sync = ?config.write_sync,
            "Cache created"
        );
        Ok(())
    }

    pub fn destroy_cache(&self, name: &str) -> Result<()> {
        if self
            .ctx
            .caches
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_none()
        {
            return Err(Error::CacheNotFound(name.to_string()));
        }
        self.ctx
            .maps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        for node in self.live_nodes() {
            node.close_cache(name);
        }
        tracing::info!(cache = %name, "Cache destroyed");
        Ok(())
    }

    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cache_configs().into_keys().collect();
        names.sort();
        names
    }

    /// Compute and install the partition map of one cache
    fn publish_map(&self, config: &CacheConfig, departed: &[NodeId]) {
        let (version, live) = {
            let registry = self.ctx.registry.read().unwrap_or_else(|e| e.into_inner());
            (registry.topology_version(), registry.live_servers())
        };
        let map = Arc::new(PartitionMap::compute(
            &config.name,
            self.ctx.config.partitions,
            config.backups,
            &live,
            version,
        ));
        self.ctx
            .maps
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(config.name.clone(), Arc::clone(&map));

        for node in self.live_nodes() {
            node.on_topology_change(&config.name, &map, departed);
        }

        let required = config.backups + 1;
        if live.len() < required {
            tracing::warn!(
                cache = %config.name,
                live_servers = live.len(),
                required,
                "Cache is under-replicated"
            );
            self.ctx.events.publish(GridEvent::UnderReplicated {
                cache: config.name.clone(),
                live_servers: live.len(),
                required,
            });
        }
    }

    fn republish_maps(&self, departed: &[NodeId]) {
        for config in self.cache_configs().into_values() {
            self.publish_map(&config, departed);
        }
        let (version, live) = {
            let registry = self.ctx.registry.read().unwrap_or_else(|e| e.into_inner());
            (registry.topology_version(), registry.live_servers())
        };
        tracing::info!(version, live_servers = ?live, "Topology changed");
        self.ctx.events.publish(GridEvent::TopologyChanged {
            version,
            live_servers: live,
        });
    }

    /// Add a node to a running grid. A new server takes over partitions
    /// empty-handed; data is not rebalanced.
    pub fn join(&self, role: NodeRole) -> NodeId {
        let id = self.spawn_node(role);
        self.republish_maps(&[]);
        id
    }

    /// Stop a node as if it crashed
    pub fn stop_node(&self, id: NodeId) -> Result<()> {
        let handle = self
            .nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .ok_or(Error::NodeNotFound(id))?;
        handle.shutdown();
        self.ctx.transport.unregister(id);
        self.ctx
            .registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .mark_dead(id)?;
        METRICS.live_nodes.dec();

        tracing::warn!(node = id, "Node stopped");
        self.republish_maps(&[id]);
        Ok(())
    }

    /// Cut a node off the network without removing it from the grid
    pub fn disconnect(&self, id: NodeId) {
        self.ctx.transport.disconnect(id);
    }

    pub fn reconnect(&self, id: NodeId) {
        self.ctx.transport.reconnect(id);
    }

    /// Handle to a cache through a specific node
    pub fn cache(&self, node: NodeId, name: &str) -> Result<Cache> {
        let node = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&node)
            .map(|h| Arc::clone(&h.node))
            .ok_or(Error::NodeNotFound(node))?;
        let config = node.cache_state(name)?.config().clone();
        Ok(Cache::new(node, config))
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|h| Arc::clone(&h.node))
    }

    /// Live node ids
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.live_nodes().iter().map(|n| n.id()).collect()
    }

    pub fn server_ids(&self) -> Vec<NodeId> {
        self.ctx.live_servers()
    }

    pub fn client_ids(&self) -> Vec<NodeId> {
        self.live_nodes()
            .iter()
            .filter(|n| n.role() == NodeRole::Client)
            .map(|n| n.id())
            .collect()
    }

    pub fn nodes_info(&self) -> Vec<NodeInfo> {
        self.ctx
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn topology_version(&self) -> u64 {
        self.ctx
            .registry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .topology_version()
    }

    pub fn partition_map(&self, cache: &str) -> Result<Arc<PartitionMap>> {
        self.ctx.map(cache)
    }

    pub fn primary_of(&self, cache: &str, key: &str) -> Result<NodeId> {
        Ok(self.ctx.map(cache)?.owners_of_key(key)?.1.primary)
    }

    pub fn backups_of(&self, cache: &str, key: &str) -> Result<Vec<NodeId>> {
        Ok(self.ctx.map(cache)?.owners_of_key(key)?.1.backups)
    }

    /// Find a key whose primary is `node`, trying `prefix0`, `prefix1`, ...
    pub fn key_with_primary(&self, cache: &str, prefix: &str, node: NodeId) -> Result<String> {
        let map = self.ctx.map(cache)?;
        (0..map.partitions() as usize * 64)
            .map(|i| format!("{}{}", prefix, i))
            .find(|key| map.owners_of_key(key).map(|(_, o)| o.primary == node).unwrap_or(false))
            .ok_or_else(|| Error::Internal(format!("node {} owns no partition of '{}'", node, cache)))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventRecord> {
        self.ctx.events.subscribe()
    }

    /// Stop every node
    pub fn shutdown(&self) {
        let handles: Vec<(NodeId, NodeHandle)> = self
            .nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (id, handle) in handles {
            handle.shutdown();
            self.ctx.transport.unregister(id);
            METRICS.live_nodes.dec();
        }
        tracing::info!("Grid stopped");
    }
}

impl Drop for Grid {
    fn drop(&mut self) {
        let handles: Vec<NodeHandle> = self
            .nodes
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in handles {
            handle.shutdown();
            METRICS.live_nodes.dec();
        }
    }
}
