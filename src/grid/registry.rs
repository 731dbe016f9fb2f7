//! Node registry
//!
//! Arena of grid members indexed by stable integer ids. Ids are handed out
//! in join order and never reused, so the partition map can refer to nodes
//! by id without holding node handles.

use crate::common::{Error, NodeState, Result};
use crate::grid::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Owns partitions
    Server,
    /// Owns nothing; reads through the near cache
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub role: NodeRole,
    pub state: NodeState,
    /// Topology version at which the node joined
    pub joined_at: u64,
}

#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: Vec<NodeInfo>,
    topology_version: u64,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node; bumps the topology version
    pub fn register(&mut self, role: NodeRole) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.topology_version += 1;
        let prefix = match role {
            NodeRole::Server => "server",
            NodeRole::Client => "client",
        };
        self.nodes.push(NodeInfo {
            id,
            name: format!("{}-{}", prefix, id),
            role,
            state: NodeState::Alive,
            joined_at: self.topology_version,
        });
        id
    }

    /// Mark a node dead; bumps the topology version if it was alive
    pub fn mark_dead(&mut self, id: NodeId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(id as usize)
            .ok_or(Error::NodeNotFound(id))?;
        if node.state.is_healthy() {
            node.state = NodeState::Dead;
            self.topology_version += 1;
        }
        Ok(())
    }

    pub fn get(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(id as usize)
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.get(id).map(|n| n.state.is_healthy()).unwrap_or(false)
    }

    /// Live server ids, in assignment order
    pub fn live_servers(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.role == NodeRole::Server && n.state.is_healthy())
            .map(|n| n.id)
            .collect()
    }

    pub fn live_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.state.is_healthy())
            .map(|n| n.id)
            .collect()
    }

    pub fn topology_version(&self) -> u64 {
        self.topology_version
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_sequential_ids() {
        let mut reg = NodeRegistry::new();
        let a = reg.register(NodeRole::Server);
        let b = reg.register(NodeRole::Server);
        let c = reg.register(NodeRole::Client);

        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(reg.topology_version(), 3);
        assert_eq!(reg.live_servers(), vec![0, 1]);
        assert_eq!(reg.live_nodes(), vec![0, 1, 2]);
        assert_eq!(reg.get(2).unwrap().name, "client-2");
    }

    #[test]
    fn test_mark_dead() {
        let mut reg = NodeRegistry::new();
        reg.register(NodeRole::Server);
        reg.register(NodeRole::Server);

        reg.mark_dead(0).unwrap();
        assert!(!reg.is_alive(0));
        assert_eq!(reg.live_servers(), vec![1]);
        assert_eq!(reg.topology_version(), 3);

        // Idempotent
        reg.mark_dead(0).unwrap();
        assert_eq!(reg.topology_version(), 3);

        assert!(matches!(reg.mark_dead(9), Err(Error::NodeNotFound(9))));
    }
}
