//! Derived cluster state snapshots.
//!
//! A snapshot is rebuilt in memory by the owning state manager and always
//! persisted whole; nothing here merges with what is already stored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{ActiveNode, NodeId, Replica, ShardAssignment, ShardId, ShardState, StatefulNode};

/// Pick the first replica, in placement order, that is currently live.
pub fn elect_shard_leader<V>(
    shard_id: ShardId,
    replica: &Replica,
    live_nodes: &BTreeMap<NodeId, V>,
) -> ShardState {
    replica
        .replicas
        .iter()
        .find(|id| live_nodes.contains_key(id))
        .map(|leader| ShardState::online(shard_id, *leader))
        .unwrap_or_else(|| ShardState::offline(shard_id))
}

/// State of one storage cluster as seen by the master
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageState {
    pub name: String,
    #[serde(default)]
    pub live_nodes: BTreeMap<NodeId, StatefulNode>,
    #[serde(default)]
    pub shard_assignments: BTreeMap<String, ShardAssignment>,
    #[serde(default)]
    pub shard_states: BTreeMap<String, BTreeMap<ShardId, ShardState>>,
}

impl StorageState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Live node ids in ascending order
    pub fn live_node_ids(&self) -> Vec<NodeId> {
        self.live_nodes.keys().copied().collect()
    }

    /// Replace a database's assignment and re-elect every shard leader from scratch.
    pub fn apply_shard_assignment(&mut self, assignment: ShardAssignment) {
        let states = assignment
            .shards
            .iter()
            .map(|(id, replica)| (*id, elect_shard_leader(*id, replica, &self.live_nodes)))
            .collect();
        self.shard_states.insert(assignment.name.clone(), states);
        self.shard_assignments
            .insert(assignment.name.clone(), assignment);
    }

    /// Mark a node live. Shards it replicates that are not online get it as leader.
    ///
    /// Returns whether anything changed, so a repeated startup is a no-op.
    pub fn node_startup(&mut self, node: StatefulNode) -> bool {
        let node_id = node.id;
        let mut changed = self.live_nodes.get(&node_id) != Some(&node);
        self.live_nodes.insert(node_id, node);

        for (database, assignment) in &self.shard_assignments {
            let states = self.shard_states.entry(database.clone()).or_default();
            for (shard_id, replica) in &assignment.shards {
                if !replica.contains(node_id) {
                    continue;
                }
                let online = states.get(shard_id).map(|s| s.is_online()).unwrap_or(false);
                if !online {
                    states.insert(*shard_id, ShardState::online(*shard_id, node_id));
                    changed = true;
                }
            }
        }
        changed
    }

    /// Drop a node and re-elect the shards it was leading.
    pub fn node_failure(&mut self, node_id: NodeId) -> bool {
        let mut changed = self.live_nodes.remove(&node_id).is_some();

        for (database, states) in self.shard_states.iter_mut() {
            let Some(assignment) = self.shard_assignments.get(database) else {
                continue;
            };
            for (shard_id, state) in states.iter_mut() {
                if state.leader != Some(node_id) {
                    continue;
                }
                *state = match assignment.shards.get(shard_id) {
                    Some(replica) => elect_shard_leader(*shard_id, replica, &self.live_nodes),
                    None => ShardState::offline(*shard_id),
                };
                changed = true;
            }
        }
        changed
    }

    /// Forget a database's assignment and shard states.
    pub fn drop_database(&mut self, database: &str) -> bool {
        let removed_assignment = self.shard_assignments.remove(database).is_some();
        let removed_states = self.shard_states.remove(database).is_some();
        removed_assignment || removed_states
    }

    pub fn shard_state(&self, database: &str, shard_id: ShardId) -> Option<&ShardState> {
        self.shard_states.get(database)?.get(&shard_id)
    }
}

/// State of one broker cluster as seen by the root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerState {
    pub name: String,
    /// Keyed by node indicator
    #[serde(default)]
    pub live_nodes: BTreeMap<String, ActiveNode>,
}

impl BrokerState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            live_nodes: BTreeMap::new(),
        }
    }
}

/// Shards hosted by one storage node, published by that node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    /// Storage cluster the node belongs to
    #[serde(default)]
    pub cluster: String,
    pub node: NodeId,
    #[serde(default)]
    pub shards: BTreeMap<String, Vec<ShardId>>,
}
