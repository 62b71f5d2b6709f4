//! Shard placement and shard state records

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::NodeId;

pub type ShardId = u32;

/// Nodes hosting one shard, in placement order (first is the preferred leader)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub replicas: Vec<NodeId>,
}

impl Replica {
    pub fn new(replicas: Vec<NodeId>) -> Self {
        Self { replicas }
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.replicas.contains(&node_id)
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

/// Replica placement of every shard of one database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    /// Database name
    pub name: String,
    pub shards: BTreeMap<ShardId, Replica>,
}

impl ShardAssignment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shards: BTreeMap::new(),
        }
    }

    pub fn add_replica(&mut self, shard_id: ShardId, node_id: NodeId) {
        self.shards
            .entry(shard_id)
            .or_default()
            .replicas
            .push(node_id);
    }

    pub fn num_of_shard(&self) -> usize {
        self.shards.len()
    }

    /// Shards with a replica on `node_id`
    pub fn shards_of(&self, node_id: NodeId) -> Vec<ShardId> {
        self.shards
            .iter()
            .filter(|(_, replica)| replica.contains(node_id))
            .map(|(id, _)| *id)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardStateType {
    Online,
    Offline,
}

/// Derived serving state of one shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub id: ShardId,
    pub state: ShardStateType,
    /// `None` means no leader
    pub leader: Option<NodeId>,
}

impl ShardState {
    pub fn online(id: ShardId, leader: NodeId) -> Self {
        Self {
            id,
            state: ShardStateType::Online,
            leader: Some(leader),
        }
    }

    pub fn offline(id: ShardId) -> Self {
        Self {
            id,
            state: ShardStateType::Offline,
            leader: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state == ShardStateType::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_helpers() {
        let mut assignment = ShardAssignment::new("cpu");
        assignment.add_replica(0, 1);
        assignment.add_replica(0, 2);
        assignment.add_replica(1, 2);
        assignment.add_replica(1, 3);

        assert_eq!(assignment.num_of_shard(), 2);
        assert_eq!(assignment.shards[&0].replicas, vec![1, 2]);
        assert_eq!(assignment.shards_of(2), vec![0, 1]);
        assert_eq!(assignment.shards_of(3), vec![1]);
        assert!(assignment.shards_of(9).is_empty());
    }

    #[test]
    fn test_assignment_json_keys() {
        let mut assignment = ShardAssignment::new("cpu");
        assignment.add_replica(7, 1);
        let json = serde_json::to_string(&assignment).unwrap();
        assert!(json.contains(r#""7":{"replicas":[1]}"#));
        let back: ShardAssignment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, assignment);
    }

    #[test]
    fn test_offline_has_no_leader() {
        let state = ShardState::offline(3);
        assert!(!state.is_online());
        assert_eq!(state.leader, None);
    }
}
