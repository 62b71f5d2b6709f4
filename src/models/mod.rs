//! Cluster records persisted in the state repository
//!
//! Every record is JSON encoded so that unknown fields written by newer
//! versions are tolerated on read.

pub mod database;
pub mod node;
pub mod shard;
pub mod state;

pub use database::{ClusterConfig, Database, DatabaseLimits, DatabaseOption};
pub use node::{ActiveNode, Master, Node, NodeId, StatefulNode};
pub use shard::{Replica, ShardAssignment, ShardId, ShardState, ShardStateType};
pub use state::{BrokerState, ReplicaState, StorageState};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Decode a record read from the repository
pub fn decode<T: DeserializeOwned>(value: &[u8]) -> crate::Result<T> {
    Ok(serde_json::from_slice(value)?)
}

/// Encode a record for the repository
pub fn encode<T: Serialize>(record: &T) -> crate::Result<Vec<u8>> {
    Ok(serde_json::to_vec(record)?)
}
