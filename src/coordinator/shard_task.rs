//! The create-shard task: master submits it after an assignment changes,
//! storage nodes create the shards they were given.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::common::Result;
use crate::models::{decode, encode, DatabaseOption, NodeId, ShardAssignment, ShardId};
use crate::task::{ControllerTaskParam, Kind, Processor, Task};

pub const CREATE_SHARD_KIND: &str = "create-shard";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateShardParams {
    pub database: String,
    pub shard_ids: Vec<ShardId>,
    #[serde(default)]
    pub option: DatabaseOption,
}

/// Group name for an assignment: stable for a given shard count.
pub fn task_name(assignment: &ShardAssignment) -> String {
    format!("{}-{}", assignment.name, assignment.num_of_shard())
}

/// One task per node hosting at least one replica.
pub fn create_shard_tasks(
    assignment: &ShardAssignment,
    option: &DatabaseOption,
) -> Result<Vec<ControllerTaskParam>> {
    let mut per_node: BTreeMap<NodeId, Vec<ShardId>> = BTreeMap::new();
    for (shard_id, replica) in &assignment.shards {
        for node_id in &replica.replicas {
            per_node.entry(*node_id).or_default().push(*shard_id);
        }
    }
    per_node
        .into_iter()
        .map(|(node_id, shard_ids)| {
            let params = CreateShardParams {
                database: assignment.name.clone(),
                shard_ids,
                option: option.clone(),
            };
            Ok(ControllerTaskParam::new(node_id, encode(&params)?))
        })
        .collect()
}

/// Storage engine hook that actually opens shards.
#[async_trait]
pub trait ShardHost: Send + Sync {
    async fn create_shards(
        &self,
        database: &str,
        shard_ids: &[ShardId],
        option: &DatabaseOption,
    ) -> Result<()>;
}

pub struct CreateShardProcessor {
    host: Arc<dyn ShardHost>,
    retry_count: u32,
    retry_back_off: Option<Duration>,
}

impl CreateShardProcessor {
    pub fn new(host: Arc<dyn ShardHost>) -> Self {
        Self {
            host,
            retry_count: 3,
            retry_back_off: None,
        }
    }

    pub fn with_retry(mut self, retry_count: u32, retry_back_off: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_back_off = Some(retry_back_off);
        self
    }
}

#[async_trait]
impl Processor for CreateShardProcessor {
    fn kind(&self) -> Kind {
        Kind::from(CREATE_SHARD_KIND)
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn retry_back_off(&self) -> Option<Duration> {
        self.retry_back_off
    }

    async fn process(&self, _ctx: CancellationToken, task: &Task) -> Result<()> {
        let params: CreateShardParams = decode(&task.params)?;
        tracing::info!(
            database = %params.database,
            shards = ?params.shard_ids,
            "create shards"
        );
        self.host
            .create_shards(&params.database, &params.shard_ids, &params.option)
            .await
    }
}
