//! Live-node registration under `/active/nodes/<indicator>`.

use serde::Serialize;
use std::time::Duration;

use crate::common::{paths, Result};
use crate::models::encode;
use crate::repo::{LeaseId, Repository};

/// Write the node record bound to a lease held by `repo`.
///
/// The record disappears when the lease ends, which is what peers observe
/// as the node's failure.
pub async fn register_node<T: Serialize + Sync>(
    repo: &dyn Repository,
    indicator: &str,
    node: &T,
    ttl: Duration,
) -> Result<LeaseId> {
    let lease = repo
        .heartbeat(&paths::live_node(indicator), encode(node)?, ttl)
        .await?;
    tracing::info!(node = indicator, lease, "node registered");
    Ok(lease)
}

pub async fn deregister_node(repo: &dyn Repository, indicator: &str) -> Result<()> {
    repo.delete(&paths::live_node(indicator)).await?;
    tracing::info!(node = indicator, "node deregistered");
    Ok(())
}
