//! Key layout of the state repository.
//!
//! Every path is relative to the repository handle's namespace.

/// Elected master record (lease-backed)
pub const MASTER_PATH: &str = "/master/node";
/// Database configs, one key per database
pub const DATABASE_CONFIG_PATH: &str = "/database/config";
/// Shard assignments, one key per database
pub const DATABASE_ASSIGN_PATH: &str = "/database/assign";
/// Per-database limits
pub const DATABASE_LIMITS_PATH: &str = "/database/limit";
/// Live nodes of a cluster, one lease-backed key per node
pub const LIVE_NODES_PATH: &str = "/active/nodes";
/// Storage cluster configs
pub const STORAGE_CONFIG_PATH: &str = "/storage/config";
/// Storage cluster state snapshots
pub const STORAGE_STATE_PATH: &str = "/state/storage/cluster";
/// Broker cluster configs
pub const BROKER_CONFIG_PATH: &str = "/broker/config";
/// Broker cluster state snapshots
pub const BROKER_STATE_PATH: &str = "/state/broker/cluster";
/// Replicas hosted per storage node
pub const REPLICA_STATE_PATH: &str = "/state/replica";

/// Task group envelopes
pub const TASK_STATUS_PATH: &str = "/task-coordinator/v1/status";
/// Per-node task records
pub const TASK_EXECUTOR_PATH: &str = "/task-coordinator/v1/executor";

/// `parent/child`
pub fn join(parent: &str, child: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), child)
}

/// Watch prefix for the children of `parent` (trailing slash included)
pub fn children(parent: &str) -> String {
    format!("{}/", parent.trim_end_matches('/'))
}

/// Last path segment, i.e. the entity name encoded in a key
pub fn last_segment(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

pub fn database_config(name: &str) -> String {
    join(DATABASE_CONFIG_PATH, name)
}

pub fn database_assign(name: &str) -> String {
    join(DATABASE_ASSIGN_PATH, name)
}

pub fn storage_state(name: &str) -> String {
    join(STORAGE_STATE_PATH, name)
}

pub fn broker_state(name: &str) -> String {
    join(BROKER_STATE_PATH, name)
}

pub fn live_node(indicator: &str) -> String {
    join(LIVE_NODES_PATH, indicator)
}

/// `/state/replica/<cluster>/<node>`
pub fn replica_state(cluster: &str, node_id: u32) -> String {
    format!("{}/{}/{}", REPLICA_STATE_PATH, cluster, node_id)
}

/// Inverse of [`replica_state`]
pub fn parse_replica_state(key: &str) -> Option<(&str, u32)> {
    let rest = key.strip_prefix(REPLICA_STATE_PATH)?.strip_prefix('/')?;
    let (cluster, node) = rest.rsplit_once('/')?;
    if cluster.is_empty() {
        return None;
    }
    Some((cluster, node.parse().ok()?))
}

/// `/task-coordinator/v1/status/kinds/<kind>/names/<name>`
pub fn task_status(kind: &str, name: &str) -> String {
    format!("{}/kinds/{}/names/{}", TASK_STATUS_PATH, kind, name)
}

/// Prefix watched by one executor: `/task-coordinator/v1/executor/<node>/`
pub fn task_executor_node(node_id: u32) -> String {
    format!("{}/{}/", TASK_EXECUTOR_PATH, node_id)
}

/// `/task-coordinator/v1/executor/<node>/kinds/<kind>/names/<name>`
pub fn task_executor(node_id: u32, kind: &str, name: &str) -> String {
    format!(
        "{}/{}/kinds/{}/names/{}",
        TASK_EXECUTOR_PATH, node_id, kind, name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(database_config("db1"), "/database/config/db1");
        assert_eq!(children(LIVE_NODES_PATH), "/active/nodes/");
        assert_eq!(last_segment("/database/assign/cpu"), "cpu");
        assert_eq!(
            task_status("create-shard", "t-10"),
            "/task-coordinator/v1/status/kinds/create-shard/names/t-10"
        );
        assert_eq!(
            task_executor(3, "create-shard", "t-10"),
            "/task-coordinator/v1/executor/3/kinds/create-shard/names/t-10"
        );
        assert!(task_executor(3, "k", "n").starts_with(&task_executor_node(3)));
        assert!(!task_executor(31, "k", "n").starts_with(&task_executor_node(3)));
    }

    #[test]
    fn test_replica_state_keys() {
        assert_eq!(replica_state("s1", 4), "/state/replica/s1/4");
        assert_eq!(parse_replica_state("/state/replica/s1/4"), Some(("s1", 4)));
        assert_eq!(parse_replica_state("/state/replica/4"), None);
        assert_eq!(parse_replica_state("/state/replica/s1/x"), None);
        assert_ne!(replica_state("s1", 4), replica_state("s2", 4));
    }
}
