//! Shared helpers for integration tests

#![allow(dead_code)]

use chronocoord::common::{paths, timestamp_now_millis, Config};
use chronocoord::coordinator::registry::register_node;
use chronocoord::models::{
    encode, ActiveNode, ClusterConfig, Database, DatabaseOption, Node, StatefulNode,
};
use chronocoord::repo::Repository;
use std::time::Duration;

/// Poll a condition (which may `.await`) until it holds, panicking after 5s.
macro_rules! eventually {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("condition not met in time: {}", stringify!($cond));
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}

/// Config with short timings for tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.coordinator.election_backoff_ms = 20;
    config.coordinator.request_timeout_ms = 1_000;
    config.coordinator.event_queue_capacity = 64;
    config
}

pub const TTL: Duration = Duration::from_secs(10);

pub fn storage_node(id: u32) -> StatefulNode {
    StatefulNode {
        node: Node::new(format!("10.0.1.{}", id), 2891, 2892),
        id,
        online_time: timestamp_now_millis(),
    }
}

pub fn active_node(ip: &str, port: u16) -> ActiveNode {
    ActiveNode {
        node: Node::new(ip, port, port + 1),
        online_time: timestamp_now_millis(),
    }
}

pub fn database(name: &str, storage: &str, shards: u32, replicas: u32) -> Database {
    Database {
        name: name.to_string(),
        storage: storage.to_string(),
        num_of_shard: shards,
        replica_factor: replicas,
        option: DatabaseOption::default(),
    }
}

pub async fn put_storage_config(repo: &dyn Repository, name: &str) {
    repo.put(
        &paths::join(paths::STORAGE_CONFIG_PATH, name),
        encode(&ClusterConfig::new(name)).unwrap(),
    )
    .await
    .unwrap();
}

pub async fn put_broker_config(repo: &dyn Repository, name: &str) {
    repo.put(
        &paths::join(paths::BROKER_CONFIG_PATH, name),
        encode(&ClusterConfig::new(name)).unwrap(),
    )
    .await
    .unwrap();
}

pub async fn put_database(repo: &dyn Repository, database: &Database) {
    repo.put(&paths::database_config(&database.name), encode(database).unwrap())
        .await
        .unwrap();
}

pub async fn register_storage_nodes(repo: &dyn Repository, ids: &[u32]) {
    for id in ids {
        let node = storage_node(*id);
        register_node(repo, &node.node.indicator(), &node, TTL)
            .await
            .unwrap();
    }
}
