//! Database and cluster configuration records

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

/// Database config written by operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    /// Storage cluster hosting the database
    pub storage: String,
    pub num_of_shard: u32,
    pub replica_factor: u32,
    #[serde(default)]
    pub option: DatabaseOption,
}

/// Engine options carried through to shard creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseOption {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ahead: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behind: Option<String>,
}

impl Database {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("database name cannot be empty".into()));
        }
        if self.storage.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "database {} has no storage cluster",
                self.name
            )));
        }
        if self.num_of_shard == 0 {
            return Err(Error::InvalidShardCount(0));
        }
        if self.replica_factor == 0 {
            return Err(Error::InvalidReplicaFactor(0));
        }
        Ok(())
    }
}

/// Write limits applied by brokers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseLimits {
    #[serde(default = "default_max_series")]
    pub max_series_per_metric: u32,
    #[serde(default = "default_max_tags")]
    pub max_tags_per_series: u32,
    #[serde(default = "default_max_fields")]
    pub max_fields_per_metric: u32,
}

fn default_max_series() -> u32 {
    100_000
}
fn default_max_tags() -> u32 {
    32
}
fn default_max_fields() -> u32 {
    256
}

impl Default for DatabaseLimits {
    fn default() -> Self {
        Self {
            max_series_per_metric: default_max_series(),
            max_tags_per_series: default_max_tags(),
            max_fields_per_metric: default_max_fields(),
        }
    }
}

/// Config of a storage or broker cluster managed from the root namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    /// Namespace of the cluster's own repository, `/<name>` when empty
    #[serde(default)]
    pub namespace: String,
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: String::new(),
        }
    }

    pub fn namespace(&self) -> String {
        if self.namespace.is_empty() {
            format!("/{}", self.name)
        } else {
            self.namespace.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db(shards: u32, replicas: u32) -> Database {
        Database {
            name: "cpu".into(),
            storage: "s1".into(),
            num_of_shard: shards,
            replica_factor: replicas,
            option: DatabaseOption::default(),
        }
    }

    #[test]
    fn test_validate() {
        assert!(db(10, 3).validate().is_ok());
        assert!(matches!(db(0, 3).validate(), Err(Error::InvalidShardCount(0))));
        assert!(matches!(db(1, 0).validate(), Err(Error::InvalidReplicaFactor(0))));

        let mut no_storage = db(1, 1);
        no_storage.storage.clear();
        assert!(no_storage.validate().is_err());
    }

    #[test]
    fn test_cluster_namespace() {
        assert_eq!(ClusterConfig::new("s1").namespace(), "/s1");
        let cfg: ClusterConfig =
            serde_json::from_str(r#"{"name":"s1","namespace":"/zone-a/s1"}"#).unwrap();
        assert_eq!(cfg.namespace(), "/zone-a/s1");
    }

    #[test]
    fn test_limits_defaults() {
        let limits: DatabaseLimits = serde_json::from_str(r#"{"max_tags_per_series":8}"#).unwrap();
        assert_eq!(limits.max_tags_per_series, 8);
        assert_eq!(limits.max_series_per_metric, 100_000);
    }
}
