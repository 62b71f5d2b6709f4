//! Node identities

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric id of a stateful (storage) node
pub type NodeId = u32;

/// Network identity of a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub host_ip: String,
    #[serde(default)]
    pub host_name: String,
    pub grpc_port: u16,
    #[serde(default)]
    pub http_port: u16,
}

impl Node {
    pub fn new(host_ip: impl Into<String>, grpc_port: u16, http_port: u16) -> Self {
        Self {
            host_ip: host_ip.into(),
            host_name: String::new(),
            grpc_port,
            http_port,
        }
    }

    /// Key suffix under the live-node path
    pub fn indicator(&self) -> String {
        format!("{}:{}", self.host_ip, self.grpc_port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.indicator())
    }
}

/// Storage node: a node with a stable numeric id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulNode {
    #[serde(flatten)]
    pub node: Node,
    pub id: NodeId,
    #[serde(default)]
    pub online_time: i64,
}

/// Stateless (broker) node with its online timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveNode {
    #[serde(flatten)]
    pub node: Node,
    #[serde(default)]
    pub online_time: i64,
}

/// Elected master record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Master {
    pub node: ActiveNode,
    pub elect_time: i64,
}

impl Master {
    pub fn is_node(&self, node: &Node) -> bool {
        self.node.node == *node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stateful_node_json_is_flat() {
        let node = StatefulNode {
            node: Node::new("10.0.0.1", 2891, 2892),
            id: 4,
            online_time: 1,
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["host_ip"], "10.0.0.1");
        assert_eq!(json["id"], 4);
        assert_eq!(node.node.indicator(), "10.0.0.1:2891");
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let raw = br#"{"host_ip":"h","grpc_port":1,"id":2,"version":"9.9"}"#;
        let node: StatefulNode = serde_json::from_slice(raw).unwrap();
        assert_eq!(node.id, 2);
        assert_eq!(node.online_time, 0);
    }
}
