//! Discovery-driven state machines.
//!
//! A [`StateMachine`] binds one [`StateMachineType`] (a watched path plus the
//! event kinds it produces) to one [`Discovery`], and forwards every change
//! as a typed [`Event`] onto a state manager's queue.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::event::{Event, EventKind, EventSender};
use crate::common::{paths, Result};
use crate::discovery::{Discovery, DiscoveryFactory, Listener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateMachineType {
    DatabaseConfig,
    ShardAssignment,
    LiveNode,
    StorageStatus,
    StorageConfig,
    StorageNode,
    BrokerConfig,
    BrokerNode,
    DatabaseLimits,
    ReplicaLeader,
}

impl StateMachineType {
    /// Parent path watched for this type
    pub fn path(&self) -> &'static str {
        match self {
            StateMachineType::DatabaseConfig => paths::DATABASE_CONFIG_PATH,
            StateMachineType::ShardAssignment => paths::DATABASE_ASSIGN_PATH,
            StateMachineType::LiveNode
            | StateMachineType::StorageNode
            | StateMachineType::BrokerNode => paths::LIVE_NODES_PATH,
            StateMachineType::StorageStatus => paths::STORAGE_STATE_PATH,
            StateMachineType::StorageConfig => paths::STORAGE_CONFIG_PATH,
            StateMachineType::BrokerConfig => paths::BROKER_CONFIG_PATH,
            StateMachineType::DatabaseLimits => paths::DATABASE_LIMITS_PATH,
            StateMachineType::ReplicaLeader => paths::REPLICA_STATE_PATH,
        }
    }

    /// (create, delete) event kinds
    pub fn events(&self) -> (EventKind, EventKind) {
        match self {
            StateMachineType::DatabaseConfig => (
                EventKind::DatabaseConfigChanged,
                EventKind::DatabaseConfigDeletion,
            ),
            StateMachineType::ShardAssignment => (
                EventKind::ShardAssignmentChanged,
                EventKind::ShardAssignmentDeletion,
            ),
            StateMachineType::LiveNode
            | StateMachineType::StorageNode
            | StateMachineType::BrokerNode => (EventKind::NodeStartup, EventKind::NodeFailure),
            StateMachineType::StorageStatus => (
                EventKind::StorageStateChanged,
                EventKind::StorageStateDeletion,
            ),
            StateMachineType::StorageConfig => (
                EventKind::StorageConfigChanged,
                EventKind::StorageConfigDeletion,
            ),
            StateMachineType::BrokerConfig => (
                EventKind::BrokerConfigChanged,
                EventKind::BrokerConfigDeletion,
            ),
            StateMachineType::DatabaseLimits => (
                EventKind::DatabaseLimitsChanged,
                EventKind::DatabaseLimitsDeletion,
            ),
            StateMachineType::ReplicaLeader => (
                EventKind::ReplicaStateChanged,
                EventKind::ReplicaStateDeletion,
            ),
        }
    }
}

impl fmt::Display for StateMachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

struct Forwarder {
    kind: StateMachineType,
    running: AtomicBool,
    sink: EventSender,
    attributes: BTreeMap<String, String>,
}

impl Forwarder {
    async fn forward(&self, kind: EventKind, key: &str, value: &[u8]) {
        if !self.running.load(Ordering::Acquire) {
            tracing::warn!(state_machine = %self.kind, key, "state machine stopped, ignore event");
            return;
        }
        let event = Event {
            kind,
            key: key.to_string(),
            value: value.to_vec(),
            attributes: self.attributes.clone(),
        };
        if let Err(e) = self.sink.emit(event).await {
            tracing::warn!(state_machine = %self.kind, key, "drop event: {}", e);
        }
    }
}

#[async_trait]
impl Listener for Forwarder {
    async fn on_create(&self, key: &str, value: &[u8]) {
        let (create, _) = self.kind.events();
        self.forward(create, key, value).await;
    }

    async fn on_delete(&self, key: &str) {
        let (_, delete) = self.kind.events();
        self.forward(delete, key, &[]).await;
    }
}

pub struct StateMachine {
    kind: StateMachineType,
    forwarder: Arc<Forwarder>,
    discovery: Discovery,
}

impl StateMachine {
    /// Register the discovery and replay the current keys.
    ///
    /// Registration failure is returned, aborting the owner's startup.
    pub async fn start(
        kind: StateMachineType,
        factory: &DiscoveryFactory,
        sink: EventSender,
        attributes: BTreeMap<String, String>,
    ) -> Result<Self> {
        let forwarder = Arc::new(Forwarder {
            kind,
            running: AtomicBool::new(true),
            sink,
            attributes,
        });
        let discovery = factory.create_discovery(&paths::children(kind.path()), forwarder.clone());
        discovery.discovery(true).await?;
        tracing::info!(state_machine = %kind, "state machine started");
        Ok(Self {
            kind,
            forwarder,
            discovery,
        })
    }

    pub fn kind(&self) -> StateMachineType {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        self.forwarder.running.load(Ordering::Acquire)
    }

    /// Stop forwarding. Only the first call has an effect.
    pub fn close(&self) -> bool {
        if self
            .forwarder
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.discovery.close();
        tracing::info!(state_machine = %self.kind, "state machine stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::event::{channel, Command};
    use crate::repo::{MemoryRepository, Repository};

    async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<Command>) -> Event {
        match rx.recv().await {
            Some(Command::Event(event)) => event,
            _ => panic!("expected event"),
        }
    }

    #[tokio::test]
    async fn test_forwards_typed_events() {
        let repo = Arc::new(MemoryRepository::new());
        repo.put("/database/config/cpu", b"{}".to_vec()).await.unwrap();

        let (sender, mut rx) = channel(16);
        let factory = DiscoveryFactory::new(repo.clone());
        let sm = StateMachine::start(
            StateMachineType::DatabaseConfig,
            &factory,
            sender,
            BTreeMap::new(),
        )
        .await
        .unwrap();

        let replayed = next_event(&mut rx).await;
        assert_eq!(replayed.kind, EventKind::DatabaseConfigChanged);
        assert_eq!(replayed.name(), "cpu");

        repo.delete("/database/config/cpu").await.unwrap();
        let deleted = next_event(&mut rx).await;
        assert_eq!(deleted.kind, EventKind::DatabaseConfigDeletion);
        assert!(deleted.value.is_empty());

        assert!(sm.close());
        assert!(!sm.close());
        assert!(!sm.is_running());
    }

    #[tokio::test]
    async fn test_attributes_are_attached() {
        let repo = Arc::new(MemoryRepository::new());
        repo.put("/active/nodes/1", b"{}".to_vec()).await.unwrap();

        let (sender, mut rx) = channel(16);
        let mut attributes = BTreeMap::new();
        attributes.insert("storage".to_string(), "s1".to_string());
        let _sm = StateMachine::start(
            StateMachineType::StorageNode,
            &DiscoveryFactory::new(repo.clone()),
            sender,
            attributes,
        )
        .await
        .unwrap();

        let event = next_event(&mut rx).await;
        assert_eq!(event.kind, EventKind::NodeStartup);
        assert_eq!(event.attribute("storage"), Some("s1"));
    }

    #[tokio::test]
    async fn test_start_fails_on_closed_repo() {
        let repo = Arc::new(MemoryRepository::new());
        repo.close().await.unwrap();
        let (sender, _rx) = channel(1);
        let result = StateMachine::start(
            StateMachineType::LiveNode,
            &DiscoveryFactory::new(repo),
            sender,
            BTreeMap::new(),
        )
        .await;
        assert!(result.is_err());
    }
}
