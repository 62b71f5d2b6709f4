//! Storage node state manager.
//!
//! Watches its own cluster's live nodes and shard assignments and publishes
//! which shards the local node hosts as a [`ReplicaState`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{EventHandler, EventLoop};
use crate::common::{paths, with_timeout, CoordinatorConfig, Result};
use crate::coordinator::event::{Event, EventKind, EventSender};
use crate::coordinator::state_machine::{StateMachine, StateMachineType};
use crate::discovery::DiscoveryFactory;
use crate::models::{decode, encode, NodeId, ReplicaState, ShardAssignment, StatefulNode};
use crate::repo::Repository;

pub struct StorageStateManager {
    inner: Arc<StorageInner>,
    event_loop: EventLoop,
    state_machines: Mutex<Vec<StateMachine>>,
}

struct StorageInner {
    cluster: String,
    node_id: NodeId,
    /// Cluster namespace: live nodes and assignments are read here
    repo: Arc<dyn Repository>,
    /// Where the replica state is published
    state_repo: Arc<dyn Repository>,
    request_timeout: Duration,
    state: tokio::sync::Mutex<StorageNodeState>,
}

#[derive(Default)]
struct StorageNodeState {
    live_nodes: BTreeMap<NodeId, StatefulNode>,
    shard_assignments: BTreeMap<String, ShardAssignment>,
    published: Option<ReplicaState>,
}

impl StorageStateManager {
    pub fn new(
        cluster: impl Into<String>,
        node_id: NodeId,
        repo: Arc<dyn Repository>,
        state_repo: Arc<dyn Repository>,
        config: &CoordinatorConfig,
    ) -> Self {
        let inner = Arc::new(StorageInner {
            cluster: cluster.into(),
            node_id,
            repo,
            state_repo,
            request_timeout: config.request_timeout(),
            state: tokio::sync::Mutex::new(StorageNodeState::default()),
        });
        let event_loop = EventLoop::start(
            inner.clone(),
            config.event_queue_capacity,
            CancellationToken::new(),
        );
        Self {
            inner,
            event_loop,
            state_machines: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let factory = DiscoveryFactory::new(self.inner.repo.clone());
        for kind in [StateMachineType::LiveNode, StateMachineType::ShardAssignment] {
            let state_machine =
                StateMachine::start(kind, &factory, self.sender(), BTreeMap::new()).await?;
            self.state_machines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(state_machine);
        }
        Ok(())
    }

    pub fn sender(&self) -> EventSender {
        self.event_loop.sender()
    }

    pub async fn emit_event(&self, event: Event) -> Result<()> {
        self.event_loop.emit_event(event).await
    }

    pub async fn wait_idle(&self) -> Result<()> {
        self.event_loop.wait_idle().await
    }

    pub async fn live_nodes(&self) -> Vec<StatefulNode> {
        self.inner.state.lock().await.live_nodes.values().cloned().collect()
    }

    pub async fn shard_assignment(&self, database: &str) -> Option<ShardAssignment> {
        self.inner
            .state
            .lock()
            .await
            .shard_assignments
            .get(database)
            .cloned()
    }

    /// Shards hosted here, as last published
    pub async fn replica_state(&self) -> Option<ReplicaState> {
        self.inner.state.lock().await.published.clone()
    }

    pub async fn close(&self) {
        let state_machines: Vec<StateMachine> = self
            .state_machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for state_machine in &state_machines {
            state_machine.close();
        }
        self.event_loop.stop().await;
    }
}

#[async_trait]
impl EventHandler for StorageInner {
    fn role(&self) -> &'static str {
        "storage"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let mut state = self.state.lock().await;
        match event.kind {
            EventKind::NodeStartup => {
                let node: StatefulNode = decode(&event.value)?;
                state.live_nodes.insert(node.id, node);
                Ok(())
            }
            EventKind::NodeFailure => {
                let indicator = event.name();
                state.live_nodes.retain(|_, n| n.node.indicator() != indicator);
                Ok(())
            }
            EventKind::ShardAssignmentChanged => {
                let assignment: ShardAssignment = decode(&event.value)?;
                state
                    .shard_assignments
                    .insert(assignment.name.clone(), assignment);
                self.publish(&mut state).await
            }
            EventKind::ShardAssignmentDeletion => {
                state.shard_assignments.remove(event.name());
                self.publish(&mut state).await
            }
            other => {
                tracing::warn!(kind = %other, key = %event.key, "storage ignores event");
                Ok(())
            }
        }
    }
}

impl StorageInner {
    async fn publish(&self, state: &mut StorageNodeState) -> Result<()> {
        let replica = ReplicaState {
            cluster: self.cluster.clone(),
            node: self.node_id,
            shards: state
                .shard_assignments
                .iter()
                .map(|(db, assignment)| (db.clone(), assignment.shards_of(self.node_id)))
                .filter(|(_, shards)| !shards.is_empty())
                .collect(),
        };
        if state.published.as_ref() == Some(&replica) {
            return Ok(());
        }
        with_timeout(
            self.request_timeout,
            "put replica state",
            self.state_repo.put(
                &paths::replica_state(&self.cluster, self.node_id),
                encode(&replica)?,
            ),
        )
        .await?;
        tracing::debug!(
            cluster = %self.cluster,
            node = self.node_id,
            databases = replica.shards.len(),
            "replica state published"
        );
        state.published = Some(replica);
        Ok(())
    }
}
