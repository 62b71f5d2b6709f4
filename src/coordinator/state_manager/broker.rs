//! Broker state manager: read caches for query and write routing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

use super::{EventHandler, EventLoop};
use crate::common::{paths, CoordinatorConfig, Result};
use crate::coordinator::event::{Event, EventKind, EventSender};
use crate::coordinator::state_machine::{StateMachine, StateMachineType};
use crate::discovery::DiscoveryFactory;
use crate::models::{
    decode, ActiveNode, Database, DatabaseLimits, NodeId, ReplicaState, ShardId, StorageState,
};
use crate::repo::Repository;

pub struct BrokerStateManager {
    inner: Arc<BrokerInner>,
    event_loop: EventLoop,
    state_machines: Mutex<Vec<StateMachine>>,
}

struct BrokerInner {
    /// Root namespace: databases, limits, storage and replica states
    repo: Arc<dyn Repository>,
    /// The broker's own cluster namespace, where its nodes register
    cluster_repo: Arc<dyn Repository>,
    state: tokio::sync::Mutex<BrokerView>,
}

#[derive(Default)]
struct BrokerView {
    databases: BTreeMap<String, Database>,
    limits: BTreeMap<String, DatabaseLimits>,
    storages: BTreeMap<String, StorageState>,
    /// Keyed by (storage cluster, node)
    replicas: BTreeMap<(String, NodeId), ReplicaState>,
    /// Live brokers keyed by indicator
    live_nodes: BTreeMap<String, ActiveNode>,
}

impl BrokerStateManager {
    pub fn new(
        repo: Arc<dyn Repository>,
        cluster_repo: Arc<dyn Repository>,
        config: &CoordinatorConfig,
    ) -> Self {
        let inner = Arc::new(BrokerInner {
            repo,
            cluster_repo,
            state: tokio::sync::Mutex::new(BrokerView::default()),
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
        let root = DiscoveryFactory::new(self.inner.repo.clone());
        let cluster = DiscoveryFactory::new(self.inner.cluster_repo.clone());
        let kinds = [
            (StateMachineType::LiveNode, &cluster),
            (StateMachineType::DatabaseConfig, &root),
            (StateMachineType::DatabaseLimits, &root),
            (StateMachineType::StorageStatus, &root),
            (StateMachineType::ReplicaLeader, &root),
        ];
        for (kind, factory) in kinds {
            let state_machine =
                StateMachine::start(kind, factory, self.sender(), BTreeMap::new()).await?;
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

    pub async fn database(&self, name: &str) -> Option<Database> {
        self.inner.state.lock().await.databases.get(name).cloned()
    }

    /// Limits of a database, defaults when none were written
    pub async fn database_limits(&self, name: &str) -> DatabaseLimits {
        self.inner
            .state
            .lock()
            .await
            .limits
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn storage_state(&self, name: &str) -> Option<StorageState> {
        self.inner.state.lock().await.storages.get(name).cloned()
    }

    pub async fn replica_state(&self, cluster: &str, node_id: NodeId) -> Option<ReplicaState> {
        self.inner
            .state
            .lock()
            .await
            .replicas
            .get(&(cluster.to_string(), node_id))
            .cloned()
    }

    pub async fn live_nodes(&self) -> Vec<ActiveNode> {
        self.inner.state.lock().await.live_nodes.values().cloned().collect()
    }

    /// Current leader of a shard, resolved through the database's storage cluster
    pub async fn shard_leader(&self, database: &str, shard_id: ShardId) -> Option<NodeId> {
        let view = self.inner.state.lock().await;
        let storage = &view.databases.get(database)?.storage;
        view.storages
            .get(storage)?
            .shard_state(database, shard_id)?
            .leader
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
impl EventHandler for BrokerInner {
    fn role(&self) -> &'static str {
        "broker"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        let mut view = self.state.lock().await;
        let name = event.name().to_string();
        match event.kind {
            EventKind::DatabaseConfigChanged => {
                let database: Database = decode(&event.value)?;
                view.databases.insert(database.name.clone(), database);
            }
            EventKind::DatabaseConfigDeletion => {
                view.databases.remove(&name);
                view.limits.remove(&name);
            }
            EventKind::DatabaseLimitsChanged => {
                let limits: DatabaseLimits = decode(&event.value)?;
                view.limits.insert(name, limits);
            }
            EventKind::DatabaseLimitsDeletion => {
                view.limits.remove(&name);
            }
            EventKind::StorageStateChanged => {
                let state: StorageState = decode(&event.value)?;
                view.storages.insert(state.name.clone(), state);
            }
            EventKind::StorageStateDeletion => {
                view.storages.remove(&name);
            }
            EventKind::ReplicaStateChanged => {
                let replica: ReplicaState = decode(&event.value)?;
                let Some((cluster, node_id)) = paths::parse_replica_state(&event.key) else {
                    tracing::warn!(key = %event.key, "skip replica state with unknown key");
                    return Ok(());
                };
                view.replicas.insert((cluster.to_string(), node_id), replica);
            }
            EventKind::ReplicaStateDeletion => {
                if let Some((cluster, node_id)) = paths::parse_replica_state(&event.key) {
                    view.replicas.remove(&(cluster.to_string(), node_id));
                }
            }
            EventKind::NodeStartup => {
                let node: ActiveNode = decode(&event.value)?;
                view.live_nodes.insert(name, node);
            }
            EventKind::NodeFailure => {
                view.live_nodes.remove(&name);
            }
            other => {
                tracing::warn!(kind = %other, key = %event.key, "broker ignores event");
            }
        }
        Ok(())
    }
}
