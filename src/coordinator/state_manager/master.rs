//! Master state manager.
//!
//! Owns the storage clusters, keeps one [`StorageState`] per cluster, turns
//! database configs into shard assignments, and publishes every state change
//! to `/state/storage/cluster/<name>`.

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{EventHandler, EventLoop};
use crate::common::{paths, with_timeout, CoordinatorConfig, Error, Result};
use crate::coordinator::cluster::{Cluster, ClusterFactory};
use crate::coordinator::event::{Event, EventKind, EventSender, STORAGE_ATTRIBUTE};
use crate::coordinator::placement::{assign, modify_shard_assignment};
use crate::coordinator::shard_task::{create_shard_tasks, task_name, CREATE_SHARD_KIND};
use crate::coordinator::state_machine::{StateMachine, StateMachineType};
use crate::discovery::DiscoveryFactory;
use crate::models::{
    decode, encode, ClusterConfig, Database, ShardAssignment, StatefulNode, StorageState,
};
use crate::repo::Repository;
use crate::task::Kind;

pub struct MasterStateManager {
    inner: Arc<MasterInner>,
    event_loop: EventLoop,
    state_machines: Mutex<Vec<StateMachine>>,
}

struct MasterInner {
    repo: Arc<dyn Repository>,
    request_timeout: Duration,
    cluster_factory: OnceCell<Arc<dyn ClusterFactory>>,
    state: tokio::sync::Mutex<MasterState>,
}

#[derive(Default)]
struct MasterState {
    databases: BTreeMap<String, Database>,
    storages: BTreeMap<String, StorageEntry>,
}

struct StorageEntry {
    cluster: Arc<dyn Cluster>,
    state: StorageState,
}

impl MasterStateManager {
    /// Start the consumer. Cluster events need [`MasterStateManager::attach`] first.
    pub fn new(repo: Arc<dyn Repository>, config: &CoordinatorConfig) -> Self {
        let inner = Arc::new(MasterInner {
            repo,
            request_timeout: config.request_timeout(),
            cluster_factory: OnceCell::new(),
            state: tokio::sync::Mutex::new(MasterState::default()),
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

    /// Wire the factory that builds storage clusters. Only the first call wins.
    pub fn attach(&self, factory: Arc<dyn ClusterFactory>) -> Result<()> {
        self.inner
            .cluster_factory
            .set(factory)
            .map_err(|_| Error::AlreadyAttached)
    }

    /// Start the state machines feeding this manager.
    pub async fn start(&self) -> Result<()> {
        let factory = DiscoveryFactory::new(self.inner.repo.clone());
        for kind in [
            StateMachineType::StorageConfig,
            StateMachineType::DatabaseConfig,
            StateMachineType::ShardAssignment,
        ] {
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

    /// Wait until everything emitted so far has been handled.
    pub async fn wait_idle(&self) -> Result<()> {
        self.event_loop.wait_idle().await
    }

    pub async fn storage_state(&self, name: &str) -> Option<StorageState> {
        let state = self.inner.state.lock().await;
        state.storages.get(name).map(|entry| entry.state.clone())
    }

    pub async fn database(&self, name: &str) -> Option<Database> {
        self.inner.state.lock().await.databases.get(name).cloned()
    }

    pub async fn storage_names(&self) -> Vec<String> {
        self.inner.state.lock().await.storages.keys().cloned().collect()
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

        let mut state = self.inner.state.lock().await;
        for (name, entry) in std::mem::take(&mut state.storages) {
            if let Err(e) = entry.cluster.close().await {
                tracing::warn!(storage = %name, "failed to close storage cluster: {}", e);
            }
        }
        state.databases.clear();
    }
}

#[async_trait]
impl EventHandler for MasterInner {
    fn role(&self) -> &'static str {
        "master"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        match event.kind {
            EventKind::DatabaseConfigChanged => self.on_database_config_changed(event).await,
            EventKind::DatabaseConfigDeletion => self.on_database_config_deletion(event).await,
            EventKind::ShardAssignmentChanged => self.on_shard_assignment_changed(event).await,
            EventKind::ShardAssignmentDeletion => self.on_shard_assignment_deletion(event).await,
            EventKind::NodeStartup => self.on_node_startup(event).await,
            EventKind::NodeFailure => self.on_node_failure(event).await,
            EventKind::StorageConfigChanged => self.on_storage_config_changed(event).await,
            EventKind::StorageConfigDeletion => self.on_storage_config_deletion(event).await,
            other => {
                tracing::warn!(kind = %other, key = %event.key, "master ignores event");
                Ok(())
            }
        }
    }
}

impl MasterInner {
    async fn on_database_config_changed(&self, event: &Event) -> Result<()> {
        let database: Database = decode(&event.value)?;
        database.validate()?;
        let mut state = self.state.lock().await;
        state
            .databases
            .insert(database.name.clone(), database.clone());
        self.reconcile_shard_assignment(&state, &database).await
    }

    async fn on_database_config_deletion(&self, event: &Event) -> Result<()> {
        let name = event.name();
        let mut state = self.state.lock().await;
        let Some(database) = state.databases.remove(name) else {
            return Ok(());
        };
        let key = paths::database_assign(name);
        with_timeout(self.request_timeout, "delete assignment", self.repo.delete(&key)).await?;

        if let Some(entry) = state.storages.get_mut(&database.storage) {
            with_timeout(
                self.request_timeout,
                "delete cluster assignment",
                entry.cluster.repo().delete(&key),
            )
            .await?;
            if entry.state.drop_database(name) {
                self.sync_state(&entry.state).await?;
            }
        }
        tracing::info!(database = name, "database dropped");
        Ok(())
    }

    async fn on_shard_assignment_changed(&self, event: &Event) -> Result<()> {
        let assignment: ShardAssignment = decode(&event.value)?;
        let mut state = self.state.lock().await;
        let storage = state
            .databases
            .get(&assignment.name)
            .map(|d| d.storage.clone())
            .ok_or_else(|| Error::NotExist(paths::database_config(&assignment.name)))?;
        let entry = state
            .storages
            .get_mut(&storage)
            .ok_or_else(|| Error::NotExist(format!("storage cluster {}", storage)))?;
        entry.state.apply_shard_assignment(assignment);
        self.sync_state(&entry.state).await
    }

    async fn on_shard_assignment_deletion(&self, event: &Event) -> Result<()> {
        let name = event.name();
        let mut state = self.state.lock().await;
        for entry in state.storages.values_mut() {
            if entry.state.drop_database(name) {
                self.sync_state(&entry.state).await?;
            }
        }
        Ok(())
    }

    async fn on_node_startup(&self, event: &Event) -> Result<()> {
        let storage = storage_attribute(event)?;
        let node: StatefulNode = decode(&event.value)?;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let entry = state
            .storages
            .get_mut(storage)
            .ok_or_else(|| Error::NotExist(format!("storage cluster {}", storage)))?;
        let node_id = node.id;
        if entry.state.node_startup(node) {
            tracing::info!(storage, node = node_id, "storage node online");
            self.sync_state(&entry.state).await?;
        }

        // databases that could not be placed yet, e.g. too few live nodes
        let assigned = &entry.state.shard_assignments;
        let pending: Vec<Database> = state
            .databases
            .values()
            .filter(|d| d.storage == storage && !assigned.contains_key(&d.name))
            .cloned()
            .collect();
        for database in pending {
            if let Err(e) = self.reconcile_shard_assignment(state, &database).await {
                tracing::debug!(database = %database.name, "shard assignment still pending: {}", e);
            }
        }
        Ok(())
    }

    async fn on_node_failure(&self, event: &Event) -> Result<()> {
        let storage = storage_attribute(event)?;
        let indicator = event.name();
        let mut state = self.state.lock().await;
        let entry = state
            .storages
            .get_mut(storage)
            .ok_or_else(|| Error::NotExist(format!("storage cluster {}", storage)))?;
        let node_id = entry
            .state
            .live_nodes
            .values()
            .find(|n| n.node.indicator() == indicator)
            .map(|n| n.id);
        let Some(node_id) = node_id else {
            return Ok(());
        };
        if entry.state.node_failure(node_id) {
            tracing::info!(storage, node = node_id, "storage node offline");
            self.sync_state(&entry.state).await?;
        }
        Ok(())
    }

    async fn on_storage_config_changed(&self, event: &Event) -> Result<()> {
        let config: ClusterConfig = decode(&event.value)?;
        let factory = self
            .cluster_factory
            .get()
            .ok_or_else(|| Error::Internal("cluster factory not attached".into()))?;
        let mut state = self.state.lock().await;
        if let Some(entry) = state.storages.get(&config.name) {
            if entry.cluster.config() == &config {
                return Ok(());
            }
        }
        if let Some(old) = state.storages.remove(&config.name) {
            if let Err(e) = old.cluster.close().await {
                tracing::warn!(storage = %config.name, "failed to close storage cluster: {}", e);
            }
        }

        let cluster = factory.new_cluster(&config).await?;
        let entry = StorageEntry {
            cluster,
            state: StorageState::new(config.name.clone()),
        };
        self.sync_state(&entry.state).await?;
        state.storages.insert(config.name.clone(), entry);
        tracing::info!(storage = %config.name, "storage cluster registered");
        Ok(())
    }

    async fn on_storage_config_deletion(&self, event: &Event) -> Result<()> {
        let name = event.name();
        let mut state = self.state.lock().await;
        let Some(entry) = state.storages.remove(name) else {
            return Ok(());
        };
        if let Err(e) = entry.cluster.close().await {
            tracing::warn!(storage = name, "failed to close storage cluster: {}", e);
        }
        with_timeout(
            self.request_timeout,
            "delete storage state",
            self.repo.delete(&paths::storage_state(name)),
        )
        .await?;
        tracing::info!(storage = name, "storage cluster removed");
        Ok(())
    }

    /// Create or grow the assignment of `database` and push it to the root
    /// and to the storage cluster. An up-to-date assignment is re-put as is.
    async fn reconcile_shard_assignment(
        &self,
        state: &MasterState,
        database: &Database,
    ) -> Result<()> {
        let entry = state
            .storages
            .get(&database.storage)
            .ok_or_else(|| Error::NotExist(format!("storage cluster {}", database.storage)))?;
        let key = paths::database_assign(&database.name);
        let stored =
            with_timeout(self.request_timeout, "get assignment", self.repo.get(&key)).await;
        let existing = match stored {
            Ok(kv) => Some(decode::<ShardAssignment>(&kv.value)?),
            Err(e) if e.is_not_exist() => None,
            Err(e) => return Err(e),
        };

        let node_ids = entry.state.live_node_ids();
        let num_of_shard = database.num_of_shard as i64;
        let replica_factor = database.replica_factor as i64;
        let (assignment, changed) = match existing {
            None => (
                assign(&database.name, &node_ids, num_of_shard, replica_factor, None, 0)?,
                true,
            ),
            Some(mut assignment) if assignment.num_of_shard() as i64 != num_of_shard => {
                modify_shard_assignment(&mut assignment, &node_ids, num_of_shard, replica_factor)?;
                (assignment, true)
            }
            Some(assignment) => (assignment, false),
        };

        let value = encode(&assignment)?;
        with_timeout(
            self.request_timeout,
            "put cluster assignment",
            entry.cluster.repo().put(&key, value.clone()),
        )
        .await?;
        with_timeout(self.request_timeout, "put assignment", self.repo.put(&key, value)).await?;
        if changed {
            tracing::info!(
                database = %database.name,
                storage = %database.storage,
                shards = assignment.num_of_shard(),
                "shard assignment saved"
            );
            self.submit_create_shard(entry.cluster.as_ref(), database, &assignment)
                .await;
        }
        Ok(())
    }

    async fn submit_create_shard(
        &self,
        cluster: &dyn Cluster,
        database: &Database,
        assignment: &ShardAssignment,
    ) {
        let Some(controller) = cluster.task_controller() else {
            return;
        };
        let name = task_name(assignment);
        let result = match create_shard_tasks(assignment, &database.option) {
            Ok(tasks) => controller.submit(Kind::from(CREATE_SHARD_KIND), &name, tasks).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {}
            Err(Error::TaskNameExists(_)) => {
                tracing::debug!(task = %name, "create shard task already submitted");
            }
            Err(e) => tracing::warn!(task = %name, "failed to submit create shard task: {}", e),
        }
    }

    async fn sync_state(&self, state: &StorageState) -> Result<()> {
        let value = encode(state)?;
        with_timeout(
            self.request_timeout,
            "put storage state",
            self.repo.put(&paths::storage_state(&state.name), value),
        )
        .await
    }
}

fn storage_attribute(event: &Event) -> Result<&str> {
    event
        .attribute(STORAGE_ATTRIBUTE)
        .ok_or_else(|| Error::Internal(format!("{} event without storage attribute", event.kind)))
}
