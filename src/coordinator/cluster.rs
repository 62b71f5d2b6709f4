//! Sub-clusters managed by the master (storage) and the root (brokers).
//!
//! A sub-cluster is a namespaced repository handle plus the state machine
//! watching its live nodes. Node events are tagged with the cluster name so
//! one state manager can serve many clusters.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::event::{EventSender, BROKER_ATTRIBUTE, STORAGE_ATTRIBUTE};
use super::state_machine::{StateMachine, StateMachineType};
use crate::common::{Result, TaskConfig};
use crate::discovery::DiscoveryFactory;
use crate::models::ClusterConfig;
use crate::repo::{Repository, RepositoryFactory};
use crate::task::Controller;

#[async_trait]
pub trait Cluster: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &ClusterConfig;

    /// Repository handle scoped to the cluster's namespace
    fn repo(&self) -> Arc<dyn Repository>;

    /// Controller submitting tasks to this cluster's nodes, if it runs tasks
    fn task_controller(&self) -> Option<Arc<Controller>> {
        None
    }

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ClusterFactory: Send + Sync {
    async fn new_cluster(&self, config: &ClusterConfig) -> Result<Arc<dyn Cluster>>;
}

pub struct NamespacedCluster {
    config: ClusterConfig,
    repo: Arc<dyn Repository>,
    state_machine: StateMachine,
    controller: Option<Arc<Controller>>,
}

#[async_trait]
impl Cluster for NamespacedCluster {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn config(&self) -> &ClusterConfig {
        &self.config
    }

    fn repo(&self) -> Arc<dyn Repository> {
        self.repo.clone()
    }

    fn task_controller(&self) -> Option<Arc<Controller>> {
        self.controller.clone()
    }

    async fn close(&self) -> Result<()> {
        self.state_machine.close();
        if let Some(controller) = &self.controller {
            controller.close().await;
        }
        self.repo.close().await?;
        tracing::info!(cluster = %self.config.name, "cluster closed");
        Ok(())
    }
}

/// Builds clusters whose node events flow into one state manager
pub struct NamespacedClusterFactory {
    repo_factory: Arc<dyn RepositoryFactory>,
    kind: StateMachineType,
    attribute: &'static str,
    sink: EventSender,
    task_config: Option<TaskConfig>,
}

impl NamespacedClusterFactory {
    pub fn storage(repo_factory: Arc<dyn RepositoryFactory>, sink: EventSender) -> Self {
        Self {
            repo_factory,
            kind: StateMachineType::StorageNode,
            attribute: STORAGE_ATTRIBUTE,
            sink,
            task_config: None,
        }
    }

    pub fn broker(repo_factory: Arc<dyn RepositoryFactory>, sink: EventSender) -> Self {
        Self {
            repo_factory,
            kind: StateMachineType::BrokerNode,
            attribute: BROKER_ATTRIBUTE,
            sink,
            task_config: None,
        }
    }

    /// Run a task controller inside every cluster built.
    pub fn with_tasks(mut self, config: TaskConfig) -> Self {
        self.task_config = Some(config);
        self
    }
}

#[async_trait]
impl ClusterFactory for NamespacedClusterFactory {
    async fn new_cluster(&self, config: &ClusterConfig) -> Result<Arc<dyn Cluster>> {
        let repo = self.repo_factory.create_repo(&config.namespace())?;

        let controller = match &self.task_config {
            Some(task_config) => {
                let controller = Arc::new(Controller::new(repo.clone(), task_config));
                if let Err(e) = controller.start().await {
                    let _ = repo.close().await;
                    return Err(e);
                }
                Some(controller)
            }
            None => None,
        };

        let mut attributes = BTreeMap::new();
        attributes.insert(self.attribute.to_string(), config.name.clone());
        let state_machine = match StateMachine::start(
            self.kind,
            &DiscoveryFactory::new(repo.clone()),
            self.sink.clone(),
            attributes,
        )
        .await
        {
            Ok(state_machine) => state_machine,
            Err(e) => {
                if let Some(controller) = &controller {
                    controller.close().await;
                }
                let _ = repo.close().await;
                return Err(e);
            }
        };

        tracing::info!(cluster = %config.name, namespace = %config.namespace(), "cluster started");
        Ok(Arc::new(NamespacedCluster {
            config: config.clone(),
            repo,
            state_machine,
            controller,
        }))
    }
}
