//! Master controller: campaigns for mastership and runs the master state
//! manager while this node holds it.

use async_trait::async_trait;
use std::sync::Arc;

use super::cluster::NamespacedClusterFactory;
use super::election::{Election, ElectionListener};
use super::state_manager::MasterStateManager;
use crate::common::{Config, CoordinatorConfig, Result, TaskConfig};
use crate::models::ActiveNode;
use crate::repo::{Repository, RepositoryFactory};

pub struct MasterController {
    election: Election,
    listener: Arc<MasterListener>,
}

struct MasterListener {
    repo: Arc<dyn Repository>,
    repo_factory: Arc<dyn RepositoryFactory>,
    coordinator: CoordinatorConfig,
    task: TaskConfig,
    active: tokio::sync::Mutex<Option<Arc<MasterStateManager>>>,
}

#[async_trait]
impl ElectionListener for MasterListener {
    async fn on_fail_over(&self) -> Result<()> {
        let manager = Arc::new(MasterStateManager::new(self.repo.clone(), &self.coordinator));
        let factory = NamespacedClusterFactory::storage(self.repo_factory.clone(), manager.sender())
            .with_tasks(self.task.clone());
        if let Err(e) = manager.attach(Arc::new(factory)) {
            manager.close().await;
            return Err(e);
        }
        if let Err(e) = manager.start().await {
            manager.close().await;
            return Err(e);
        }
        if let Some(previous) = self.active.lock().await.replace(manager) {
            previous.close().await;
        }
        Ok(())
    }

    async fn on_resignation(&self) {
        let manager = self.active.lock().await.take();
        if let Some(manager) = manager {
            manager.close().await;
        }
    }
}

impl MasterController {
    pub fn new(
        node: ActiveNode,
        repo: Arc<dyn Repository>,
        repo_factory: Arc<dyn RepositoryFactory>,
        config: &Config,
    ) -> Self {
        let listener = Arc::new(MasterListener {
            repo: repo.clone(),
            repo_factory,
            coordinator: config.coordinator.clone(),
            task: config.task.clone(),
            active: tokio::sync::Mutex::new(None),
        });
        let election = Election::new(repo, node, &config.coordinator, listener.clone());
        Self { election, listener }
    }

    pub async fn start(&self) -> Result<()> {
        self.election.initialize().await?;
        self.election.elect();
        Ok(())
    }

    pub fn is_master(&self) -> bool {
        self.election.is_master()
    }

    /// The running master state manager, while this node is master
    pub async fn state_manager(&self) -> Option<Arc<MasterStateManager>> {
        self.listener.active.lock().await.clone()
    }

    pub async fn close(&self) {
        self.election.close().await;
        // resignation may not have run if fail-over was still in progress
        self.listener.on_resignation().await;
    }
}
