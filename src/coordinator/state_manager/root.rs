//! Root state manager: owns the broker clusters and their [`BrokerState`].

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{EventHandler, EventLoop};
use crate::common::{paths, with_timeout, CoordinatorConfig, Error, Result};
use crate::coordinator::cluster::{Cluster, ClusterFactory};
use crate::coordinator::event::{Event, EventKind, EventSender, BROKER_ATTRIBUTE};
use crate::coordinator::state_machine::{StateMachine, StateMachineType};
use crate::discovery::DiscoveryFactory;
use crate::models::{decode, encode, ActiveNode, BrokerState, ClusterConfig};
use crate::repo::Repository;

pub struct RootStateManager {
    inner: Arc<RootInner>,
    event_loop: EventLoop,
    state_machines: Mutex<Vec<StateMachine>>,
}

struct RootInner {
    repo: Arc<dyn Repository>,
    request_timeout: Duration,
    cluster_factory: OnceCell<Arc<dyn ClusterFactory>>,
    brokers: tokio::sync::Mutex<BTreeMap<String, BrokerEntry>>,
}

struct BrokerEntry {
    cluster: Arc<dyn Cluster>,
    state: BrokerState,
}

impl RootStateManager {
    pub fn new(repo: Arc<dyn Repository>, config: &CoordinatorConfig) -> Self {
        let inner = Arc::new(RootInner {
            repo,
            request_timeout: config.request_timeout(),
            cluster_factory: OnceCell::new(),
            brokers: tokio::sync::Mutex::new(BTreeMap::new()),
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

    pub fn attach(&self, factory: Arc<dyn ClusterFactory>) -> Result<()> {
        self.inner
            .cluster_factory
            .set(factory)
            .map_err(|_| Error::AlreadyAttached)
    }

    pub async fn start(&self) -> Result<()> {
        let state_machine = StateMachine::start(
            StateMachineType::BrokerConfig,
            &DiscoveryFactory::new(self.inner.repo.clone()),
            self.sender(),
            BTreeMap::new(),
        )
        .await?;
        self.state_machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state_machine);
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

    pub async fn broker_state(&self, name: &str) -> Option<BrokerState> {
        self.inner
            .brokers
            .lock()
            .await
            .get(name)
            .map(|entry| entry.state.clone())
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

        let mut brokers = self.inner.brokers.lock().await;
        for (name, entry) in std::mem::take(&mut *brokers) {
            if let Err(e) = entry.cluster.close().await {
                tracing::warn!(broker = %name, "failed to close broker cluster: {}", e);
            }
        }
    }
}

#[async_trait]
impl EventHandler for RootInner {
    fn role(&self) -> &'static str {
        "root"
    }

    async fn handle(&self, event: &Event) -> Result<()> {
        match event.kind {
            EventKind::BrokerConfigChanged => self.on_broker_config_changed(event).await,
            EventKind::BrokerConfigDeletion => self.on_broker_config_deletion(event).await,
            EventKind::NodeStartup | EventKind::NodeFailure => self.on_broker_node(event).await,
            other => {
                tracing::warn!(kind = %other, key = %event.key, "root ignores event");
                Ok(())
            }
        }
    }
}

impl RootInner {
    async fn on_broker_config_changed(&self, event: &Event) -> Result<()> {
        let config: ClusterConfig = decode(&event.value)?;
        let factory = self
            .cluster_factory
            .get()
            .ok_or_else(|| Error::Internal("cluster factory not attached".into()))?;
        let mut brokers = self.brokers.lock().await;
        if let Some(entry) = brokers.get(&config.name) {
            if entry.cluster.config() == &config {
                return Ok(());
            }
        }
        if let Some(old) = brokers.remove(&config.name) {
            if let Err(e) = old.cluster.close().await {
                tracing::warn!(broker = %config.name, "failed to close broker cluster: {}", e);
            }
        }
        let cluster = factory.new_cluster(&config).await?;
        let entry = BrokerEntry {
            cluster,
            state: BrokerState::new(config.name.clone()),
        };
        self.sync_state(&entry.state).await?;
        brokers.insert(config.name.clone(), entry);
        tracing::info!(broker = %config.name, "broker cluster registered");
        Ok(())
    }

    async fn on_broker_config_deletion(&self, event: &Event) -> Result<()> {
        let name = event.name();
        let mut brokers = self.brokers.lock().await;
        let Some(entry) = brokers.remove(name) else {
            return Ok(());
        };
        if let Err(e) = entry.cluster.close().await {
            tracing::warn!(broker = name, "failed to close broker cluster: {}", e);
        }
        with_timeout(
            self.request_timeout,
            "delete broker state",
            self.repo.delete(&paths::broker_state(name)),
        )
        .await?;
        tracing::info!(broker = name, "broker cluster removed");
        Ok(())
    }

    async fn on_broker_node(&self, event: &Event) -> Result<()> {
        let broker = event.attribute(BROKER_ATTRIBUTE).ok_or_else(|| {
            Error::Internal(format!("{} event without broker attribute", event.kind))
        })?;
        let mut brokers = self.brokers.lock().await;
        let entry = brokers
            .get_mut(broker)
            .ok_or_else(|| Error::NotExist(format!("broker cluster {}", broker)))?;
        let indicator = event.name().to_string();
        let changed = if event.kind == EventKind::NodeStartup {
            let node: ActiveNode = decode(&event.value)?;
            entry.state.live_nodes.insert(indicator, node.clone()) != Some(node)
        } else {
            entry.state.live_nodes.remove(&indicator).is_some()
        };
        if changed {
            self.sync_state(&entry.state).await?;
        }
        Ok(())
    }

    async fn sync_state(&self, state: &BrokerState) -> Result<()> {
        let value = encode(state)?;
        with_timeout(
            self.request_timeout,
            "put broker state",
            self.repo.put(&paths::broker_state(&state.name), value),
        )
        .await
    }
}
