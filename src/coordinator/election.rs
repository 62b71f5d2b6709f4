//! Master election over a lease-backed key.
//!
//! Every candidate tries to create [`paths::MASTER_PATH`] bound to its own
//! lease and watches the key. The candidate whose record lands there runs
//! its fail-over callback; when the key disappears (lease expired, master
//! resigned) every candidate retries.
//!
//! ```text
//!  Follower ──(own record seen)──▶ Becoming ──(fail-over ok)──▶ Leader
//!     ▲                                │                           │
//!     └──────(fail-over error)─────────┘            (key deleted)  │
//!     └──────────────────────── Resigning ◀─────────────────────────┘
//! ```

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::{paths, timestamp_now_millis, CoordinatorConfig, Result};
use crate::models::{decode, encode, ActiveNode, Master};
use crate::repo::{Compare, EventType, Repository, Txn, WatchStream};

/// Callbacks run on the election's watch task.
#[async_trait]
pub trait ElectionListener: Send + Sync {
    /// This node became master. An error resigns the mastership.
    async fn on_fail_over(&self) -> Result<()>;

    /// This node stopped being master.
    async fn on_resignation(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElectionState {
    Follower = 0,
    Becoming = 1,
    Leader = 2,
    Resigning = 3,
}

impl ElectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ElectionState::Becoming,
            2 => ElectionState::Leader,
            3 => ElectionState::Resigning,
            _ => ElectionState::Follower,
        }
    }
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct Election {
    inner: Arc<ElectionInner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct ElectionInner {
    repo: Arc<dyn Repository>,
    node: ActiveNode,
    ttl: Duration,
    backoff: Duration,
    listener: Arc<dyn ElectionListener>,
    state: AtomicU8,
    retry: Notify,
    cancel: CancellationToken,
}

impl Election {
    pub fn new(
        repo: Arc<dyn Repository>,
        node: ActiveNode,
        config: &CoordinatorConfig,
        listener: Arc<dyn ElectionListener>,
    ) -> Self {
        Self {
            inner: Arc::new(ElectionInner {
                repo,
                node,
                ttl: config.lease_ttl(),
                backoff: config.election_backoff(),
                listener,
                state: AtomicU8::new(ElectionState::Follower as u8),
                retry: Notify::new(),
                cancel: CancellationToken::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Open the watch on the master key.
    pub async fn initialize(&self) -> Result<()> {
        let stream = self.inner.repo.watch(paths::MASTER_PATH, true).await?;
        let inner = self.inner.clone();
        self.push_handle(tokio::spawn(async move { inner.watch_master(stream).await }));
        Ok(())
    }

    /// Start campaigning in the background.
    pub fn elect(&self) {
        let inner = self.inner.clone();
        self.push_handle(tokio::spawn(async move { inner.campaign().await }));
    }

    pub fn is_master(&self) -> bool {
        self.state() == ElectionState::Leader
    }

    pub fn state(&self) -> ElectionState {
        self.inner.state()
    }

    /// Stop campaigning; a leader resigns and removes its record.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        if self.inner.resign().await {
            self.inner.delete_own_record().await;
        }
    }

    fn push_handle(&self, handle: JoinHandle<()>) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }
}

impl Drop for Election {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl ElectionInner {
    fn state(&self) -> ElectionState {
        ElectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ElectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ElectionState, to: ElectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn campaign(&self) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.try_elect().await {
                Ok(true) => {
                    tracing::info!(node = %self.node.node, "elect master record created");
                }
                Ok(false) => {
                    tracing::debug!(
                        node = %self.node.node,
                        "master exists, wait for next election"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        node = %self.node.node,
                        "elect master failed, retry after {:?}: {}",
                        self.backoff,
                        e
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(self.backoff) => continue,
                    }
                }
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = self.retry.notified() => {}
            }
        }
    }

    async fn try_elect(&self) -> Result<bool> {
        let master = Master {
            node: self.node.clone(),
            elect_time: timestamp_now_millis(),
        };
        self.repo
            .put_if_not_exist(paths::MASTER_PATH, encode(&master)?, self.ttl)
            .await
    }

    async fn watch_master(&self, mut stream: WatchStream) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                event = stream.recv() => event,
            };
            let Some(event) = event else {
                tracing::warn!(node = %self.node.node, "master watch closed, stop election");
                self.resign().await;
                return;
            };
            match event.event_type {
                EventType::Delete => self.on_master_deleted().await,
                EventType::All | EventType::Modify => {
                    for kv in &event.kvs {
                        match decode::<Master>(&kv.value) {
                            Ok(master) => self.on_master_changed(master).await,
                            Err(e) => tracing::warn!("skip malformed master record: {}", e),
                        }
                    }
                }
            }
        }
    }

    async fn on_master_changed(&self, master: Master) {
        if !master.is_node(&self.node.node) {
            // someone else holds the key
            if self.resign().await {
                tracing::warn!(
                    node = %self.node.node,
                    master = %master.node.node,
                    "master moved away"
                );
            }
            return;
        }
        if !self.transition(ElectionState::Follower, ElectionState::Becoming) {
            return;
        }
        match self.listener.on_fail_over().await {
            Ok(()) => {
                self.set_state(ElectionState::Leader);
                tracing::info!(node = %self.node.node, "become master");
            }
            Err(e) => {
                tracing::error!(node = %self.node.node, "fail over failed, resign: {}", e);
                self.set_state(ElectionState::Follower);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.backoff) => {}
                }
                self.delete_own_record().await;
            }
        }
    }

    async fn on_master_deleted(&self) {
        if self.resign().await {
            tracing::info!(node = %self.node.node, "master record gone, resigned");
        }
        self.retry.notify_one();
    }

    /// Leader → Follower through Resigning. Returns whether this node was leader.
    async fn resign(&self) -> bool {
        if !self.transition(ElectionState::Leader, ElectionState::Resigning) {
            return false;
        }
        self.listener.on_resignation().await;
        self.set_state(ElectionState::Follower);
        true
    }

    async fn delete_own_record(&self) {
        let Ok(kv) = self.repo.get(paths::MASTER_PATH).await else {
            return;
        };
        let own = decode::<Master>(&kv.value).is_ok_and(|m| m.is_node(&self.node.node));
        if !own {
            return;
        }
        let txn = Txn::new()
            .when(Compare::ModRevision(paths::MASTER_PATH.to_string(), kv.mod_revision))
            .delete(paths::MASTER_PATH);
        if let Err(e) = self.repo.commit(txn).await {
            tracing::warn!(node = %self.node.node, "failed to delete master record: {}", e);
        }
    }
}
