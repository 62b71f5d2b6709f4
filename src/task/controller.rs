//! Task controller: submits task groups and aggregates their outcome.
//!
//! A submit writes the group envelope and one record per executor node in a
//! single transaction. The controller then watches every executor record;
//! once all records of a group are terminal it flips the envelope to
//! `DoneOk` (or `DoneErr` if any task failed) and deletes the per-node
//! records, again in one transaction guarded by the envelope's revision.
//! On (re)start the full listing is replayed, so groups that finished while
//! no controller was running are completed too.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::model::{ControllerTaskParam, GroupedTasks, Kind, Task, TaskState};
use crate::common::{paths, timestamp_now_millis, with_timeout, Error, Result, TaskConfig};
use crate::models::{decode, encode};
use crate::repo::{Compare, EventType, KeyValue, Repository, Txn, WatchStream};

pub struct Controller {
    inner: Arc<ControllerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct ControllerInner {
    repo: Arc<dyn Repository>,
    max_txn_ops: usize,
    request_timeout: Duration,
    cancel: CancellationToken,
}

/// Outcome tracking of one group that is still running
struct GroupWaiter {
    envelope_key: String,
    pending: HashSet<String>,
    finished: HashMap<String, Task>,
}

impl GroupWaiter {
    fn new(envelope: &GroupedTasks) -> Self {
        Self {
            envelope_key: envelope.status_key(),
            pending: envelope.executor_keys().into_iter().collect(),
            finished: HashMap::new(),
        }
    }

    fn record(&mut self, key: &str, task: Task) {
        if self.pending.remove(key) {
            self.finished.insert(key.to_string(), task);
        }
    }

    fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Controller {
    pub fn new(repo: Arc<dyn Repository>, config: &TaskConfig) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                repo,
                max_txn_ops: config.max_txn_ops,
                request_timeout: config.request_timeout(),
                cancel: CancellationToken::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Open the executor watch and start aggregating results.
    pub async fn start(&self) -> Result<()> {
        let stream = self
            .inner
            .repo
            .watch_prefix(&paths::children(paths::TASK_EXECUTOR_PATH), true)
            .await?;
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run(stream).await });
        let previous = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::info!("task controller started");
        Ok(())
    }

    /// Submit one task per node as a named group.
    ///
    /// Fails with [`Error::TooManyTasks`] when the group does not fit one
    /// transaction, and with [`Error::TaskNameExists`] while a group with the
    /// same kind and name is still running. A finished group may be resubmitted.
    pub async fn submit(
        &self,
        kind: Kind,
        name: &str,
        params: Vec<ControllerTaskParam>,
    ) -> Result<()> {
        self.inner.submit(kind, name, params).await
    }

    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl ControllerInner {
    async fn submit(
        &self,
        kind: Kind,
        name: &str,
        params: Vec<ControllerTaskParam>,
    ) -> Result<()> {
        if params.is_empty() {
            return Err(Error::InvalidConfig(format!(
                "task group {}/{} has no tasks",
                kind, name
            )));
        }
        // the envelope takes one op
        if params.len() >= self.max_txn_ops {
            return Err(Error::TooManyTasks {
                count: params.len(),
                max: self.max_txn_ops,
            });
        }
        let mut nodes = HashSet::new();
        if let Some(dup) = params.iter().find(|p| !nodes.insert(p.node_id)) {
            return Err(Error::InvalidConfig(format!(
                "task group {}/{} targets node {} twice",
                kind, name, dup.node_id
            )));
        }

        let status_key = paths::task_status(kind.as_str(), name);
        let existing = with_timeout(
            self.request_timeout,
            "get task status",
            self.repo.get(&status_key),
        )
        .await;
        let guard = match existing {
            Ok(kv) => {
                let existing: GroupedTasks = decode(&kv.value)?;
                if !existing.state.is_terminal() {
                    return Err(Error::TaskNameExists(name.to_string()));
                }
                Compare::ModRevision(status_key.clone(), kv.mod_revision)
            }
            Err(e) if e.is_not_exist() => Compare::NotExists(status_key.clone()),
            Err(e) => return Err(e),
        };

        let tasks: Vec<Task> = params
            .into_iter()
            .map(|p| Task::new(kind.clone(), name, p.node_id, p.params))
            .collect();
        let envelope = GroupedTasks {
            kind: kind.clone(),
            name: name.to_string(),
            state: TaskState::Running,
            tasks: tasks.clone(),
            submitted_at: timestamp_now_millis(),
        };

        let mut txn = Txn::new().when(guard).put(status_key, encode(&envelope)?);
        for task in &tasks {
            txn = txn.put(task.executor_key(), encode(task)?);
        }
        if !with_timeout(self.request_timeout, "submit task group", self.repo.commit(txn)).await? {
            return Err(Error::TaskNameExists(name.to_string()));
        }
        tracing::info!(kind = %kind, name, tasks = tasks.len(), "task group submitted");
        Ok(())
    }

    async fn run(&self, mut stream: WatchStream) {
        let mut waiters: HashMap<String, GroupWaiter> = HashMap::new();
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!("task controller stopped");
                    return;
                }
                event = stream.recv() => event,
            };
            let Some(event) = event else {
                tracing::error!("task executor watch closed, controller exits");
                return;
            };
            match event.event_type {
                EventType::All => {
                    waiters.clear();
                    if let Err(e) = self.resync(&mut waiters).await {
                        tracing::error!("failed to load running task groups: {}", e);
                    }
                    for kv in &event.kvs {
                        self.on_task_update(&mut waiters, kv).await;
                    }
                }
                EventType::Modify => {
                    for kv in &event.kvs {
                        self.on_task_update(&mut waiters, kv).await;
                    }
                }
                EventType::Delete => {}
            }
        }
    }

    async fn resync(&self, waiters: &mut HashMap<String, GroupWaiter>) -> Result<()> {
        let envelopes = self
            .repo
            .list(&paths::children(paths::TASK_STATUS_PATH))
            .await?;
        for kv in envelopes {
            match decode::<GroupedTasks>(&kv.value) {
                Ok(envelope) if !envelope.state.is_terminal() => {
                    waiters.insert(envelope.status_key(), GroupWaiter::new(&envelope));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(key = %kv.key, "skip malformed task group: {}", e),
            }
        }
        Ok(())
    }

    async fn on_task_update(&self, waiters: &mut HashMap<String, GroupWaiter>, kv: &KeyValue) {
        let task: Task = match decode(&kv.value) {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(key = %kv.key, "skip malformed task: {}", e);
                return;
            }
        };
        if !task.state.is_terminal() {
            return;
        }
        let status_key = task.status_key();
        if !waiters.contains_key(&status_key) {
            match self.load_waiter(&status_key).await {
                Ok(Some(waiter)) => {
                    waiters.insert(status_key.clone(), waiter);
                }
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(key = %status_key, "failed to load task group: {}", e);
                    return;
                }
            }
        }
        let Some(waiter) = waiters.get_mut(&status_key) else {
            return;
        };
        waiter.record(&kv.key, task);
        if !waiter.is_complete() {
            return;
        }
        if let Some(waiter) = waiters.remove(&status_key) {
            if let Err(e) = self.finish(waiter).await {
                tracing::warn!(key = %status_key, "failed to finish task group: {}", e);
            }
        }
    }

    async fn load_waiter(&self, status_key: &str) -> Result<Option<GroupWaiter>> {
        let kv = match self.repo.get(status_key).await {
            Ok(kv) => kv,
            Err(e) if e.is_not_exist() => return Ok(None),
            Err(e) => return Err(e),
        };
        let envelope: GroupedTasks = decode(&kv.value)?;
        if envelope.state.is_terminal() {
            return Ok(None);
        }
        Ok(Some(GroupWaiter::new(&envelope)))
    }

    async fn finish(&self, mut waiter: GroupWaiter) -> Result<()> {
        let kv = with_timeout(
            self.request_timeout,
            "get task status",
            self.repo.get(&waiter.envelope_key),
        )
        .await?;
        let mut envelope: GroupedTasks = decode(&kv.value)?;
        let keys = envelope.executor_keys();

        let mut tasks = Vec::with_capacity(envelope.tasks.len());
        for (task, key) in envelope.tasks.iter().zip(&keys) {
            tasks.push(waiter.finished.remove(key).unwrap_or_else(|| task.clone()));
        }
        let failed = tasks.iter().any(|t| t.state == TaskState::DoneErr);
        envelope.tasks = tasks;
        envelope.advance(if failed {
            TaskState::DoneErr
        } else {
            TaskState::DoneOk
        })?;

        let mut txn = Txn::new()
            .when(Compare::ModRevision(waiter.envelope_key.clone(), kv.mod_revision))
            .put(waiter.envelope_key.clone(), encode(&envelope)?);
        for key in keys {
            txn = txn.delete(key);
        }
        if !with_timeout(self.request_timeout, "finish task group", self.repo.commit(txn)).await? {
            return Err(Error::ConcurrentModification(waiter.envelope_key));
        }
        tracing::info!(
            kind = %envelope.kind,
            name = %envelope.name,
            state = %envelope.state,
            "task group done"
        );
        Ok(())
    }
}
