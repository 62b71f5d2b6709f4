//! Task executor: runs the tasks addressed to one node.
//!
//! Each registered kind gets its own queue and dispatcher; a semaphore caps
//! how many tasks of that kind run at once. Results are written back with a
//! revision guard so a record replaced meanwhile is never overwritten.

use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::model::{Kind, Task, TaskState};
use super::processor::Processor;
use crate::common::{paths, panic_message, Error, Result, TaskConfig};
use crate::models::{decode, encode, NodeId};
use crate::repo::{Compare, EventType, KeyValue, Repository, Txn, WatchStream};

/// A task observed at a given revision of its record
struct Dispatch {
    key: String,
    mod_revision: i64,
    task: Task,
}

/// How one dispatched task ended
enum Outcome {
    Done,
    Failed(String),
    /// The executor shut down first; the record is left for the next start
    Interrupted,
}

pub struct Executor {
    node_id: NodeId,
    repo: Arc<dyn Repository>,
    /// Back-off for processors that do not set their own
    retry_back_off: Duration,
    processors: HashMap<Kind, Arc<dyn Processor>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(node_id: NodeId, repo: Arc<dyn Repository>, config: &TaskConfig) -> Self {
        Self {
            node_id,
            repo,
            retry_back_off: config.default_retry_backoff(),
            processors: HashMap::new(),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Register a processor before [`Executor::start`]. One processor per kind.
    pub fn register(&mut self, processor: Arc<dyn Processor>) -> Result<()> {
        let kind = processor.kind();
        if self.processors.contains_key(&kind) {
            return Err(Error::InvalidConfig(format!(
                "processor for task kind {} already registered",
                kind
            )));
        }
        self.processors.insert(kind, processor);
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub async fn start(&self) -> Result<()> {
        let stream = self
            .repo
            .watch_prefix(&paths::task_executor_node(self.node_id), true)
            .await?;

        let mut queues = HashMap::new();
        let mut handles = Vec::with_capacity(self.processors.len() + 1);
        for (kind, processor) in &self.processors {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.insert(kind.clone(), tx);
            handles.push(tokio::spawn(dispatch(
                processor.clone(),
                rx,
                self.repo.clone(),
                self.retry_back_off,
                self.cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(watch(
            self.node_id,
            stream,
            queues,
            self.repo.clone(),
            self.cancel.clone(),
        )));
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        tracing::info!(
            node = self.node_id,
            kinds = self.processors.len(),
            "task executor started"
        );
        Ok(())
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn watch(
    node_id: NodeId,
    mut stream: WatchStream,
    queues: HashMap<Kind, mpsc::UnboundedSender<Dispatch>>,
    repo: Arc<dyn Repository>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = stream.recv() => event,
        };
        let Some(event) = event else {
            tracing::warn!(node = node_id, "task watch closed, executor exits");
            return;
        };
        if event.event_type == EventType::Delete {
            continue;
        }
        for kv in event.kvs {
            route(&queues, repo.as_ref(), kv).await;
        }
    }
}

async fn route(
    queues: &HashMap<Kind, mpsc::UnboundedSender<Dispatch>>,
    repo: &dyn Repository,
    kv: KeyValue,
) {
    let task: Task = match decode(&kv.value) {
        Ok(task) => task,
        Err(e) => {
            tracing::warn!(key = %kv.key, "skip malformed task: {}", e);
            return;
        }
    };
    if task.state.is_terminal() {
        return;
    }
    let item = Dispatch {
        key: kv.key,
        mod_revision: kv.mod_revision,
        task,
    };
    match queues.get(&item.task.kind) {
        Some(queue) => {
            if let Err(mpsc::error::SendError(item)) = queue.send(item) {
                tracing::warn!(key = %item.key, "task queue closed, task dropped");
            }
        }
        None => {
            let reason = Error::UnsupportedTaskKind(item.task.kind.to_string()).to_string();
            tracing::warn!(key = %item.key, "{}", reason);
            write_back(repo, item, Err(reason)).await;
        }
    }
}

async fn dispatch(
    processor: Arc<dyn Processor>,
    mut rx: mpsc::UnboundedReceiver<Dispatch>,
    repo: Arc<dyn Repository>,
    default_back_off: Duration,
    cancel: CancellationToken,
) {
    let back_off = processor.retry_back_off().unwrap_or(default_back_off);
    let semaphore = Arc::new(Semaphore::new(processor.concurrency().max(1)));
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = rx.recv() => item,
        };
        let Some(item) = item else {
            return;
        };
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            permit = semaphore.clone().acquire_owned() => permit,
        };
        let Ok(permit) = permit else {
            return;
        };
        let processor = processor.clone();
        let repo = repo.clone();
        let ctx = cancel.child_token();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = run_with_retry(processor.as_ref(), back_off, ctx, &item.task).await;
            match outcome {
                Outcome::Done => write_back(repo.as_ref(), item, Ok(())).await,
                Outcome::Failed(message) => write_back(repo.as_ref(), item, Err(message)).await,
                Outcome::Interrupted => {
                    tracing::debug!(key = %item.key, "executor closed, task left for restart");
                }
            }
        });
    }
}

async fn run_with_retry(
    processor: &dyn Processor,
    back_off: Duration,
    ctx: CancellationToken,
    task: &Task,
) -> Outcome {
    let attempts = processor.retry_count() + 1;
    let mut attempt = 1;
    loop {
        let result = AssertUnwindSafe(processor.process(ctx.clone(), task))
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(())) => return Outcome::Done,
            // a failure caused by shutdown is not the task's outcome
            Ok(Err(_)) if ctx.is_cancelled() => return Outcome::Interrupted,
            Ok(Err(e)) if attempt < attempts => {
                tracing::warn!(
                    kind = %task.kind,
                    name = %task.name,
                    attempt,
                    "task failed, retry after {:?}: {}",
                    back_off,
                    e
                );
                tokio::select! {
                    _ = ctx.cancelled() => return Outcome::Interrupted,
                    _ = tokio::time::sleep(back_off) => {}
                }
                attempt += 1;
            }
            Ok(Err(e)) => return Outcome::Failed(e.to_string()),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    kind = %task.kind,
                    name = %task.name,
                    "task panicked: {}",
                    message
                );
                return Outcome::Failed(message);
            }
        }
    }
}

async fn write_back(
    repo: &dyn Repository,
    item: Dispatch,
    outcome: std::result::Result<(), String>,
) {
    let mut task = item.task;
    match outcome {
        Ok(()) => task.state = TaskState::DoneOk,
        Err(message) => {
            task.state = TaskState::DoneErr;
            task.err_msg = message;
        }
    }
    let value = match encode(&task) {
        Ok(value) => value,
        Err(e) => {
            tracing::error!(key = %item.key, "failed to encode task: {}", e);
            return;
        }
    };
    let txn = Txn::new()
        .when(Compare::ModRevision(item.key.clone(), item.mod_revision))
        .put(item.key.clone(), value);
    match repo.commit(txn).await {
        Ok(true) => {
            tracing::debug!(key = %item.key, state = %task.state, "task result written");
        }
        Ok(false) => {
            tracing::warn!(key = %item.key, "task record changed meanwhile, result dropped");
        }
        Err(e) => {
            tracing::error!(key = %item.key, "failed to write task result: {}", e);
        }
    }
}
