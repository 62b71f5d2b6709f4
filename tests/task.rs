//! Task controller / executor tests

#[macro_use]
mod common;

use async_trait::async_trait;
use chronocoord::common::{paths, TaskConfig};
use chronocoord::coordinator::shard_task::{
    create_shard_tasks, CreateShardProcessor, ShardHost, CREATE_SHARD_KIND,
};
use chronocoord::coordinator::{MasterStateManager, NamespacedClusterFactory};
use chronocoord::models::{decode, encode, DatabaseOption, ShardId};
use chronocoord::repo::{MemoryRepository, MemoryRepositoryFactory, Repository, RepositoryFactory};
use chronocoord::task::{
    Controller, ControllerTaskParam, Executor, GroupedTasks, Kind, Processor, Task, TaskState,
};
use chronocoord::Error;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{database, put_database, put_storage_config, register_storage_nodes, test_config};

const KIND: &str = "test-kind";

#[derive(Default)]
struct TestProcessor {
    fail_nodes: HashSet<u32>,
    panic_nodes: HashSet<u32>,
    /// Attempts that fail before one succeeds
    flaky_attempts: u32,
    retry_count: u32,
    /// `None` leaves the back-off to the executor
    back_off: Option<Duration>,
    concurrency: usize,
    delay: Duration,
    calls: AtomicU32,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

#[async_trait]
impl Processor for TestProcessor {
    fn kind(&self) -> Kind {
        Kind::from(KIND)
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn retry_back_off(&self) -> Option<Duration> {
        self.back_off
    }

    fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }

    async fn process(&self, _ctx: CancellationToken, task: &Task) -> chronocoord::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.panic_nodes.contains(&task.executor) {
            panic!("processor blew up on node {}", task.executor);
        }
        if self.fail_nodes.contains(&task.executor) {
            return Err(Error::Other(format!("node {} refused", task.executor)));
        }
        if call <= self.flaky_attempts {
            return Err(Error::Other("not yet".into()));
        }
        Ok(())
    }
}

/// Short default back-off so retry tests stay fast
fn task_config() -> TaskConfig {
    TaskConfig {
        default_retry_backoff_ms: 5,
        ..Default::default()
    }
}

async fn start_executor_with(
    repo: Arc<dyn Repository>,
    node_id: u32,
    processor: Arc<dyn Processor>,
    config: &TaskConfig,
) -> Executor {
    let mut executor = Executor::new(node_id, repo, config);
    executor.register(processor).unwrap();
    executor.start().await.unwrap();
    executor
}

async fn start_executor(
    repo: &Arc<MemoryRepository>,
    node_id: u32,
    processor: Arc<dyn Processor>,
) -> Executor {
    start_executor_with(repo.clone(), node_id, processor, &task_config()).await
}

fn params(nodes: &[u32]) -> Vec<ControllerTaskParam> {
    nodes
        .iter()
        .map(|id| ControllerTaskParam::new(*id, format!("node-{}", id).into_bytes()))
        .collect()
}

async fn envelope(repo: &MemoryRepository, name: &str) -> GroupedTasks {
    decode(&repo.get(&paths::task_status(KIND, name)).await.unwrap().value).unwrap()
}

async fn executor_keys(repo: &MemoryRepository) -> usize {
    repo.list(&paths::children(paths::TASK_EXECUTOR_PATH))
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_group_completes_ok_and_cleans_up() {
    let repo = Arc::new(MemoryRepository::new());
    let controller = Controller::new(repo.clone(), &TaskConfig::default());
    controller.start().await.unwrap();
    let processor = Arc::new(TestProcessor::default());
    let mut executors = Vec::new();
    for id in 1..=3 {
        executors.push(start_executor(&repo, id, processor.clone()).await);
    }

    controller
        .submit(Kind::from(KIND), "g1", params(&[1, 2, 3]))
        .await
        .unwrap();
    eventually!(envelope(&repo, "g1").await.state == TaskState::DoneOk);
    let done = envelope(&repo, "g1").await;
    assert!(done.tasks.iter().all(|t| t.state == TaskState::DoneOk));
    assert_eq!(done.tasks[1].params, b"node-2");
    assert_eq!(executor_keys(&repo).await, 0);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);

    // a finished name can be reused
    controller
        .submit(Kind::from(KIND), "g1", params(&[1]))
        .await
        .unwrap();
    eventually!(envelope(&repo, "g1").await.state == TaskState::DoneOk);
    assert_eq!(envelope(&repo, "g1").await.tasks.len(), 1);

    for executor in executors {
        executor.close().await;
    }
    controller.close().await;
}

#[tokio::test]
async fn test_any_failure_fails_group() {
    let repo = Arc::new(MemoryRepository::new());
    let controller = Controller::new(repo.clone(), &TaskConfig::default());
    controller.start().await.unwrap();
    let processor = Arc::new(TestProcessor {
        fail_nodes: [2].into_iter().collect(),
        ..Default::default()
    });
    let _e1 = start_executor(&repo, 1, processor.clone()).await;
    let _e2 = start_executor(&repo, 2, processor.clone()).await;

    controller
        .submit(Kind::from(KIND), "g", params(&[1, 2]))
        .await
        .unwrap();
    eventually!(envelope(&repo, "g").await.state == TaskState::DoneErr);
    let done = envelope(&repo, "g").await;
    assert_eq!(done.tasks[0].state, TaskState::DoneOk);
    assert_eq!(done.tasks[1].state, TaskState::DoneErr);
    assert!(done.tasks[1].err_msg.contains("node 2 refused"));
    assert_eq!(executor_keys(&repo).await, 0);
}

#[tokio::test]
async fn test_panic_is_reported_as_failure() {
    let repo = Arc::new(MemoryRepository::new());
    let controller = Controller::new(repo.clone(), &TaskConfig::default());
    controller.start().await.unwrap();
    let processor = Arc::new(TestProcessor {
        panic_nodes: [1].into_iter().collect(),
        ..Default::default()
    });
    let _e1 = start_executor(&repo, 1, processor.clone()).await;

    controller
        .submit(Kind::from(KIND), "p", params(&[1]))
        .await
        .unwrap();
    eventually!(envelope(&repo, "p").await.state == TaskState::DoneErr);
    let done = envelope(&repo, "p").await;
    assert!(done.tasks[0].err_msg.contains("processor blew up"));

    // the executor keeps serving after a panic
    controller
        .submit(Kind::from(KIND), "p2", params(&[1]))
        .await
        .unwrap();
    eventually!(envelope(&repo, "p2").await.state.is_terminal());
    assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_retry_until_success() {
    let repo = Arc::new(MemoryRepository::new());
    let controller = Controller::new(repo.clone(), &TaskConfig::default());
    controller.start().await.unwrap();
    let processor = Arc::new(TestProcessor {
        flaky_attempts: 2,
        retry_count: 2,
        ..Default::default()
    });
    let _e1 = start_executor(&repo, 1, processor.clone()).await;

    controller
        .submit(Kind::from(KIND), "r", params(&[1]))
        .await
        .unwrap();
    eventually!(envelope(&repo, "r").await.state == TaskState::DoneOk);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let repo = Arc::new(MemoryRepository::new());
    let controller = Controller::new(repo.clone(), &TaskConfig::default());
    controller.start().await.unwrap();
    let processor = Arc::new(TestProcessor {
        flaky_attempts: 5,
        retry_count: 1,
        ..Default::default()
    });
    let _e1 = start_executor(&repo, 1, processor.clone()).await;

    controller
        .submit(Kind::from(KIND), "r", params(&[1]))
        .await
        .unwrap();
    eventually!(envelope(&repo, "r").await.state == TaskState::DoneErr);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unknown_kind_fails_task() {
    let repo = Arc::new(MemoryRepository::new());
    let controller = Controller::new(repo.clone(), &TaskConfig::default());
    controller.start().await.unwrap();
    let _e1 = start_executor(&repo, 1, Arc::new(TestProcessor::default())).await;

    controller
        .submit(Kind::from("nobody-handles-this"), "u", params(&[1]))
        .await
        .unwrap();
    let key = paths::task_status("nobody-handles-this", "u");
    eventually!({
        let group: GroupedTasks = decode(&repo.get(&key).await.unwrap().value).unwrap();
        group.state == TaskState::DoneErr
    });
}

#[tokio::test]
async fn test_concurrency_limit_per_kind() {
    let repo = Arc::new(MemoryRepository::new());
    let controller = Controller::new(repo.clone(), &TaskConfig::default());
    controller.start().await.unwrap();
    let processor = Arc::new(TestProcessor {
        concurrency: 2,
        delay: Duration::from_millis(30),
        ..Default::default()
    });
    let _e1 = start_executor(&repo, 1, processor.clone()).await;

    for i in 0..6 {
        controller
            .submit(Kind::from(KIND), &format!("c{}", i), params(&[1]))
            .await
            .unwrap();
    }
    for i in 0..6 {
        eventually!(envelope(&repo, &format!("c{}", i)).await.state == TaskState::DoneOk);
    }
    assert_eq!(processor.calls.load(Ordering::SeqCst), 6);
    assert!(processor.max_running.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_controller_restart_finishes_completed_groups() {
    let repo = Arc::new(MemoryRepository::new());
    let processor = Arc::new(TestProcessor::default());
    let _e1 = start_executor(&repo, 1, processor.clone()).await;
    let _e2 = start_executor(&repo, 2, processor.clone()).await;

    // submitted while no controller loop is running
    let offline = Controller::new(repo.clone(), &TaskConfig::default());
    offline
        .submit(Kind::from(KIND), "late", params(&[1, 2]))
        .await
        .unwrap();
    eventually!(processor.calls.load(Ordering::SeqCst) == 2);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(envelope(&repo, "late").await.state, TaskState::Running);

    let controller = Controller::new(repo.clone(), &TaskConfig::default());
    controller.start().await.unwrap();
    eventually!(envelope(&repo, "late").await.state == TaskState::DoneOk);
    assert_eq!(executor_keys(&repo).await, 0);
    controller.close().await;
}

#[derive(Default)]
struct RecordingHost {
    created: Mutex<Vec<(String, Vec<ShardId>)>>,
}

#[async_trait]
impl ShardHost for RecordingHost {
    async fn create_shards(
        &self,
        database: &str,
        shard_ids: &[ShardId],
        _option: &DatabaseOption,
    ) -> chronocoord::Result<()> {
        self.created
            .lock()
            .unwrap()
            .push((database.to_string(), shard_ids.to_vec()));
        Ok(())
    }
}

#[tokio::test]
async fn test_create_shard_processor() {
    use chronocoord::models::{Replica, ShardAssignment};

    let repo = Arc::new(MemoryRepository::new());
    let controller = Controller::new(repo.clone(), &TaskConfig::default());
    controller.start().await.unwrap();
    let host = Arc::new(RecordingHost::default());
    let _e1 = start_executor(&repo, 1, Arc::new(CreateShardProcessor::new(host.clone()))).await;

    let mut assignment = ShardAssignment::new("cpu");
    assignment.shards.insert(0, Replica::new(vec![1]));
    assignment.shards.insert(1, Replica::new(vec![1]));
    let tasks = create_shard_tasks(&assignment, &DatabaseOption::default()).unwrap();
    controller
        .submit(Kind::from(CREATE_SHARD_KIND), "cpu-2", tasks)
        .await
        .unwrap();

    let key = paths::task_status(CREATE_SHARD_KIND, "cpu-2");
    eventually!({
        let group: GroupedTasks = decode(&repo.get(&key).await.unwrap().value).unwrap();
        group.state == TaskState::DoneOk
    });
    assert_eq!(
        host.created.lock().unwrap().clone(),
        vec![("cpu".to_string(), vec![0, 1])]
    );
}

#[tokio::test]
async fn test_executor_shutdown_leaves_task_for_restart() {
    let repo = Arc::new(MemoryRepository::new());
    let controller = Controller::new(repo.clone(), &task_config());
    controller.start().await.unwrap();
    let failing = Arc::new(TestProcessor {
        fail_nodes: [1].into_iter().collect(),
        retry_count: 5,
        back_off: Some(Duration::from_millis(500)),
        ..Default::default()
    });
    let executor = start_executor(&repo, 1, failing.clone()).await;

    controller
        .submit(Kind::from(KIND), "s", params(&[1]))
        .await
        .unwrap();
    eventually!(failing.calls.load(Ordering::SeqCst) == 1);
    // closed while waiting out the first back-off
    executor.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let kv = repo.get(&paths::task_executor(1, KIND, "s")).await.unwrap();
    let task: Task = decode(&kv.value).unwrap();
    assert_eq!(task.state, TaskState::Created);
    assert!(task.err_msg.is_empty());
    assert_eq!(envelope(&repo, "s").await.state, TaskState::Running);
    assert_eq!(failing.calls.load(Ordering::SeqCst), 1);

    // the next executor on that node runs it again
    let healthy = Arc::new(TestProcessor::default());
    let executor = start_executor(&repo, 1, healthy.clone()).await;
    eventually!(envelope(&repo, "s").await.state == TaskState::DoneOk);
    assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    executor.close().await;
    controller.close().await;
}

#[tokio::test]
async fn test_stale_result_is_not_written_over_newer_record() {
    let repo = Arc::new(MemoryRepository::new());
    let processor = Arc::new(TestProcessor {
        delay: Duration::from_millis(200),
        ..Default::default()
    });
    let executor = start_executor(&repo, 1, processor.clone()).await;

    let task = Task::new(Kind::from(KIND), "w", 1, b"v1".to_vec());
    let key = task.executor_key();
    repo.put(&key, encode(&task).unwrap()).await.unwrap();
    eventually!(processor.running.load(Ordering::SeqCst) == 1);

    // replaced while the processor still works on the old revision
    let mut replaced = task.clone();
    replaced.state = TaskState::DoneErr;
    replaced.err_msg = "superseded".into();
    repo.put(&key, encode(&replaced).unwrap()).await.unwrap();

    eventually!(processor.running.load(Ordering::SeqCst) == 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored: Task = decode(&repo.get(&key).await.unwrap().value).unwrap();
    assert_eq!(stored, replaced);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    executor.close().await;
}

#[tokio::test]
async fn test_configured_back_off_applies_to_processor_defaults() {
    let repo = Arc::new(MemoryRepository::new());
    let controller = Controller::new(repo.clone(), &task_config());
    controller.start().await.unwrap();
    let processor = Arc::new(TestProcessor {
        flaky_attempts: 1,
        retry_count: 1,
        ..Default::default()
    });
    let config = TaskConfig {
        default_retry_backoff_ms: 300,
        ..Default::default()
    };
    let _e1 = start_executor_with(repo.clone(), 1, processor.clone(), &config).await;

    let started = std::time::Instant::now();
    controller
        .submit(Kind::from(KIND), "b", params(&[1]))
        .await
        .unwrap();
    eventually!(envelope(&repo, "b").await.state == TaskState::DoneOk);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
    controller.close().await;
}

#[tokio::test]
async fn test_master_assignment_creates_shards_on_nodes() {
    let root = MemoryRepository::new();
    let factory = Arc::new(MemoryRepositoryFactory::new(&root));
    let config = test_config();
    let manager = MasterStateManager::new(Arc::new(root.new_handle()), &config.coordinator);
    manager
        .attach(Arc::new(
            NamespacedClusterFactory::storage(factory.clone(), manager.sender())
                .with_tasks(task_config()),
        ))
        .unwrap();
    manager.start().await.unwrap();
    put_storage_config(&root, "s1").await;
    eventually!(manager.storage_state("s1").await.is_some());

    let cluster_repo = factory.create_repo("/s1").unwrap();
    let host = Arc::new(RecordingHost::default());
    let mut executors = Vec::new();
    for id in 1..=3 {
        let processor = Arc::new(CreateShardProcessor::new(host.clone()));
        let config = task_config();
        let executor = start_executor_with(cluster_repo.clone(), id, processor, &config);
        executors.push(executor.await);
    }
    register_storage_nodes(cluster_repo.as_ref(), &[1, 2, 3]).await;
    put_database(&root, &database("cpu", "s1", 3, 2)).await;

    let key = paths::task_status(CREATE_SHARD_KIND, "cpu-3");
    eventually!(match cluster_repo.get(&key).await {
        Ok(kv) => decode::<GroupedTasks>(&kv.value).unwrap().state == TaskState::DoneOk,
        Err(_) => false,
    });

    let state = manager.storage_state("s1").await.unwrap();
    let expected = create_shard_tasks(&state.shard_assignments["cpu"], &DatabaseOption::default())
        .unwrap();
    let created = host.created.lock().unwrap().clone();
    assert_eq!(created.len(), expected.len());
    assert!(created.iter().all(|(db, _)| db == "cpu"));
    // 3 shards, 2 replicas each
    assert_eq!(created.iter().map(|(_, shards)| shards.len()).sum::<usize>(), 6);
    assert!(cluster_repo
        .list(&paths::children(paths::TASK_EXECUTOR_PATH))
        .await
        .unwrap()
        .is_empty());

    for executor in executors {
        executor.close().await;
    }
    manager.close().await;
}
