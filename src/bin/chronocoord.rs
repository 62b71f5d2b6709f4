//! chronocoord binary

use async_trait::async_trait;
use chronocoord::common::{paths, timestamp_now_millis, Config};
use chronocoord::coordinator::registry::register_node;
use chronocoord::coordinator::shard_task::{CreateShardProcessor, ShardHost};
use chronocoord::coordinator::{
    BrokerStateManager, MasterController, NamespacedClusterFactory, RootStateManager,
    StorageStateManager,
};
use chronocoord::models::{
    encode, ActiveNode, ClusterConfig, Database, DatabaseOption, Node, ShardId, StatefulNode,
};
use chronocoord::repo::{MemoryRepository, MemoryRepositoryFactory, Repository, RepositoryFactory};
use chronocoord::task::Executor;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chronocoord")]
#[command(about = "Cluster coordination for a distributed time-series database")]
struct Cli {
    /// Root key namespace
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// Lease TTL of master and live-node records, in seconds
    #[arg(long, global = true)]
    lease_ttl_secs: Option<u64>,

    /// Timeout of individual store calls, in milliseconds
    #[arg(long, global = true)]
    request_timeout_ms: Option<u64>,

    /// Maximum operations in one store transaction
    #[arg(long, global = true)]
    max_txn_ops: Option<usize>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Overlay flags given on the command line onto file/env settings.
    fn apply(&self, config: &mut Config) {
        if let Some(namespace) = &self.namespace {
            config.coordinator.namespace = namespace.clone();
        }
        if let Some(ttl) = self.lease_ttl_secs {
            config.coordinator.lease_ttl_secs = ttl;
        }
        if let Some(timeout) = self.request_timeout_ms {
            config.coordinator.request_timeout_ms = timeout;
            config.task.request_timeout_ms = timeout;
        }
        if let Some(max) = self.max_txn_ops {
            config.task.max_txn_ops = max;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run master, storage, broker and root roles in one process
    Standalone {
        /// Storage cluster name
        #[arg(long, default_value = "storage-1")]
        storage: String,

        /// Number of storage nodes to start
        #[arg(long, default_value = "3")]
        storage_nodes: u32,

        /// Broker cluster name
        #[arg(long, default_value = "broker-1")]
        broker: String,

        /// Database to create on startup
        #[arg(long)]
        database: Option<String>,

        /// Shards of the startup database
        #[arg(long, default_value = "4")]
        shards: u32,

        /// Replica factor of the startup database
        #[arg(long, default_value = "2")]
        replicas: u32,
    },
}

/// Shard host that only logs; the storage engine is not part of this binary.
struct LoggingShardHost {
    node_id: u32,
}

#[async_trait]
impl ShardHost for LoggingShardHost {
    async fn create_shards(
        &self,
        database: &str,
        shard_ids: &[ShardId],
        _option: &DatabaseOption,
    ) -> chronocoord::Result<()> {
        tracing::info!(node = self.node_id, database, shards = ?shard_ids, "shards created");
        Ok(())
    }
}

struct StorageNode {
    manager: StorageStateManager,
    executor: Executor,
    repo: Arc<dyn Repository>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration, using defaults: {}", e);
            Config::default()
        }
    };
    cli.apply(&mut config);
    config.validate()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Standalone {
            storage,
            storage_nodes,
            broker,
            database,
            shards,
            replicas,
        } => {
            tracing::info!(
                namespace = %config.coordinator.namespace,
                "starting chronocoord v{} in standalone mode",
                chronocoord::VERSION
            );
            let root = MemoryRepository::new().with_namespace(&config.coordinator.namespace);
            let repo_factory: Arc<dyn RepositoryFactory> =
                Arc::new(MemoryRepositoryFactory::new(&root));
            let root_repo: Arc<dyn Repository> = Arc::new(root.new_handle());
            let ttl = config.coordinator.lease_ttl();

            let storage_config = ClusterConfig::new(storage.clone());
            root_repo
                .put(
                    &paths::join(paths::STORAGE_CONFIG_PATH, &storage),
                    encode(&storage_config)?,
                )
                .await?;

            let mut nodes = Vec::new();
            for id in 1..=storage_nodes {
                let repo = repo_factory.create_repo(&storage_config.namespace())?;
                let node = StatefulNode {
                    node: Node::new("127.0.0.1", 2890 + id as u16, 2990 + id as u16),
                    id,
                    online_time: timestamp_now_millis(),
                };
                register_node(repo.as_ref(), &node.node.indicator(), &node, ttl).await?;

                let manager = StorageStateManager::new(
                    storage.clone(),
                    id,
                    repo.clone(),
                    root_repo.clone(),
                    &config.coordinator,
                );
                manager.start().await?;
                let mut executor = Executor::new(id, repo.clone(), &config.task);
                executor.register(Arc::new(CreateShardProcessor::new(Arc::new(LoggingShardHost {
                    node_id: id,
                }))))?;
                executor.start().await?;
                nodes.push(StorageNode {
                    manager,
                    executor,
                    repo,
                });
            }

            let master_node = ActiveNode {
                node: Node::new("127.0.0.1", 9000, 9001),
                online_time: timestamp_now_millis(),
            };
            let master = MasterController::new(
                master_node,
                root_repo.clone(),
                repo_factory.clone(),
                &config,
            );
            master.start().await?;

            let root_manager = RootStateManager::new(root_repo.clone(), &config.coordinator);
            root_manager.attach(Arc::new(NamespacedClusterFactory::broker(
                repo_factory.clone(),
                root_manager.sender(),
            )))?;
            root_manager.start().await?;
            let broker_config = ClusterConfig::new(broker.clone());
            root_repo
                .put(
                    &paths::join(paths::BROKER_CONFIG_PATH, &broker),
                    encode(&broker_config)?,
                )
                .await?;
            let broker_repo = repo_factory.create_repo(&broker_config.namespace())?;
            let broker_node = ActiveNode {
                node: Node::new("127.0.0.1", 9100, 9101),
                online_time: timestamp_now_millis(),
            };
            register_node(
                broker_repo.as_ref(),
                &broker_node.node.indicator(),
                &broker_node,
                ttl,
            )
            .await?;

            let broker_manager = BrokerStateManager::new(
                root_repo.clone(),
                broker_repo.clone(),
                &config.coordinator,
            );
            broker_manager.start().await?;

            if let Some(name) = database {
                let db = Database {
                    name: name.clone(),
                    storage: storage.clone(),
                    num_of_shard: shards,
                    replica_factor: replicas,
                    option: DatabaseOption::default(),
                };
                db.validate()?;
                root_repo
                    .put(&paths::database_config(&name), encode(&db)?)
                    .await?;
                tracing::info!(database = %name, shards, replicas, "database config written");
            }

            tracing::info!("standalone cluster running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");

            broker_manager.close().await;
            broker_repo.close().await?;
            root_manager.close().await;
            master.close().await;
            for node in nodes {
                node.executor.close().await;
                node.manager.close().await;
                node.repo.close().await?;
            }
            root_repo.close().await?;
        }
    }

    Ok(())
}
