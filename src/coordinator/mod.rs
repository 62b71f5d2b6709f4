//! Cluster coordination
//!
//! - Master election over a lease-backed key
//! - Discovery-driven state machines feeding per-role state managers
//! - Shard placement and derived shard leadership
//! - Sub-cluster lifecycle for storage and broker clusters

pub mod cluster;
pub mod election;
pub mod event;
pub mod master;
pub mod placement;
pub mod registry;
pub mod shard_task;
pub mod state_machine;
pub mod state_manager;

pub use cluster::{Cluster, ClusterFactory, NamespacedClusterFactory};
pub use election::{Election, ElectionListener, ElectionState};
pub use event::{Event, EventKind, EventSender};
pub use master::MasterController;
pub use state_machine::{StateMachine, StateMachineType};
pub use state_manager::{
    BrokerStateManager, MasterStateManager, RootStateManager, StorageStateManager,
};
