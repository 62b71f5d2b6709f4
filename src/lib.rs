//! # chronocoord
//!
//! Cluster coordination core for a distributed time-series database:
//! - Master election over a lease-backed key
//! - Prefix discovery and typed state machines
//! - Per-role state managers (master, storage, broker, root)
//! - Shard replica placement and shard leader derivation
//! - Repository-backed task coordination (controller / executor)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── root namespace ───────────────────────────┐
//! │  /master/node        /database/config/*     /storage/config/*         │
//! │        │                    │                      │                  │
//! │   Election ──▶ MasterStateManager ◀── state machines                  │
//! │                    │  placement                                       │
//! │                    ▼                                                  │
//! │  /database/assign/*   /state/storage/cluster/<name>                   │
//! └────────────┬──────────────────────────────────────────────────────────┘
//!              │ namespaced repo per storage cluster
//!   ┌──────────▼──────────┐   ┌─────────────────────┐
//!   │ /active/nodes/*      │   │ task-coordinator/*  │
//!   │ StorageStateManager  │   │ Controller/Executor │
//!   └──────────────────────┘   └─────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # in-process cluster against the memory repository
//! chronocoord standalone --storage-nodes 3 --database cpu --shards 6 --replicas 2
//! ```

#![allow(clippy::result_large_err)]

pub mod common;
pub mod coordinator;
pub mod discovery;
pub mod models;
pub mod repo;
pub mod task;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{MasterController, MasterStateManager};
pub use repo::{MemoryRepository, Repository};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
