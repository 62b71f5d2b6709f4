//! State repository: the linearizable key-value store every component
//! converges through.
//!
//! The store itself (replication, consensus) lives outside this crate and
//! is consumed through [`Repository`]. [`memory::MemoryRepository`] is an
//! in-process implementation with the same ordering and transaction
//! guarantees, used for tests and the standalone binary.

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::common::Result;

pub use memory::{MemoryRepository, MemoryRepositoryFactory};

/// Lease handle returned by lease-backed writes
pub type LeaseId = i64;

/// One stored entry. `mod_revision` is the store revision of its last write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Full listing delivered before incremental events
    All,
    Modify,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub kvs: Vec<KeyValue>,
}

/// Events in store revision order; ends when the watch or its repository closes.
pub type WatchStream = mpsc::UnboundedReceiver<WatchEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// Key must be absent
    NotExists(String),
    /// Key's last write must be at this revision
    ModRevision(String, i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put(String, Vec<u8>),
    Delete(String),
}

/// Optimistic transaction: all ops apply atomically iff every compare holds.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub ops: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compares.push(compare);
        self
    }

    pub fn put(mut self, key: impl Into<String>, value: Vec<u8>) -> Self {
        self.ops.push(TxnOp::Put(key.into(), value));
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(TxnOp::Delete(key.into()));
        self
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Read one key; [`crate::Error::NotExist`] when absent.
    async fn get(&self, key: &str) -> Result<KeyValue>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Every entry under `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Watch every key under `prefix`. With `with_initial`, the first event
    /// is an [`EventType::All`] listing taken atomically with the subscription.
    async fn watch_prefix(&self, prefix: &str, with_initial: bool) -> Result<WatchStream>;

    /// Watch one key, optionally starting with an [`EventType::All`] event
    /// holding its current value (empty when absent).
    async fn watch(&self, key: &str, with_initial: bool) -> Result<WatchStream>;

    /// Create `key` bound to a fresh lease unless it exists. Returns whether it was created.
    async fn put_if_not_exist(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    /// Put `key` bound to a lease kept alive by this handle.
    async fn heartbeat(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<LeaseId>;

    /// Commit an optimistic transaction. Returns whether the compares held.
    async fn commit(&self, txn: Txn) -> Result<bool>;

    /// Release this handle; its watch streams end.
    async fn close(&self) -> Result<()>;
}

/// Builds namespaced repository handles, one per sub-cluster.
pub trait RepositoryFactory: Send + Sync {
    fn create_repo(&self, namespace: &str) -> Result<Arc<dyn Repository>>;
}
