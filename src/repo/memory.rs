//! In-process state repository.
//!
//! One revision counter orders every mutation. Watchers are fed while the
//! store lock is held, so each watch sees events in revision order and an
//! initial listing never misses a concurrent write.
//!
//! Leases are kept alive for as long as the handle that created them is
//! open. Closing the handle, or [`MemoryRepository::revoke_lease`], deletes
//! the attached keys the way a store does when a session's lease expires.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    Compare, EventType, KeyValue, LeaseId, Repository, RepositoryFactory, Txn, TxnOp, WatchEvent,
    WatchStream,
};
use crate::common::{Error, Result};

/// Mirrors the default operation limit of a transaction in etcd
pub const DEFAULT_MAX_TXN_OPS: usize = 128;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
struct Record {
    value: Vec<u8>,
    mod_revision: i64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseRecord {
    owner: u64,
    #[allow(dead_code)]
    ttl: Duration,
    keys: HashSet<String>,
}

struct Watcher {
    owner: u64,
    /// Full key (namespace included)
    target: String,
    prefix: bool,
    namespace: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

impl Watcher {
    fn matches(&self, key: &str) -> bool {
        if self.prefix {
            key.starts_with(&self.target)
        } else {
            key == self.target
        }
    }
}

struct Store {
    revision: i64,
    records: BTreeMap<String, Record>,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease: LeaseId,
    watchers: Vec<Watcher>,
    max_txn_ops: usize,
}

impl Store {
    fn new(max_txn_ops: usize) -> Self {
        Self {
            revision: 0,
            records: BTreeMap::new(),
            leases: HashMap::new(),
            next_lease: 1,
            watchers: Vec::new(),
            max_txn_ops,
        }
    }

    fn grant(&mut self, owner: u64, ttl: Duration) -> LeaseId {
        let id = self.next_lease;
        self.next_lease += 1;
        self.leases.insert(
            id,
            LeaseRecord {
                owner,
                ttl,
                keys: HashSet::new(),
            },
        );
        id
    }

    fn detach(&mut self, key: &str) {
        let lease = self.records.get(key).and_then(|r| r.lease);
        if let Some(lease) = lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
    }

    /// Write at the current revision; the caller bumps `revision` first.
    fn apply_put(&mut self, key: String, value: Vec<u8>, lease: Option<LeaseId>) {
        self.detach(&key);
        if let Some(record) = lease.and_then(|id| self.leases.get_mut(&id)) {
            record.keys.insert(key.clone());
        }
        let kv = KeyValue {
            key: key.clone(),
            value: value.clone(),
            mod_revision: self.revision,
        };
        self.records.insert(
            key,
            Record {
                value,
                mod_revision: self.revision,
                lease,
            },
        );
        self.notify(EventType::Modify, vec![kv]);
    }

    fn apply_delete(&mut self, key: &str) {
        if !self.records.contains_key(key) {
            return;
        }
        self.detach(key);
        self.records.remove(key);
        let kv = KeyValue {
            key: key.to_string(),
            value: Vec::new(),
            mod_revision: self.revision,
        };
        self.notify(EventType::Delete, vec![kv]);
    }

    fn revoke(&mut self, lease: LeaseId) {
        let Some(record) = self.leases.remove(&lease) else {
            return;
        };
        let mut keys: Vec<String> = record.keys.into_iter().collect();
        keys.sort();
        for key in keys {
            self.revision += 1;
            if let Some(r) = self.records.get_mut(&key) {
                r.lease = None;
            }
            self.apply_delete(&key);
        }
    }

    fn notify(&mut self, event_type: EventType, kvs: Vec<KeyValue>) {
        self.watchers.retain(|watcher| {
            let matching: Vec<KeyValue> = kvs
                .iter()
                .filter(|kv| watcher.matches(&kv.key))
                .map(|kv| strip(&watcher.namespace, kv.clone()))
                .collect();
            if matching.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(WatchEvent {
                    event_type,
                    kvs: matching,
                })
                .is_ok()
        });
    }

    fn snapshot(&self, namespace: &str, target: &str, prefix: bool) -> Vec<KeyValue> {
        let to_kv = |(key, record): (&String, &Record)| {
            strip(
                namespace,
                KeyValue {
                    key: key.clone(),
                    value: record.value.clone(),
                    mod_revision: record.mod_revision,
                },
            )
        };
        if prefix {
            self.records
                .range(target.to_string()..)
                .take_while(|(key, _)| key.starts_with(target))
                .map(to_kv)
                .collect()
        } else {
            self.records.get_key_value(target).map(to_kv).into_iter().collect()
        }
    }
}

fn strip(namespace: &str, mut kv: KeyValue) -> KeyValue {
    if let Some(rest) = kv.key.strip_prefix(namespace) {
        kv.key = rest.to_string();
    }
    kv
}

/// Handle onto a shared in-memory store, scoped to a namespace.
pub struct MemoryRepository {
    store: Arc<Mutex<Store>>,
    namespace: String,
    handle: u64,
    closed: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::with_max_txn_ops(DEFAULT_MAX_TXN_OPS)
    }

    pub fn with_max_txn_ops(max_txn_ops: usize) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::new(max_txn_ops))),
            namespace: String::new(),
            handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        }
    }

    /// A new handle onto the same store, nested under `namespace`.
    pub fn with_namespace(&self, namespace: &str) -> Self {
        Self {
            store: self.store.clone(),
            namespace: format!("{}{}", self.namespace, namespace.trim_end_matches('/')),
            handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
        }
    }

    /// A new handle (own leases, own close) on the same namespace.
    pub fn new_handle(&self) -> Self {
        self.with_namespace("")
    }

    /// Expire a lease now, deleting every key attached to it.
    pub fn revoke_lease(&self, lease: LeaseId) {
        self.lock().revoke(lease);
    }

    /// Lease a key is bound to, if any
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        self.lock()
            .records
            .get(&self.full(key))
            .and_then(|r| r.lease)
    }

    /// Current store revision
    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn full(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::RepositoryClosed);
        }
        Ok(())
    }

    fn subscribe(&self, target: &str, prefix: bool, with_initial: bool) -> Result<WatchStream> {
        self.check_open()?;
        let target = self.full(target);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut store = self.lock();
        if with_initial {
            let kvs = store.snapshot(&self.namespace, &target, prefix);
            // receiver is alive, the send cannot fail
            let _ = tx.send(WatchEvent {
                event_type: EventType::All,
                kvs,
            });
        }
        store.watchers.push(Watcher {
            owner: self.handle,
            target,
            prefix,
            namespace: self.namespace.clone(),
            tx,
        });
        Ok(rx)
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get(&self, key: &str) -> Result<KeyValue> {
        self.check_open()?;
        let full = self.full(key);
        let store = self.lock();
        store
            .records
            .get(&full)
            .map(|record| KeyValue {
                key: key.to_string(),
                value: record.value.clone(),
                mod_revision: record.mod_revision,
            })
            .ok_or_else(|| Error::NotExist(key.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_open()?;
        let mut store = self.lock();
        store.revision += 1;
        store.apply_put(self.full(key), value, None);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_open()?;
        let full = self.full(key);
        let mut store = self.lock();
        if store.records.contains_key(&full) {
            store.revision += 1;
            store.apply_delete(&full);
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        self.check_open()?;
        let target = self.full(prefix);
        Ok(self.lock().snapshot(&self.namespace, &target, true))
    }

    async fn watch_prefix(&self, prefix: &str, with_initial: bool) -> Result<WatchStream> {
        self.subscribe(prefix, true, with_initial)
    }

    async fn watch(&self, key: &str, with_initial: bool) -> Result<WatchStream> {
        self.subscribe(key, false, with_initial)
    }

    async fn put_if_not_exist(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        self.check_open()?;
        let full = self.full(key);
        let mut store = self.lock();
        if store.records.contains_key(&full) {
            return Ok(false);
        }
        let lease = store.grant(self.handle, ttl);
        store.revision += 1;
        store.apply_put(full, value, Some(lease));
        Ok(true)
    }

    async fn heartbeat(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<LeaseId> {
        self.check_open()?;
        let mut store = self.lock();
        let lease = store.grant(self.handle, ttl);
        store.revision += 1;
        store.apply_put(self.full(key), value, Some(lease));
        Ok(lease)
    }

    async fn commit(&self, txn: Txn) -> Result<bool> {
        self.check_open()?;
        let mut store = self.lock();
        if txn.ops.len() > store.max_txn_ops {
            return Err(Error::TooManyTxnOps {
                count: txn.ops.len(),
                max: store.max_txn_ops,
            });
        }
        let holds = txn.compares.iter().all(|compare| match compare {
            Compare::NotExists(key) => !store.records.contains_key(&self.full(key)),
            Compare::ModRevision(key, revision) => store
                .records
                .get(&self.full(key))
                .map(|r| r.mod_revision == *revision)
                .unwrap_or(false),
        });
        if !holds {
            return Ok(false);
        }
        store.revision += 1;
        for op in txn.ops {
            match op {
                TxnOp::Put(key, value) => store.apply_put(self.full(&key), value, None),
                TxnOp::Delete(key) => store.apply_delete(&self.full(&key)),
            }
        }
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut store = self.lock();
        let owned: Vec<LeaseId> = store
            .leases
            .iter()
            .filter(|(_, lease)| lease.owner == self.handle)
            .map(|(id, _)| *id)
            .collect();
        for lease in owned {
            store.revoke(lease);
        }
        store.watchers.retain(|w| w.owner != self.handle);
        Ok(())
    }
}

/// Hands out namespaced handles onto one shared store.
pub struct MemoryRepositoryFactory {
    root: MemoryRepository,
}

impl MemoryRepositoryFactory {
    pub fn new(root: &MemoryRepository) -> Self {
        Self {
            root: root.new_handle(),
        }
    }
}

impl RepositoryFactory for MemoryRepositoryFactory {
    fn create_repo(&self, namespace: &str) -> Result<Arc<dyn Repository>> {
        Ok(Arc::new(self.root.with_namespace(namespace)))
    }
}
