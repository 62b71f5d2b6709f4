//! Prefix discovery: turns a repository watch into create/delete callbacks.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::Result;
use crate::repo::{EventType, Repository, WatchStream};

/// Receiver of discovered changes.
///
/// Callbacks run on the watch-delivery task and must not block: decode and
/// forward, nothing more.
#[async_trait]
pub trait Listener: Send + Sync {
    async fn on_create(&self, key: &str, value: &[u8]);

    async fn on_delete(&self, key: &str);

    /// Called before an initial listing is replayed.
    async fn cleanup(&self) {}
}

/// Watches one prefix and drives a [`Listener`].
pub struct Discovery {
    repo: Arc<dyn Repository>,
    prefix: String,
    listener: Arc<dyn Listener>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    /// Open the watch and start delivering.
    ///
    /// With `need_initialize`, every key present now is replayed through
    /// `on_create` (after `cleanup`) before incremental events.
    pub async fn discovery(&self, need_initialize: bool) -> Result<()> {
        let stream = self.repo.watch_prefix(&self.prefix, need_initialize).await?;
        let task = tokio::spawn(deliver(
            self.prefix.clone(),
            stream,
            self.listener.clone(),
            self.cancel.clone(),
        ));
        let previous = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn deliver(
    prefix: String,
    mut stream: WatchStream,
    listener: Arc<dyn Listener>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(prefix = %prefix, "discovery closed");
                return;
            }
            event = stream.recv() => event,
        };
        let Some(event) = event else {
            tracing::warn!(prefix = %prefix, "watch channel closed, discovery exits");
            return;
        };
        match event.event_type {
            EventType::All => {
                listener.cleanup().await;
                for kv in &event.kvs {
                    listener.on_create(&kv.key, &kv.value).await;
                }
            }
            EventType::Modify => {
                for kv in &event.kvs {
                    listener.on_create(&kv.key, &kv.value).await;
                }
            }
            EventType::Delete => {
                for kv in &event.kvs {
                    listener.on_delete(&kv.key).await;
                }
            }
        }
    }
}

/// Builds [`Discovery`] instances against one repository handle.
#[derive(Clone)]
pub struct DiscoveryFactory {
    repo: Arc<dyn Repository>,
}

impl DiscoveryFactory {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub fn create_discovery(&self, prefix: &str, listener: Arc<dyn Listener>) -> Discovery {
        Discovery {
            repo: self.repo.clone(),
            prefix: prefix.to_string(),
            listener,
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryRepository;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Recorder {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl Listener for Recorder {
        async fn on_create(&self, key: &str, value: &[u8]) {
            let _ = self
                .tx
                .send(format!("create {} {}", key, String::from_utf8_lossy(value)));
        }

        async fn on_delete(&self, key: &str) {
            let _ = self.tx.send(format!("delete {}", key));
        }

        async fn cleanup(&self) {
            let _ = self.tx.send("cleanup".to_string());
        }
    }

    #[tokio::test]
    async fn test_replay_then_incremental() {
        let repo = Arc::new(MemoryRepository::new());
        repo.put("/db/a", b"1".to_vec()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = DiscoveryFactory::new(repo.clone());
        let discovery = factory.create_discovery("/db/", Arc::new(Recorder { tx }));
        discovery.discovery(true).await.unwrap();

        repo.put("/db/b", b"2".to_vec()).await.unwrap();
        repo.delete("/db/a").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "cleanup");
        assert_eq!(rx.recv().await.unwrap(), "create /db/a 1");
        assert_eq!(rx.recv().await.unwrap(), "create /db/b 2");
        assert_eq!(rx.recv().await.unwrap(), "delete /db/a");

        discovery.close();
        repo.put("/db/c", b"3".to_vec()).await.unwrap();
        let late = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(!matches!(late, Ok(Some(_))));
    }

    #[tokio::test]
    async fn test_without_initialize_skips_existing() {
        let repo = Arc::new(MemoryRepository::new());
        repo.put("/db/a", b"1".to_vec()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let discovery =
            DiscoveryFactory::new(repo.clone()).create_discovery("/db/", Arc::new(Recorder { tx }));
        discovery.discovery(false).await.unwrap();
        repo.put("/db/b", b"2".to_vec()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), "create /db/b 2");
    }
}
