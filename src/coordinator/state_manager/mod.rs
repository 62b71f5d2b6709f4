//! State managers: one single-consumer reconciler per role.
//!
//! Producers (state machines, tests, other components) only ever enqueue
//! through [`EventSender`]. One consumer task drains the bounded queue and
//! hands each event to the role's [`EventHandler`], so every mutation of a
//! manager's cache happens on that task, under that manager's one mutex.
//!
//! A panic while handling an event is caught and logged and that single
//! event is dropped; the consumer keeps running. The cache can then lag
//! behind the repository until a later event or a restart re-lists it.

pub mod broker;
pub mod master;
pub mod root;
pub mod storage;

pub use broker::BrokerStateManager;
pub use master::MasterStateManager;
pub use root::RootStateManager;
pub use storage::StorageStateManager;

use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::event::{channel, Command, Event, EventSender};
use crate::common::{panic_message, Result};

#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    fn role(&self) -> &'static str;

    async fn handle(&self, event: &Event) -> Result<()>;
}

/// The consumer task plus the producer handle of its queue.
pub struct EventLoop {
    role: &'static str,
    sender: EventSender,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn start<H: EventHandler>(
        handler: Arc<H>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let role = handler.role();
        let (sender, rx) = channel(capacity);
        let handle = tokio::spawn(consume(handler, rx, cancel.clone()));
        Self {
            role,
            sender,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub async fn emit_event(&self, event: Event) -> Result<()> {
        self.sender.emit(event).await
    }

    /// Resolves once every event emitted before the call was handled.
    pub async fn wait_idle(&self) -> Result<()> {
        self.sender.barrier().await
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(role = self.role, "event consumer ended abnormally: {}", e);
            }
        }
    }
}

async fn consume<H: EventHandler>(
    handler: Arc<H>,
    mut rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) {
    tracing::info!(role = handler.role(), "state manager started");
    loop {
        let command = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = rx.recv() => command,
        };
        match command {
            Some(Command::Event(event)) => process_event(handler.as_ref(), event).await,
            Some(Command::Barrier(done)) => {
                let _ = done.send(());
            }
            None => break,
        }
    }
    tracing::info!(role = handler.role(), "state manager stopped");
}

async fn process_event<H: EventHandler>(handler: &H, event: Event) {
    tracing::debug!(role = handler.role(), kind = %event.kind, key = %event.key, "process event");
    match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_not_exist() => {
            tracing::debug!(
                role = handler.role(),
                kind = %event.kind,
                key = %event.key,
                "skip event: {}",
                e
            );
        }
        Ok(Err(e)) => {
            tracing::error!(
                role = handler.role(),
                kind = %event.kind,
                key = %event.key,
                "failed to process event: {}",
                e
            );
        }
        Err(panic) => {
            tracing::error!(
                role = handler.role(),
                kind = %event.kind,
                key = %event.key,
                "panic while processing event, event dropped: {}",
                panic_message(panic.as_ref())
            );
        }
    }
}
