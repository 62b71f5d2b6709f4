//! Typed cluster events and the bounded queue feeding a state manager.

use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::{mpsc, oneshot};

use crate::common::{paths, Error, Result};

/// Attribute naming the storage cluster an event came from
pub const STORAGE_ATTRIBUTE: &str = "storage";
/// Attribute naming the broker cluster an event came from
pub const BROKER_ATTRIBUTE: &str = "broker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DatabaseConfigChanged,
    DatabaseConfigDeletion,
    ShardAssignmentChanged,
    ShardAssignmentDeletion,
    NodeStartup,
    NodeFailure,
    StorageStateChanged,
    StorageStateDeletion,
    StorageConfigChanged,
    StorageConfigDeletion,
    BrokerConfigChanged,
    BrokerConfigDeletion,
    DatabaseLimitsChanged,
    DatabaseLimitsDeletion,
    ReplicaStateChanged,
    ReplicaStateDeletion,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One change observed in the repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub key: String,
    /// Empty for deletions
    pub value: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind, key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            kind,
            key: key.into(),
            value,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Entity name encoded in the key
    pub fn name(&self) -> &str {
        paths::last_segment(&self.key)
    }
}

pub(crate) enum Command {
    Event(Event),
    /// Resolved once every command queued before it was handled
    Barrier(oneshot::Sender<()>),
}

/// Producer side of a state manager's queue
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<Command>,
}

impl EventSender {
    /// Enqueue an event, waiting only while the queue is full.
    pub async fn emit(&self, event: Event) -> Result<()> {
        self.tx
            .send(Command::Event(event))
            .await
            .map_err(|_| Error::Closed("event queue".into()))
    }

    pub(crate) async fn barrier(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Barrier(done_tx))
            .await
            .map_err(|_| Error::Closed("event queue".into()))?;
        done_rx
            .await
            .map_err(|_| Error::Closed("event queue".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub(crate) fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = Event::new(EventKind::NodeFailure, "/active/nodes/3", vec![])
            .with_attribute(STORAGE_ATTRIBUTE, "s1");
        assert_eq!(event.name(), "3");
        assert_eq!(event.attribute(STORAGE_ATTRIBUTE), Some("s1"));
        assert_eq!(event.attribute(BROKER_ATTRIBUTE), None);
        assert_eq!(event.kind.to_string(), "NodeFailure");
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped() {
        let (sender, rx) = channel(4);
        drop(rx);
        let err = sender
            .emit(Event::new(EventKind::NodeStartup, "/k", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
        assert!(sender.is_closed());
    }
}
