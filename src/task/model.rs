//! Task records persisted under the task-coordinator paths

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::common::{paths, Error, Result};
use crate::models::NodeId;

/// Task type name; selects the processor on the executor side
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kind(pub String);

impl Kind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Kind {
    fn from(kind: &str) -> Self {
        Self(kind.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Running,
    DoneOk,
    DoneErr,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::DoneOk | TaskState::DoneErr)
    }

    fn rank(&self) -> u8 {
        match self {
            TaskState::Created => 0,
            TaskState::Running => 1,
            TaskState::DoneOk | TaskState::DoneErr => 2,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::DoneOk => "done_ok",
            TaskState::DoneErr => "done_err",
        };
        f.write_str(s)
    }
}

/// One node's share of a task group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub kind: Kind,
    pub name: String,
    pub executor: NodeId,
    #[serde(with = "base64_bytes", default)]
    pub params: Vec<u8>,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub err_msg: String,
}

impl Task {
    pub fn new(kind: Kind, name: impl Into<String>, executor: NodeId, params: Vec<u8>) -> Self {
        Self {
            kind,
            name: name.into(),
            executor,
            params,
            state: TaskState::Created,
            err_msg: String::new(),
        }
    }

    /// Key of this task under its executor's prefix
    pub fn executor_key(&self) -> String {
        paths::task_executor(self.executor, self.kind.as_str(), &self.name)
    }

    pub fn status_key(&self) -> String {
        paths::task_status(self.kind.as_str(), &self.name)
    }
}

/// Envelope of a submitted task group, stored at the status key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedTasks {
    pub kind: Kind,
    pub name: String,
    pub state: TaskState,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub submitted_at: i64,
}

impl GroupedTasks {
    pub fn status_key(&self) -> String {
        paths::task_status(self.kind.as_str(), &self.name)
    }

    pub fn executor_keys(&self) -> Vec<String> {
        self.tasks.iter().map(Task::executor_key).collect()
    }

    /// Move the group forward; a terminal group never changes state again.
    pub fn advance(&mut self, next: TaskState) -> Result<()> {
        if self.state.is_terminal() || next.rank() < self.state.rank() {
            return Err(Error::Internal(format!(
                "task group {}/{} cannot move from {} to {}",
                self.kind, self.name, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Params for one executor node when submitting a group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerTaskParam {
    pub node_id: NodeId,
    pub params: Vec<u8>,
}

impl ControllerTaskParam {
    pub fn new(node_id: NodeId, params: Vec<u8>) -> Self {
        Self { node_id, params }
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_json_shape() {
        let task = Task::new(Kind::from("create-shard"), "cpu-3", 2, b"{\"a\":1}".to_vec());
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["kind"], "create-shard");
        assert_eq!(json["state"], "created");
        assert!(json["params"].is_string());
        assert!(json.get("err_msg").is_none());

        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
        assert_eq!(
            back.executor_key(),
            "/task-coordinator/v1/executor/2/kinds/create-shard/names/cpu-3"
        );
    }

    #[test]
    fn test_group_state_never_regresses() {
        let mut group = GroupedTasks {
            kind: Kind::from("k"),
            name: "n".into(),
            state: TaskState::Running,
            tasks: vec![],
            submitted_at: 0,
        };
        assert!(group.advance(TaskState::Created).is_err());
        group.advance(TaskState::DoneErr).unwrap();
        assert!(group.advance(TaskState::DoneOk).is_err());
        assert_eq!(group.state, TaskState::DoneErr);
    }
}
