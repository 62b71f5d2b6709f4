use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::model::{Kind, Task};
use crate::common::Result;

/// Executes tasks of one kind on an executor node.
#[async_trait]
pub trait Processor: Send + Sync {
    fn kind(&self) -> Kind;

    /// Extra attempts after the first failure
    fn retry_count(&self) -> u32 {
        0
    }

    /// Constant wait between attempts; `None` takes the executor's default
    fn retry_back_off(&self) -> Option<Duration> {
        None
    }

    /// Tasks of this kind allowed to run at once
    fn concurrency(&self) -> usize {
        1
    }

    /// `ctx` is cancelled when the executor shuts down.
    async fn process(&self, ctx: CancellationToken, task: &Task) -> Result<()>;
}
