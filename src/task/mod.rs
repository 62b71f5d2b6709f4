//! Task coordination: controller-side submission and aggregation,
//! executor-side dispatch, with all state in the repository.

pub mod controller;
pub mod executor;
pub mod model;
pub mod processor;

pub use controller::Controller;
pub use executor::Executor;
pub use model::{ControllerTaskParam, GroupedTasks, Kind, Task, TaskState};
pub use processor::Processor;
