//! Common utilities and types shared across chronocoord

pub mod config;
pub mod error;
pub mod paths;
pub mod utils;

pub use self::config::{Config, CoordinatorConfig, TaskConfig};
pub use error::{Error, Result};
pub use utils::{panic_message, timestamp_now, timestamp_now_millis, with_timeout};
