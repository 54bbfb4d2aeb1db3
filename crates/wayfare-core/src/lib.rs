pub mod config;
pub mod context;
pub mod contracts;
pub mod error;
pub mod event;
pub mod graph;
pub mod progress;
pub mod strategy;
pub mod types;

pub use config::{RunConfig, LATEST_RUN_CONFIG_VERSION};
pub use error::{Result, WayfareError};
pub use event::{RunEvent, RunEventBus};
pub use progress::{BranchProgress, RunProgress, LATEST_RUN_PROGRESS_VERSION};
pub use types::*;
