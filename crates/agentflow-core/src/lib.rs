pub mod config;
pub mod error;
pub mod event;
pub mod timestamp;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowError, Result};
pub use event::{EventBus, FlowEvent, NotifyLevel};
pub use traits::WorkflowApi;
pub use types::*;
