pub mod catalog;
pub mod controller;
pub mod graph;
pub mod tracker;

pub use catalog::AgentCatalog;
pub use controller::{EditorSession, NodeDraft};
pub use graph::{GraphModel, GraphSnapshot};
pub use tracker::{Applied, ExecutionTracker, PollEnd, RunSnapshot};
