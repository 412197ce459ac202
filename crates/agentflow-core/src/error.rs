use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
    // Local validation errors (rejected before any network call)
    #[error("Agent type {0} is not available")]
    UnknownAgentType(String),

    #[error("Edge endpoint not found in graph: {0}")]
    MissingEndpoint(String),

    #[error("Self-loop edges are not allowed: {0}")]
    SelfLoop(String),

    #[error("Edge already exists: {source_id} -> {target_id} ({edge_type})")]
    DuplicateEdge {
        source_id: String,
        target_id: String,
        edge_type: String,
    },

    #[error("Node not found in graph: {0}")]
    NodeNotFound(String),

    #[error("No workflow is open")]
    NoWorkflowOpen,

    // Remote errors
    #[error("Remote request failed ({status}): {}", .message.as_deref().unwrap_or("no message"))]
    Remote { status: u16, message: Option<String> },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Response decode error: {0}")]
    Decode(String),

    #[error("Response discarded, target no longer exists: {0}")]
    Stale(String),

    #[error("Execution not tracked: {0}")]
    UntrackedExecution(String),

    #[error("Polling gave up after {failures} consecutive failures: {execution_id}")]
    PollExhausted { execution_id: String, failures: u32 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Execution tracker is shut down")]
    TrackerShutDown,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Rejected locally, no request was issued.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FlowError::UnknownAgentType(_)
                | FlowError::MissingEndpoint(_)
                | FlowError::SelfLoop(_)
                | FlowError::DuplicateEdge { .. }
                | FlowError::NodeNotFound(_)
                | FlowError::NoWorkflowOpen
        )
    }

    /// Failed on the way to or from the remote side.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            FlowError::Remote { .. } | FlowError::Transport(_) | FlowError::Decode(_)
        )
    }

    /// Text shown to the user. Remote failures use the server message when
    /// there is one and `fallback` otherwise.
    pub fn user_message(&self, fallback: &str) -> String {
        match self {
            FlowError::Remote {
                message: Some(msg), ..
            } if !msg.trim().is_empty() => msg.clone(),
            FlowError::Remote { .. } | FlowError::Transport(_) | FlowError::Decode(_) => {
                fallback.to_string()
            }
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
