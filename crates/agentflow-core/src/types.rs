use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Edge type used when the caller does not pick one.
pub const DEFAULT_EDGE_TYPE: &str = "default";

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A named, owned graph of agent nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "empty_object", alias = "meta_info")]
    pub metadata: serde_json::Value,
    #[serde(default, with = "crate::timestamp::option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// One step of a workflow, bound to an agent type and a canvas position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub workflow_id: String,
    /// Agent type tag, a key of the agent catalog.
    #[serde(rename = "node_type")]
    pub agent_type: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub position_x: f64,
    #[serde(default)]
    pub position_y: f64,
    #[serde(default = "empty_object")]
    pub config: serde_json::Value,
    #[serde(default, with = "crate::timestamp::option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        agent_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            agent_type: agent_type.into(),
            name: name.into(),
            description: None,
            position_x: 0.0,
            position_y: 0.0,
            config: empty_object(),
            created_at: None,
            updated_at: None,
        }
    }

    /// Set the canvas position.
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position_x = x;
        self.position_y = y;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn position(&self) -> (f64, f64) {
        (self.position_x, self.position_y)
    }
}

/// A directed, optionally conditioned connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub workflow_id: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(default = "default_edge_type")]
    pub edge_type: String,
    #[serde(default = "empty_object")]
    pub conditions: serde_json::Value,
    #[serde(default, with = "crate::timestamp::option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_edge_type() -> String {
    DEFAULT_EDGE_TYPE.to_string()
}

impl Edge {
    pub fn new(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            edge_type: default_edge_type(),
            conditions: empty_object(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_type(mut self, edge_type: impl Into<String>) -> Self {
        self.edge_type = edge_type.into();
        self
    }

    /// Whether either end of this edge is `node_id`.
    pub fn touches(&self, node_id: &str) -> bool {
        self.source_id == node_id || self.target_id == node_id
    }
}

/// Status of an execution or of one of its steps.
///
/// The engine may introduce values this client does not know about; those
/// are kept verbatim in `Other` and count as terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Other(String),
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Other(s) => s,
        }
    }

    /// No further transition is expected.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::InProgress)
    }
}

impl From<String> for RunStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => RunStatus::Pending,
            "in_progress" => RunStatus::InProgress,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Other(s),
        }
    }
}

impl From<&str> for RunStatus {
    fn from(s: &str) -> Self {
        RunStatus::from(s.to_string())
    }
}

impl From<RunStatus> for String {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record of one node's run within an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub id: String,
    pub node_id: String,
    pub status: RunStatus,
    #[serde(default = "empty_object")]
    pub input_data: serde_json::Value,
    #[serde(default = "empty_object")]
    pub output_data: serde_json::Value,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, with = "crate::timestamp::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionStep {
    pub fn new(id: impl Into<String>, node_id: impl Into<String>, status: RunStatus) -> Self {
        Self {
            id: id.into(),
            node_id: node_id.into(),
            status,
            input_data: empty_object(),
            output_data: empty_object(),
            error_message: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }
}

/// One run of a workflow against a given input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub user_id: String,
    pub status: RunStatus,
    #[serde(default = "empty_object")]
    pub input_data: serde_json::Value,
    #[serde(default = "empty_object")]
    pub output_data: serde_json::Value,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, with = "crate::timestamp::option")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "crate::timestamp::option")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<ExecutionStep>,
}

impl Execution {
    pub fn new(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        user_id: impl Into<String>,
        status: RunStatus,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            user_id: user_id.into(),
            status,
            input_data: empty_object(),
            output_data: empty_object(),
            error_message: None,
            started_at: None,
            completed_at: None,
            steps: Vec::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<ExecutionStep>) -> Self {
        self.steps = steps;
        self
    }

    /// Order steps by start time, timestamp-less steps last. Ties keep their
    /// step id order so repeated polls produce the same sequence.
    pub fn sort_steps(&mut self) {
        self.steps.sort_by(|a, b| match (&a.started_at, &b.started_at) {
            (Some(x), Some(y)) => x.cmp(y).then_with(|| a.id.cmp(&b.id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });
    }
}

/// Catalog metadata describing an invocable agent type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

fn default_category() -> String {
    "general".to_string()
}

/// Agent type tag → descriptor, as reported by the catalog service.
pub type AgentCatalogMap = HashMap<String, AgentDescriptor>;

// Request payloads

#[derive(Debug, Clone, Serialize)]
pub struct NewWorkflow {
    pub user_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewNode {
    #[serde(rename = "node_type")]
    pub agent_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub position_x: f64,
    pub position_y: f64,
    pub config: serde_json::Value,
}

/// Partial node update; absent fields are left untouched by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl NodeUpdate {
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            position_x: Some(x),
            position_y: Some(y),
            ..Default::default()
        }
    }

    pub fn config(config: serde_json::Value) -> Self {
        Self {
            config: Some(config),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewEdge {
    pub source_id: String,
    pub target_id: String,
    pub edge_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartExecution {
    pub user_id: String,
    pub input_data: serde_json::Value,
}

/// Reply to a start request; the full record must be fetched separately.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStarted {
    pub execution_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// Reply body of delete and cancel endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Ack {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_success() -> bool {
    true
}
