//! Shared test utilities for agentflow crates.
//!
//! [`MockWorkflowApi`] is an in-memory stand-in for the workflow backend:
//! it stores workflows, nodes and edges, records every call, serves scripted
//! execution polls, injects failures and can hold responses back behind
//! gates to reproduce out-of-order arrival.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use tokio::sync::{Notify, Semaphore};

use agentflow_core::error::{FlowError, Result};
use agentflow_core::traits::WorkflowApi;
use agentflow_core::types::*;

pub mod fixtures {
    use super::*;

    fn descriptor(name: &str, description: &str, category: &str, inputs: &[&str], outputs: &[&str]) -> AgentDescriptor {
        AgentDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            category: category.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// A small catalog in the shape the backend reports.
    pub fn default_agents() -> AgentCatalogMap {
        let mut agents = AgentCatalogMap::new();
        agents.insert(
            "requirements_analyzer".into(),
            descriptor("Requirements Analyzer", "Analyzes requirements and extracts key points", "code", &["description"], &["analyzed_requirements"]),
        );
        agents.insert(
            "code_generator".into(),
            descriptor("Code Generator", "Generates code based on requirements or specifications", "code", &["description", "language"], &["generated_code"]),
        );
        agents.insert(
            "code_optimizer".into(),
            descriptor("Code Optimizer", "Optimizes and improves generated code", "code", &["code", "optimization_level"], &["optimized_code"]),
        );
        agents.insert(
            "git_analyzer".into(),
            descriptor("Git Analyzer", "Analyzes git repository and conflicts", "git", &["repository_url", "base_branch", "target_branch"], &["repository_analysis"]),
        );
        agents.insert(
            "task_executor".into(),
            descriptor("Task Executor", "Executes the specified task", "general", &["task_description", "input_data"], &["execution_result"]),
        );
        agents
    }

    /// 2024-01-01T00:00:<secs>Z
    pub fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }
}

/// A failure the mock returns instead of handling the request.
#[derive(Debug, Clone)]
pub enum MockFailure {
    Remote { status: u16, message: Option<String> },
    Transport(String),
}

impl MockFailure {
    pub fn server(status: u16, message: &str) -> Self {
        MockFailure::Remote {
            status,
            message: Some(message.to_string()),
        }
    }

    fn into_error(self) -> FlowError {
        match self {
            MockFailure::Remote { status, message } => FlowError::Remote { status, message },
            MockFailure::Transport(msg) => FlowError::Transport(msg),
        }
    }
}

/// One scripted answer to `get_execution`.
#[derive(Debug, Clone)]
pub enum ScriptedPoll {
    Record(Execution),
    Fail(MockFailure),
}

/// Holds responses of one operation until released.
#[derive(Clone)]
pub struct Gate {
    permits: Arc<Semaphore>,
}

impl Gate {
    /// Let one held response through.
    pub fn release(&self) {
        self.permits.add_permits(1);
    }
}

#[derive(Default)]
struct MockState {
    agents: AgentCatalogMap,
    workflows: Vec<Workflow>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    executions: HashMap<String, Execution>,
    scripts: HashMap<String, VecDeque<ScriptedPoll>>,
    failures: HashMap<String, VecDeque<MockFailure>>,
    calls: Vec<String>,
    aborted: Vec<String>,
    next_node: u32,
    next_edge: u32,
    next_execution: u32,
}

pub struct MockWorkflowApi {
    state: Mutex<MockState>,
    gates: Mutex<HashMap<String, Gate>>,
    call_signal: Notify,
}

impl Default for MockWorkflowApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWorkflowApi {
    /// Mock backend with [`fixtures::default_agents`].
    pub fn new() -> Self {
        Self::with_agents(fixtures::default_agents())
    }

    pub fn with_agents(agents: AgentCatalogMap) -> Self {
        Self {
            state: Mutex::new(MockState {
                agents,
                ..Default::default()
            }),
            gates: Mutex::new(HashMap::new()),
            call_signal: Notify::new(),
        }
    }

    // --- seeding ---

    pub fn seed_workflow(&self, id: &str, user_id: &str, name: &str) -> Workflow {
        let wf = Workflow {
            id: id.to_string(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            description: None,
            metadata: serde_json::json!({}),
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        };
        self.state.lock().unwrap().workflows.push(wf.clone());
        wf
    }

    pub fn seed_node(&self, node: Node) {
        self.state.lock().unwrap().nodes.push(node);
    }

    pub fn seed_edge(&self, edge: Edge) {
        self.state.lock().unwrap().edges.push(edge);
    }

    /// Answers for successive `get_execution(execution_id)` calls. The last
    /// entry keeps being served once the script runs out.
    pub fn script_execution(&self, execution_id: &str, polls: Vec<ScriptedPoll>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(execution_id.to_string(), polls.into());
    }

    /// Make the next call of `op` fail.
    pub fn fail_next(&self, op: &str, failure: MockFailure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Hold every response of `op` until [`Gate::release`] is called. The
    /// request is applied to the mock store before it is held.
    pub fn pause(&self, op: &str) -> Gate {
        let gate = Gate {
            permits: Arc::new(Semaphore::new(0)),
        };
        self.gates
            .lock()
            .unwrap()
            .insert(op.to_string(), gate.clone());
        gate
    }

    // --- inspection ---

    /// Every call so far, as `op` or `op:arg`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        let prefix = format!("{}:", op);
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.as_str() == op || c.starts_with(&prefix))
            .count()
    }

    /// Resolve once `op` has been called at least `n` times.
    pub async fn wait_for_calls(&self, op: &str, n: usize) {
        loop {
            let notified = self.call_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.call_count(op) >= n {
                return;
            }
            notified.await;
        }
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.state.lock().unwrap().nodes.clone()
    }

    pub fn edges(&self) -> Vec<Edge> {
        self.state.lock().unwrap().edges.clone()
    }

    pub fn workflows(&self) -> Vec<Workflow> {
        self.state.lock().unwrap().workflows.clone()
    }

    pub fn aborted(&self) -> Vec<String> {
        self.state.lock().unwrap().aborted.clone()
    }

    // --- internals ---

    /// Log the call and pop an injected failure, if any.
    fn enter(&self, op: &str, arg: Option<&str>) -> Result<()> {
        let failure = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(match arg {
                Some(a) => format!("{}:{}", op, a),
                None => op.to_string(),
            });
            state.failures.get_mut(op).and_then(|q| q.pop_front())
        };
        self.call_signal.notify_waiters();
        match failure {
            Some(f) => Err(f.into_error()),
            None => Ok(()),
        }
    }

    async fn hold(&self, op: &str) {
        let gate = self.gates.lock().unwrap().get(op).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.permits.acquire().await {
                permit.forget();
            }
        }
    }

    fn not_found(what: &str, id: &str) -> FlowError {
        FlowError::Remote {
            status: 404,
            message: Some(format!("{} with ID {} not found", what, id)),
        }
    }
}

impl WorkflowApi for MockWorkflowApi {
    fn create_workflow(&self, req: NewWorkflow) -> BoxFuture<'_, Result<Workflow>> {
        Box::pin(async move {
            self.enter("create_workflow", None)?;
            let wf = Workflow {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: req.user_id,
                name: req.name,
                description: req.description,
                metadata: req.metadata.unwrap_or_else(|| serde_json::json!({})),
                created_at: Some(Utc::now()),
                updated_at: Some(Utc::now()),
            };
            self.state.lock().unwrap().workflows.push(wf.clone());
            self.hold("create_workflow").await;
            Ok(wf)
        })
    }

    fn get_workflow(&self, workflow_id: &str) -> BoxFuture<'_, Result<Workflow>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            self.enter("get_workflow", Some(&workflow_id))?;
            let found = self
                .state
                .lock()
                .unwrap()
                .workflows
                .iter()
                .find(|w| w.id == workflow_id)
                .cloned();
            found.ok_or_else(|| Self::not_found("Workflow", &workflow_id))
        })
    }

    fn list_workflows(&self, user_id: &str) -> BoxFuture<'_, Result<Vec<Workflow>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            self.enter("list_workflows", Some(&user_id))?;
            let state = self.state.lock().unwrap();
            Ok(state
                .workflows
                .iter()
                .filter(|w| w.user_id == user_id)
                .cloned()
                .collect())
        })
    }

    fn update_workflow(
        &self,
        workflow_id: &str,
        update: WorkflowUpdate,
    ) -> BoxFuture<'_, Result<Workflow>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            self.enter("update_workflow", Some(&workflow_id))?;
            let mut state = self.state.lock().unwrap();
            let wf = state
                .workflows
                .iter_mut()
                .find(|w| w.id == workflow_id)
                .ok_or_else(|| Self::not_found("Workflow", &workflow_id))?;
            if let Some(name) = update.name {
                wf.name = name;
            }
            if let Some(description) = update.description {
                wf.description = Some(description);
            }
            wf.updated_at = Some(Utc::now());
            Ok(wf.clone())
        })
    }

    fn delete_workflow(&self, workflow_id: &str) -> BoxFuture<'_, Result<()>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            self.enter("delete_workflow", Some(&workflow_id))?;
            {
                let mut state = self.state.lock().unwrap();
                let before = state.workflows.len();
                state.workflows.retain(|w| w.id != workflow_id);
                if state.workflows.len() == before {
                    return Err(Self::not_found("Workflow", &workflow_id));
                }
                state.nodes.retain(|n| n.workflow_id != workflow_id);
                state.edges.retain(|e| e.workflow_id != workflow_id);
                state.executions.retain(|_, x| x.workflow_id != workflow_id);
            }
            self.hold("delete_workflow").await;
            Ok(())
        })
    }

    fn add_node(&self, workflow_id: &str, req: NewNode) -> BoxFuture<'_, Result<Node>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            self.enter("add_node", Some(&workflow_id))?;
            let node = {
                let mut state = self.state.lock().unwrap();
                if !state.workflows.iter().any(|w| w.id == workflow_id) {
                    return Err(Self::not_found("Workflow", &workflow_id));
                }
                if !state.agents.contains_key(&req.agent_type) {
                    return Err(FlowError::Remote {
                        status: 400,
                        message: Some(format!("Invalid node type: {}", req.agent_type)),
                    });
                }
                state.next_node += 1;
                let mut node = Node::new(
                    format!("n{}", state.next_node),
                    workflow_id.clone(),
                    req.agent_type,
                    req.name,
                )
                .at(req.position_x, req.position_y)
                .with_config(req.config);
                node.description = req.description;
                node.created_at = Some(Utc::now());
                node.updated_at = node.created_at;
                state.nodes.push(node.clone());
                node
            };
            self.hold("add_node").await;
            Ok(node)
        })
    }

    fn list_nodes(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<Node>>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            self.enter("list_nodes", Some(&workflow_id))?;
            let state = self.state.lock().unwrap();
            Ok(state
                .nodes
                .iter()
                .filter(|n| n.workflow_id == workflow_id)
                .cloned()
                .collect())
        })
    }

    fn update_node(&self, node_id: &str, update: NodeUpdate) -> BoxFuture<'_, Result<Node>> {
        let node_id = node_id.to_string();
        Box::pin(async move {
            self.enter("update_node", Some(&node_id))?;
            let node = {
                let mut state = self.state.lock().unwrap();
                let node = state
                    .nodes
                    .iter_mut()
                    .find(|n| n.id == node_id)
                    .ok_or_else(|| Self::not_found("Node", &node_id))?;
                if let Some(name) = update.name {
                    node.name = name;
                }
                if let Some(description) = update.description {
                    node.description = Some(description);
                }
                if let Some(x) = update.position_x {
                    node.position_x = x;
                }
                if let Some(y) = update.position_y {
                    node.position_y = y;
                }
                if let Some(config) = update.config {
                    node.config = config;
                }
                node.updated_at = Some(Utc::now());
                node.clone()
            };
            self.hold("update_node").await;
            Ok(node)
        })
    }

    fn delete_node(&self, node_id: &str) -> BoxFuture<'_, Result<()>> {
        let node_id = node_id.to_string();
        Box::pin(async move {
            self.enter("delete_node", Some(&node_id))?;
            {
                let mut state = self.state.lock().unwrap();
                let before = state.nodes.len();
                state.nodes.retain(|n| n.id != node_id);
                if state.nodes.len() == before {
                    return Err(Self::not_found("Node", &node_id));
                }
                state.edges.retain(|e| !e.touches(&node_id));
            }
            self.hold("delete_node").await;
            Ok(())
        })
    }

    fn add_edge(&self, workflow_id: &str, req: NewEdge) -> BoxFuture<'_, Result<Edge>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            self.enter("add_edge", Some(&workflow_id))?;
            let edge = {
                let mut state = self.state.lock().unwrap();
                if !state.workflows.iter().any(|w| w.id == workflow_id) {
                    return Err(Self::not_found("Workflow", &workflow_id));
                }
                for endpoint in [&req.source_id, &req.target_id] {
                    if !state.nodes.iter().any(|n| &n.id == endpoint) {
                        return Err(FlowError::Remote {
                            status: 400,
                            message: Some(format!("Node {} does not exist", endpoint)),
                        });
                    }
                }
                state.next_edge += 1;
                let mut edge = Edge::new(
                    format!("edge{}", state.next_edge),
                    workflow_id.clone(),
                    req.source_id,
                    req.target_id,
                )
                .with_type(req.edge_type);
                if let Some(conditions) = req.conditions {
                    edge.conditions = conditions;
                }
                edge.created_at = Some(Utc::now());
                edge.updated_at = edge.created_at;
                state.edges.push(edge.clone());
                edge
            };
            self.hold("add_edge").await;
            Ok(edge)
        })
    }

    fn list_edges(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<Edge>>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            self.enter("list_edges", Some(&workflow_id))?;
            let state = self.state.lock().unwrap();
            Ok(state
                .edges
                .iter()
                .filter(|e| e.workflow_id == workflow_id)
                .cloned()
                .collect())
        })
    }

    fn delete_edge(&self, edge_id: &str) -> BoxFuture<'_, Result<()>> {
        let edge_id = edge_id.to_string();
        Box::pin(async move {
            self.enter("delete_edge", Some(&edge_id))?;
            {
                let mut state = self.state.lock().unwrap();
                let before = state.edges.len();
                state.edges.retain(|e| e.id != edge_id);
                if state.edges.len() == before {
                    return Err(Self::not_found("Edge", &edge_id));
                }
            }
            self.hold("delete_edge").await;
            Ok(())
        })
    }

    fn start_execution(
        &self,
        workflow_id: &str,
        req: StartExecution,
    ) -> BoxFuture<'_, Result<String>> {
        let workflow_id = workflow_id.to_string();
        Box::pin(async move {
            self.enter("start_execution", Some(&workflow_id))?;
            let mut state = self.state.lock().unwrap();
            if !state.workflows.iter().any(|w| w.id == workflow_id) {
                return Err(Self::not_found("Workflow", &workflow_id));
            }
            state.next_execution += 1;
            let id = format!("e{}", state.next_execution);
            let mut record = Execution::new(id.clone(), workflow_id, req.user_id, RunStatus::Pending);
            record.input_data = req.input_data;
            record.started_at = Some(Utc::now());
            state.executions.insert(id.clone(), record);
            Ok(id)
        })
    }

    fn get_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<Execution>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            self.enter("get_execution", Some(&execution_id))?;
            let next = {
                let mut state = self.state.lock().unwrap();
                match state.scripts.get_mut(&execution_id) {
                    Some(script) if script.len() > 1 => script.pop_front(),
                    Some(script) => script.front().cloned(),
                    None => state
                        .executions
                        .get(&execution_id)
                        .cloned()
                        .map(ScriptedPoll::Record),
                }
            };
            self.hold("get_execution").await;
            match next {
                Some(ScriptedPoll::Record(record)) => Ok(record),
                Some(ScriptedPoll::Fail(failure)) => Err(failure.into_error()),
                None => Err(Self::not_found("Workflow execution", &execution_id)),
            }
        })
    }

    fn abort_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<()>> {
        let execution_id = execution_id.to_string();
        Box::pin(async move {
            self.enter("abort_execution", Some(&execution_id))?;
            self.state.lock().unwrap().aborted.push(execution_id);
            Ok(())
        })
    }

    fn list_agents(&self) -> BoxFuture<'_, Result<AgentCatalogMap>> {
        Box::pin(async move {
            self.enter("list_agents", None)?;
            let agents = self.state.lock().unwrap().agents.clone();
            self.hold("list_agents").await;
            Ok(agents)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_node_delete_cascades_edges() {
        let api = MockWorkflowApi::new();
        api.seed_workflow("w1", "u1", "W");
        api.seed_node(Node::new("a", "w1", "code_generator", "A"));
        api.seed_node(Node::new("b", "w1", "code_generator", "B"));
        api.seed_edge(Edge::new("x", "w1", "a", "b"));

        api.delete_node("a").await.unwrap();
        assert!(api.edges().is_empty());
        assert_eq!(api.call_count("delete_node"), 1);
    }

    #[tokio::test]
    async fn test_script_repeats_last_entry() {
        let api = MockWorkflowApi::new();
        api.script_execution(
            "e9",
            vec![
                ScriptedPoll::Record(Execution::new("e9", "w1", "u1", RunStatus::Pending)),
                ScriptedPoll::Record(Execution::new("e9", "w1", "u1", RunStatus::Completed)),
            ],
        );
        assert_eq!(api.get_execution("e9").await.unwrap().status, RunStatus::Pending);
        assert_eq!(api.get_execution("e9").await.unwrap().status, RunStatus::Completed);
        assert_eq!(api.get_execution("e9").await.unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let api = MockWorkflowApi::new();
        api.fail_next("list_agents", MockFailure::Transport("down".into()));
        assert!(api.list_agents().await.is_err());
        assert!(api.list_agents().await.is_ok());
        assert_eq!(api.call_count("list_agents"), 2);
    }
}
