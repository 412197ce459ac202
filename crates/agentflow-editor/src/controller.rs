use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agentflow_core::config::EditorConfig;
use agentflow_core::error::{FlowError, Result};
use agentflow_core::event::{EventBus, FlowEvent};
use agentflow_core::traits::WorkflowApi;
use agentflow_core::types::*;

use crate::catalog::AgentCatalog;
use crate::graph::{GraphModel, GraphSnapshot};
use crate::tracker::ExecutionTracker;

/// A node the user dropped on the canvas, before the server has seen it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDraft {
    pub agent_type: String,
    pub position_x: f64,
    pub position_y: f64,
    /// Defaults to the catalog descriptor's name.
    pub name: Option<String>,
    /// Defaults to the catalog descriptor's description.
    pub description: Option<String>,
    pub config: Option<serde_json::Value>,
}

impl NodeDraft {
    pub fn new(agent_type: impl Into<String>, x: f64, y: f64) -> Self {
        Self {
            agent_type: agent_type.into(),
            position_x: x,
            position_y: y,
            name: None,
            description: None,
            config: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = Some(config);
        self
    }
}

#[derive(Default)]
struct SessionState {
    workflow: Option<Workflow>,
    /// Bumped on every open/close so late responses for an earlier session
    /// can be recognised.
    epoch: u64,
    graph: GraphModel,
}

/// Translates user gestures into remote calls and graph updates.
///
/// The graph lock is never held across a remote call. Every failure is
/// published as a notification on the event bus and returned to the caller.
pub struct EditorSession {
    api: Arc<dyn WorkflowApi>,
    catalog: Arc<AgentCatalog>,
    tracker: Arc<ExecutionTracker>,
    event_bus: Arc<EventBus>,
    config: EditorConfig,
    user_id: String,
    state: Arc<Mutex<SessionState>>,
}

impl EditorSession {
    pub fn new(
        api: Arc<dyn WorkflowApi>,
        catalog: Arc<AgentCatalog>,
        tracker: Arc<ExecutionTracker>,
        event_bus: Arc<EventBus>,
        config: EditorConfig,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            api,
            catalog,
            tracker,
            event_bus,
            config,
            user_id: user_id.into(),
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }

    pub fn catalog(&self) -> &Arc<AgentCatalog> {
        &self.catalog
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The open workflow, if any.
    pub async fn workflow(&self) -> Option<Workflow> {
        self.state.lock().await.workflow.clone()
    }

    pub async fn snapshot(&self) -> GraphSnapshot {
        self.state.lock().await.graph.snapshot()
    }

    // --- workflows ---

    pub async fn create_workflow(&self, name: &str, description: Option<&str>) -> Result<Workflow> {
        let req = NewWorkflow {
            user_id: self.user_id.clone(),
            name: name.to_string(),
            description: description.map(str::to_string),
            metadata: None,
        };
        let result = self.api.create_workflow(req).await;
        if let Ok(wf) = &result {
            info!(workflow_id = %wf.id, name = %wf.name, "Workflow created");
        }
        self.report(result, "Failed to create workflow")
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let result = self.api.list_workflows(&self.user_id).await;
        self.report(result, "Failed to get user workflows")
    }

    pub async fn rename_workflow(&self, workflow_id: &str, name: &str) -> Result<Workflow> {
        let update = WorkflowUpdate {
            name: Some(name.to_string()),
            description: None,
        };
        let result = self.api.update_workflow(workflow_id, update).await;
        if let Ok(wf) = &result {
            let mut state = self.state.lock().await;
            if let Some(open) = state.workflow.as_mut().filter(|w| w.id == wf.id) {
                *open = wf.clone();
            }
        }
        self.report(result, "Failed to update workflow")
    }

    /// Delete a workflow remotely. Closes the session if it was the open one.
    pub async fn delete_workflow(&self, workflow_id: &str) -> Result<()> {
        let result = self.api.delete_workflow(workflow_id).await;
        if result.is_ok() {
            info!(workflow_id = %workflow_id, "Workflow deleted");
            let is_open = self
                .state
                .lock()
                .await
                .workflow
                .as_ref()
                .map(|w| w.id == workflow_id)
                .unwrap_or(false);
            if is_open {
                self.close().await;
            }
        }
        self.report(result, "Failed to delete workflow")
    }

    /// Load a workflow with its nodes and edges, replacing the local graph.
    pub async fn open(&self, workflow_id: &str) -> Result<GraphSnapshot> {
        let result = futures::try_join!(
            self.api.get_workflow(workflow_id),
            self.api.list_nodes(workflow_id),
            self.api.list_edges(workflow_id),
        );
        let (workflow, nodes, edges) = self.report(result, "Failed to get workflow")?;

        let snapshot = {
            let mut state = self.state.lock().await;
            state.epoch += 1;
            state.workflow = Some(workflow);
            state.graph.load_nodes(nodes);
            let dropped = state.graph.load_edges(edges);
            if dropped > 0 {
                warn!(workflow_id = %workflow_id, dropped, "Workflow had edges with missing endpoints");
            }
            state.graph.snapshot()
        };
        info!(
            workflow_id = %workflow_id,
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            "Workflow opened"
        );
        self.graph_changed(workflow_id, snapshot.revision);
        Ok(snapshot)
    }

    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.epoch += 1;
        state.workflow = None;
        state.graph.clear();
    }

    // --- graph commands ---

    /// Create a node of a catalog agent type at the drop position. The node
    /// appears in the graph only once the server has confirmed it.
    pub async fn on_add_node(&self, draft: NodeDraft) -> Result<Node> {
        let result = self.add_node(draft).await;
        self.report(result, "Failed to add node")
    }

    async fn add_node(&self, draft: NodeDraft) -> Result<Node> {
        let (workflow_id, epoch) = self.current().await?;
        let descriptor = self
            .catalog
            .lookup(&draft.agent_type)
            .await
            .ok_or_else(|| FlowError::UnknownAgentType(draft.agent_type.clone()))?;

        let req = NewNode {
            agent_type: draft.agent_type,
            name: draft.name.unwrap_or(descriptor.name),
            description: draft.description.or(Some(descriptor.description)),
            position_x: draft.position_x,
            position_y: draft.position_y,
            config: draft
                .config
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
        };
        let node = self.api.add_node(&workflow_id, req).await?;

        let revision = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch {
                return Err(FlowError::Stale(format!("node {}", node.id)));
            }
            state.graph.upsert_node(node.clone());
            state.graph.revision()
        };
        info!(node_id = %node.id, agent_type = %node.agent_type, "Node added");
        self.graph_changed(&workflow_id, revision);
        Ok(node)
    }

    pub async fn on_delete_node(&self, node_id: &str) -> Result<()> {
        let result = self.delete_node(node_id).await;
        self.report(result, "Failed to delete node")
    }

    async fn delete_node(&self, node_id: &str) -> Result<()> {
        let (workflow_id, epoch) = self.current().await?;
        self.api.delete_node(node_id).await?;

        let revision = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch {
                return Ok(());
            }
            state.graph.remove_node(node_id);
            state.graph.revision()
        };
        info!(node_id = %node_id, "Node deleted");
        self.graph_changed(&workflow_id, revision);
        Ok(())
    }

    /// Connect two nodes. Both endpoints must be in the graph.
    pub async fn on_add_edge(
        &self,
        source_id: &str,
        target_id: &str,
        edge_type: Option<&str>,
    ) -> Result<Edge> {
        let result = self.add_edge(source_id, target_id, edge_type).await;
        self.report(result, "Failed to add edge")
    }

    async fn add_edge(&self, source_id: &str, target_id: &str, edge_type: Option<&str>) -> Result<Edge> {
        let edge_type = edge_type
            .unwrap_or(self.config.default_edge_type.as_str())
            .to_string();

        let (workflow_id, epoch, sent_at) = {
            let state = self.state.lock().await;
            let workflow_id = state
                .workflow
                .as_ref()
                .map(|w| w.id.clone())
                .ok_or(FlowError::NoWorkflowOpen)?;
            for endpoint in [source_id, target_id] {
                if !state.graph.contains_node(endpoint) {
                    return Err(FlowError::MissingEndpoint(endpoint.to_string()));
                }
            }
            if source_id == target_id && !self.config.allow_self_loops {
                return Err(FlowError::SelfLoop(source_id.to_string()));
            }
            if !self.config.allow_duplicate_edges
                && state.graph.has_edge(source_id, target_id, &edge_type)
            {
                return Err(FlowError::DuplicateEdge {
                    source_id: source_id.to_string(),
                    target_id: target_id.to_string(),
                    edge_type,
                });
            }
            (workflow_id, state.epoch, state.graph.revision())
        };

        let req = NewEdge {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            edge_type,
            conditions: None,
        };
        let edge = self.api.add_edge(&workflow_id, req).await?;

        let revision = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch || state.graph.upsert_edge(edge.clone()).is_err() {
                return Err(FlowError::Stale(format!("edge {} sent at revision {}", edge.id, sent_at)));
            }
            state.graph.revision()
        };
        info!(edge_id = %edge.id, source = %edge.source_id, target = %edge.target_id, "Edge added");
        self.graph_changed(&workflow_id, revision);
        Ok(edge)
    }

    pub async fn on_delete_edge(&self, edge_id: &str) -> Result<()> {
        let result = self.delete_edge(edge_id).await;
        self.report(result, "Failed to delete edge")
    }

    async fn delete_edge(&self, edge_id: &str) -> Result<()> {
        let (workflow_id, epoch) = self.current().await?;
        self.api.delete_edge(edge_id).await?;

        let revision = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch {
                return Ok(());
            }
            state.graph.remove_edge(edge_id);
            state.graph.revision()
        };
        info!(edge_id = %edge_id, "Edge deleted");
        self.graph_changed(&workflow_id, revision);
        Ok(())
    }

    /// Move a node locally and persist the position in the background.
    ///
    /// The returned handle resolves when the position update has been
    /// answered; callers are free to drop it.
    pub async fn on_node_drag_end(&self, node_id: &str, x: f64, y: f64) -> Result<JoinHandle<()>> {
        let result = self.move_node(node_id, x, y).await;
        self.report(result, "Failed to update node position")
    }

    async fn move_node(&self, node_id: &str, x: f64, y: f64) -> Result<JoinHandle<()>> {
        let (workflow_id, revision) = {
            let mut state = self.state.lock().await;
            let workflow_id = state
                .workflow
                .as_ref()
                .map(|w| w.id.clone())
                .ok_or(FlowError::NoWorkflowOpen)?;
            if !state.graph.set_node_position(node_id, x, y) {
                return Err(FlowError::NodeNotFound(node_id.to_string()));
            }
            (workflow_id, state.graph.revision())
        };
        self.graph_changed(&workflow_id, revision);

        let api = self.api.clone();
        let event_bus = self.event_bus.clone();
        let node_id = node_id.to_string();
        Ok(tokio::spawn(async move {
            match api.update_node(&node_id, NodeUpdate::position(x, y)).await {
                Ok(_) => debug!(node_id = %node_id, x, y, "Node position saved"),
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "Failed to save node position");
                    event_bus.publish(FlowEvent::error(
                        e.user_message("Failed to update node position"),
                    ));
                }
            }
        }))
    }

    /// Replace a node's configuration blob. Only the configuration is taken
    /// from the server's answer; the local position may be newer.
    pub async fn on_update_node_config(&self, node_id: &str, config: serde_json::Value) -> Result<Node> {
        let result = self.update_node_config(node_id, config).await;
        self.report(result, "Failed to update node configuration")
    }

    async fn update_node_config(&self, node_id: &str, config: serde_json::Value) -> Result<Node> {
        let (workflow_id, epoch, sent_at) = {
            let state = self.state.lock().await;
            let workflow_id = state
                .workflow
                .as_ref()
                .map(|w| w.id.clone())
                .ok_or(FlowError::NoWorkflowOpen)?;
            if !state.graph.contains_node(node_id) {
                return Err(FlowError::NodeNotFound(node_id.to_string()));
            }
            (workflow_id, state.epoch, state.graph.revision())
        };

        let remote = self.api.update_node(node_id, NodeUpdate::config(config)).await?;

        let (node, revision) = {
            let mut state = self.state.lock().await;
            let local = match state.graph.node(&remote.id) {
                Some(local) if state.epoch == epoch => local.clone(),
                _ => {
                    return Err(FlowError::Stale(format!("node {} sent at revision {}", remote.id, sent_at)));
                }
            };
            let node = Node {
                config: remote.config,
                updated_at: remote.updated_at,
                ..local
            };
            state.graph.upsert_node(node.clone());
            (node, state.graph.revision())
        };
        info!(node_id = %node.id, "Node configuration updated");
        self.graph_changed(&workflow_id, revision);
        Ok(node)
    }

    // --- execution ---

    /// Start a run of the open workflow; the tracker polls it from here on.
    pub async fn on_run(&self, input: serde_json::Value) -> Result<String> {
        let result = match self.current().await {
            Ok((workflow_id, _)) => self.tracker.start(&workflow_id, &self.user_id, input).await,
            Err(e) => Err(e),
        };
        self.report(result, "Failed to execute workflow")
    }

    pub async fn on_abort(&self, execution_id: &str) -> Result<()> {
        let result = self.tracker.abort(execution_id).await;
        self.report(result, "Failed to abort execution")
    }

    // --- helpers ---

    async fn current(&self) -> Result<(String, u64)> {
        let state = self.state.lock().await;
        state
            .workflow
            .as_ref()
            .map(|w| (w.id.clone(), state.epoch))
            .ok_or(FlowError::NoWorkflowOpen)
    }

    fn graph_changed(&self, workflow_id: &str, revision: u64) {
        self.event_bus.publish(FlowEvent::GraphChanged {
            workflow_id: workflow_id.to_string(),
            revision,
        });
    }

    /// Publish a notification for a failed command. Stale responses are
    /// dropped quietly.
    fn report<T>(&self, result: Result<T>, fallback: &str) -> Result<T> {
        match &result {
            Err(FlowError::Stale(what)) => {
                debug!(target_gone = %what, "Discarded response for a removed target");
            }
            Err(e) => {
                warn!(error = %e, "{}", fallback);
                self.event_bus.publish(FlowEvent::error(e.user_message(fallback)));
            }
            Ok(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::config::ExecutionConfig;
    use agentflow_core::event::NotifyLevel;
    use agentflow_test_utils::{MockFailure, MockWorkflowApi};

    struct Harness {
        api: Arc<MockWorkflowApi>,
        bus: Arc<EventBus>,
        session: Arc<EditorSession>,
    }

    async fn harness_with(config: EditorConfig) -> Harness {
        let api = Arc::new(MockWorkflowApi::new());
        api.seed_workflow("w1", "u1", "Pipeline");
        api.seed_node(Node::new("a", "w1", "code_generator", "A"));
        api.seed_node(Node::new("b", "w1", "code_optimizer", "B"));
        api.seed_node(Node::new("c", "w1", "task_executor", "C"));
        api.seed_edge(Edge::new("ab", "w1", "a", "b"));

        let bus = Arc::new(EventBus::default());
        let catalog = Arc::new(AgentCatalog::new(api.clone()));
        let tracker = Arc::new(ExecutionTracker::new(
            api.clone(),
            bus.clone(),
            &ExecutionConfig::default(),
        ));
        let session = Arc::new(EditorSession::new(
            api.clone(),
            catalog,
            tracker,
            bus.clone(),
            config,
            "u1",
        ));
        session.open("w1").await.unwrap();
        Harness { api, bus, session }
    }

    async fn harness() -> Harness {
        harness_with(EditorConfig::default()).await
    }

    fn errors(rx: &mut tokio::sync::broadcast::Receiver<FlowEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let FlowEvent::Notification {
                level: NotifyLevel::Error,
                message,
            } = event
            {
                out.push(message);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_open_loads_graph() {
        let h = harness().await;
        let snap = h.session.snapshot().await;
        assert_eq!(snap.nodes.len(), 3);
        assert_eq!(snap.edges.len(), 1);
        assert_eq!(h.session.workflow().await.unwrap().name, "Pipeline");
    }

    #[tokio::test]
    async fn test_unknown_agent_type_rejected_locally() {
        let h = harness().await;
        let mut rx = h.bus.subscribe();
        let before = h.session.snapshot().await;

        let err = h
            .session
            .on_add_node(NodeDraft::new("mystery", 10.0, 10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::UnknownAgentType(_)));
        assert_eq!(h.api.call_count("add_node"), 0);
        assert_eq!(h.session.snapshot().await, before);
        assert_eq!(errors(&mut rx), vec!["Agent type mystery is not available"]);
    }

    #[tokio::test]
    async fn test_add_node_uses_descriptor_defaults() {
        let h = harness().await;
        let node = h
            .session
            .on_add_node(NodeDraft::new("code_generator", 120.0, 80.0))
            .await
            .unwrap();
        assert_eq!(node.name, "Code Generator");
        assert_eq!(
            node.description.as_deref(),
            Some("Generates code based on requirements or specifications")
        );
        assert_eq!(node.position(), (120.0, 80.0));
        assert_eq!(node.config, serde_json::json!({}));
        assert!(h.session.snapshot().await.node(&node.id).is_some());
    }

    #[tokio::test]
    async fn test_add_node_failure_leaves_graph() {
        let h = harness().await;
        let mut rx = h.bus.subscribe();
        h.api.fail_next("add_node", MockFailure::server(500, "Database unavailable"));
        let before = h.session.snapshot().await;

        assert!(h
            .session
            .on_add_node(NodeDraft::new("code_generator", 0.0, 0.0))
            .await
            .is_err());
        assert_eq!(h.session.snapshot().await.nodes, before.nodes);
        assert_eq!(errors(&mut rx), vec!["Database unavailable"]);
    }

    #[tokio::test]
    async fn test_add_edge_missing_endpoint_rejected_locally() {
        let h = harness().await;
        let err = h.session.on_add_edge("a", "ghost", None).await.unwrap_err();
        assert!(matches!(err, FlowError::MissingEndpoint(ref id) if id == "ghost"));
        assert_eq!(h.api.call_count("add_edge"), 0);
    }

    #[tokio::test]
    async fn test_self_loop_and_duplicate_policy() {
        let h = harness().await;
        assert!(matches!(
            h.session.on_add_edge("a", "a", None).await,
            Err(FlowError::SelfLoop(_))
        ));
        assert!(matches!(
            h.session.on_add_edge("a", "b", None).await,
            Err(FlowError::DuplicateEdge { .. })
        ));
        // Same endpoints with another type is a different edge.
        h.session.on_add_edge("a", "b", Some("failure")).await.unwrap();
        assert_eq!(h.api.call_count("add_edge"), 1);

        let permissive = harness_with(EditorConfig {
            allow_self_loops: true,
            allow_duplicate_edges: true,
            ..EditorConfig::default()
        })
        .await;
        permissive.session.on_add_edge("a", "a", None).await.unwrap();
        permissive.session.on_add_edge("a", "b", None).await.unwrap();
        assert_eq!(permissive.session.snapshot().await.edges.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_node_cascades_locally() {
        let h = harness().await;
        h.session.on_delete_node("a").await.unwrap();
        let snap = h.session.snapshot().await;
        assert!(snap.node("a").is_none());
        assert!(snap.edges.iter().all(|e| !e.touches("a")));
    }

    #[tokio::test]
    async fn test_delete_edge_failure_keeps_edge() {
        let h = harness().await;
        let mut rx = h.bus.subscribe();
        h.api.fail_next(
            "delete_edge",
            MockFailure::Remote {
                status: 500,
                message: None,
            },
        );
        assert!(h.session.on_delete_edge("ab").await.is_err());
        assert!(h.session.snapshot().await.edge("ab").is_some());
        assert_eq!(errors(&mut rx), vec!["Failed to delete edge"]);
        assert_eq!(h.api.call_count("delete_edge"), 1);
    }

    #[tokio::test]
    async fn test_drag_end_moves_locally_and_persists() {
        let h = harness().await;
        let handle = h.session.on_node_drag_end("b", 300.0, 40.0).await.unwrap();
        assert_eq!(h.session.snapshot().await.node("b").unwrap().position(), (300.0, 40.0));
        handle.await.unwrap();
        let saved = h.api.nodes().into_iter().find(|n| n.id == "b").unwrap();
        assert_eq!(saved.position(), (300.0, 40.0));
    }

    #[tokio::test]
    async fn test_drag_end_failure_is_notified_but_position_kept() {
        let h = harness().await;
        let mut rx = h.bus.subscribe();
        h.api.fail_next("update_node", MockFailure::Transport("reset".into()));
        let handle = h.session.on_node_drag_end("b", 5.0, 6.0).await.unwrap();
        handle.await.unwrap();
        assert_eq!(h.session.snapshot().await.node("b").unwrap().position(), (5.0, 6.0));
        assert_eq!(errors(&mut rx), vec!["Failed to update node position"]);
    }

    #[tokio::test]
    async fn test_update_config_discarded_when_node_deleted_meanwhile() {
        let h = harness().await;
        let gate = h.api.pause("update_node");

        let session = h.session.clone();
        let pending = tokio::spawn(async move {
            session
                .on_update_node_config("c", serde_json::json!({"task_description": "x"}))
                .await
        });
        h.api.wait_for_calls("update_node", 1).await;
        h.session.on_delete_node("c").await.unwrap();
        gate.release();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(FlowError::Stale(_))));
        assert!(h.session.snapshot().await.node("c").is_none());
    }

    #[tokio::test]
    async fn test_update_config_keeps_newer_local_position() {
        let h = harness().await;
        let gate = h.api.pause("update_node");

        let session = h.session.clone();
        let pending = tokio::spawn(async move {
            session
                .on_update_node_config("b", serde_json::json!({"optimization_level": "high"}))
                .await
        });
        h.api.wait_for_calls("update_node", 1).await;
        let saved = h.session.on_node_drag_end("b", 300.0, 40.0).await.unwrap();
        h.api.wait_for_calls("update_node", 2).await;

        gate.release();
        let node = pending.await.unwrap().unwrap();
        assert_eq!(node.position(), (300.0, 40.0));
        assert_eq!(node.config, serde_json::json!({"optimization_level": "high"}));

        let local = h.session.snapshot().await.node("b").cloned().unwrap();
        assert_eq!(local.position(), (300.0, 40.0));
        assert_eq!(local.config, serde_json::json!({"optimization_level": "high"}));

        gate.release();
        saved.await.unwrap();
        assert_eq!(h.session.snapshot().await.node("b").unwrap().position(), (300.0, 40.0));
    }

    #[tokio::test]
    async fn test_add_edge_discarded_after_reopen() {
        let h = harness().await;
        let gate = h.api.pause("add_edge");

        let session = h.session.clone();
        let pending = tokio::spawn(async move { session.on_add_edge("b", "c", None).await });
        h.api.wait_for_calls("add_edge", 1).await;
        h.session.open("w1").await.unwrap();
        gate.release();

        assert!(matches!(pending.await.unwrap(), Err(FlowError::Stale(_))));
        let snap = h.session.snapshot().await;
        let between = snap
            .edges
            .iter()
            .filter(|e| e.source_id == "b" && e.target_id == "c")
            .count();
        assert_eq!(between, 1);
    }

    #[tokio::test]
    async fn test_add_node_discarded_after_workflow_switch() {
        let h = harness().await;
        h.api.seed_workflow("w2", "u1", "Other");
        let gate = h.api.pause("add_node");

        let session = h.session.clone();
        let pending = tokio::spawn(async move {
            session
                .on_add_node(NodeDraft::new("task_executor", 1.0, 1.0))
                .await
        });
        h.api.wait_for_calls("add_node", 1).await;
        h.session.open("w2").await.unwrap();
        gate.release();

        assert!(matches!(pending.await.unwrap(), Err(FlowError::Stale(_))));
        assert!(h.session.snapshot().await.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_commands_require_open_workflow() {
        let h = harness().await;
        h.session.close().await;
        assert!(matches!(
            h.session.on_add_node(NodeDraft::new("code_generator", 0.0, 0.0)).await,
            Err(FlowError::NoWorkflowOpen)
        ));
        assert!(matches!(
            h.session.on_run(serde_json::json!({})).await,
            Err(FlowError::NoWorkflowOpen)
        ));
        assert_eq!(h.api.call_count("start_execution"), 0);
    }

    #[tokio::test]
    async fn test_delete_open_workflow_closes_session() {
        let h = harness().await;
        h.session.delete_workflow("w1").await.unwrap();
        assert!(h.session.workflow().await.is_none());
        assert!(h.session.snapshot().await.nodes.is_empty());
        assert!(h.api.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_rename_updates_open_workflow() {
        let h = harness().await;
        h.session.rename_workflow("w1", "Renamed").await.unwrap();
        assert_eq!(h.session.workflow().await.unwrap().name, "Renamed");
    }
}
