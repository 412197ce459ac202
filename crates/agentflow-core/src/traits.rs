use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Remote workflow store, execution engine and agent catalog.
///
/// Every call is a suspension point. Implementations must not retry
/// mutating calls on their own.
pub trait WorkflowApi: Send + Sync + 'static {
    // Workflows
    fn create_workflow(&self, req: NewWorkflow) -> BoxFuture<'_, Result<Workflow>>;

    fn get_workflow(&self, workflow_id: &str) -> BoxFuture<'_, Result<Workflow>>;

    fn list_workflows(&self, user_id: &str) -> BoxFuture<'_, Result<Vec<Workflow>>>;

    fn update_workflow(
        &self,
        workflow_id: &str,
        update: WorkflowUpdate,
    ) -> BoxFuture<'_, Result<Workflow>>;

    /// Deletes the workflow; nodes, edges and executions go with it.
    fn delete_workflow(&self, workflow_id: &str) -> BoxFuture<'_, Result<()>>;

    // Nodes
    fn add_node(&self, workflow_id: &str, req: NewNode) -> BoxFuture<'_, Result<Node>>;

    fn list_nodes(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<Node>>>;

    fn update_node(&self, node_id: &str, update: NodeUpdate) -> BoxFuture<'_, Result<Node>>;

    fn delete_node(&self, node_id: &str) -> BoxFuture<'_, Result<()>>;

    // Edges
    fn add_edge(&self, workflow_id: &str, req: NewEdge) -> BoxFuture<'_, Result<Edge>>;

    fn list_edges(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<Edge>>>;

    fn delete_edge(&self, edge_id: &str) -> BoxFuture<'_, Result<()>>;

    // Executions
    /// Start a run. Returns the execution id only.
    fn start_execution(
        &self,
        workflow_id: &str,
        req: StartExecution,
    ) -> BoxFuture<'_, Result<String>>;

    /// Current status of a run, steps embedded.
    fn get_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<Execution>>;

    /// Ask the engine to stop a run. Honoured (or not) by the engine.
    fn abort_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<()>>;

    // Catalog
    fn list_agents(&self) -> BoxFuture<'_, Result<AgentCatalogMap>>;
}
