use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use agentflow_core::config::ApiConfig;
use agentflow_core::error::{FlowError, Result};
use agentflow_core::traits::WorkflowApi;
use agentflow_core::types::*;

/// `WorkflowApi` over the backend's JSON/HTTP interface.
pub struct HttpWorkflowApi {
    http: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct AgentsEnvelope {
    #[serde(default)]
    agents: AgentCatalogMap,
}

impl HttpWorkflowApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("agentflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FlowError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!(method = %method, url = %url, "Workflow API request");
        let req = self.http.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T> {
        let resp = req
            .send()
            .await
            .map_err(|e| FlowError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| FlowError::Transport(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            let message = server_message(&body);
            warn!(
                status = status.as_u16(),
                message = message.as_deref().unwrap_or(""),
                "Workflow API returned an error"
            );
            return Err(FlowError::Remote {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&body).map_err(|e| FlowError::Decode(e.to_string()))
    }

    async fn send_ack(req: RequestBuilder) -> Result<()> {
        let ack: Ack = Self::send_json(req).await?;
        if ack.success {
            Ok(())
        } else {
            Err(FlowError::Remote {
                status: 200,
                message: ack.message,
            })
        }
    }
}

/// Percent-encode one path segment.
fn seg(id: &str) -> String {
    urlencoding::encode(id).into_owned()
}

/// Pull a human-readable message out of an error body.
///
/// The backend answers `{"detail": "..."}`; validation failures carry a list
/// under `detail`. `{"message": "..."}` is accepted too.
fn server_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let pick = |key: &str| match value.get(key) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(serde_json::Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    pick("detail").or_else(|| pick("message"))
}

impl WorkflowApi for HttpWorkflowApi {
    fn create_workflow(&self, req: NewWorkflow) -> BoxFuture<'_, Result<Workflow>> {
        let builder = self.request(Method::POST, "/workflows").json(&req);
        Box::pin(Self::send_json(builder))
    }

    fn get_workflow(&self, workflow_id: &str) -> BoxFuture<'_, Result<Workflow>> {
        let builder = self.request(Method::GET, &format!("/workflows/{}", seg(workflow_id)));
        Box::pin(Self::send_json(builder))
    }

    fn list_workflows(&self, user_id: &str) -> BoxFuture<'_, Result<Vec<Workflow>>> {
        let builder = self.request(Method::GET, &format!("/users/{}/workflows", seg(user_id)));
        Box::pin(Self::send_json(builder))
    }

    fn update_workflow(
        &self,
        workflow_id: &str,
        update: WorkflowUpdate,
    ) -> BoxFuture<'_, Result<Workflow>> {
        let builder = self
            .request(Method::PATCH, &format!("/workflows/{}", seg(workflow_id)))
            .json(&update);
        Box::pin(Self::send_json(builder))
    }

    fn delete_workflow(&self, workflow_id: &str) -> BoxFuture<'_, Result<()>> {
        let builder = self.request(Method::DELETE, &format!("/workflows/{}", seg(workflow_id)));
        Box::pin(Self::send_ack(builder))
    }

    fn add_node(&self, workflow_id: &str, req: NewNode) -> BoxFuture<'_, Result<Node>> {
        let builder = self
            .request(Method::POST, &format!("/workflows/{}/nodes", seg(workflow_id)))
            .json(&req);
        Box::pin(Self::send_json(builder))
    }

    fn list_nodes(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<Node>>> {
        let builder = self.request(Method::GET, &format!("/workflows/{}/nodes", seg(workflow_id)));
        Box::pin(Self::send_json(builder))
    }

    fn update_node(&self, node_id: &str, update: NodeUpdate) -> BoxFuture<'_, Result<Node>> {
        let builder = self
            .request(Method::PUT, &format!("/nodes/{}", seg(node_id)))
            .json(&update);
        Box::pin(Self::send_json(builder))
    }

    fn delete_node(&self, node_id: &str) -> BoxFuture<'_, Result<()>> {
        let builder = self.request(Method::DELETE, &format!("/nodes/{}", seg(node_id)));
        Box::pin(Self::send_ack(builder))
    }

    fn add_edge(&self, workflow_id: &str, req: NewEdge) -> BoxFuture<'_, Result<Edge>> {
        let builder = self
            .request(Method::POST, &format!("/workflows/{}/edges", seg(workflow_id)))
            .json(&req);
        Box::pin(Self::send_json(builder))
    }

    fn list_edges(&self, workflow_id: &str) -> BoxFuture<'_, Result<Vec<Edge>>> {
        let builder = self.request(Method::GET, &format!("/workflows/{}/edges", seg(workflow_id)));
        Box::pin(Self::send_json(builder))
    }

    fn delete_edge(&self, edge_id: &str) -> BoxFuture<'_, Result<()>> {
        let builder = self.request(Method::DELETE, &format!("/edges/{}", seg(edge_id)));
        Box::pin(Self::send_ack(builder))
    }

    fn start_execution(
        &self,
        workflow_id: &str,
        req: StartExecution,
    ) -> BoxFuture<'_, Result<String>> {
        let builder = self
            .request(Method::POST, &format!("/workflows/{}/execute", seg(workflow_id)))
            .json(&req);
        Box::pin(async move {
            let started: ExecutionStarted = Self::send_json(builder).await?;
            Ok(started.execution_id)
        })
    }

    fn get_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<Execution>> {
        let builder = self.request(
            Method::GET,
            &format!("/workflow-executions/{}", seg(execution_id)),
        );
        Box::pin(Self::send_json(builder))
    }

    fn abort_execution(&self, execution_id: &str) -> BoxFuture<'_, Result<()>> {
        let builder = self.request(
            Method::POST,
            &format!("/workflow-executions/{}/cancel", seg(execution_id)),
        );
        Box::pin(Self::send_ack(builder))
    }

    fn list_agents(&self) -> BoxFuture<'_, Result<AgentCatalogMap>> {
        let builder = self.request(Method::GET, "/workflow-agents");
        Box::pin(async move {
            let envelope: AgentsEnvelope = Self::send_json(builder).await?;
            Ok(envelope.agents)
        })
    }
}
