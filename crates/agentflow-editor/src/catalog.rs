use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use agentflow_core::error::{FlowError, Result};
use agentflow_core::traits::WorkflowApi;
use agentflow_core::types::{AgentCatalogMap, AgentDescriptor};

/// Session-wide cache of the agent catalog.
///
/// The catalog is fetched at most once per session unless [`load`] is called
/// again after a failure. Callers that arrive while a fetch is running wait
/// for it and share its outcome. While the cache is empty every agent type is
/// unknown, so node creation fails safe.
///
/// [`load`]: AgentCatalog::load
pub struct AgentCatalog {
    api: Arc<dyn WorkflowApi>,
    agents: RwLock<Option<Arc<AgentCatalogMap>>>,
    fetch: Mutex<Option<String>>,
    attempts: AtomicU64,
}

impl AgentCatalog {
    pub fn new(api: Arc<dyn WorkflowApi>) -> Self {
        Self {
            api,
            agents: RwLock::new(None),
            fetch: Mutex::new(None),
            attempts: AtomicU64::new(0),
        }
    }

    /// Fetch the catalog, or return the cached copy.
    pub async fn load(&self) -> Result<Arc<AgentCatalogMap>> {
        if let Some(map) = self.cached().await {
            return Ok(map);
        }

        let seen = self.attempts.load(Ordering::Acquire);
        let mut last_error = self.fetch.lock().await;

        if let Some(map) = self.cached().await {
            return Ok(map);
        }
        // A fetch finished while we waited for the lock; share its failure.
        if self.attempts.load(Ordering::Acquire) != seen {
            if let Some(msg) = last_error.as_ref() {
                return Err(FlowError::Transport(msg.clone()));
            }
        }

        let result = self.api.list_agents().await;
        self.attempts.fetch_add(1, Ordering::AcqRel);

        match result {
            Ok(map) => {
                info!(count = map.len(), "Agent catalog loaded");
                let map = Arc::new(map);
                *self.agents.write().await = Some(map.clone());
                *last_error = None;
                Ok(map)
            }
            Err(e) => {
                warn!(error = %e, "Failed to load agent catalog");
                *last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Load the catalog unless a fetch has already been attempted, then look
    /// up `agent_type`. A failed fetch is not repeated here.
    pub async fn lookup(&self, agent_type: &str) -> Option<AgentDescriptor> {
        if self.attempts.load(Ordering::Acquire) == 0 {
            let _ = self.load().await;
        }
        self.get(agent_type).await
    }

    /// Descriptor for `agent_type` from the cache. Never fetches.
    pub async fn get(&self, agent_type: &str) -> Option<AgentDescriptor> {
        self.agents
            .read()
            .await
            .as_ref()
            .and_then(|m| m.get(agent_type).cloned())
    }

    pub async fn is_loaded(&self) -> bool {
        self.agents.read().await.is_some()
    }

    /// All cached descriptors ordered by agent type.
    pub async fn descriptors(&self) -> Vec<(String, AgentDescriptor)> {
        let guard = self.agents.read().await;
        let mut all: Vec<(String, AgentDescriptor)> = guard
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Cached descriptors grouped by category, for palette listings.
    pub async fn by_category(&self) -> BTreeMap<String, Vec<(String, AgentDescriptor)>> {
        let mut groups: BTreeMap<String, Vec<(String, AgentDescriptor)>> = BTreeMap::new();
        for (agent_type, descriptor) in self.descriptors().await {
            groups
                .entry(descriptor.category.clone())
                .or_default()
                .push((agent_type, descriptor));
        }
        groups
    }

    /// Forget the cached catalog and any previous attempt.
    pub async fn reset(&self) {
        let mut last_error = self.fetch.lock().await;
        *self.agents.write().await = None;
        *last_error = None;
        self.attempts.store(0, Ordering::Release);
    }

    async fn cached(&self) -> Option<Arc<AgentCatalogMap>> {
        self.agents.read().await.clone()
    }
}
