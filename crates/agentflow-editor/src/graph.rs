use serde::Serialize;
use tracing::{debug, warn};

use agentflow_core::error::{FlowError, Result};
use agentflow_core::types::{Edge, Node};

/// Local copy of the open workflow's nodes and edges.
///
/// The model holds only server-confirmed records. Edges never reference a
/// node id that is absent from the model.
#[derive(Debug, Default)]
pub struct GraphModel {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    revision: u64,
}

/// Read-only copy of the graph handed to the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub revision: u64,
}

impl GraphSnapshot {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }
}

impl GraphModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumped on every mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.id == id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    /// An edge with the same endpoints and type is already present.
    pub fn has_edge(&self, source_id: &str, target_id: &str, edge_type: &str) -> bool {
        self.edges.iter().any(|e| {
            e.source_id == source_id && e.target_id == target_id && e.edge_type == edge_type
        })
    }

    /// Replace every node. Edges left dangling by the new node set are dropped.
    pub fn load_nodes(&mut self, nodes: Vec<Node>) {
        self.nodes = nodes;
        let before = self.edges.len();
        let nodes = &self.nodes;
        self.edges
            .retain(|e| nodes.iter().any(|n| n.id == e.source_id) && nodes.iter().any(|n| n.id == e.target_id));
        if self.edges.len() != before {
            debug!(dropped = before - self.edges.len(), "Dropped edges after node reload");
        }
        self.bump();
    }

    /// Replace every edge. Edges with an endpoint missing from the model are
    /// dropped; returns how many were dropped.
    pub fn load_edges(&mut self, edges: Vec<Edge>) -> usize {
        let total = edges.len();
        let mut kept = Vec::with_capacity(total);
        for edge in edges {
            if self.contains_node(&edge.source_id) && self.contains_node(&edge.target_id) {
                kept.push(edge);
            } else {
                warn!(
                    edge_id = %edge.id,
                    source = %edge.source_id,
                    target = %edge.target_id,
                    "Dropping edge with missing endpoint"
                );
            }
        }
        self.edges = kept;
        self.bump();
        total - self.edges.len()
    }

    /// Insert `node`, or replace the node with the same id in place.
    pub fn upsert_node(&mut self, node: Node) {
        match self.nodes.iter_mut().find(|n| n.id == node.id) {
            Some(existing) => *existing = node,
            None => self.nodes.push(node),
        }
        self.bump();
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        let idx = self.nodes.iter().position(|n| n.id == id)?;
        let node = self.nodes.remove(idx);
        self.edges.retain(|e| !e.touches(id));
        self.bump();
        Some(node)
    }

    /// Insert or replace `edge`. Refused if either endpoint is absent.
    pub fn upsert_edge(&mut self, edge: Edge) -> Result<()> {
        for endpoint in [&edge.source_id, &edge.target_id] {
            if !self.contains_node(endpoint) {
                return Err(FlowError::MissingEndpoint(endpoint.clone()));
            }
        }
        match self.edges.iter_mut().find(|e| e.id == edge.id) {
            Some(existing) => *existing = edge,
            None => self.edges.push(edge),
        }
        self.bump();
        Ok(())
    }

    pub fn remove_edge(&mut self, id: &str) -> Option<Edge> {
        let idx = self.edges.iter().position(|e| e.id == id)?;
        let edge = self.edges.remove(idx);
        self.bump();
        Some(edge)
    }

    /// Move a node. Only the position fields change. Returns false when the
    /// node is not in the model.
    pub fn set_node_position(&mut self, id: &str, x: f64, y: f64) -> bool {
        match self.nodes.iter_mut().find(|n| n.id == id) {
            Some(node) => {
                node.position_x = x;
                node.position_y = y;
                self.bump();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
        self.bump();
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
            revision: self.revision,
        }
    }

    fn bump(&mut self) {
        self.revision += 1;
    }
}
