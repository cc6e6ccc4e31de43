use tracing::debug;

use graphflow_core::error::GraphError;

use super::edge::{Edge, EdgeCondition};
use super::node::Node;
use super::Graph;

/// Incremental construction API for [`Graph`].
///
/// Endpoint checks happen eagerly on `add_edge`; everything else is checked
/// by `build`, which reports all problems at once.
#[derive(Debug, Default, Clone)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    entry_point: Option<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Re-adding the identical node is a no-op.
    pub fn add_node(&mut self, node: Node) -> Result<&mut Self, GraphError> {
        if let Some(existing) = self.nodes.iter().find(|n| n.name == node.name) {
            if existing.same_as(&node) {
                return Ok(self);
            }
            return Err(GraphError::DuplicateNode(node.name));
        }
        debug!(node = %node.name, "Registering node");
        self.nodes.push(node);
        Ok(self)
    }

    /// Add an unconditional edge in the target's default group.
    pub fn add_edge(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Result<&mut Self, GraphError> {
        self.add_edge_with(Edge::new(from, to))
    }

    /// Add an edge gated by `condition`.
    pub fn add_conditional_edge(
        &mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: EdgeCondition,
    ) -> Result<&mut Self, GraphError> {
        self.add_edge_with(Edge::new(from, to).with_condition(condition))
    }

    /// Add a fully specified edge.
    pub fn add_edge_with(&mut self, edge: Edge) -> Result<&mut Self, GraphError> {
        for endpoint in [&edge.from, &edge.to] {
            if !self.contains(endpoint) {
                return Err(GraphError::UnknownNode(endpoint.clone()));
            }
        }
        self.edges.push(edge);
        Ok(self)
    }

    /// Seed runs from this node only, instead of every node without incoming edges.
    pub fn set_entry_point(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry_point = Some(name.into());
        self
    }

    /// Nodes in insertion order.
    pub fn get_participants(&self) -> &[Node] {
        &self.nodes
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }

    /// Validate and freeze the graph. The builder stays usable afterwards.
    pub fn build(&self) -> Result<Graph, GraphError> {
        let graph = Graph::assemble(
            self.nodes.clone(),
            &self.edges,
            self.entry_point.as_deref(),
        )?;
        debug!(
            nodes = graph.len(),
            edges = graph.edges().len(),
            "Graph built"
        );
        Ok(graph)
    }
}
