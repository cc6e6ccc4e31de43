pub mod builder;
pub mod edge;
pub mod node;

pub use builder::GraphBuilder;
pub use edge::{ConditionFn, Edge, EdgeCondition};
pub use node::Node;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use graphflow_core::error::{GraphError, GraphViolation};
use graphflow_core::types::ActivationCondition;

/// A resolved edge: endpoints and group are indices into the graph.
#[derive(Debug, Clone)]
pub struct EdgeEntry {
    pub source: usize,
    pub target: usize,
    pub condition: EdgeCondition,
    /// Index into the target's activation groups.
    pub group: usize,
}

/// A partition of one node's incoming edges sharing a join rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationGroup {
    pub label: String,
    pub condition: ActivationCondition,
    /// Edge indices belonging to this group, in declaration order.
    pub edges: Vec<usize>,
}

#[derive(Debug)]
struct GraphInner {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<EdgeEntry>,
    outgoing: Vec<Vec<usize>>,
    groups: Vec<Vec<ActivationGroup>>,
    start_nodes: Vec<usize>,
    entry_point: Option<usize>,
}

/// Immutable, validated execution graph.
///
/// Cloning is cheap; all clones share the same adjacency data. Run state
/// never lives here, so one graph can back any number of runs.
#[derive(Debug, Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    /// Validate declared nodes and edges and resolve them into adjacency lists.
    ///
    /// Every violation is collected before failing.
    pub(crate) fn assemble(
        nodes: Vec<Node>,
        edges: &[Edge],
        entry_point: Option<&str>,
    ) -> Result<Self, GraphError> {
        let mut violations = Vec::new();
        if nodes.is_empty() {
            violations.push(GraphViolation::Empty);
        }

        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();

        let mut resolved = Vec::with_capacity(edges.len());
        let mut groups: Vec<Vec<ActivationGroup>> = vec![Vec::new(); nodes.len()];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![0usize; nodes.len()];

        for edge in edges {
            let (source, target) = match (index.get(&edge.from), index.get(&edge.to)) {
                (Some(&s), Some(&t)) => (s, t),
                (s, _) => {
                    let missing = if s.is_none() { &edge.from } else { &edge.to };
                    violations.push(GraphViolation::UnknownEdgeEndpoint {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        missing: missing.clone(),
                    });
                    continue;
                }
            };

            let condition = edge
                .activation_condition
                .or(nodes[target].activation)
                .unwrap_or_default();
            let label = edge.group_label();
            let edge_id = resolved.len();
            let target_groups = &mut groups[target];
            let group = match target_groups.iter().position(|g| g.label == label) {
                Some(g) => {
                    let existing = &mut target_groups[g];
                    if existing.condition != condition {
                        let conflict = GraphViolation::ConflictingActivation {
                            target: edge.to.clone(),
                            group: label.to_string(),
                        };
                        if !violations.contains(&conflict) {
                            violations.push(conflict);
                        }
                    }
                    existing.edges.push(edge_id);
                    g
                }
                None => {
                    target_groups.push(ActivationGroup {
                        label: label.to_string(),
                        condition,
                        edges: vec![edge_id],
                    });
                    target_groups.len() - 1
                }
            };

            outgoing[source].push(edge_id);
            incoming[target] += 1;
            resolved.push(EdgeEntry {
                source,
                target,
                condition: edge.condition.clone(),
                group,
            });
        }

        let entry = match entry_point {
            Some(name) => match index.get(name) {
                Some(&i) => Some(i),
                None => {
                    violations.push(GraphViolation::UnknownEntryPoint(name.to_string()));
                    None
                }
            },
            None => None,
        };

        let start_nodes: Vec<usize> = match entry {
            Some(i) => vec![i],
            None => (0..nodes.len()).filter(|&i| incoming[i] == 0).collect(),
        };
        if start_nodes.is_empty() && !nodes.is_empty() && entry_point.is_none() {
            violations.push(GraphViolation::NoStartNode);
        }

        if !violations.is_empty() {
            return Err(GraphError::Validation(violations));
        }

        Ok(Self {
            inner: Arc::new(GraphInner {
                nodes,
                index,
                edges: resolved,
                outgoing,
                groups,
                start_nodes,
                entry_point: entry,
            }),
        })
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.inner.nodes
    }

    /// Participants in declaration order (alias kept for roster seeding).
    pub fn participants(&self) -> &[Node] {
        self.nodes()
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.inner.nodes.get(index)
    }

    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.inner.index.get(name).copied()
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.node_index(name).map(|i| &self.inner.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.inner.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.nodes.is_empty()
    }

    pub fn edges(&self) -> &[EdgeEntry] {
        &self.inner.edges
    }

    /// Indices of edges leaving `node`, in declaration order.
    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.inner.outgoing[node]
    }

    /// Activation groups of `node`, in order of first declaration.
    pub fn groups(&self, node: usize) -> &[ActivationGroup] {
        &self.inner.groups[node]
    }

    /// Nodes seeded into wave 0.
    pub fn start_nodes(&self) -> &[usize] {
        &self.inner.start_nodes
    }

    pub fn entry_point(&self) -> Option<&str> {
        self.inner
            .entry_point
            .map(|i| self.inner.nodes[i].name.as_str())
    }

    pub fn name_of(&self, node: usize) -> &str {
        &self.inner.nodes[node].name
    }

    /// Serializable structural summary, independent of worker identity.
    pub fn shape(&self) -> GraphShape {
        let nodes = self.inner.nodes.iter().map(|n| n.name.clone()).collect();
        let edges = self
            .inner
            .edges
            .iter()
            .map(|e| {
                let group = &self.inner.groups[e.target][e.group];
                EdgeShape {
                    from: self.name_of(e.source).to_string(),
                    to: self.name_of(e.target).to_string(),
                    condition: e.condition.describe(),
                    group: group.label.clone(),
                    activation: group.condition,
                }
            })
            .collect();
        let start_nodes = self
            .inner
            .start_nodes
            .iter()
            .map(|&i| self.name_of(i).to_string())
            .collect();
        GraphShape {
            nodes,
            edges,
            start_nodes,
        }
    }

    /// Render the graph as a Mermaid flowchart.
    ///
    /// Start nodes render as stadiums, conditional edges as dotted arrows
    /// labelled with their condition.
    pub fn to_mermaid(&self) -> String {
        let mut lines = vec!["graph TD".to_string()];
        for (i, node) in self.inner.nodes.iter().enumerate() {
            let id = sanitize_id(&node.name);
            if self.inner.start_nodes.contains(&i) {
                lines.push(format!("    {}([{}])", id, node.name));
            } else {
                lines.push(format!("    {}[{}]", id, node.name));
            }
        }
        for edge in &self.inner.edges {
            let from = sanitize_id(self.name_of(edge.source));
            let to = sanitize_id(self.name_of(edge.target));
            let group = &self.inner.groups[edge.target][edge.group];
            let mut label = Vec::new();
            if edge.condition.is_conditional() {
                label.push(edge.condition.describe());
            }
            if group.label != self.name_of(edge.target) || group.condition == ActivationCondition::Any {
                label.push(format!("{}:{}", group.label, group.condition));
            }
            if label.is_empty() {
                lines.push(format!("    {} --> {}", from, to));
            } else {
                let text = label.join(" ").replace('"', "'");
                lines.push(format!("    {} -. \"{}\" .-> {}", from, text, to));
            }
        }
        lines.join("\n")
    }
}

impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        let (a, b) = (&self.inner, &other.inner);
        a.nodes.len() == b.nodes.len()
            && a.nodes.iter().zip(&b.nodes).all(|(x, y)| x.same_as(y))
            && a.edges.len() == b.edges.len()
            && a.edges.iter().zip(&b.edges).all(|(x, y)| {
                x.source == y.source
                    && x.target == y.target
                    && x.group == y.group
                    && x.condition == y.condition
            })
            && a.groups == b.groups
            && a.start_nodes == b.start_nodes
    }
}

/// Structural summary of a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphShape {
    pub nodes: Vec<String>,
    pub edges: Vec<EdgeShape>,
    pub start_nodes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeShape {
    pub from: String,
    pub to: String,
    pub condition: String,
    pub group: String,
    pub activation: ActivationCondition,
}

/// Mermaid identifiers must be alphanumeric or underscores.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
