use std::time::Duration;

use thiserror::Error;

/// A single structural problem found while validating a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphViolation {
    #[error("edge {from} -> {to} references undeclared node '{missing}'")]
    UnknownEdgeEndpoint {
        from: String,
        to: String,
        missing: String,
    },

    #[error("edge {from} -> {to} has an invalid condition: {reason}")]
    InvalidEdgeCondition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("graph has no start node (every node has incoming edges and no entry point is set)")]
    NoStartNode,

    #[error("graph has no nodes")]
    Empty,

    #[error("entry point '{0}' is not a declared node")]
    UnknownEntryPoint(String),

    #[error("activation group '{group}' of node '{target}' mixes 'all' and 'any' edges")]
    ConflictingActivation { target: String, group: String },
}

/// Errors raised while constructing a graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("node '{0}' is already registered with a different worker")]
    DuplicateNode(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("graph validation failed: {}", join_violations(.0))]
    Validation(Vec<GraphViolation>),
}

impl GraphError {
    /// All violations carried by this error (empty for builder-call errors).
    pub fn violations(&self) -> &[GraphViolation] {
        match self {
            Self::Validation(v) => v,
            _ => &[],
        }
    }
}

fn join_violations(violations: &[GraphViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph errors
    #[error(transparent)]
    Graph(#[from] GraphError),

    // Run errors
    #[error("no progress in wave {wave}: {failed_conditions} edge condition(s) failed and no edge armed")]
    NoProgress { wave: usize, failed_conditions: usize },

    #[error("node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error("node '{node}' timed out after {timeout:?}")]
    NodeTimeout { node: String, timeout: Duration },

    /// Raised by worker implementations; the scheduler wraps it in `NodeFailed`.
    #[error("worker error: {0}")]
    Worker(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Name of the node this error is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::NodeFailed { node, .. } | Self::NodeTimeout { node, .. } => Some(node),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_violation() {
        let err = GraphError::Validation(vec![
            GraphViolation::NoStartNode,
            GraphViolation::UnknownEntryPoint("ghost".into()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("no start node"));
        assert!(msg.contains("'ghost'"));
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn graph_error_converts_into_flow_error() {
        let err: FlowError = GraphError::UnknownNode("x".into()).into();
        assert!(matches!(err, FlowError::Graph(GraphError::UnknownNode(_))));
        assert_eq!(err.to_string(), "unknown node: x");
    }

    #[test]
    fn node_attribution() {
        let err = FlowError::NodeFailed {
            node: "writer".into(),
            message: "boom".into(),
        };
        assert_eq!(err.node(), Some("writer"));
        assert_eq!(FlowError::Worker("x".into()).node(), None);
    }
}
