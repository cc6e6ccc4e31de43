use std::collections::HashSet;

use graphflow_core::error::FlowError;
use graphflow_core::traits::{FailureAction, FailurePolicy};

/// Any worker failure aborts the run. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnFailure;

impl FailurePolicy for AbortOnFailure {
    fn on_failure(&self, _node: &str, _error: &FlowError) -> FailureAction {
        FailureAction::Abort
    }
}

/// Downgrade failures of the listed nodes to skipped turns.
#[derive(Debug, Clone, Default)]
pub struct SkipNodes {
    nodes: HashSet<String>,
    all: bool,
}

impl SkipNodes {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            all: false,
        }
    }

    /// Skip failures of every node.
    pub fn all() -> Self {
        Self {
            nodes: HashSet::new(),
            all: true,
        }
    }
}

impl FailurePolicy for SkipNodes {
    fn on_failure(&self, node: &str, _error: &FlowError) -> FailureAction {
        if self.all || self.nodes.contains(node) {
            FailureAction::Skip
        } else {
            FailureAction::Abort
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(node: &str) -> FlowError {
        FlowError::NodeFailed {
            node: node.into(),
            message: "boom".into(),
        }
    }

    #[test]
    fn test_abort_is_default() {
        assert_eq!(AbortOnFailure.on_failure("a", &err("a")), FailureAction::Abort);
    }

    #[test]
    fn test_skip_listed_nodes_only() {
        let policy = SkipNodes::new(["flaky"]);
        assert_eq!(policy.on_failure("flaky", &err("flaky")), FailureAction::Skip);
        assert_eq!(policy.on_failure("core", &err("core")), FailureAction::Abort);
        assert_eq!(SkipNodes::all().on_failure("core", &err("core")), FailureAction::Skip);
    }
}
