use std::sync::Arc;

use graphflow_core::traits::Worker;
use graphflow_core::types::{ActivationCondition, PerSourceFilter};

use crate::filter::{FilteredWorker, MessageFilter};

/// A named participant in the graph.
///
/// The node only references its worker; the caller keeps ownership of the
/// worker and may share one instance between several graphs.
#[derive(Clone)]
pub struct Node {
    /// Unique name, used as the sole cross-reference key.
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Default activation condition for incoming edges that declare none.
    pub activation: Option<ActivationCondition>,
    worker: Arc<dyn Worker>,
}

impl Node {
    /// Create a node around an owned worker.
    pub fn new<W: Worker>(name: impl Into<String>, worker: W) -> Self {
        Self::shared(name, Arc::new(worker))
    }

    /// Create a node around a worker that is shared elsewhere.
    pub fn shared(name: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self {
            name: name.into(),
            description: None,
            activation: None,
            worker,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the default activation condition of incoming edges.
    pub fn with_activation(mut self, activation: ActivationCondition) -> Self {
        self.activation = Some(activation);
        self
    }

    /// Narrow the history this node observes. An empty rule list is a no-op.
    pub fn with_filter(mut self, rules: Vec<PerSourceFilter>) -> Self {
        if rules.is_empty() {
            return self;
        }
        let filtered = FilteredWorker::new(self.worker, MessageFilter::new(rules));
        self.worker = Arc::new(filtered);
        self
    }

    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }

    /// Describe the node: explicit description, else the worker's own.
    pub fn describe(&self) -> &str {
        self.description
            .as_deref()
            .unwrap_or_else(|| self.worker.description())
    }

    /// Whether both nodes are the same registration (name, attributes and worker instance).
    pub fn same_as(&self, other: &Node) -> bool {
        self.name == other.name
            && self.description == other.description
            && self.activation == other.activation
            && Arc::as_ptr(&self.worker) as *const () == Arc::as_ptr(&other.worker) as *const ()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("activation", &self.activation)
            .finish_non_exhaustive()
    }
}
