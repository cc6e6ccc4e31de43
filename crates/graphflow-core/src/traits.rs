use futures::future::BoxFuture;

use crate::error::{FlowError, Result};
use crate::types::{Message, WorkerOutput};

/// The unit of work behind a graph node.
///
/// Workers of the same wave are invoked concurrently, each with the same
/// history snapshot, so implementations must tolerate parallel calls.
pub trait Worker: Send + Sync + 'static {
    /// Produce one turn from the history this node is allowed to see.
    fn invoke<'a>(&'a self, history: &'a [Message]) -> BoxFuture<'a, Result<WorkerOutput>>;

    /// Short human-readable description.
    fn description(&self) -> &str {
        ""
    }
}

/// What the scheduler does with a failed worker invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Fail the whole run.
    Abort,
    /// Record a diagnostic and continue as if the node produced nothing.
    Skip,
}

/// Decides per node how worker errors are handled.
pub trait FailurePolicy: Send + Sync + 'static {
    fn on_failure(&self, node: &str, error: &FlowError) -> FailureAction;
}
