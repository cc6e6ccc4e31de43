//! Wave-based execution engine for graphs of workers.
//!
//! Build a [`Graph`] with [`GraphBuilder`], wrap it in a [`GraphFlow`] with a
//! [`TerminationPolicy`], then `run` or `run_stream` it. Every wave dispatches
//! its active nodes concurrently over the same history snapshot, arms
//! outgoing edges whose conditions accept the outputs, and promotes the
//! targets whose activation groups are satisfied.

pub mod failure;
pub mod filter;
pub mod flow;
pub mod graph;
pub mod loader;
mod scheduler;
pub mod termination;
pub mod worker;

pub use failure::{AbortOnFailure, SkipNodes};
pub use filter::{FilteredWorker, MessageFilter};
pub use flow::GraphFlow;
pub use graph::{
    ActivationGroup, Edge, EdgeCondition, EdgeShape, Graph, GraphBuilder, GraphShape, Node,
};
pub use loader::{build_graph, flow_from_config, scripted_flow};
pub use termination::{ExternalSignal, TerminationPolicy};
pub use worker::{worker_fn, FnWorker, ScriptedWorker};
