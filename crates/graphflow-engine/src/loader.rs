use std::sync::Arc;

use tracing::info;

use graphflow_core::config::{EdgeConfig, FlowConfig, NodeConfig};
use graphflow_core::error::{FlowError, GraphError, GraphViolation, Result};
use graphflow_core::traits::Worker;

use crate::flow::GraphFlow;
use crate::graph::{Edge, EdgeCondition, Graph, GraphBuilder, Node};
use crate::termination::TerminationPolicy;
use crate::worker::ScriptedWorker;

/// Build a graph from config, asking `factory` for each node's worker.
///
/// Dangling edges and malformed edge conditions are reported together with
/// the build-time violations instead of stopping at the first one.
pub fn build_graph<F>(config: &FlowConfig, mut factory: F) -> Result<Graph>
where
    F: FnMut(&NodeConfig) -> Result<Arc<dyn Worker>>,
{
    let mut builder = GraphBuilder::new();
    for node in &config.nodes {
        let worker = factory(node)?;
        let mut built = Node::shared(&node.name, worker).with_filter(node.filter.clone());
        if let Some(description) = &node.description {
            built = built.with_description(description);
        }
        if let Some(activation) = node.activation {
            built = built.with_activation(activation);
        }
        builder.add_node(built)?;
    }

    let mut violations = Vec::new();
    for edge in &config.edges {
        let built = match edge_from_config(edge) {
            Ok(built) => built,
            Err(violation) => {
                violations.push(violation);
                continue;
            }
        };
        match builder.add_edge_with(built) {
            Ok(_) => {}
            Err(GraphError::UnknownNode(missing)) => {
                violations.push(GraphViolation::UnknownEdgeEndpoint {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing,
                });
            }
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(entry) = &config.entry_point {
        builder.set_entry_point(entry);
    }

    match builder.build() {
        Ok(_) if !violations.is_empty() => Err(GraphError::Validation(violations).into()),
        Ok(graph) => Ok(graph),
        Err(GraphError::Validation(found)) => {
            violations.extend(found);
            Err(GraphError::Validation(violations).into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Build a complete flow (graph, engine settings, termination) from config.
pub fn flow_from_config<F>(config: &FlowConfig, factory: F) -> Result<GraphFlow>
where
    F: FnMut(&NodeConfig) -> Result<Arc<dyn Worker>>,
{
    let graph = build_graph(config, factory)?;
    let mut flow = GraphFlow::new(graph).with_engine(config.engine.clone());
    if let Some(policy) = config
        .termination
        .as_ref()
        .and_then(TerminationPolicy::from_config)
    {
        flow = flow.with_termination(policy);
    }
    info!(
        nodes = flow.graph().len(),
        edges = flow.graph().edges().len(),
        "Flow loaded from config"
    );
    Ok(flow)
}

/// Build a flow whose nodes reply with their configured `replies`.
pub fn scripted_flow(config: &FlowConfig) -> Result<GraphFlow> {
    flow_from_config(config, |node| {
        let worker = ScriptedWorker::new(node.replies.iter().cloned())
            .with_description(node.description.clone().unwrap_or_default());
        Ok(Arc::new(worker) as Arc<dyn Worker>)
    })
}

fn edge_from_config(edge: &EdgeConfig) -> std::result::Result<Edge, GraphViolation> {
    let invalid = |reason: String| GraphViolation::InvalidEdgeCondition {
        from: edge.from.clone(),
        to: edge.to.clone(),
        reason,
    };
    let condition = match (&edge.contains, &edge.regex) {
        (Some(_), Some(_)) => return Err(invalid("sets both 'contains' and 'regex'".into())),
        (Some(text), None) => EdgeCondition::contains(text.clone()),
        (None, Some(pattern)) => EdgeCondition::matches(pattern).map_err(|e| match e {
            FlowError::Config(reason) => invalid(reason),
            other => invalid(other.to_string()),
        })?,
        (None, None) => EdgeCondition::Always,
    };

    let mut built = Edge::new(&edge.from, &edge.to).with_condition(condition);
    if let Some(group) = &edge.group {
        built = built.with_group(group);
    }
    if let Some(activation) = edge.activation {
        built = built.with_activation(activation);
    }
    Ok(built)
}
