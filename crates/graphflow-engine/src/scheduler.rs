use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use graphflow_core::config::EngineConfig;
use graphflow_core::error::{FlowError, Result};
use graphflow_core::event::EventBus;
use graphflow_core::traits::{FailureAction, FailurePolicy};
use graphflow_core::types::{
    ActivationCondition, Diagnostic, FlowEvent, FlowResult, Message, RunId, StopReason,
    TokenUsage, WorkerOutput,
};

use crate::graph::edge::describe_panic;
use crate::graph::Graph;
use crate::termination::TerminationPolicy;

/// Fan-out of run events to a stream consumer and/or a broadcast bus.
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    stream: Option<mpsc::UnboundedSender<Result<FlowEvent>>>,
    bus: Option<Arc<EventBus>>,
}

impl EventSink {
    pub(crate) fn new(
        stream: Option<mpsc::UnboundedSender<Result<FlowEvent>>>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        Self { stream, bus }
    }

    fn emit(&self, event: FlowEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event.clone());
        }
        if let Some(tx) = &self.stream {
            // Receiver gone means nobody is listening any more
            let _ = tx.send(Ok(event));
        }
    }
}

/// Per-wave edge satisfaction, bucketed by `(target, group)`.
///
/// A fresh instance is used for every wave, so `all` groups only promote
/// when every edge arms within the same wave.
struct Readiness {
    armed: Vec<Vec<BTreeSet<usize>>>,
}

impl Readiness {
    fn new(graph: &Graph) -> Self {
        let armed = (0..graph.len())
            .map(|n| vec![BTreeSet::new(); graph.groups(n).len()])
            .collect();
        Self { armed }
    }

    fn arm(&mut self, graph: &Graph, edge_id: usize) {
        let edge = &graph.edges()[edge_id];
        self.armed[edge.target][edge.group].insert(edge_id);
    }

    /// Nodes with at least one satisfied group, in declaration order.
    fn promoted(&self, graph: &Graph) -> Vec<usize> {
        (0..graph.len())
            .filter(|&node| {
                graph
                    .groups(node)
                    .iter()
                    .zip(&self.armed[node])
                    .any(|(group, armed)| match group.condition {
                        ActivationCondition::All => armed.len() == group.edges.len(),
                        ActivationCondition::Any => !armed.is_empty(),
                    })
            })
            .collect()
    }
}

/// Outcome of one node invocation inside a wave.
struct Completion {
    node: usize,
    elapsed: Duration,
    outcome: Result<WorkerOutput>,
}

/// Drives one run of a graph, wave by wave.
pub(crate) struct Scheduler<'a> {
    graph: &'a Graph,
    engine: &'a EngineConfig,
    termination: Option<&'a TerminationPolicy>,
    failure: &'a dyn FailurePolicy,
    sink: EventSink,
}

impl<'a> Scheduler<'a> {
    pub(crate) fn new(
        graph: &'a Graph,
        engine: &'a EngineConfig,
        termination: Option<&'a TerminationPolicy>,
        failure: &'a dyn FailurePolicy,
        sink: EventSink,
    ) -> Self {
        Self {
            graph,
            engine,
            termination,
            failure,
            sink,
        }
    }

    pub(crate) async fn run(self, task: String, cancel: CancellationToken) -> Result<FlowResult> {
        let started = Instant::now();
        let run_id = RunId::new();
        let graph = self.graph;

        let mut history = vec![Message::task(task.clone())];
        let mut diagnostics = Vec::new();
        let mut usage = TokenUsage::default();
        let mut active: Vec<usize> = graph.start_nodes().to_vec();
        let mut wave = 0usize;

        info!(run_id = %run_id, nodes = graph.len(), "Starting graph run");
        self.sink.emit(FlowEvent::RunStarted {
            run_id: run_id.clone(),
            task,
        });

        let stop_reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if let Some(max) = self.engine.max_waves {
                if wave >= max {
                    warn!(max_waves = max, "Wave limit reached");
                    break StopReason::MaxWaves(max);
                }
            }

            let names: Vec<String> = active
                .iter()
                .map(|&n| graph.name_of(n).to_string())
                .collect();
            info!(wave, nodes = ?names, "Dispatching wave");
            self.sink.emit(FlowEvent::WaveStarted {
                wave,
                nodes: names,
            });

            let snapshot: Arc<[Message]> = Arc::from(history.as_slice());
            let mut tasks = self.dispatch(&active, snapshot);

            let mut readiness = Readiness::new(graph);
            let mut armed_edges = 0usize;
            let mut failed_conditions = 0usize;

            let cancelled = loop {
                let joined = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    joined = tasks.join_next() => Some(joined),
                };
                let cancelled = joined.is_none();
                let mut batch = match joined {
                    Some(None) => break false,
                    Some(Some(first)) => vec![first],
                    None => Vec::new(),
                };
                // Anything already finished belongs to this batch, including
                // tasks that completed before a cancel was observed.
                while let Some(next) = tasks.try_join_next() {
                    batch.push(next);
                }

                let mut completions = Vec::with_capacity(batch.len());
                for joined in batch {
                    match joined {
                        Ok(completion) => completions.push(completion),
                        Err(e) => {
                            tasks.abort_all();
                            return Err(FlowError::Worker(format!("wave task failed: {}", e)));
                        }
                    }
                }
                completions.sort_by_key(|c| (c.elapsed.as_millis(), c.node));

                for completion in completions {
                    let name = graph.name_of(completion.node);
                    let output = match completion.outcome {
                        Ok(output) => output,
                        Err(error) => match self.failure.on_failure(name, &error) {
                            FailureAction::Abort => {
                                warn!(node = name, error = %error, "Node failed, aborting run");
                                tasks.abort_all();
                                return Err(error);
                            }
                            FailureAction::Skip => {
                                warn!(node = name, error = %error, "Node failed, skipping turn");
                                self.record(
                                    &mut diagnostics,
                                    Diagnostic::NodeSkipped {
                                        wave,
                                        node: name.to_string(),
                                        error: error.to_string(),
                                    },
                                );
                                continue;
                            }
                        },
                    };

                    let message = Message::new(name, output.content).with_usage(output.usage);
                    for &edge_id in graph.outgoing(completion.node) {
                        let edge = &graph.edges()[edge_id];
                        match edge.condition.evaluate(&message) {
                            Ok(true) => {
                                debug!(wave, from = name, to = graph.name_of(edge.target), "Edge armed");
                                readiness.arm(graph, edge_id);
                                armed_edges += 1;
                            }
                            Ok(false) => {}
                            Err(error) => {
                                failed_conditions += 1;
                                let target = graph.name_of(edge.target);
                                warn!(wave, from = name, to = target, error = %error, "Edge condition failed");
                                self.record(
                                    &mut diagnostics,
                                    Diagnostic::ConditionFailed {
                                        wave,
                                        source: name.to_string(),
                                        target: target.to_string(),
                                        message: error,
                                    },
                                );
                            }
                        }
                    }

                    // Dispatched nodes read the wave snapshot, not `history`
                    if let Some(u) = &message.usage {
                        usage.accumulate(u);
                    }
                    self.sink.emit(FlowEvent::Turn {
                        wave,
                        message: message.clone(),
                    });
                    history.push(message);
                }

                if cancelled {
                    tasks.abort_all();
                    break true;
                }
            };

            wave += 1;
            if cancelled {
                info!(wave = wave - 1, "Run cancelled");
                break StopReason::Cancelled;
            }

            let mut next = readiness.promoted(graph);
            if !self.engine.allow_repeated_speaker {
                next.retain(|node| {
                    if active.contains(node) {
                        debug!(node = graph.name_of(*node), "Suppressing repeated speaker");
                        self.record(
                            &mut diagnostics,
                            Diagnostic::RepeatSuppressed {
                                wave: wave - 1,
                                node: graph.name_of(*node).to_string(),
                            },
                        );
                        false
                    } else {
                        true
                    }
                });
            }

            if let Some(policy) = self.termination {
                if let Some(reason) = policy.evaluate(&history) {
                    policy.reset();
                    break StopReason::Terminated(reason);
                }
            }

            if next.is_empty() {
                if failed_conditions > 0 && armed_edges == 0 {
                    return Err(FlowError::NoProgress {
                        wave: wave - 1,
                        failed_conditions,
                    });
                }
                break StopReason::Exhausted;
            }
            active = next;
        };

        let result = FlowResult {
            run_id,
            messages: history,
            stop_reason,
            waves: wave,
            duration: started.elapsed(),
            usage,
            diagnostics,
        };
        info!(
            run_id = %result.run_id,
            waves = result.waves,
            turns = result.messages.len() - 1,
            stop_reason = %result.stop_reason,
            "Graph run finished"
        );
        self.sink.emit(FlowEvent::Finished(result.clone()));
        Ok(result)
    }

    /// Spawn one task per active node, all sharing the same history snapshot.
    fn dispatch(&self, active: &[usize], snapshot: Arc<[Message]>) -> JoinSet<Completion> {
        let mut tasks = JoinSet::new();
        let wave_start = Instant::now();
        for &node in active {
            let worker = self.graph.nodes()[node].worker().clone();
            let name = self.graph.name_of(node).to_string();
            let history = snapshot.clone();
            let timeout = self.engine.node_timeout();
            tasks.spawn(async move {
                let call = AssertUnwindSafe(async { worker.invoke(&history).await }).catch_unwind();
                let result = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, call).await {
                        Ok(result) => result,
                        Err(_) => {
                            return Completion {
                                node,
                                elapsed: wave_start.elapsed(),
                                outcome: Err(FlowError::NodeTimeout {
                                    node: name,
                                    timeout: limit,
                                }),
                            }
                        }
                    },
                    None => call.await,
                };
                let outcome = match result {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(e)) => Err(FlowError::NodeFailed {
                        node: name,
                        message: match e {
                            FlowError::Worker(message) => message,
                            other => other.to_string(),
                        },
                    }),
                    Err(payload) => Err(FlowError::NodeFailed {
                        node: name,
                        message: format!("worker panicked: {}", describe_panic(payload.as_ref())),
                    }),
                };
                Completion {
                    node,
                    elapsed: wave_start.elapsed(),
                    outcome,
                }
            });
        }
        tasks
    }

    fn record(&self, diagnostics: &mut Vec<Diagnostic>, diagnostic: Diagnostic) {
        self.sink.emit(FlowEvent::Diagnostic(diagnostic.clone()));
        diagnostics.push(diagnostic);
    }
}
