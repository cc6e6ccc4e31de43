use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use graphflow_core::config::EngineConfig;
use graphflow_core::error::Result;
use graphflow_core::event::EventBus;
use graphflow_core::traits::FailurePolicy;
use graphflow_core::types::{FlowEvent, FlowResult};

use crate::failure::AbortOnFailure;
use crate::graph::{Graph, Node};
use crate::scheduler::{EventSink, Scheduler};
use crate::termination::TerminationPolicy;

/// A runnable team: a validated graph plus the policies that drive it.
///
/// Cloning is cheap. Each run gets its own history and readiness state,
/// so the same flow can be run repeatedly.
#[derive(Clone)]
pub struct GraphFlow {
    graph: Graph,
    engine: EngineConfig,
    termination: Option<TerminationPolicy>,
    failure: Arc<dyn FailurePolicy>,
    events: Option<Arc<EventBus>>,
}

impl GraphFlow {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            engine: EngineConfig::default(),
            termination: None,
            failure: Arc::new(AbortOnFailure),
            events: None,
        }
    }

    pub fn with_termination(mut self, policy: TerminationPolicy) -> Self {
        self.termination = Some(policy);
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_failure_policy<P: FailurePolicy>(mut self, policy: P) -> Self {
        self.failure = Arc::new(policy);
        self
    }

    /// Publish every run event on `bus` as well.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn participants(&self) -> &[Node] {
        self.graph.participants()
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn termination(&self) -> Option<&TerminationPolicy> {
        self.termination.as_ref()
    }

    /// Run to completion.
    pub async fn run(&self, task: impl Into<String>) -> Result<FlowResult> {
        self.run_with_cancel(task, CancellationToken::new()).await
    }

    /// Run to completion, stopping early with `StopReason::Cancelled` when
    /// `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        task: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<FlowResult> {
        let sink = EventSink::new(None, self.events.clone());
        self.scheduler(sink).run(task.into(), cancel).await
    }

    /// Run on a background task and stream events as they happen.
    ///
    /// The last item is `FlowEvent::Finished`, or an `Err` if the run failed.
    /// Dropping the stream cancels the run; cancelling `cancel` ends it with
    /// `StopReason::Cancelled`.
    pub fn run_stream(
        &self,
        task: impl Into<String>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<FlowEvent>> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        let run_token = cancel.child_token();
        let guard = run_token.clone().drop_guard();
        let flow = self.clone();
        let task = task.into();

        tokio::spawn(async move {
            let sink = EventSink::new(Some(tx.clone()), flow.events.clone());
            if let Err(e) = flow.scheduler(sink).run(task, run_token).await {
                let _ = tx.send(Err(e));
            }
        });

        stream::unfold((rx, guard), |(mut rx, guard)| async move {
            rx.recv().await.map(|item| (item, (rx, guard)))
        })
    }

    /// Clear per-run policy state (external termination signals).
    pub fn reset(&self) {
        if let Some(policy) = &self.termination {
            policy.reset();
        }
    }

    fn scheduler(&self, sink: EventSink) -> Scheduler<'_> {
        Scheduler::new(
            &self.graph,
            &self.engine,
            self.termination.as_ref(),
            self.failure.as_ref(),
            sink,
        )
    }
}

impl std::fmt::Debug for GraphFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphFlow")
            .field("graph", &self.graph.shape())
            .field("engine", &self.engine)
            .field("termination", &self.termination)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use graphflow_core::types::StopReason;

    use super::*;
    use crate::graph::GraphBuilder;
    use crate::worker::ScriptedWorker;

    fn chain() -> Graph {
        let mut builder = GraphBuilder::new();
        builder
            .add_node(Node::new("writer", ScriptedWorker::new(["draft"])))
            .unwrap()
            .add_node(Node::new("editor", ScriptedWorker::new(["final"])))
            .unwrap();
        builder.add_edge("writer", "editor").unwrap();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_run_returns_history() {
        let flow = GraphFlow::new(chain());
        let result = flow.run("write").await.unwrap();
        let contents: Vec<_> = result.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["write", "draft", "final"]);
        assert_eq!(result.stop_reason, StopReason::Exhausted);
    }

    #[tokio::test]
    async fn test_stream_yields_events_in_order() {
        let flow = GraphFlow::new(chain());
        let events: Vec<_> = flow
            .run_stream("write", CancellationToken::new())
            .collect()
            .await;
        let kinds: Vec<&str> = events
            .iter()
            .map(|e| match e.as_ref().unwrap() {
                FlowEvent::RunStarted { .. } => "start",
                FlowEvent::WaveStarted { .. } => "wave",
                FlowEvent::Turn { .. } => "turn",
                FlowEvent::Diagnostic(_) => "diag",
                FlowEvent::Finished(_) => "finished",
            })
            .collect();
        assert_eq!(kinds, vec!["start", "wave", "turn", "wave", "turn", "finished"]);
    }

    #[tokio::test]
    async fn test_event_bus_receives_events() {
        let bus = Arc::new(EventBus::new(32));
        let mut rx = bus.subscribe();
        let flow = GraphFlow::new(chain()).with_event_bus(bus);
        flow.run("write").await.unwrap();

        let mut turns = 0;
        while let Ok(event) = rx.try_recv() {
            if let FlowEvent::Turn { .. } = event {
                turns += 1;
            }
        }
        assert_eq!(turns, 2);
    }
}
