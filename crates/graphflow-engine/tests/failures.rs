use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use graphflow_core::config::EngineConfig;
use graphflow_core::error::FlowError;
use graphflow_core::types::{Diagnostic, FlowEvent, PerSourceFilter, StopReason, TokenUsage};
use graphflow_engine::{
    EdgeCondition, GraphBuilder, GraphFlow, Node, ScriptedWorker, SkipNodes, TerminationPolicy,
};
use graphflow_test_utils::{FailingWorker, MockWorker, PanickingWorker};

fn pipeline(middle: Node) -> GraphBuilder {
    let mut builder = GraphBuilder::new();
    builder
        .add_node(Node::new("A", ScriptedWorker::new(["a"])))
        .unwrap()
        .add_node(middle)
        .unwrap()
        .add_node(Node::new("C", ScriptedWorker::new(["c"])))
        .unwrap();
    builder.add_edge("A", "B").unwrap().add_edge("B", "C").unwrap();
    builder
}

#[tokio::test]
async fn failing_predicate_without_any_armed_edge_is_no_progress() {
    let mut builder = GraphBuilder::new();
    builder
        .add_node(Node::new("A", ScriptedWorker::new(["a"])))
        .unwrap()
        .add_node(Node::new("B", ScriptedWorker::new(["b"])))
        .unwrap();
    builder
        .add_conditional_edge(
            "A",
            "B",
            EdgeCondition::when(|m| panic!("cannot classify '{}'", m.content)),
        )
        .unwrap();

    let err = GraphFlow::new(builder.build().unwrap())
        .run("go")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FlowError::NoProgress {
            wave: 0,
            failed_conditions: 1
        }
    ));
}

#[tokio::test]
async fn worker_failure_aborts_by_default() {
    let err = GraphFlow::new(pipeline(Node::new("B", FailingWorker::new("rate limited"))).build().unwrap())
        .run("go")
        .await
        .unwrap_err();
    match err {
        FlowError::NodeFailed { node, message } => {
            assert_eq!(node, "B");
            assert_eq!(message, "rate limited");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn worker_panic_is_a_node_failure() {
    let err = GraphFlow::new(pipeline(Node::new("B", PanickingWorker)).build().unwrap())
        .run("go")
        .await
        .unwrap_err();
    assert_eq!(err.node(), Some("B"));
    assert!(err.to_string().contains("worker panicked: worker exploded"));
}

#[tokio::test]
async fn skip_policy_downgrades_failure_to_missing_turn() {
    let flow = GraphFlow::new(pipeline(Node::new("B", FailingWorker::new("flaky"))).build().unwrap())
        .with_failure_policy(SkipNodes::new(["B"]));
    let result = flow.run("go").await.unwrap();

    assert_eq!(result.speakers(), vec!["A"]);
    assert_eq!(result.stop_reason, StopReason::Exhausted);
    assert_eq!(
        result.diagnostics,
        vec![Diagnostic::NodeSkipped {
            wave: 1,
            node: "B".into(),
            error: "node 'B' failed: flaky".into(),
        }]
    );
}

#[tokio::test]
async fn slow_worker_times_out() {
    let slow = Node::new("B", MockWorker::new(["b"]).with_delay(Duration::from_secs(30)));
    let flow = GraphFlow::new(pipeline(slow).build().unwrap()).with_engine(EngineConfig {
        node_timeout_secs: Some(1),
        ..Default::default()
    });
    let err = flow.run("go").await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::NodeTimeout { ref node, timeout } if node == "B" && timeout == Duration::from_secs(1)
    ));
}

#[tokio::test]
async fn filtered_node_sees_only_selected_messages() {
    let reviewer = MockWorker::new(["ok"]);
    let mut builder = GraphBuilder::new();
    builder
        .add_node(Node::new("writer", ScriptedWorker::new(["v1", "v2", "v3"])))
        .unwrap()
        .add_node(Node::new("noise", ScriptedWorker::new(["chatter"])))
        .unwrap()
        .add_node(
            Node::new("reviewer", reviewer.clone())
                .with_filter(vec![PerSourceFilter::last("writer", 1)]),
        )
        .unwrap();
    builder
        .add_edge("writer", "writer")
        .unwrap()
        .add_edge("writer", "noise")
        .unwrap()
        .add_conditional_edge("writer", "reviewer", EdgeCondition::contains("v3"))
        .unwrap();
    builder.set_entry_point("writer");

    let flow = GraphFlow::new(builder.build().unwrap())
        .with_termination(TerminationPolicy::source_match(["reviewer"]));
    let result = flow.run("draft").await.unwrap();

    assert_eq!(result.stop_reason, StopReason::Terminated("'reviewer' answered".into()));
    let seen = reviewer.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].len(), 1);
    assert_eq!(seen[0][0].content, "v3");
}

#[tokio::test]
async fn usage_is_summed_and_can_terminate() {
    let mut builder = GraphBuilder::new();
    builder
        .add_node(Node::new(
            "A",
            MockWorker::new(["a"]).with_usage(TokenUsage::new(30, 20)),
        ))
        .unwrap();
    builder.add_edge("A", "A").unwrap();
    builder.set_entry_point("A");

    let flow = GraphFlow::new(builder.build().unwrap())
        .with_termination(TerminationPolicy::token_usage(120));
    let result = flow.run("go").await.unwrap();

    assert_eq!(result.usage, TokenUsage::new(90, 60));
    assert_eq!(result.waves, 3);
    assert!(matches!(result.stop_reason, StopReason::Terminated(ref r) if r.starts_with("Token usage limit reached")));
}

#[tokio::test]
async fn stream_ends_with_finished_after_cancellation() {
    let mut builder = GraphBuilder::new();
    builder
        .add_node(Node::new("fast", MockWorker::new(["quick"])))
        .unwrap()
        .add_node(Node::new(
            "slow",
            MockWorker::new(["never"]).with_delay(Duration::from_secs(30)),
        ))
        .unwrap();
    let flow = GraphFlow::new(builder.build().unwrap());

    let cancel = CancellationToken::new();
    let mut stream = Box::pin(flow.run_stream("go", cancel.clone()));
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let mut turns = Vec::new();
    let mut finished = None;
    while let Some(event) = stream.next().await {
        match event.unwrap() {
            FlowEvent::Turn { message, .. } => turns.push(message.source),
            FlowEvent::Finished(result) => finished = Some(result),
            _ => {}
        }
    }

    assert_eq!(turns, vec!["fast".to_string()]);
    let result = finished.expect("stream should end with a Finished event");
    assert!(result.is_cancelled());
}

#[tokio::test]
async fn stream_surfaces_run_errors() {
    let flow = GraphFlow::new(pipeline(Node::new("B", FailingWorker::new("down"))).build().unwrap());
    let events: Vec<_> = flow.run_stream("go", CancellationToken::new()).collect().await;
    let last = events.last().expect("at least one event");
    assert!(matches!(last, Err(FlowError::NodeFailed { .. })));
}

#[tokio::test]
async fn stream_delivers_turns_before_slow_sibling_finishes() {
    let slow = MockWorker::new(["late"]).with_delay(Duration::from_secs(2));
    let mut builder = GraphBuilder::new();
    builder
        .add_node(Node::new("fast", MockWorker::new(["quick"])))
        .unwrap()
        .add_node(Node::new("slow", slow.clone()))
        .unwrap();
    let flow = GraphFlow::new(builder.build().unwrap());

    let cancel = CancellationToken::new();
    let mut stream = Box::pin(flow.run_stream("go", cancel.clone()));
    let started = std::time::Instant::now();
    let first_turn = loop {
        match stream.next().await.expect("stream ended early").unwrap() {
            FlowEvent::Turn { message, .. } => break message,
            _ => continue,
        }
    };

    assert_eq!(first_turn.source, "fast");
    assert_eq!(slow.completed(), 0);
    assert!(started.elapsed() < Duration::from_secs(1));

    cancel.cancel();
    while stream.next().await.is_some() {}
}
