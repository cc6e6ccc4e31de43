//! Shared mocks and fixtures for graphflow tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tempfile::TempDir;

use graphflow_core::error::{FlowError, Result};
use graphflow_core::traits::Worker;
use graphflow_core::types::{Message, TokenUsage, WorkerOutput};

#[derive(Default)]
struct MockState {
    replies: Vec<String>,
    delay: Option<Duration>,
    usage: Option<TokenUsage>,
    calls: AtomicUsize,
    completed: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

/// Scripted worker that records every history it was shown.
///
/// Clones share state, so a test can keep one handle and give another to
/// the graph.
#[derive(Clone, Default)]
pub struct MockWorker {
    state: Arc<MockState>,
}

impl MockWorker {
    /// Cycle through `replies`; with none, reply with the call number.
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::new(MockState {
                replies: replies.into_iter().map(Into::into).collect(),
                ..Default::default()
            }),
        }
    }

    /// Sleep this long before answering.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.rebuild(|s| s.delay = Some(delay))
    }

    /// Report this usage on every reply.
    pub fn with_usage(self, usage: TokenUsage) -> Self {
        self.rebuild(|s| s.usage = Some(usage))
    }

    fn rebuild(self, f: impl FnOnce(&mut MockState)) -> Self {
        let mut state = MockState {
            replies: self.state.replies.clone(),
            delay: self.state.delay,
            usage: self.state.usage,
            ..Default::default()
        };
        f(&mut state);
        Self {
            state: Arc::new(state),
        }
    }

    /// Invocations started so far.
    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Invocations that ran to completion.
    pub fn completed(&self) -> usize {
        self.state.completed.load(Ordering::SeqCst)
    }

    /// Every history view this worker received, in call order.
    pub fn seen(&self) -> Vec<Vec<Message>> {
        self.state
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Source names of each received view.
    pub fn seen_sources(&self) -> Vec<Vec<String>> {
        self.seen()
            .iter()
            .map(|view| view.iter().map(|m| m.source.clone()).collect())
            .collect()
    }
}

impl Worker for MockWorker {
    fn invoke<'a>(&'a self, history: &'a [Message]) -> BoxFuture<'a, Result<WorkerOutput>> {
        let call = self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(history.to_vec());

        async move {
            if let Some(delay) = self.state.delay {
                tokio::time::sleep(delay).await;
            }
            let content = if self.state.replies.is_empty() {
                format!("reply {}", call + 1)
            } else {
                self.state.replies[call % self.state.replies.len()].clone()
            };
            self.state.completed.fetch_add(1, Ordering::SeqCst);
            let output = WorkerOutput::text(content);
            Ok(match self.state.usage {
                Some(usage) => output.with_usage(usage),
                None => output,
            })
        }
        .boxed()
    }

    fn description(&self) -> &str {
        "mock worker"
    }
}

/// Worker that always returns an error.
#[derive(Debug, Clone)]
pub struct FailingWorker {
    message: String,
}

impl FailingWorker {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Worker for FailingWorker {
    fn invoke<'a>(&'a self, _history: &'a [Message]) -> BoxFuture<'a, Result<WorkerOutput>> {
        async move { Err(FlowError::Worker(self.message.clone())) }.boxed()
    }
}

/// Worker that panics when invoked.
#[derive(Debug, Clone, Default)]
pub struct PanickingWorker;

impl Worker for PanickingWorker {
    fn invoke<'a>(&'a self, _history: &'a [Message]) -> BoxFuture<'a, Result<WorkerOutput>> {
        futures::future::lazy(|_| -> Result<WorkerOutput> { panic!("worker exploded") }).boxed()
    }
}

/// A history that starts with `task` followed by `(source, content)` turns.
pub fn history(task: &str, turns: &[(&str, &str)]) -> Vec<Message> {
    let mut messages = vec![Message::task(task)];
    messages.extend(turns.iter().map(|(s, c)| Message::new(*s, *c)));
    messages
}

/// Write a flow config into a fresh temp dir. Keep the `TempDir` alive
/// for as long as the path is used.
pub fn write_flow_config(content: &str) -> std::io::Result<(TempDir, PathBuf)> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("graphflow.toml");
    std::fs::write(&path, content)?;
    Ok((dir, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_records_views_and_cycles() {
        let worker = MockWorker::new(["a", "b"]);
        let handle = worker.clone();
        let h = history("task", &[("x", "1")]);
        assert_eq!(worker.invoke(&h).await.unwrap().content, "a");
        assert_eq!(worker.invoke(&h[..1]).await.unwrap().content, "b");
        assert_eq!(handle.calls(), 2);
        assert_eq!(handle.completed(), 2);
        assert_eq!(
            handle.seen_sources(),
            vec![vec!["user".to_string(), "x".to_string()], vec!["user".to_string()]]
        );
    }

    #[tokio::test]
    async fn mock_without_replies_counts() {
        let worker = MockWorker::default().with_usage(TokenUsage::new(3, 4));
        let out = worker.invoke(&[]).await.unwrap();
        assert_eq!(out.content, "reply 1");
        assert_eq!(out.usage, Some(TokenUsage::new(3, 4)));
    }

    #[tokio::test]
    async fn failing_worker_errors() {
        let err = FailingWorker::new("nope").invoke(&[]).await.unwrap_err();
        assert!(matches!(err, FlowError::Worker(ref m) if m == "nope"));
    }

    #[test]
    fn writes_config_fixture() {
        let (_dir, path) = write_flow_config("[[nodes]]\nname = \"a\"\n").unwrap();
        assert!(std::fs::read_to_string(path).unwrap().contains("name = \"a\""));
    }
}
