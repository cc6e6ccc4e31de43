use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use futures::FutureExt;

use graphflow_core::error::Result;
use graphflow_core::traits::Worker;
use graphflow_core::types::{Message, WorkerOutput};

/// Deterministic worker that cycles through canned replies.
///
/// With no replies it echoes the content of the last message it sees.
/// The CLI builds one of these for every configured node.
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    replies: Vec<String>,
    description: String,
    cursor: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            description: String::new(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }
}

impl Worker for ScriptedWorker {
    fn invoke<'a>(&'a self, history: &'a [Message]) -> BoxFuture<'a, Result<WorkerOutput>> {
        let turn = self.cursor.fetch_add(1, Ordering::SeqCst);
        let content = if self.replies.is_empty() {
            history.last().map(|m| m.content.clone()).unwrap_or_default()
        } else {
            self.replies[turn % self.replies.len()].clone()
        };
        async move { Ok(WorkerOutput::text(content)) }.boxed()
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// Worker backed by a plain async closure over the visible history.
pub struct FnWorker<F> {
    f: F,
}

/// Wrap a closure as a [`Worker`].
pub fn worker_fn<F>(f: F) -> FnWorker<F>
where
    F: for<'a> Fn(&'a [Message]) -> BoxFuture<'a, Result<WorkerOutput>> + Send + Sync + 'static,
{
    FnWorker { f }
}

impl<F> Worker for FnWorker<F>
where
    F: for<'a> Fn(&'a [Message]) -> BoxFuture<'a, Result<WorkerOutput>> + Send + Sync + 'static,
{
    fn invoke<'a>(&'a self, history: &'a [Message]) -> BoxFuture<'a, Result<WorkerOutput>> {
        (self.f)(history)
    }
}
