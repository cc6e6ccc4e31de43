use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use graphflow_core::error::Result;
use graphflow_core::traits::Worker;
use graphflow_core::types::{FilterPosition, Message, PerSourceFilter, WorkerOutput};

/// Read-time view over history, declared as rules per source.
///
/// Each rule selects messages from one source; the selections are unioned
/// and returned in chronological order. Sources no rule names are dropped.
/// With no rules at all the history passes through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    rules: Vec<PerSourceFilter>,
}

impl MessageFilter {
    pub fn new(rules: Vec<PerSourceFilter>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[PerSourceFilter] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Produce the filtered view. Never mutates `history`.
    pub fn apply(&self, history: &[Message]) -> Vec<Message> {
        if self.rules.is_empty() {
            return history.to_vec();
        }

        let mut keep = BTreeSet::new();
        for rule in &self.rules {
            let positions: Vec<usize> = history
                .iter()
                .enumerate()
                .filter(|(_, m)| m.source == rule.source)
                .map(|(i, _)| i)
                .collect();
            let selected = match (rule.position, rule.count) {
                // A zero count means no truncation
                (FilterPosition::All, _) | (_, None) | (_, Some(0)) => &positions[..],
                (FilterPosition::First, Some(n)) => &positions[..n.min(positions.len())],
                (FilterPosition::Last, Some(n)) => {
                    &positions[positions.len().saturating_sub(n)..]
                }
            };
            keep.extend(selected.iter().copied());
        }

        keep.into_iter().map(|i| history[i].clone()).collect()
    }
}

/// Worker wrapper that shows the inner worker a filtered history.
pub struct FilteredWorker {
    inner: Arc<dyn Worker>,
    filter: MessageFilter,
}

impl FilteredWorker {
    pub fn new(inner: Arc<dyn Worker>, filter: MessageFilter) -> Self {
        Self { inner, filter }
    }

    pub fn filter(&self) -> &MessageFilter {
        &self.filter
    }
}

impl Worker for FilteredWorker {
    fn invoke<'a>(&'a self, history: &'a [Message]) -> BoxFuture<'a, Result<WorkerOutput>> {
        let view = self.filter.apply(history);
        async move { self.inner.invoke(&view).await }.boxed()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }
}
