use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Source name stamped on the task message that opens every run.
pub const TASK_SOURCE: &str = "user";

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token accounting reported by a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One turn of the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Name of the node that produced this turn (or `user` for the task).
    pub source: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
            usage: None,
            timestamp: Utc::now(),
        }
    }

    /// The task message that seeds a run.
    pub fn task(content: impl Into<String>) -> Self {
        Self::new(TASK_SOURCE, content)
    }

    pub fn with_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn is_task(&self) -> bool {
        self.source == TASK_SOURCE
    }
}

/// What a worker hands back for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOutput {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

impl WorkerOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Join rule of an activation group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationCondition {
    /// Every edge of the group must arm within the same wave.
    #[default]
    All,
    /// One armed edge is enough.
    Any,
}

impl std::fmt::Display for ActivationCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Any => write!(f, "any"),
        }
    }
}

/// Which end of a source's messages a filter rule keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterPosition {
    First,
    #[default]
    Last,
    All,
}

/// Keep the first/last `count` messages produced by `source`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerSourceFilter {
    pub source: String,
    #[serde(default)]
    pub position: FilterPosition,
    /// `None` or `0` keeps every message from the source.
    #[serde(default)]
    pub count: Option<usize>,
}

impl PerSourceFilter {
    pub fn first(source: impl Into<String>, count: usize) -> Self {
        Self {
            source: source.into(),
            position: FilterPosition::First,
            count: Some(count),
        }
    }

    pub fn last(source: impl Into<String>, count: usize) -> Self {
        Self {
            source: source.into(),
            position: FilterPosition::Last,
            count: Some(count),
        }
    }

    pub fn all(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            position: FilterPosition::All,
            count: None,
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    /// A termination policy fired.
    Terminated(String),
    /// The next wave had nothing to run.
    Exhausted,
    /// The engine's wave cap was reached.
    MaxWaves(usize),
    /// The run was cancelled from outside.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminated(reason) => write!(f, "{}", reason),
            Self::Exhausted => write!(f, "no further work"),
            Self::MaxWaves(n) => write!(f, "wave limit reached ({})", n),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Recoverable problems recorded during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Diagnostic {
    /// An edge predicate errored or panicked; the edge stayed unarmed.
    ConditionFailed {
        wave: usize,
        source: String,
        target: String,
        message: String,
    },
    /// A worker failed and the failure policy downgraded it to a skipped turn.
    NodeSkipped {
        wave: usize,
        node: String,
        error: String,
    },
    /// A promotion was dropped because the node just ran.
    RepeatSuppressed { wave: usize, node: String },
}

/// Final outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowResult {
    pub run_id: RunId,
    /// Full history, task message first.
    pub messages: Vec<Message>,
    pub stop_reason: StopReason,
    /// Number of waves dispatched.
    pub waves: usize,
    pub duration: Duration,
    pub usage: TokenUsage,
    pub diagnostics: Vec<Diagnostic>,
}

impl FlowResult {
    /// Turns produced by nodes (the task message excluded).
    pub fn turns(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| !m.is_task())
    }

    /// Node names in the order their turns were recorded.
    pub fn speakers(&self) -> Vec<&str> {
        self.turns().map(|m| m.source.as_str()).collect()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop_reason == StopReason::Cancelled
    }
}

/// Events emitted while a run progresses.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FlowEvent {
    RunStarted { run_id: RunId, task: String },
    WaveStarted { wave: usize, nodes: Vec<String> },
    Turn { wave: usize, message: Message },
    Diagnostic(Diagnostic),
    Finished(FlowResult),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage::new(10, 5));
        total.accumulate(&TokenUsage::new(1, 2));
        assert_eq!(total, TokenUsage::new(11, 7));
        assert_eq!(total.total(), 18);
    }

    #[test]
    fn task_message_is_tagged() {
        let m = Message::task("do it");
        assert!(m.is_task());
        assert_eq!(m.source, TASK_SOURCE);
        assert!(!Message::new("writer", "x").is_task());
    }

    #[test]
    fn activation_condition_parses_lowercase() {
        let a: ActivationCondition = serde_json::from_str("\"any\"").unwrap();
        assert_eq!(a, ActivationCondition::Any);
        assert_eq!(ActivationCondition::default(), ActivationCondition::All);
        assert_eq!(ActivationCondition::Any.to_string(), "any");
    }

    #[test]
    fn stop_reason_display() {
        assert_eq!(StopReason::Exhausted.to_string(), "no further work");
        assert_eq!(
            StopReason::Terminated("Maximum number of messages 3 reached".into()).to_string(),
            "Maximum number of messages 3 reached"
        );
    }

    #[test]
    fn speakers_skip_task() {
        let result = FlowResult {
            run_id: RunId::new(),
            messages: vec![
                Message::task("t"),
                Message::new("a", "1"),
                Message::new("b", "2"),
            ],
            stop_reason: StopReason::Exhausted,
            waves: 2,
            duration: Duration::from_millis(3),
            usage: TokenUsage::default(),
            diagnostics: vec![],
        };
        assert_eq!(result.speakers(), vec!["a", "b"]);
        assert!(!result.is_cancelled());
    }
}
