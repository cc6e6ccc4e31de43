use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use graphflow_core::config::{CombineMode, TerminationConfig};
use graphflow_core::types::Message;

/// A flag settable from outside the run loop; polled once per wave.
#[derive(Debug, Clone, Default)]
pub struct ExternalSignal {
    flag: Arc<AtomicBool>,
}

impl ExternalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination. Safe to call from any thread or task.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// User-supplied stop predicate; returns the stop reason when it fires.
pub type TerminationFn = Arc<dyn Fn(&[Message]) -> Option<String> + Send + Sync>;

/// Stop predicate over the accumulated history.
///
/// Evaluation is pure and never blocks. Composite policies evaluate both
/// sides every time so the reasons of an `And` can be reported together.
#[derive(Clone)]
pub enum TerminationPolicy {
    /// Stop once the history (task message included) holds `n` messages.
    MaxMessages(usize),
    /// Stop when a message contains `text`, optionally only from `sources`.
    TextMention { text: String, sources: Vec<String> },
    /// Stop when the signal has been set.
    External(ExternalSignal),
    /// Stop once any of these nodes has produced a turn.
    SourceMatch(Vec<String>),
    /// Stop once the summed token usage reaches `max_total`.
    TokenUsage { max_total: u64 },
    /// Stop once this much wall-clock time has passed since the first message.
    Timeout(Duration),
    Custom(TerminationFn),
    And(Box<TerminationPolicy>, Box<TerminationPolicy>),
    Or(Box<TerminationPolicy>, Box<TerminationPolicy>),
}

impl TerminationPolicy {
    pub fn max_messages(n: usize) -> Self {
        Self::MaxMessages(n)
    }

    pub fn text_mention(text: impl Into<String>) -> Self {
        Self::TextMention {
            text: text.into(),
            sources: Vec::new(),
        }
    }

    pub fn text_mention_from<I, S>(text: impl Into<String>, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::TextMention {
            text: text.into(),
            sources: sources.into_iter().map(Into::into).collect(),
        }
    }

    pub fn external(signal: ExternalSignal) -> Self {
        Self::External(signal)
    }

    pub fn source_match<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::SourceMatch(sources.into_iter().map(Into::into).collect())
    }

    pub fn token_usage(max_total: u64) -> Self {
        Self::TokenUsage { max_total }
    }

    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout(duration)
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[Message]) -> Option<String> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Stop when either policy stops.
    pub fn or(self, other: TerminationPolicy) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Stop only when both policies stop.
    pub fn and(self, other: TerminationPolicy) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// Return the stop reason if the run should end.
    pub fn evaluate(&self, history: &[Message]) -> Option<String> {
        match self {
            Self::MaxMessages(n) => (history.len() >= *n).then(|| {
                format!(
                    "Maximum number of messages {} reached, current message count: {}",
                    n,
                    history.len()
                )
            }),
            Self::TextMention { text, sources } => history
                .iter()
                .filter(|m| sources.is_empty() || sources.contains(&m.source))
                .any(|m| m.content.contains(text.as_str()))
                .then(|| format!("Text '{}' mentioned", text)),
            Self::External(signal) => signal
                .is_set()
                .then(|| "External termination requested".to_string()),
            Self::SourceMatch(sources) => history
                .iter()
                .filter(|m| !m.is_task())
                .find(|m| sources.contains(&m.source))
                .map(|m| format!("'{}' answered", m.source)),
            Self::TokenUsage { max_total } => {
                let total: u64 = history
                    .iter()
                    .filter_map(|m| m.usage.as_ref())
                    .map(|u| u.total())
                    .sum();
                (total >= *max_total).then(|| {
                    format!(
                        "Token usage limit reached, total token count: {}",
                        total
                    )
                })
            }
            Self::Timeout(limit) => {
                let started = history.first()?.timestamp;
                let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
                (elapsed >= *limit)
                    .then(|| format!("Timeout of {:.3} seconds reached", limit.as_secs_f64()))
            }
            Self::Custom(f) => f(history),
            Self::And(a, b) => match (a.evaluate(history), b.evaluate(history)) {
                (Some(x), Some(y)) => Some(format!("{}; {}", x, y)),
                _ => None,
            },
            Self::Or(a, b) => a.evaluate(history).or_else(|| b.evaluate(history)),
        }
    }

    /// Clear per-run state (external signals) so the policy can be reused.
    pub fn reset(&self) {
        match self {
            Self::External(signal) => signal.reset(),
            Self::And(a, b) | Self::Or(a, b) => {
                a.reset();
                b.reset();
            }
            _ => {}
        }
    }

    /// Build a policy from the `[termination]` config table.
    ///
    /// Returns `None` when the table sets no condition.
    pub fn from_config(config: &TerminationConfig) -> Option<Self> {
        if config.is_empty() {
            return None;
        }
        let mut parts = Vec::new();
        if let Some(n) = config.max_messages {
            parts.push(Self::MaxMessages(n));
        }
        if let Some(text) = &config.text_mention {
            parts.push(Self::TextMention {
                text: text.clone(),
                sources: config.text_sources.clone(),
            });
        }
        if !config.stop_on_sources.is_empty() {
            parts.push(Self::SourceMatch(config.stop_on_sources.clone()));
        }
        if let Some(max_total) = config.max_total_tokens {
            parts.push(Self::TokenUsage { max_total });
        }
        if let Some(secs) = config.timeout_secs {
            parts.push(Self::Timeout(Duration::from_secs(secs)));
        }

        parts.into_iter().reduce(|acc, next| match config.mode {
            CombineMode::Any => acc.or(next),
            CombineMode::All => acc.and(next),
        })
    }
}

impl std::fmt::Debug for TerminationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxMessages(n) => f.debug_tuple("MaxMessages").field(n).finish(),
            Self::TextMention { text, sources } => f
                .debug_struct("TextMention")
                .field("text", text)
                .field("sources", sources)
                .finish(),
            Self::External(signal) => f.debug_tuple("External").field(&signal.is_set()).finish(),
            Self::SourceMatch(sources) => f.debug_tuple("SourceMatch").field(sources).finish(),
            Self::TokenUsage { max_total } => f
                .debug_struct("TokenUsage")
                .field("max_total", max_total)
                .finish(),
            Self::Timeout(d) => f.debug_tuple("Timeout").field(d).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
            Self::And(a, b) => f.debug_tuple("And").field(a).field(b).finish(),
            Self::Or(a, b) => f.debug_tuple("Or").field(a).field(b).finish(),
        }
    }
}
