use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use regex::Regex;

use graphflow_core::error::{FlowError, Result};
use graphflow_core::types::{ActivationCondition, Message};

/// Fallible predicate over a single output.
pub type ConditionFn = Arc<dyn Fn(&Message) -> std::result::Result<bool, String> + Send + Sync>;

/// Condition for traversing an edge.
#[derive(Clone, Default)]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse if the output contains the literal text.
    Contains(String),
    /// Traverse if the output matches the regular expression.
    Matches(Regex),
    /// Traverse if the caller-supplied predicate returns `Ok(true)`.
    Predicate(ConditionFn),
}

impl EdgeCondition {
    pub fn contains(text: impl Into<String>) -> Self {
        Self::Contains(text.into())
    }

    /// Compile a regex condition.
    pub fn matches(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(Self::Matches)
            .map_err(|e| FlowError::Config(format!("invalid edge regex '{}': {}", pattern, e)))
    }

    /// Wrap an infallible predicate.
    pub fn when<F>(f: F) -> Self
    where
        F: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(move |m| Ok(f(m))))
    }

    /// Wrap a predicate that may fail.
    pub fn try_when<F>(f: F) -> Self
    where
        F: Fn(&Message) -> std::result::Result<bool, String> + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Evaluate against one output. Predicate errors and panics come back as `Err`.
    pub fn evaluate(&self, message: &Message) -> std::result::Result<bool, String> {
        match self {
            Self::Always => Ok(true),
            Self::Contains(text) => Ok(message.content.contains(text.as_str())),
            Self::Matches(re) => Ok(re.is_match(&message.content)),
            Self::Predicate(f) => catch_unwind(AssertUnwindSafe(|| f(message)))
                .unwrap_or_else(|payload| {
                    Err(format!("condition panicked: {}", describe_panic(payload.as_ref())))
                }),
        }
    }

    pub fn is_conditional(&self) -> bool {
        !matches!(self, Self::Always)
    }

    /// Stable textual form used in graph shapes and diagrams.
    pub fn describe(&self) -> String {
        match self {
            Self::Always => "always".to_string(),
            Self::Contains(text) => format!("contains:{}", text),
            Self::Matches(re) => format!("regex:{}", re.as_str()),
            Self::Predicate(_) => "predicate".to_string(),
        }
    }
}

impl PartialEq for EdgeCondition {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Always, Self::Always) => true,
            (Self::Contains(a), Self::Contains(b)) => a == b,
            (Self::Matches(a), Self::Matches(b)) => a.as_str() == b.as_str(),
            (Self::Predicate(a), Self::Predicate(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for EdgeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EdgeCondition({})", self.describe())
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn describe_panic(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// An edge as declared to the builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Source node name.
    pub from: String,
    /// Target node name.
    pub to: String,
    pub condition: EdgeCondition,
    /// Activation group on the target; `None` joins the target's default group.
    pub activation_group: Option<String>,
    /// Join rule; `None` falls back to the target's default, then `all`.
    pub activation_condition: Option<ActivationCondition>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
            activation_group: None,
            activation_condition: None,
        }
    }

    /// Create an edge that fires when the output contains `text`.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(from, to).with_condition(EdgeCondition::contains(text))
    }

    pub fn with_condition(mut self, condition: EdgeCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.activation_group = Some(group.into());
        self
    }

    pub fn with_activation(mut self, activation: ActivationCondition) -> Self {
        self.activation_condition = Some(activation);
        self
    }

    /// Group label this edge lands in on its target.
    pub fn group_label(&self) -> &str {
        self.activation_group.as_deref().unwrap_or(&self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_builders() {
        let e = Edge::new("a", "b");
        assert_eq!(e.from, "a");
        assert_eq!(e.to, "b");
        assert!(!e.condition.is_conditional());
        assert_eq!(e.group_label(), "b");

        let e = Edge::conditional("a", "c", "APPROVE")
            .with_group("review")
            .with_activation(ActivationCondition::Any);
        assert_eq!(e.condition, EdgeCondition::contains("APPROVE"));
        assert_eq!(e.group_label(), "review");
        assert_eq!(e.activation_condition, Some(ActivationCondition::Any));
    }

    #[test]
    fn test_contains_condition() {
        let c = EdgeCondition::contains("CONTINUE");
        assert_eq!(c.evaluate(&Message::new("b", "please CONTINUE")), Ok(true));
        assert_eq!(c.evaluate(&Message::new("b", "STOP")), Ok(false));
    }

    #[test]
    fn test_regex_condition() {
        let c = EdgeCondition::matches(r"^C\d_COMPLETE$").unwrap();
        assert_eq!(c.evaluate(&Message::new("c1", "C1_COMPLETE")), Ok(true));
        assert_eq!(c.evaluate(&Message::new("c1", "not yet")), Ok(false));
        assert!(EdgeCondition::matches("(").is_err());
    }

    #[test]
    fn test_predicate_errors_and_panics_are_contained() {
        let failing = EdgeCondition::try_when(|_| Err("bad input".to_string()));
        assert_eq!(
            failing.evaluate(&Message::new("a", "x")),
            Err("bad input".to_string())
        );

        let panicking = EdgeCondition::when(|m| {
            if m.content.is_empty() {
                panic!("empty output");
            }
            true
        });
        let err = panicking.evaluate(&Message::new("a", "")).unwrap_err();
        assert!(err.contains("empty output"));
        assert_eq!(panicking.evaluate(&Message::new("a", "ok")), Ok(true));
    }

    #[test]
    fn test_condition_equality() {
        let p = EdgeCondition::when(|_| true);
        assert_eq!(p, p.clone());
        assert_ne!(p, EdgeCondition::when(|_| true));
        assert_eq!(EdgeCondition::Always, EdgeCondition::default());
        assert_ne!(EdgeCondition::contains("a"), EdgeCondition::contains("b"));
    }
}
