use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlowError, Result};
use crate::types::{ActivationCondition, PerSourceFilter};

/// Top-level flow configuration, usually read from `graphflow.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub termination: Option<TerminationConfig>,
    /// Seed only this node instead of every node without incoming edges.
    #[serde(default)]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
}

/// Scheduler knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Allow a node to run again in the wave right after its own.
    #[serde(default = "default_allow_repeated_speaker")]
    pub allow_repeated_speaker: bool,
    /// Per-invocation timeout; unset means no timeout.
    #[serde(default)]
    pub node_timeout_secs: Option<u64>,
    /// Hard cap on dispatched waves; unset means unbounded.
    #[serde(default)]
    pub max_waves: Option<usize>,
    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            allow_repeated_speaker: default_allow_repeated_speaker(),
            node_timeout_secs: None,
            max_waves: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_secs.map(Duration::from_secs)
    }
}

fn default_allow_repeated_speaker() -> bool { true }
fn default_event_capacity() -> usize { crate::event::DEFAULT_EVENT_CAPACITY }

/// How configured termination conditions combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineMode {
    /// Stop when any condition fires.
    #[default]
    Any,
    /// Stop only when every condition holds.
    All,
}

/// Declarative termination conditions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminationConfig {
    #[serde(default)]
    pub max_messages: Option<usize>,
    #[serde(default)]
    pub text_mention: Option<String>,
    /// Restrict `text_mention` to these sources (empty = any source).
    #[serde(default)]
    pub text_sources: Vec<String>,
    /// Stop as soon as one of these nodes has spoken.
    #[serde(default)]
    pub stop_on_sources: Vec<String>,
    #[serde(default)]
    pub max_total_tokens: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub mode: CombineMode,
}

impl TerminationConfig {
    /// True when the table sets no stop condition.
    pub fn is_empty(&self) -> bool {
        self.max_messages.is_none()
            && self.text_mention.is_none()
            && self.stop_on_sources.is_empty()
            && self.max_total_tokens.is_none()
            && self.timeout_secs.is_none()
    }
}

/// A node declared in config. `replies` feeds the scripted worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub replies: Vec<String>,
    /// Default activation condition for incoming edges that declare none.
    #[serde(default)]
    pub activation: Option<ActivationCondition>,
    #[serde(default)]
    pub filter: Vec<PerSourceFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub from: String,
    pub to: String,
    /// Literal substring the source output must contain.
    #[serde(default)]
    pub contains: Option<String>,
    /// Regular expression the source output must match.
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub activation: Option<ActivationCondition>,
}

impl FlowConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;
        debug!(path = %path.display(), "Loading flow config");
        Self::from_toml_str(&content)
    }

    /// Parse config from TOML text, with env var expansion.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` and `${ENV_VAR:-fallback}` patterns.
///
/// Unset variables without a fallback are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            result.push_str(&rest[start..]);
            return result;
        };
        let expr = &after[..end];
        let (name, fallback) = match expr.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (expr, None),
        };
        match (std::env::var(name), fallback) {
            (Ok(val), _) => result.push_str(&val),
            (Err(_), Some(fallback)) => result.push_str(fallback),
            (Err(_), None) => result.push_str(&rest[start..start + 3 + end]),
        }
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    result
}
