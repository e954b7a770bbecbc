//! Step error policies

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// What to do once a step has failed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Abort the strategy with a step execution error
    #[default]
    Stop,
    /// Record the failure and carry on
    Continue,
    /// Re-run the step with backoff until attempts run out
    Retry,
    /// Mark the step skipped and carry on
    Skip,
}

/// Delay growth between retry attempts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `delay * attempt`
    Linear,
    /// `delay * 2^(attempt - 1)`
    #[default]
    Exponential,
}

/// Action descriptor: a registry key plus raw parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ActionSpec {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
}

/// Error policy for a step, or the strategy-wide default
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorHandling {
    #[serde(default)]
    pub action: ErrorAction,

    /// Total attempts including the first (1-10)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Base delay in seconds (1-300)
    #[serde(default = "default_delay")]
    pub delay: u64,

    /// Action run once after the policy is exhausted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<ActionSpec>,

    /// `name=value` assignment applied when the step finally fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_variable: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay() -> u64 {
    1
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            action: ErrorAction::default(),
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            delay: default_delay(),
            fallback: None,
            set_variable: None,
        }
    }
}

impl ErrorHandling {
    /// Policy used when neither the step nor the strategy declares one
    pub fn stop_once() -> Self {
        Self {
            action: ErrorAction::Stop,
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_action(action: ErrorAction) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    /// Attempts actually made: only `retry` re-runs a step
    pub fn effective_attempts(&self) -> u32 {
        match self.action {
            ErrorAction::Retry => self.max_attempts.max(1),
            _ => 1,
        }
    }

    /// Split `set_variable` on the first `=`
    pub fn variable_assignment(&self) -> Option<(&str, &str)> {
        let assignment = self.set_variable.as_deref()?;
        let (name, value) = assignment.split_once('=')?;
        Some((name.trim(), value.trim()))
    }
}

/// Accept either an action name (`on_error: skip`) or a full policy
pub(crate) fn deserialize_error_handling<'de, D>(
    deserializer: D,
) -> Result<Option<ErrorHandling>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ErrorHandlingValue {
        Action(ErrorAction),
        Policy(ErrorHandling),
    }

    Ok(
        Option::<ErrorHandlingValue>::deserialize(deserializer)?.map(|value| match value {
            ErrorHandlingValue::Action(action) => ErrorHandling::with_action(action),
            ErrorHandlingValue::Policy(policy) => policy,
        }),
    )
}
