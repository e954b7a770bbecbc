//! Step definitions

use super::condition::Condition;
use super::error_handling::{deserialize_error_handling, ActionSpec, ErrorHandling};
use super::loops::{ForEachConfig, ParallelConfig, RepeatConfig};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// When to write checkpoints around a step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointTiming {
    Before,
    After,
    Both,
}

impl CheckpointTiming {
    pub fn before(self) -> bool {
        matches!(self, CheckpointTiming::Before | CheckpointTiming::Both)
    }

    pub fn after(self) -> bool {
        matches!(self, CheckpointTiming::After | CheckpointTiming::Both)
    }
}

/// One unit of work in a strategy.
///
/// A bare `{name, action}` step has no control flow at all; every other
/// field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub action: ActionSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_error_handling"
    )]
    pub on_error: Option<ErrorHandling>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEachConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelConfig>,

    /// Steps that must finish first (`dag` mode only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<CheckpointTiming>,

    /// Variables assigned after a successful run; values containing `${`
    /// are evaluated first
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub set_variables: Map<String, Value>,

    /// A failing non-critical step never stops the strategy
    #[serde(default = "default_is_critical")]
    pub is_critical: bool,

    /// Skip guard: an expression, a variable name or a filesystem path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_exists: Option<String>,

    /// Per-attempt timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

fn default_is_critical() -> bool {
    true
}

impl Step {
    /// Plain step running `action_type` with no control flow
    pub fn new(name: impl Into<String>, action_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            action: ActionSpec {
                action_type: action_type.into(),
                params: Map::new(),
            },
            condition: None,
            on_error: None,
            for_each: None,
            repeat: None,
            parallel: None,
            depends_on: Vec::new(),
            checkpoint: None,
            set_variables: Map::new(),
            is_critical: true,
            skip_if_exists: None,
            timeout: None,
        }
    }

    /// Whether `for_each` iterations should run concurrently
    pub fn runs_in_parallel(&self) -> bool {
        self.for_each.is_some() && self.parallel.as_ref().map(|p| p.enabled).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::error_handling::ErrorAction;

    #[test]
    fn test_legacy_step_shape() {
        let step: Step = serde_yaml::from_str("{name: load, action: {type: noop}}").unwrap();
        assert_eq!(step, Step::new("load", "noop"));
        assert!(step.is_critical);
    }

    #[test]
    fn test_full_step() {
        let yaml = r#"
name: map_ids
action:
  type: echo
  params:
    source: "${variables.source}"
condition: "${variables.enabled}"
on_error: continue
for_each:
  items: "${variables.ids}"
  as: id
parallel:
  max_workers: 2
  fail_fast: true
checkpoint: both
set_variables:
  last: "${id}"
is_critical: false
timeout: 30
"#;
        let step: Step = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.on_error.as_ref().unwrap().action, ErrorAction::Continue);
        assert!(step.runs_in_parallel());
        let timing = step.checkpoint.unwrap();
        assert!(timing.before() && timing.after());
        assert!(!step.is_critical);
        assert_eq!(step.timeout, Some(30));
    }
}
