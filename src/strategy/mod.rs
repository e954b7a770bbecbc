//! Strategy documents
//!
//! A strategy is the declarative description of one workflow run: metadata,
//! initial variables, runtime parameters, execution mode, error defaults,
//! checkpoint settings, the ordered steps, cleanup steps and pre/post
//! conditions. Documents are YAML (or JSON) and are validated on load.

pub mod condition;
pub mod error_handling;
pub mod loops;
pub mod step;
pub mod validation;

pub use condition::Condition;
pub use error_handling::{ActionSpec, BackoffStrategy, ErrorAction, ErrorHandling};
pub use loops::{ForEachConfig, ItemsSource, ParallelConfig, RepeatConfig};
pub use step::{CheckpointTiming, Step};

use crate::error::Result;
use error_handling::deserialize_error_handling;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// How top-level steps are scheduled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Declared order, one step at a time
    #[default]
    Sequential,
    /// Topological levels from `depends_on`; steps in a level run concurrently
    Dag,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Wall-clock limit for the whole run, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_checkpoint_directory")]
    pub directory: PathBuf,
}

fn default_checkpoint_directory() -> PathBuf {
    PathBuf::from("checkpoints")
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_checkpoint_directory(),
        }
    }
}

/// A validated strategy document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Strategy {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default = "default_version", deserialize_with = "deserialize_version")]
    pub version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Initial values of `variables`
    #[serde(default)]
    pub variables: Map<String, Value>,

    /// Runtime parameters; caller-supplied values override these
    #[serde(default)]
    pub parameters: Map<String, Value>,

    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Default error policy for steps without `on_error`
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_error_handling"
    )]
    pub error_handling: Option<ErrorHandling>,

    #[serde(default)]
    pub checkpointing: CheckpointConfig,

    pub steps: Vec<Step>,

    /// Cleanup steps; always run, failures are only logged
    #[serde(rename = "finally", default, skip_serializing_if = "Vec::is_empty")]
    pub finally_steps: Vec<Step>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_conditions: Vec<Condition>,

    /// Free-form requirements block, carried but not interpreted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Value>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Versions are often written unquoted (`version: 1.0`)
fn deserialize_version<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(version) => Ok(version),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "version must be a string or a number, found {other}"
        ))),
    }
}

impl Strategy {
    /// Parse and validate a YAML or JSON document
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let strategy: Strategy = serde_yaml::from_str(content)?;
        strategy.validate()?;
        debug!(
            "Loaded strategy '{}' v{} with {} steps",
            strategy.name,
            strategy.version,
            strategy.steps.len()
        );
        Ok(strategy)
    }

    /// Load, parse and validate a strategy file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        debug!("Read strategy document from {}", path.display());
        Self::from_yaml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate_strategy(self)
    }

    /// Look up a main step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Effective error policy for a step: its own, else the strategy
    /// default, else stop after one attempt
    pub fn error_policy_for(&self, step: &Step) -> ErrorHandling {
        step.on_error
            .clone()
            .or_else(|| self.error_handling.clone())
            .unwrap_or_else(ErrorHandling::stop_once)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DOCUMENT: &str = r#"
name: ensembl_mapping
description: Map protein identifiers
version: 2.1
tags: [proteins]
variables:
  threshold: 0.8
parameters:
  source: uniprot
execution:
  mode: dag
  timeout: 600
error_handling:
  action: retry
  max_attempts: 2
checkpointing:
  enabled: true
  directory: /tmp/mapflow
steps:
  - name: load
    action: {type: noop}
  - name: map
    action: {type: echo}
    depends_on: [load]
    on_error: skip
finally:
  - name: cleanup
    action: {type: noop}
pre_conditions:
  - "${parameters.source} != ''"
requirements:
  datasets: [uniprot]
"#;

    #[test]
    fn test_parse_full_document() {
        let strategy = Strategy::from_yaml_str(DOCUMENT).unwrap();
        assert_eq!(strategy.version, "2.1");
        assert_eq!(strategy.execution.mode, ExecutionMode::Dag);
        assert_eq!(strategy.execution.timeout, Some(600));
        assert!(strategy.checkpointing.enabled);
        assert_eq!(strategy.finally_steps.len(), 1);
        assert_eq!(strategy.pre_conditions.len(), 1);
        assert!(strategy.requirements.is_some());
    }

    #[test]
    fn test_error_policy_resolution() {
        let strategy = Strategy::from_yaml_str(DOCUMENT).unwrap();
        let load = strategy.step("load").unwrap();
        let map = strategy.step("map").unwrap();
        assert_eq!(strategy.error_policy_for(load).action, ErrorAction::Retry);
        assert_eq!(strategy.error_policy_for(map).action, ErrorAction::Skip);

        let bare = Strategy::from_yaml_str("name: s\nsteps:\n  - {name: a, action: {type: noop}}")
            .unwrap();
        assert_eq!(bare.error_policy_for(&bare.steps[0]), ErrorHandling::stop_once());
        assert_eq!(bare.version, "1.0");
        assert!(!bare.checkpointing.enabled);
    }

    #[test]
    fn test_json_documents_are_accepted() {
        let strategy = Strategy::from_yaml_str(
            r#"{"name": "s", "steps": [{"name": "a", "action": {"type": "noop"}}]}"#,
        )
        .unwrap();
        assert_eq!(strategy.steps[0].name, "a");
    }

    #[test]
    fn test_malformed_document_is_a_parse_error() {
        let err = Strategy::from_yaml_str("name: [unclosed").unwrap_err();
        assert!(matches!(err, crate::error::StrategyError::Parse(_)));
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DOCUMENT.as_bytes()).unwrap();
        let strategy = Strategy::from_file(file.path()).await.unwrap();
        assert_eq!(strategy.name, "ensembl_mapping");

        let missing = Strategy::from_file("/nonexistent/strategy.yaml").await;
        assert!(matches!(missing, Err(crate::error::StrategyError::Io(_))));
    }
}
