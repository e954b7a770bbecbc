//! Execution state for one strategy run
//!
//! The context is owned by a single executor for the lifetime of a run. It is
//! the scope every expression is evaluated against, and every step writes
//! its outcome into it.
//!
//! Concurrent work (parallel `for_each` iterations and DAG levels) never
//! shares a context. Each task runs on a [`ExecutionContext::fork`], whose
//! mutations are journaled; the parent replays the journals with
//! [`ExecutionContext::merge`] in a deterministic order once all tasks finish.

use crate::expression::Scope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Outcome of a successful step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    /// Value returned by the action (a list of per-item values for loops)
    pub output: Value,
    pub attempts: u32,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn new(output: Value, attempts: u32, duration_ms: u64) -> Self {
        Self {
            output,
            attempts,
            duration_ms,
            completed_at: Utc::now(),
        }
    }
}

/// Run metadata, exposed to expressions as `execution`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ExecutionMetadata {
    pub strategy_name: String,
    pub strategy_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub executed_steps: Vec<String>,
    #[serde(default)]
    pub failed_steps: Vec<String>,
    #[serde(default)]
    pub skipped_steps: Vec<String>,
    /// Set only when the run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A single journaled mutation, replayed by [`ExecutionContext::merge`]
#[derive(Debug, Clone, PartialEq)]
enum ContextUpdate {
    StepResult(String, StepResult),
    Metrics(String, Value),
    Variable(String, Value),
    Executed(String),
    Failed(String),
    Skipped(String),
    Datasets(Map<String, Value>),
    Statistics(Map<String, Value>),
    Identifiers(Vec<Value>),
}

/// Mutable state of one strategy run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionContext {
    /// Step name to result; `${steps.<name>}` resolves to the output
    #[serde(default)]
    pub steps: BTreeMap<String, StepResult>,
    #[serde(default)]
    pub datasets: Map<String, Value>,
    /// Step name to the `metrics` map its action reported
    #[serde(default)]
    pub metrics: Map<String, Value>,
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub statistics: Map<String, Value>,
    #[serde(default)]
    pub current_identifiers: Vec<Value>,
    #[serde(default)]
    pub execution: ExecutionMetadata,
    /// Caller-supplied keys outside the fixed set
    /// (`initial_identifier`, `ontology_type`, ...)
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,

    /// Environment snapshot taken when the run starts
    #[serde(skip)]
    env: Map<String, Value>,
    /// Loop-scoped names: `foreach`, `repeat` and the bound item variable
    #[serde(skip)]
    bindings: Map<String, Value>,
    #[serde(skip)]
    journal: Option<Vec<ContextUpdate>>,
}

/// Keys with a fixed meaning in an initial context
const RESERVED_KEYS: &[&str] = &[
    "steps",
    "datasets",
    "metrics",
    "variables",
    "parameters",
    "statistics",
    "current_identifiers",
    "execution",
    "env",
];

impl ExecutionContext {
    /// Empty context with the process environment captured
    pub fn new() -> Self {
        let mut context = Self::default();
        context.capture_env();
        context
    }

    /// Snapshot the process environment; later changes are not observed
    pub fn capture_env(&mut self) {
        self.env = std::env::vars()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
    }

    /// Replace the environment snapshot
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = vars
            .into_iter()
            .map(|(key, value)| (key.into(), Value::String(value.into())))
            .collect();
        self
    }

    /// Merge a caller-supplied initial mapping.
    ///
    /// Known sections merge key by key (`current_identifiers` replaces),
    /// everything else lands in [`ExecutionContext::extra`].
    pub fn merge_initial(&mut self, initial: Map<String, Value>) {
        for (key, value) in initial {
            match (key.as_str(), value) {
                ("variables", Value::Object(map)) => self.variables.extend(map),
                ("parameters", Value::Object(map)) => self.parameters.extend(map),
                ("datasets", Value::Object(map)) => self.datasets.extend(map),
                ("statistics", Value::Object(map)) => self.statistics.extend(map),
                ("metrics", Value::Object(map)) => self.metrics.extend(map),
                ("current_identifiers", Value::Array(items)) => self.current_identifiers = items,
                (reserved, value) if RESERVED_KEYS.contains(&reserved) => {
                    tracing::warn!(
                        "Ignoring initial context key '{}' with unexpected shape: {}",
                        reserved,
                        value
                    );
                }
                (_, value) => {
                    self.extra.insert(key, value);
                }
            }
        }
    }

    /// Record a successful step
    pub fn record_step_result(&mut self, step: &str, result: StepResult) {
        self.journal(|| ContextUpdate::StepResult(step.to_string(), result.clone()));
        self.steps.insert(step.to_string(), result);
    }

    pub fn record_metrics(&mut self, step: &str, metrics: Value) {
        self.journal(|| ContextUpdate::Metrics(step.to_string(), metrics.clone()));
        self.metrics.insert(step.to_string(), metrics);
    }

    pub fn set_variable(&mut self, name: &str, value: Value) {
        self.journal(|| ContextUpdate::Variable(name.to_string(), value.clone()));
        self.variables.insert(name.to_string(), value);
    }

    pub fn merge_datasets(&mut self, datasets: Map<String, Value>) {
        self.journal(|| ContextUpdate::Datasets(datasets.clone()));
        self.datasets.extend(datasets);
    }

    pub fn merge_statistics(&mut self, statistics: Map<String, Value>) {
        self.journal(|| ContextUpdate::Statistics(statistics.clone()));
        self.statistics.extend(statistics);
    }

    pub fn set_current_identifiers(&mut self, identifiers: Vec<Value>) {
        self.journal(|| ContextUpdate::Identifiers(identifiers.clone()));
        self.current_identifiers = identifiers;
    }

    // A step sits in exactly one classification list; the latest mark wins.

    pub fn mark_executed(&mut self, step: &str) {
        self.journal(|| ContextUpdate::Executed(step.to_string()));
        let execution = &mut self.execution;
        classify(
            &mut execution.executed_steps,
            [&mut execution.failed_steps, &mut execution.skipped_steps],
            step,
        );
    }

    pub fn mark_failed(&mut self, step: &str) {
        self.journal(|| ContextUpdate::Failed(step.to_string()));
        let execution = &mut self.execution;
        classify(
            &mut execution.failed_steps,
            [&mut execution.executed_steps, &mut execution.skipped_steps],
            step,
        );
    }

    pub fn mark_skipped(&mut self, step: &str) {
        self.journal(|| ContextUpdate::Skipped(step.to_string()));
        let execution = &mut self.execution;
        classify(
            &mut execution.skipped_steps,
            [&mut execution.executed_steps, &mut execution.failed_steps],
            step,
        );
    }

    fn journal(&mut self, update: impl FnOnce() -> ContextUpdate) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(update());
        }
    }

    /// Independent copy for a concurrent task; its mutations are journaled
    pub fn fork(&self) -> Self {
        let mut forked = self.clone();
        forked.journal = Some(Vec::new());
        forked
    }

    /// Replay a fork's mutations onto this context
    pub fn merge(&mut self, fork: ExecutionContext) {
        for update in fork.journal.unwrap_or_default() {
            match update {
                ContextUpdate::StepResult(step, result) => self.record_step_result(&step, result),
                ContextUpdate::Metrics(step, metrics) => self.record_metrics(&step, metrics),
                ContextUpdate::Variable(name, value) => self.set_variable(&name, value),
                ContextUpdate::Executed(step) => self.mark_executed(&step),
                ContextUpdate::Failed(step) => self.mark_failed(&step),
                ContextUpdate::Skipped(step) => self.mark_skipped(&step),
                ContextUpdate::Datasets(datasets) => self.merge_datasets(datasets),
                ContextUpdate::Statistics(statistics) => self.merge_statistics(statistics),
                ContextUpdate::Identifiers(identifiers) => self.set_current_identifiers(identifiers),
            }
        }
    }

    /// Bind a loop-scoped name, shadowing any variable of the same name.
    ///
    /// Returns the shadowed variable so [`ExecutionContext::unbind`] can
    /// restore it. Bindings are never journaled.
    pub fn bind(&mut self, name: &str, value: Value, as_variable: bool) -> Option<Value> {
        self.bindings.insert(name.to_string(), value.clone());
        if as_variable {
            self.variables.insert(name.to_string(), value)
        } else {
            None
        }
    }

    /// Remove a loop-scoped name, restoring a shadowed variable if any
    pub fn unbind(&mut self, name: &str, as_variable: bool, shadowed: Option<Value>) {
        self.bindings.remove(name);
        if as_variable {
            match shadowed {
                Some(previous) => {
                    self.variables.insert(name.to_string(), previous);
                }
                None => {
                    self.variables.remove(name);
                }
            }
        }
    }

    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// `${steps}` view: step name to output
    pub fn step_outputs(&self) -> Map<String, Value> {
        self.steps
            .iter()
            .map(|(name, result)| (name.clone(), result.output.clone()))
            .collect()
    }

    /// The whole context as one mapping, as passed to legacy actions
    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        root.insert("steps".into(), Value::Object(self.step_outputs()));
        root.insert("datasets".into(), Value::Object(self.datasets.clone()));
        root.insert("metrics".into(), Value::Object(self.metrics.clone()));
        root.insert("variables".into(), Value::Object(self.variables.clone()));
        root.insert("parameters".into(), Value::Object(self.parameters.clone()));
        root.insert("statistics".into(), Value::Object(self.statistics.clone()));
        root.insert(
            "current_identifiers".into(),
            Value::Array(self.current_identifiers.clone()),
        );
        root.insert(
            "execution".into(),
            serde_json::to_value(&self.execution).unwrap_or(Value::Null),
        );
        for (key, value) in &self.extra {
            root.entry(key.clone()).or_insert_with(|| value.clone());
        }
        for (key, value) in &self.bindings {
            root.insert(key.clone(), value.clone());
        }
        Value::Object(root)
    }

    /// Step name lists as they stand: executed, failed, skipped
    pub fn classification(&self) -> (&[String], &[String], &[String]) {
        (
            &self.execution.executed_steps,
            &self.execution.failed_steps,
            &self.execution.skipped_steps,
        )
    }
}

fn classify(target: &mut Vec<String>, others: [&mut Vec<String>; 2], step: &str) {
    for list in others {
        list.retain(|existing| existing != step);
    }
    if !target.iter().any(|existing| existing == step) {
        target.push(step.to_string());
    }
}

fn map_value(map: &Map<String, Value>) -> Cow<'static, Value> {
    Cow::Owned(Value::Object(map.clone()))
}

impl Scope for ExecutionContext {
    fn root(&self, name: &str) -> Option<Cow<'_, Value>> {
        if let Some(bound) = self.bindings.get(name) {
            return Some(Cow::Borrowed(bound));
        }
        match name {
            "steps" => Some(Cow::Owned(Value::Object(self.step_outputs()))),
            "datasets" => Some(map_value(&self.datasets)),
            "metrics" => Some(map_value(&self.metrics)),
            "variables" => Some(map_value(&self.variables)),
            "parameters" => Some(map_value(&self.parameters)),
            "statistics" => Some(map_value(&self.statistics)),
            "current_identifiers" => Some(Cow::Owned(Value::Array(
                self.current_identifiers.clone(),
            ))),
            "execution" => serde_json::to_value(&self.execution).ok().map(Cow::Owned),
            "env" => Some(map_value(&self.env)),
            other => self.extra.get(other).map(Cow::Borrowed),
        }
    }

    fn member(&self, root: &str, key: &str) -> Option<Cow<'_, Value>> {
        if let Some(bound) = self.bindings.get(root) {
            return bound.get(key).map(Cow::Borrowed);
        }
        let section = match root {
            "steps" => return self.steps.get(key).map(|result| Cow::Borrowed(&result.output)),
            "datasets" => &self.datasets,
            "metrics" => &self.metrics,
            "variables" => &self.variables,
            "parameters" => &self.parameters,
            "statistics" => &self.statistics,
            "env" => &self.env,
            other => {
                return match self.root(other)? {
                    Cow::Borrowed(value) => value.get(key).map(Cow::Borrowed),
                    Cow::Owned(value) => value.get(key).cloned().map(Cow::Owned),
                }
            }
        };
        section.get(key).map(Cow::Borrowed)
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod context_tests;
