//! Action registry
//!
//! Steps name their work with a string key (`action.type`). The registry maps
//! those keys to [`Action`] implementations, registered once at startup.
//! Actions written against the older calling convention implement
//! [`LegacyAction`] and are adapted on registration.

use super::context::ExecutionContext;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Typed view of the execution context handed to actions
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionContext {
    pub step_name: String,
    pub initial_identifier: Option<Value>,
    pub current_identifier: Option<Value>,
    pub ontology_type: Option<String>,
    pub current_identifiers: Vec<Value>,
    pub datasets: Map<String, Value>,
    pub statistics: Map<String, Value>,
    pub variables: Map<String, Value>,
    pub parameters: Map<String, Value>,
}

impl ActionContext {
    /// Snapshot the parts of `context` an action may read
    pub fn from_execution(step_name: &str, context: &ExecutionContext) -> Self {
        let extra = |key: &str| context.extra.get(key).cloned();
        Self {
            step_name: step_name.to_string(),
            initial_identifier: extra("initial_identifier"),
            current_identifier: extra("current_identifier"),
            ontology_type: context
                .extra
                .get("ontology_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            current_identifiers: context.current_identifiers.clone(),
            datasets: context.datasets.clone(),
            statistics: context.statistics.clone(),
            variables: context.variables.clone(),
            parameters: context.parameters.clone(),
        }
    }
}

/// A unit of domain work invoked by a step
#[async_trait]
pub trait Action: Send + Sync {
    /// Run with fully resolved parameters
    async fn run(&self, params: &Map<String, Value>, context: &ActionContext) -> Result<Value>;
}

/// Older calling convention: identifiers, ontology type and endpoints are
/// passed positionally together with the whole context as a mapping
#[async_trait]
pub trait LegacyAction: Send + Sync {
    async fn execute(
        &self,
        current_identifiers: &[Value],
        current_ontology_type: Option<&str>,
        action_params: &Map<String, Value>,
        source_endpoint: Option<&str>,
        target_endpoint: Option<&str>,
        context: &Map<String, Value>,
    ) -> Result<Value>;
}

/// Adapts a [`LegacyAction`] to [`Action`]
struct LegacyAdapter<A>(A);

#[async_trait]
impl<A: LegacyAction> Action for LegacyAdapter<A> {
    async fn run(&self, params: &Map<String, Value>, context: &ActionContext) -> Result<Value> {
        let endpoint = |key: &str| params.get(key).and_then(Value::as_str);
        let mapping = match serde_json::to_value(context)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        self.0
            .execute(
                &context.current_identifiers,
                context.ontology_type.as_deref(),
                params,
                endpoint("source_endpoint"),
                endpoint("target_endpoint"),
                &mapping,
            )
            .await
    }
}

/// Wraps a synchronous closure as an [`Action`]
struct FnAction<F>(F);

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(&Map<String, Value>, &ActionContext) -> Result<Value> + Send + Sync,
{
    async fn run(&self, params: &Map<String, Value>, context: &ActionContext) -> Result<Value> {
        (self.0)(params, context)
    }
}

/// Does nothing and returns null
pub struct NoopAction;

#[async_trait]
impl Action for NoopAction {
    async fn run(&self, _params: &Map<String, Value>, _context: &ActionContext) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// Returns its resolved parameters
pub struct EchoAction;

#[async_trait]
impl Action for EchoAction {
    async fn run(&self, params: &Map<String, Value>, _context: &ActionContext) -> Result<Value> {
        Ok(Value::Object(params.clone()))
    }
}

/// Sleeps for `seconds` (fractional allowed)
pub struct SleepAction;

#[async_trait]
impl Action for SleepAction {
    async fn run(&self, params: &Map<String, Value>, _context: &ActionContext) -> Result<Value> {
        let seconds = match params.get("seconds") {
            None => 0.0,
            Some(value) => value
                .as_f64()
                .ok_or_else(|| anyhow!("sleep: 'seconds' must be a number, got {value}"))?,
        };
        let duration = Duration::try_from_secs_f64(seconds)
            .map_err(|e| anyhow!("sleep: invalid 'seconds' value {seconds}: {e}"))?;
        tokio::time::sleep(duration).await;
        Ok(json!({ "slept": seconds }))
    }
}

/// String-keyed action lookup
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `noop`, `echo` and `sleep`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("noop", NoopAction);
        registry.register("echo", EchoAction);
        registry.register("sleep", SleepAction);
        registry
    }

    /// Register an action; a later registration under the same key wins
    pub fn register(&mut self, action_type: impl Into<String>, action: impl Action + 'static) {
        let action_type = action_type.into();
        debug!("Registering action '{}'", action_type);
        self.actions.insert(action_type, Arc::new(action));
    }

    pub fn register_legacy(
        &mut self,
        action_type: impl Into<String>,
        action: impl LegacyAction + 'static,
    ) {
        self.register(action_type, LegacyAdapter(action));
    }

    /// Register a synchronous closure
    pub fn register_fn<F>(&mut self, action_type: impl Into<String>, f: F)
    where
        F: Fn(&Map<String, Value>, &ActionContext) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(action_type, FnAction(f));
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(action_type).cloned()
    }

    pub fn contains(&self, action_type: &str) -> bool {
        self.actions.contains_key(action_type)
    }

    /// Registered keys, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
