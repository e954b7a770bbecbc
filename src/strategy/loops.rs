//! Loop and parallelism configuration for steps

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on `repeat.max_iterations`, also its default
pub const MAX_REPEAT_ITERATIONS: u32 = 1000;

/// Where `for_each` gets its items
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ItemsSource {
    /// Literal list in the document
    List(Vec<Value>),
    /// `${...}` expression expected to evaluate to a list; any other string
    /// is a single item
    Expression(String),
}

/// Iterate a step over a list of items
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForEachConfig {
    pub items: ItemsSource,

    /// Name the current item is bound to
    #[serde(rename = "as", default = "default_item_variable")]
    pub variable: String,
}

fn default_item_variable() -> String {
    "item".to_string()
}

/// Re-run a step while a condition holds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RepeatConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,

    /// Checked before every iteration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub while_condition: Option<String>,
}

impl RepeatConfig {
    pub fn iteration_limit(&self) -> u32 {
        self.max_iterations.unwrap_or(MAX_REPEAT_ITERATIONS)
    }
}

/// Run `for_each` iterations concurrently
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParallelConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Fail the step on the first failed iteration instead of logging all
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_max_workers() -> usize {
    4
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_workers: default_max_workers(),
            fail_fast: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_items_source_shapes() {
        let literal: ForEachConfig = serde_yaml::from_str("items: [1, 2, 3]").unwrap();
        assert_eq!(literal.items, ItemsSource::List(vec![json!(1), json!(2), json!(3)]));
        assert_eq!(literal.variable, "item");

        let expr: ForEachConfig =
            serde_yaml::from_str("{items: '${variables.ids}', as: id}").unwrap();
        assert_eq!(expr.items, ItemsSource::Expression("${variables.ids}".to_string()));
        assert_eq!(expr.variable, "id");
    }

    #[test]
    fn test_repeat_defaults() {
        let repeat: RepeatConfig = serde_yaml::from_str("while_condition: '${x} < 3'").unwrap();
        assert_eq!(repeat.iteration_limit(), MAX_REPEAT_ITERATIONS);
        let parallel: ParallelConfig = serde_yaml::from_str("{}").unwrap();
        assert!(parallel.enabled);
        assert_eq!(parallel.max_workers, 4);
    }
}
