//! Structural and semantic validation of strategy documents
//!
//! Validation collects every problem it finds so a single load reports all
//! of them. A strategy that fails validation never starts executing.

use super::{ExecutionMode, Step, Strategy};
use crate::error::{Result, StrategyError};
use crate::expression::ExpressionEvaluator;
use crate::strategy::loops::{ItemsSource, MAX_REPEAT_ITERATIONS};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::warn;

/// Maximum nesting of `all`/`any` conditions
pub const MAX_CONDITION_DEPTH: usize = 64;

static STEP_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*$").expect("Valid regex pattern"));

/// Validate a strategy, reporting every violation at once
pub fn validate_strategy(strategy: &Strategy) -> Result<()> {
    let errors = collect_errors(strategy);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(StrategyError::Validation(errors.join("; ")))
    }
}

fn collect_errors(strategy: &Strategy) -> Vec<String> {
    let mut errors = Vec::new();
    let evaluator = ExpressionEvaluator::new();

    if strategy.name.trim().is_empty() {
        errors.push("strategy name cannot be empty".to_string());
    }
    if strategy.steps.is_empty() {
        errors.push("strategy must define at least one step".to_string());
    }

    let mut seen = HashSet::new();
    for step in strategy.steps.iter().chain(&strategy.finally_steps) {
        if !seen.insert(step.name.as_str()) {
            errors.push(format!("duplicate step name '{}'", step.name));
        }
        validate_step(step, &evaluator, &mut errors);
    }

    let declared: HashSet<&str> = strategy.steps.iter().map(|s| s.name.as_str()).collect();
    for step in &strategy.steps {
        if step.depends_on.is_empty() {
            continue;
        }
        match strategy.execution.mode {
            ExecutionMode::Dag => {
                for dependency in &step.depends_on {
                    if dependency == &step.name {
                        errors.push(format!("step '{}' cannot depend on itself", step.name));
                    } else if !declared.contains(dependency.as_str()) {
                        errors.push(format!(
                            "step '{}' depends on unknown step '{dependency}'",
                            step.name
                        ));
                    }
                }
            }
            ExecutionMode::Sequential => warn!(
                "Step '{}' declares depends_on, which is ignored in sequential mode",
                step.name
            ),
        }
    }

    if let Some(policy) = &strategy.error_handling {
        validate_policy("error_handling", policy, &mut errors);
    }

    for (index, condition) in strategy
        .pre_conditions
        .iter()
        .chain(&strategy.post_conditions)
        .enumerate()
    {
        let label = format!("strategy condition #{}", index + 1);
        validate_condition(&label, condition, &evaluator, &mut errors);
    }

    if strategy.execution.timeout == Some(0) {
        errors.push("execution.timeout must be positive".to_string());
    }

    errors
}

fn validate_step(step: &Step, evaluator: &ExpressionEvaluator, errors: &mut Vec<String>) {
    let name = &step.name;
    if !STEP_NAME.is_match(name) {
        errors.push(format!(
            "invalid step name '{name}': use letters, digits, '_' or '-', starting with a letter or '_'"
        ));
    }
    if step.action.action_type.trim().is_empty() {
        errors.push(format!("step '{name}' has an empty action type"));
    }

    if step.for_each.is_some() && step.repeat.is_some() {
        errors.push(format!("step '{name}' cannot combine for_each and repeat"));
    }
    if step.parallel.as_ref().is_some_and(|p| p.enabled) && step.for_each.is_none() {
        errors.push(format!("step '{name}' enables parallel without for_each"));
    }
    if let Some(parallel) = &step.parallel {
        if parallel.max_workers == 0 {
            errors.push(format!("step '{name}': parallel.max_workers must be at least 1"));
        }
    }

    if let Some(for_each) = &step.for_each {
        if for_each.variable.trim().is_empty() {
            errors.push(format!("step '{name}': for_each.as cannot be empty"));
        }
        if let ItemsSource::Expression(expression) = &for_each.items {
            if expression.contains("${") {
                check_expression(name, "for_each.items", expression, evaluator, errors);
            }
        }
    }

    if let Some(repeat) = &step.repeat {
        match repeat.max_iterations {
            Some(n) if !(1..=MAX_REPEAT_ITERATIONS).contains(&n) => errors.push(format!(
                "step '{name}': repeat.max_iterations must be between 1 and {MAX_REPEAT_ITERATIONS}"
            )),
            None if repeat.while_condition.is_none() => errors.push(format!(
                "step '{name}': repeat needs max_iterations or while_condition"
            )),
            _ => {}
        }
        if let Some(expression) = &repeat.while_condition {
            check_expression(name, "repeat.while_condition", expression, evaluator, errors);
        }
    }

    if let Some(policy) = &step.on_error {
        validate_policy(&format!("step '{name}' on_error"), policy, errors);
    }
    if let Some(condition) = &step.condition {
        validate_condition(&format!("step '{name}' condition"), condition, evaluator, errors);
    }
    if step.timeout == Some(0) {
        errors.push(format!("step '{name}': timeout must be positive"));
    }
}

fn validate_policy(
    label: &str,
    policy: &super::ErrorHandling,
    errors: &mut Vec<String>,
) {
    if !(1..=10).contains(&policy.max_attempts) {
        errors.push(format!("{label}: max_attempts must be between 1 and 10"));
    }
    if !(1..=300).contains(&policy.delay) {
        errors.push(format!("{label}: delay must be between 1 and 300 seconds"));
    }
    if let Some(assignment) = &policy.set_variable {
        if policy.variable_assignment().is_none() {
            errors.push(format!(
                "{label}: set_variable '{assignment}' must have the form name=value"
            ));
        }
    }
    if let Some(fallback) = &policy.fallback {
        if fallback.action_type.trim().is_empty() {
            errors.push(format!("{label}: fallback has an empty action type"));
        }
    }
}

fn validate_condition(
    label: &str,
    condition: &super::Condition,
    evaluator: &ExpressionEvaluator,
    errors: &mut Vec<String>,
) {
    if condition.depth() > MAX_CONDITION_DEPTH {
        errors.push(format!(
            "{label} is nested deeper than {MAX_CONDITION_DEPTH} levels"
        ));
        return;
    }
    for expression in condition.expressions() {
        check_expression(label, "expression", expression, evaluator, errors);
    }
}

/// Expressions must at least parse and pass the safety checks at load time
fn check_expression(
    owner: &str,
    field: &str,
    expression: &str,
    evaluator: &ExpressionEvaluator,
    errors: &mut Vec<String>,
) {
    if let Err(e) = evaluator.compile(expression) {
        errors.push(format!("{owner}: invalid {field}: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Condition;

    fn load(yaml: &str) -> Result<Strategy> {
        Strategy::from_yaml_str(yaml)
    }

    fn message(result: Result<Strategy>) -> String {
        match result {
            Err(StrategyError::Validation(message)) => message,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_minimal_strategy_is_valid() {
        assert!(load("name: s\nsteps:\n  - {name: a, action: {type: noop}}").is_ok());
    }

    #[test]
    fn test_duplicate_names_across_finally() {
        let msg = message(load(
            "name: s\nsteps:\n  - {name: a, action: {type: noop}}\nfinally:\n  - {name: a, action: {type: noop}}",
        ));
        assert!(msg.contains("duplicate step name 'a'"));
    }

    #[test]
    fn test_unknown_dag_dependency() {
        let msg = message(load(
            "name: s\nexecution: {mode: dag}\nsteps:\n  - {name: a, action: {type: noop}, depends_on: [ghost]}",
        ));
        assert!(msg.contains("unknown step 'ghost'"));
    }

    #[test]
    fn test_sequential_mode_ignores_dependencies() {
        assert!(load(
            "name: s\nsteps:\n  - {name: a, action: {type: noop}, depends_on: [ghost]}"
        )
        .is_ok());
    }

    #[test]
    fn test_loop_conflicts_and_ranges() {
        let msg = message(load(
            r#"
name: s
steps:
  - name: both
    action: {type: noop}
    for_each: {items: [1]}
    repeat: {max_iterations: 2}
  - name: too_many
    action: {type: noop}
    repeat: {max_iterations: 5000}
  - name: lonely_parallel
    action: {type: noop}
    parallel: {max_workers: 2}
"#,
        ));
        assert!(msg.contains("cannot combine for_each and repeat"));
        assert!(msg.contains("between 1 and 1000"));
        assert!(msg.contains("parallel without for_each"));
    }

    #[test]
    fn test_policy_ranges() {
        let msg = message(load(
            "name: s\nsteps:\n  - {name: a, action: {type: noop}, on_error: {action: retry, max_attempts: 11, delay: 0}}",
        ));
        assert!(msg.contains("max_attempts"));
        assert!(msg.contains("delay"));
    }

    #[test]
    fn test_invalid_step_name() {
        let msg = message(load("name: s\nsteps:\n  - {name: '9 lives', action: {type: noop}}"));
        assert!(msg.contains("invalid step name"));
    }

    #[test]
    fn test_unsafe_condition_is_rejected_at_load() {
        let msg = message(load(
            "name: s\nsteps:\n  - {name: a, action: {type: noop}, condition: \"__import__('os')\"}",
        ));
        assert!(msg.contains("condition"));
    }

    #[test]
    fn test_condition_depth_limit() {
        let mut condition = Condition::Expression("${x}".to_string());
        for _ in 0..MAX_CONDITION_DEPTH {
            condition = Condition::All(vec![condition]);
        }
        let mut strategy =
            load("name: s\nsteps:\n  - {name: a, action: {type: noop}}").unwrap();
        strategy.steps[0].condition = Some(condition);
        match validate_strategy(&strategy) {
            Err(StrategyError::Validation(msg)) => assert!(msg.contains("nested deeper")),
            other => panic!("expected a validation error, got {other:?}"),
        }
    }
}
