//! `for_each` and `repeat` execution
//!
//! Every iteration goes through the step's error policy on its own. The step
//! output is the list of per-iteration outputs; an iteration that ended in
//! `skip` or `continue` contributes `null`.

use super::{ExecutionContext, StepOutcome, StrategyExecutor};
use crate::error::{Result, StrategyError};
use crate::strategy::{ForEachConfig, ItemsSource, ParallelConfig, RepeatConfig, Step};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Loop-scoped names bound around one `for_each` iteration
struct IterationBinding<'a> {
    variable: &'a str,
    shadowed: Option<Value>,
}

impl<'a> IterationBinding<'a> {
    fn bind(
        context: &mut ExecutionContext,
        variable: &'a str,
        index: usize,
        item: Value,
        total: usize,
    ) -> Self {
        context.bind(
            "foreach",
            json!({ "index": index, "item": item.clone(), "total": total }),
            false,
        );
        let shadowed = context.bind(variable, item, true);
        Self { variable, shadowed }
    }

    fn unbind(self, context: &mut ExecutionContext) {
        context.unbind(self.variable, true, self.shadowed);
        context.unbind("foreach", false, None);
    }
}

/// Running total of a loop's iterations
#[derive(Default)]
struct LoopResults {
    outputs: Vec<Value>,
    attempts: u32,
}

impl LoopResults {
    fn push(&mut self, step: &str, index: usize, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Completed { output, attempts } => {
                self.outputs.push(output);
                self.attempts += attempts;
            }
            StepOutcome::Skipped | StepOutcome::Failed => {
                debug!("Iteration {} of step '{}' produced no result", index, step);
                self.outputs.push(Value::Null);
            }
        }
    }

    fn into_outcome(self) -> StepOutcome {
        StepOutcome::Completed {
            output: Value::Array(self.outputs),
            attempts: self.attempts,
        }
    }
}

impl StrategyExecutor {
    /// Items of a `for_each`: a literal list, a `${...}` expression yielding
    /// a list, or a bare string taken as the single item
    pub(crate) fn resolve_items(
        &self,
        config: &ForEachConfig,
        context: &ExecutionContext,
    ) -> Result<Vec<Value>> {
        let evaluator = self.evaluator.evaluator();
        match &config.items {
            ItemsSource::List(items) => Ok(items
                .iter()
                .map(|item| evaluator.resolve_value(item, context))
                .collect()),
            ItemsSource::Expression(expression) if expression.contains("${") => {
                match evaluator.evaluate(expression, context)? {
                    Value::Array(items) => Ok(items),
                    Value::Null => {
                        warn!("for_each items '{}' resolved to null", expression);
                        Ok(Vec::new())
                    }
                    other => Ok(vec![other]),
                }
            }
            ItemsSource::Expression(text) => Ok(vec![Value::String(text.clone())]),
        }
    }

    pub(crate) async fn run_for_each(
        &self,
        step: &Step,
        context: &mut ExecutionContext,
    ) -> Result<StepOutcome> {
        let Some(config) = &step.for_each else {
            return self.execute_with_policy(step, context).await;
        };
        let items = self.resolve_items(config, context)?;
        info!("Step '{}' iterating over {} items", step.name, items.len());

        if let Some(parallel) = step.parallel.as_ref().filter(|p| p.enabled) {
            return self
                .run_parallel_for_each(step, config, parallel, items, context)
                .await;
        }

        let total = items.len();
        let mut results = LoopResults::default();
        for (index, item) in items.into_iter().enumerate() {
            let binding = IterationBinding::bind(context, &config.variable, index, item, total);
            let outcome = self.execute_with_policy(step, context).await;
            binding.unbind(context);
            results.push(&step.name, index, outcome?);
        }
        Ok(results.into_outcome())
    }

    /// Iterations run on forks of the context, at most `max_workers` at a
    /// time, and are merged back in item order
    async fn run_parallel_for_each(
        &self,
        step: &Step,
        config: &ForEachConfig,
        parallel: &ParallelConfig,
        items: Vec<Value>,
        context: &mut ExecutionContext,
    ) -> Result<StepOutcome> {
        let total = items.len();
        let semaphore = Arc::new(Semaphore::new(parallel.max_workers.max(1)));
        debug!(
            "Step '{}' running {} iterations with {} workers",
            step.name, total, parallel.max_workers
        );

        let forks: Vec<(usize, Value, ExecutionContext)> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| (index, item, context.fork()))
            .collect();

        let tasks = forks.into_iter().map(|(index, item, mut fork)| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let outcome = match semaphore.acquire().await {
                    Ok(_permit) => {
                        // Forks are discarded after the merge, so no unbind
                        let _binding =
                            IterationBinding::bind(&mut fork, &config.variable, index, item, total);
                        self.execute_with_policy(step, &mut fork).await
                    }
                    Err(e) => Err(StrategyError::StepExecution {
                        step: step.name.clone(),
                        message: format!("worker pool closed: {e}"),
                        source: None,
                    }),
                };
                (fork, outcome)
            }
        });
        let finished = join_all(tasks).await;

        let mut results = LoopResults::default();
        let mut first_error = None;
        for (index, (fork, outcome)) in finished.into_iter().enumerate() {
            context.merge(fork);
            match outcome {
                Ok(outcome) => results.push(&step.name, index, outcome),
                Err(e) if parallel.fail_fast => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Iteration {} of step '{}' failed: {}", index, step.name, e);
                    results.outputs.push(Value::Null);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results.into_outcome()),
        }
    }

    /// Re-run the step while `while_condition` holds, up to the iteration
    /// limit; the condition is checked before each iteration
    pub(crate) async fn run_repeat(
        &self,
        step: &Step,
        context: &mut ExecutionContext,
    ) -> Result<StepOutcome> {
        let Some(config) = &step.repeat else {
            return self.execute_with_policy(step, context).await;
        };
        let outcome = self.repeat_iterations(step, config, context).await;
        context.unbind("repeat", false, None);
        outcome
    }

    async fn repeat_iterations(
        &self,
        step: &Step,
        config: &RepeatConfig,
        context: &mut ExecutionContext,
    ) -> Result<StepOutcome> {
        let limit = config.iteration_limit();
        let mut results = LoopResults::default();

        for iteration in 0..limit {
            context.bind(
                "repeat",
                json!({ "iteration": iteration, "max_iterations": limit }),
                false,
            );
            if let Some(condition) = &config.while_condition {
                if !self.evaluator.evaluator().evaluate_bool(condition, context)? {
                    debug!(
                        "Step '{}' stopped repeating after {} iterations",
                        step.name, iteration
                    );
                    break;
                }
            }
            let outcome = self.execute_with_policy(step, context).await?;
            results.push(&step.name, iteration as usize, outcome);
        }
        Ok(results.into_outcome())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ActionRegistry;
    use crate::strategy::Strategy;

    fn executor() -> StrategyExecutor {
        let strategy = Strategy::from_yaml_str(
            "name: items\nvariables:\n  ids: [a, b]\nsteps:\n  - {name: s, action: {type: noop}}",
        )
        .unwrap();
        StrategyExecutor::new(strategy, ActionRegistry::with_builtins())
    }

    fn config(items: ItemsSource) -> ForEachConfig {
        ForEachConfig {
            items,
            variable: "item".to_string(),
        }
    }

    #[test]
    fn test_resolve_items_sources() {
        let executor = executor();
        let mut context = ExecutionContext::default();
        context.variables.insert("ids".into(), json!(["a", "b"]));
        context.variables.insert("one".into(), json!(7));

        let literal = config(ItemsSource::List(vec![json!(1), json!("${variables.one}")]));
        assert_eq!(
            executor.resolve_items(&literal, &context).unwrap(),
            vec![json!(1), json!(7)]
        );

        let expression = config(ItemsSource::Expression("${variables.ids}".into()));
        assert_eq!(
            executor.resolve_items(&expression, &context).unwrap(),
            vec![json!("a"), json!("b")]
        );

        let bare = config(ItemsSource::Expression("just-one".into()));
        assert_eq!(
            executor.resolve_items(&bare, &context).unwrap(),
            vec![json!("just-one")]
        );

        let missing = config(ItemsSource::Expression("${variables.absent}".into()));
        assert!(executor.resolve_items(&missing, &context).unwrap().is_empty());
    }

    #[test]
    fn test_iteration_binding_restores_shadowed_variable() {
        let mut context = ExecutionContext::default();
        context.variables.insert("item".into(), json!("outer"));
        let binding = IterationBinding::bind(&mut context, "item", 1, json!(5), 3);
        assert_eq!(context.variables["item"], json!(5));
        assert_eq!(context.binding("foreach").unwrap()["total"], json!(3));

        binding.unbind(&mut context);
        assert_eq!(context.variables["item"], json!("outer"));
        assert!(context.binding("foreach").is_none());
    }
}
