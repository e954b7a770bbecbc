//! Strategy execution
//!
//! [`StrategyExecutor`] drives one strategy run: it seeds the
//! [`ExecutionContext`], checks pre-conditions, schedules steps sequentially
//! or by dependency level, applies each step's error policy, and always runs
//! the `finally` steps before handing the context back.

pub mod actions;
pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod loops;
pub mod retry;

pub use actions::{Action, ActionContext, ActionRegistry, LegacyAction};
pub use checkpoint::{Checkpoint, CheckpointManager};
pub use context::{ExecutionContext, ExecutionMetadata, StepResult};
pub use dag::dependency_levels;

use crate::error::{ExecutionFailure, Result, StrategyError};
use crate::expression::parser::parse_constant;
use crate::expression::value::display;
use crate::expression::ConditionEvaluator;
use crate::strategy::{ActionSpec, ErrorAction, ErrorHandling, ExecutionMode, Step, Strategy};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How a step (or one loop iteration) ended after its error policy ran
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed { output: Value, attempts: u32 },
    /// Policy `skip`
    Skipped,
    /// Policy `continue`: failed, but the run proceeds
    Failed,
}

/// Runs a [`Strategy`] against an [`ActionRegistry`]
pub struct StrategyExecutor {
    strategy: Strategy,
    registry: ActionRegistry,
    evaluator: ConditionEvaluator,
    checkpoints: CheckpointManager,
    dry_run: bool,
    env: Option<Vec<(String, String)>>,
    context: ExecutionContext,
    /// Set by [`StrategyExecutor::restore_checkpoint`] until the next run
    resume_pending: bool,
    resuming: bool,
}

impl StrategyExecutor {
    pub fn new(strategy: Strategy, registry: ActionRegistry) -> Self {
        let checkpoints = CheckpointManager::new(
            strategy.checkpointing.directory.clone(),
            strategy.checkpointing.enabled,
        );
        Self {
            strategy,
            registry,
            evaluator: ConditionEvaluator::default(),
            checkpoints,
            dry_run: false,
            env: None,
            context: ExecutionContext::default(),
            resume_pending: false,
            resuming: false,
        }
    }

    /// Resolve parameters but never invoke actions
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Write checkpoints under `directory` instead of the configured one
    pub fn with_checkpoint_dir(mut self, directory: impl Into<PathBuf>) -> Self {
        self.checkpoints =
            CheckpointManager::new(directory, self.strategy.checkpointing.enabled);
        self
    }

    /// Use `vars` as the environment snapshot instead of the process environment
    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn evaluator(&self) -> &ConditionEvaluator {
        &self.evaluator
    }

    /// Context of the last run (or the restored checkpoint)
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Run the strategy to completion.
    ///
    /// `initial` is merged over the strategy's declared variables and
    /// parameters. On failure the final context travels inside the
    /// [`ExecutionFailure`] with `execution.error` set.
    pub async fn execute(
        &mut self,
        initial: Option<Map<String, Value>>,
    ) -> std::result::Result<ExecutionContext, ExecutionFailure> {
        let mut context = self.initialize(initial);
        info!(
            "Starting strategy '{}' v{} ({} steps, {:?} mode{})",
            self.strategy.name,
            self.strategy.version,
            self.strategy.steps.len(),
            self.strategy.execution.mode,
            if self.dry_run { ", dry run" } else { "" }
        );
        if self.checkpoints.is_enabled() {
            debug!(
                "Checkpoints are written to {}",
                self.checkpoints.directory().display()
            );
        }

        let outcome = match self.strategy.execution.timeout {
            Some(seconds) => {
                match timeout(Duration::from_secs(seconds), self.run_main(&mut context)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(StrategyError::StrategyTimeout {
                        name: self.strategy.name.clone(),
                        seconds,
                    }),
                }
            }
            None => self.run_main(&mut context).await,
        };

        self.run_finally(&mut context).await;
        context.execution.completed_at = Some(Utc::now());
        self.resuming = false;

        let result = match outcome {
            Ok(()) => {
                let (executed, failed, skipped) = context.classification();
                info!(
                    "Strategy '{}' completed: {} executed, {} failed, {} skipped",
                    self.strategy.name,
                    executed.len(),
                    failed.len(),
                    skipped.len()
                );
                Ok(context.clone())
            }
            Err(source) => {
                error!("Strategy '{}' failed: {}", self.strategy.name, source);
                context.execution.error = Some(source.to_string());
                Err(ExecutionFailure {
                    strategy: self.strategy.name.clone(),
                    source,
                    context: Box::new(context.clone()),
                })
            }
        };
        self.context = context;
        result
    }

    fn initialize(&mut self, initial: Option<Map<String, Value>>) -> ExecutionContext {
        if self.resume_pending {
            self.resume_pending = false;
            self.resuming = true;
            let mut context = std::mem::take(&mut self.context);
            info!(
                "Resuming strategy '{}' with {} completed steps",
                self.strategy.name,
                context.execution.executed_steps.len()
            );
            if let Some(initial) = initial {
                context.merge_initial(initial);
            }
            context.execution.completed_at = None;
            context.execution.error = None;
            context.execution.dry_run = self.dry_run;
            return context;
        }

        let mut context = match &self.env {
            Some(vars) => ExecutionContext::default().with_env(vars.iter().cloned()),
            None => ExecutionContext::new(),
        };
        context.variables = self.strategy.variables.clone();
        context.parameters = self.strategy.parameters.clone();
        if let Some(initial) = initial {
            context.merge_initial(initial);
        }
        context.execution.strategy_name = self.strategy.name.clone();
        context.execution.strategy_version = self.strategy.version.clone();
        context.execution.started_at = Some(Utc::now());
        context.execution.dry_run = self.dry_run;
        context
    }

    /// Pre-conditions, step dispatch and post-conditions
    async fn run_main(&self, context: &mut ExecutionContext) -> Result<()> {
        for condition in &self.strategy.pre_conditions {
            if !self.evaluator.evaluate_condition(Some(condition), context)? {
                return Err(StrategyError::PreCondition(display(&condition.to_value())));
            }
        }

        match self.strategy.execution.mode {
            ExecutionMode::Sequential => self.execute_sequential(context).await?,
            ExecutionMode::Dag => self.execute_dag(context).await?,
        }

        for condition in &self.strategy.post_conditions {
            match self.evaluator.evaluate_condition(Some(condition), context) {
                Ok(true) => {}
                Ok(false) => warn!(
                    "Post-condition not met: {}",
                    display(&condition.to_value())
                ),
                Err(e) => warn!("Post-condition could not be evaluated: {}", e),
            }
        }
        Ok(())
    }

    async fn execute_sequential(&self, context: &mut ExecutionContext) -> Result<()> {
        for step in &self.strategy.steps {
            self.run_step(step, context).await?;
        }
        Ok(())
    }

    /// Cleanup steps; failures are logged and never change the outcome
    async fn run_finally(&self, context: &mut ExecutionContext) {
        for step in &self.strategy.finally_steps {
            if let Err(e) = self.run_step(step, context).await {
                warn!("Cleanup step '{}' failed: {}", step.name, e);
            }
        }
    }

    /// Guards, loop dispatch and bookkeeping for one step
    pub(crate) async fn run_step(&self, step: &Step, context: &mut ExecutionContext) -> Result<()> {
        if self.resuming && context.execution.executed_steps.contains(&step.name) {
            info!("Step '{}' already completed, skipping", step.name);
            return Ok(());
        }

        let started = Instant::now();
        let outcome = match self.check_guards(step, context) {
            Ok(false) => {
                context.mark_skipped(&step.name);
                return Ok(());
            }
            Ok(true) => {
                info!("Running step '{}'", step.name);
                self.dispatch(step, context).await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(StepOutcome::Completed { output, attempts }) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                debug!("Step '{}' completed in {}ms", step.name, duration_ms);
                context.record_step_result(&step.name, StepResult::new(output, attempts, duration_ms));
                context.mark_executed(&step.name);
                if step.checkpoint.is_some_and(|timing| timing.after()) {
                    let saved = self
                        .save_checkpoint_named(&format!("after_{}", step.name), context)
                        .await;
                    if let Err(e) = saved {
                        // moves the step out of executed_steps
                        context.mark_failed(&step.name);
                        return Err(StrategyError::step_execution(&step.name, e));
                    }
                }
                Ok(())
            }
            Ok(StepOutcome::Skipped) => {
                context.mark_skipped(&step.name);
                Ok(())
            }
            Ok(StepOutcome::Failed) => {
                context.mark_failed(&step.name);
                Ok(())
            }
            Err(e) => {
                context.mark_failed(&step.name);
                Err(StrategyError::step_execution(&step.name, e))
            }
        }
    }

    /// Checkpoint, then hand the step to the matching loop or run it once
    async fn dispatch(&self, step: &Step, context: &mut ExecutionContext) -> Result<StepOutcome> {
        if step.checkpoint.is_some_and(|timing| timing.before()) {
            self.save_checkpoint_named(&format!("before_{}", step.name), context)
                .await?;
        }
        if step.for_each.is_some() {
            self.run_for_each(step, context).await
        } else if step.repeat.is_some() {
            self.run_repeat(step, context).await
        } else {
            self.execute_with_policy(step, context).await
        }
    }

    /// `skip_if_exists` then `condition`; false means skip the step
    fn check_guards(&self, step: &Step, context: &ExecutionContext) -> Result<bool> {
        if let Some(target) = &step.skip_if_exists {
            let exists = if target.contains("${") {
                self.evaluator.evaluator().evaluate_bool(target, context)?
            } else {
                context.variables.contains_key(target) || Path::new(target).exists()
            };
            if exists {
                info!("Skipping step '{}': '{}' already exists", step.name, target);
                return Ok(false);
            }
        }

        if !self
            .evaluator
            .evaluate_condition(step.condition.as_ref(), context)?
        {
            info!("Skipping step '{}': condition not met", step.name);
            return Ok(false);
        }
        Ok(true)
    }

    /// Run one execution of a step under its error policy
    pub(crate) async fn execute_with_policy(
        &self,
        step: &Step,
        context: &mut ExecutionContext,
    ) -> Result<StepOutcome> {
        let policy = self.strategy.error_policy_for(step);
        let max_attempts = policy.effective_attempts();
        let mut attempt = 1;

        let error = loop {
            debug!(
                "Executing step '{}' (attempt {}/{})",
                step.name, attempt, max_attempts
            );
            match self.execute_once(step, context).await {
                Ok(output) => {
                    return Ok(StepOutcome::Completed {
                        output,
                        attempts: attempt,
                    })
                }
                Err(e) if attempt < max_attempts => {
                    warn!(
                        "Step '{}' failed on attempt {}/{}: {}",
                        step.name, attempt, max_attempts, e
                    );
                    retry::backoff(&step.name, &policy, attempt).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        self.handle_exhausted(step, &policy, error, attempt, context)
            .await
    }

    async fn handle_exhausted(
        &self,
        step: &Step,
        policy: &ErrorHandling,
        error: StrategyError,
        attempts: u32,
        context: &mut ExecutionContext,
    ) -> Result<StepOutcome> {
        if let Some((name, expression)) = policy.variable_assignment() {
            let value = self.assignment_value(expression, context);
            debug!("Step '{}' failed, setting variable '{}'", step.name, name);
            context.set_variable(name, value);
        }

        if let Some(fallback) = &policy.fallback {
            info!(
                "Running fallback action '{}' for step '{}'",
                fallback.action_type, step.name
            );
            match self.invoke(&step.name, fallback, step.timeout, context).await {
                Ok(output) => {
                    self.apply_result(&step.name, &output, context);
                    return Ok(StepOutcome::Completed { output, attempts });
                }
                Err(e) => warn!("Fallback for step '{}' failed: {}", step.name, e),
            }
        }

        let action = match policy.action {
            ErrorAction::Stop | ErrorAction::Retry if !step.is_critical => ErrorAction::Continue,
            action => action,
        };
        match action {
            ErrorAction::Skip => {
                warn!("Skipping step '{}' after error: {}", step.name, error);
                Ok(StepOutcome::Skipped)
            }
            ErrorAction::Continue => {
                warn!("Continuing past failed step '{}': {}", step.name, error);
                Ok(StepOutcome::Failed)
            }
            ErrorAction::Stop | ErrorAction::Retry => {
                error!(
                    "Step '{}' failed after {} attempt(s): {}",
                    step.name, attempts, error
                );
                Err(StrategyError::step_execution(&step.name, error))
            }
        }
    }

    /// `set_variable` right-hand side: a placeholder expression, a literal,
    /// or plain text
    fn assignment_value(&self, expression: &str, context: &ExecutionContext) -> Value {
        if expression.contains("${") {
            self.evaluator
                .evaluator()
                .resolve_value(&Value::String(expression.to_string()), context)
        } else {
            parse_constant(expression).unwrap_or_else(|_| Value::String(expression.to_string()))
        }
    }

    /// A single attempt: action, result conventions, `set_variables`
    async fn execute_once(&self, step: &Step, context: &mut ExecutionContext) -> Result<Value> {
        let output = self
            .invoke(&step.name, &step.action, step.timeout, context)
            .await?;
        self.apply_result(&step.name, &output, context);

        for (name, value) in &step.set_variables {
            let resolved = self.evaluator.evaluator().resolve_value(value, context);
            context.set_variable(name, resolved);
        }
        Ok(output)
    }

    /// Resolve parameters and call the registered action
    async fn invoke(
        &self,
        step_name: &str,
        action: &ActionSpec,
        timeout_seconds: Option<u64>,
        context: &ExecutionContext,
    ) -> Result<Value> {
        let evaluator = self.evaluator.evaluator();
        let params: Map<String, Value> = action
            .params
            .iter()
            .map(|(key, value)| (key.clone(), evaluator.resolve_value(value, context)))
            .collect();

        if self.dry_run {
            info!(
                "[dry run] Step '{}' would run action '{}'",
                step_name, action.action_type
            );
            return Ok(json!({
                "dry_run": true,
                "action": action.action_type,
                "params": params,
            }));
        }

        let implementation =
            self.registry
                .get(&action.action_type)
                .ok_or_else(|| StrategyError::UnknownAction {
                    step: step_name.to_string(),
                    action_type: action.action_type.clone(),
                })?;
        let action_context = ActionContext::from_execution(step_name, context);
        let run = implementation.run(&params, &action_context);

        let result = match timeout_seconds {
            Some(seconds) => timeout(Duration::from_secs(seconds), run)
                .await
                .map_err(|_| StrategyError::StepTimeout {
                    step: step_name.to_string(),
                    seconds,
                })?,
            None => run.await,
        };
        result.map_err(|source| StrategyError::ActionFailed {
            step: step_name.to_string(),
            action_type: action.action_type.clone(),
            source,
        })
    }

    /// Fold well-known keys of a map result into the context
    fn apply_result(&self, step_name: &str, output: &Value, context: &mut ExecutionContext) {
        let Value::Object(result) = output else {
            return;
        };
        if let Some(metrics) = result.get("metrics") {
            context.record_metrics(step_name, metrics.clone());
        }
        if let Some(Value::Object(datasets)) = result.get("datasets") {
            context.merge_datasets(datasets.clone());
        }
        if let Some(Value::Object(statistics)) = result.get("statistics") {
            context.merge_statistics(statistics.clone());
        }
        if let Some(Value::Array(identifiers)) = result.get("current_identifiers") {
            context.set_current_identifiers(identifiers.clone());
        }
    }

    async fn save_checkpoint_named(
        &self,
        checkpoint_name: &str,
        context: &ExecutionContext,
    ) -> Result<Option<PathBuf>> {
        self.checkpoints
            .save(&self.strategy.name, checkpoint_name, context)
            .await
    }

    /// Checkpoint the current context under `checkpoint_name`
    pub async fn save_checkpoint(&self, checkpoint_name: &str) -> Result<Option<PathBuf>> {
        self.save_checkpoint_named(checkpoint_name, &self.context)
            .await
    }

    /// Replace the in-memory state with a checkpoint.
    ///
    /// The next [`StrategyExecutor::execute`] continues from the restored
    /// context and does not re-run steps it lists as executed.
    pub async fn restore_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = CheckpointManager::load(path.as_ref()).await?;
        if checkpoint.strategy_name != self.strategy.name {
            warn!(
                "Checkpoint belongs to strategy '{}', restoring into '{}'",
                checkpoint.strategy_name, self.strategy.name
            );
        }
        info!(
            "Restored checkpoint '{}' from {}",
            checkpoint.checkpoint_name,
            path.as_ref().display()
        );
        self.context = checkpoint.into_context();
        if let Some(vars) = &self.env {
            self.context = std::mem::take(&mut self.context).with_env(vars.iter().cloned());
        }
        self.evaluator = ConditionEvaluator::default();
        self.resume_pending = true;
        Ok(())
    }
}
