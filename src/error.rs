//! Error taxonomy for strategy loading and execution

use crate::executor::ExecutionContext;
use thiserror::Error;

/// Failure raised by the expression evaluator.
///
/// Every parse failure, disallowed construct, unknown function or failed
/// reference resolution surfaces as this single kind, carrying the text of
/// the offending expression.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Expression error in '{expression}': {message}")]
pub struct ExpressionError {
    pub expression: String,
    pub message: String,
}

impl ExpressionError {
    pub fn new(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Attach the full expression text to an error raised deeper in evaluation
    pub fn in_expression(mut self, expression: &str) -> Self {
        if self.expression.is_empty() {
            self.expression = expression.to_string();
        }
        self
    }
}

/// Errors raised while loading, validating or executing a strategy
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Strategy validation failed: {0}")]
    Validation(String),

    #[error("Failed to parse strategy document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("Unknown action type '{action_type}' in step '{step}'")]
    UnknownAction { step: String, action_type: String },

    #[error("Action '{action_type}' failed in step '{step}': {source}")]
    ActionFailed {
        step: String,
        action_type: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Step '{step}' timed out after {seconds}s")]
    StepTimeout { step: String, seconds: u64 },

    #[error("Step '{step}' failed: {message}")]
    StepExecution {
        step: String,
        message: String,
        #[source]
        source: Option<Box<StrategyError>>,
    },

    #[error("Pre-condition failed: {0}")]
    PreCondition(String),

    #[error("Circular dependency detected in {operation} among steps: {}", steps.join(", "))]
    CircularDependency {
        operation: String,
        steps: Vec<String>,
    },

    #[error("Strategy '{name}' exceeded its timeout of {seconds}s")]
    StrategyTimeout { name: String, seconds: u64 },

    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StrategyError {
    /// Wrap a failure as the fatal step-level error
    pub fn step_execution(step: &str, cause: StrategyError) -> Self {
        match cause {
            already @ StrategyError::StepExecution { .. } => already,
            other => StrategyError::StepExecution {
                step: step.to_string(),
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    pub fn checkpoint(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        StrategyError::Checkpoint {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Name of the step this error is attributed to, if any
    pub fn step(&self) -> Option<&str> {
        match self {
            StrategyError::UnknownAction { step, .. }
            | StrategyError::ActionFailed { step, .. }
            | StrategyError::StepTimeout { step, .. }
            | StrategyError::StepExecution { step, .. } => Some(step),
            _ => None,
        }
    }
}

/// A failed strategy run.
///
/// The final context is handed back alongside the cause so callers keep the
/// audit trail (`execution.error` and the step classification lists).
#[derive(Debug, Error)]
#[error("Strategy '{strategy}' failed: {source}")]
pub struct ExecutionFailure {
    pub strategy: String,
    #[source]
    pub source: StrategyError,
    pub context: Box<ExecutionContext>,
}

pub type Result<T, E = StrategyError> = std::result::Result<T, E>;
