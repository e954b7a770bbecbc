//! # mapflow
//!
//! A YAML-driven strategy engine for identifier mapping pipelines.
//!
//! A strategy document declares variables, parameters and an ordered list of
//! steps. Each step names an action registered with the engine and may carry
//! conditions, loops, retries, checkpoints and dependencies. Values flow
//! between steps through a shared execution context that every `${...}`
//! expression is evaluated against.
//!
//! ## Usage
//!
//! ```bash
//! mapflow run strategy.yaml [--dry-run] [--param key=value] [--checkpoint-dir DIR]
//! mapflow validate strategy.yaml
//! ```
//!
//! ## Modules
//!
//! - `app` - Binary configuration, logging and fatal error reporting
//! - `error` - Error types for expressions, strategies and runs
//! - `executor` - Strategy execution, action registry, checkpoints
//! - `expression` - Sandboxed `${...}` expression and condition evaluation
//! - `strategy` - Strategy document model, loading and validation
pub mod app;
pub mod error;
pub mod executor;
pub mod expression;
pub mod strategy;

pub use error::{ExecutionFailure, ExpressionError, StrategyError};
pub use executor::{ActionRegistry, ExecutionContext, StrategyExecutor};
pub use strategy::Strategy;
