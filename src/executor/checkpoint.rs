//! Filesystem checkpoints of execution state
//!
//! One JSON document per checkpoint at
//! `<directory>/<strategy>_<checkpoint>_<unix_timestamp>.json`. Writes go to a
//! temp file first and are renamed into place.

use super::context::{ExecutionContext, StepResult};
use crate::error::{Result, StrategyError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Serialized snapshot of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub strategy_name: String,
    pub checkpoint_name: String,
    pub timestamp: DateTime<Utc>,
    pub context: ExecutionContext,
    pub variables: Map<String, Value>,
    pub parameters: Map<String, Value>,
    pub executed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub step_results: BTreeMap<String, StepResult>,
    pub step_metrics: Map<String, Value>,
}

impl Checkpoint {
    pub fn capture(strategy_name: &str, checkpoint_name: &str, context: &ExecutionContext) -> Self {
        let (executed, failed, skipped) = context.classification();
        Self {
            strategy_name: strategy_name.to_string(),
            checkpoint_name: checkpoint_name.to_string(),
            timestamp: Utc::now(),
            context: context.clone(),
            variables: context.variables.clone(),
            parameters: context.parameters.clone(),
            executed_steps: executed.to_vec(),
            failed_steps: failed.to_vec(),
            skipped_steps: skipped.to_vec(),
            step_results: context.steps.clone(),
            step_metrics: context.metrics.clone(),
        }
    }

    /// Rebuild the execution context this checkpoint describes.
    ///
    /// The top-level sections win over the embedded context, and the
    /// environment is captured afresh.
    pub fn into_context(self) -> ExecutionContext {
        let mut context = self.context;
        context.variables = self.variables;
        context.parameters = self.parameters;
        context.steps = self.step_results;
        context.metrics = self.step_metrics;
        context.execution.executed_steps = self.executed_steps;
        context.execution.failed_steps = self.failed_steps;
        context.execution.skipped_steps = self.skipped_steps;
        context.capture_env();
        context
    }
}

/// Writes and reads checkpoints under one directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    directory: PathBuf,
    enabled: bool,
}

impl CheckpointManager {
    pub fn new(directory: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            directory: directory.into(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn checkpoint_path(&self, strategy_name: &str, checkpoint_name: &str, unix: i64) -> PathBuf {
        self.directory.join(format!(
            "{}_{}_{}.json",
            sanitize(strategy_name),
            sanitize(checkpoint_name),
            unix
        ))
    }

    /// Write a checkpoint; returns `None` when checkpointing is disabled
    pub async fn save(
        &self,
        strategy_name: &str,
        checkpoint_name: &str,
        context: &ExecutionContext,
    ) -> Result<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }

        let checkpoint = Checkpoint::capture(strategy_name, checkpoint_name, context);
        let path = self.checkpoint_path(
            strategy_name,
            checkpoint_name,
            checkpoint.timestamp.timestamp(),
        );
        let temp_path = path.with_extension("tmp");

        fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| StrategyError::checkpoint("Failed to create checkpoint directory", e))?;

        let json = serde_json::to_string_pretty(&checkpoint)
            .map_err(|e| StrategyError::checkpoint("Failed to serialize checkpoint", e))?;
        fs::write(&temp_path, json)
            .await
            .map_err(|e| StrategyError::checkpoint("Failed to write checkpoint to temp file", e))?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            StrategyError::checkpoint("Failed to move checkpoint to final location", e)
        })?;

        info!(
            "Saved checkpoint '{}' for strategy {} at {}",
            checkpoint_name,
            strategy_name,
            path.display()
        );
        Ok(Some(path))
    }

    /// Read a checkpoint file
    pub async fn load(path: impl AsRef<Path>) -> Result<Checkpoint> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            StrategyError::checkpoint(format!("Failed to read checkpoint {}", path.display()), e)
        })?;
        let checkpoint: Checkpoint = serde_json::from_str(&content).map_err(|e| {
            StrategyError::checkpoint(format!("Failed to parse checkpoint {}", path.display()), e)
        })?;
        debug!(
            "Loaded checkpoint '{}' of strategy {}",
            checkpoint.checkpoint_name, checkpoint.strategy_name
        );
        Ok(checkpoint)
    }

    /// Checkpoint files in the directory, sorted by name
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let mut checkpoints = Vec::new();
        if !self.directory.exists() {
            return Ok(checkpoints);
        }

        let mut entries = fs::read_dir(&self.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                checkpoints.push(path);
            }
        }
        checkpoints.sort();
        Ok(checkpoints)
    }
}

/// Keep file names portable
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "checkpoint_tests.rs"]
mod checkpoint_tests;
