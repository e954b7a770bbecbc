//! Application configuration

use anyhow::Result;
use std::path::{Path, PathBuf};

/// Application configuration structure
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Verbosity level for logging
    pub verbose: u8,
    /// Relative strategy and checkpoint paths resolve against this
    pub working_dir: PathBuf,
    /// Overrides the checkpoint directory declared by a strategy
    pub checkpoint_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Create a new application configuration
    pub fn new(verbose: u8) -> Result<Self> {
        let working_dir = std::env::current_dir()
            .map_err(|e| anyhow::anyhow!("Failed to get current directory: {}", e))?;

        Ok(Self {
            verbose,
            working_dir,
            checkpoint_dir: None,
        })
    }

    /// Set the working directory
    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.checkpoint_dir = dir;
        self
    }

    /// Resolve a user-supplied path against the working directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    /// Checkpoint directory override, resolved
    pub fn checkpoint_dir(&self) -> Option<PathBuf> {
        self.checkpoint_dir.as_deref().map(|dir| self.resolve(dir))
    }

    /// Get the log level string based on verbosity
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            verbose: 0,
            working_dir: PathBuf::from("."),
            checkpoint_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_by_verbosity() {
        let levels: Vec<_> = (0..4)
            .map(|verbose| AppConfig { verbose, ..AppConfig::default() }.log_level())
            .collect();
        assert_eq!(levels, vec!["info", "debug", "trace", "trace"]);
    }

    #[test]
    fn test_paths_resolve_against_working_dir() {
        let config = AppConfig::default()
            .with_working_dir(PathBuf::from("/work"))
            .with_checkpoint_dir(Some(PathBuf::from("ckpt")));
        assert_eq!(config.resolve(Path::new("s.yaml")), PathBuf::from("/work/s.yaml"));
        assert_eq!(config.resolve(Path::new("/abs/s.yaml")), PathBuf::from("/abs/s.yaml"));
        assert_eq!(config.checkpoint_dir(), Some(PathBuf::from("/work/ckpt")));
    }
}
