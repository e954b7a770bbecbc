use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use mapflow::app::{handle_fatal_error, init_logging, AppConfig};
use mapflow::{ActionRegistry, Strategy, StrategyExecutor};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::debug;

/// Run declarative identifier mapping strategies
#[derive(Parser)]
#[command(name = "mapflow")]
#[command(about = "Run YAML-defined mapping strategies", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a strategy and print the final context as JSON
    Run {
        /// Path to the strategy document
        file: PathBuf,

        /// Resolve parameters without invoking actions
        #[arg(long)]
        dry_run: bool,

        /// Runtime parameter, repeatable (values are parsed as YAML scalars)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Write checkpoints here instead of the strategy's directory
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Resume from a checkpoint file
        #[arg(long)]
        resume: Option<PathBuf>,
    },
    /// Parse and validate a strategy without running it
    Validate {
        /// Path to the strategy document
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match AppConfig::new(cli.verbose) {
        Ok(config) => config,
        Err(e) => handle_fatal_error(e, cli.verbose),
    };
    init_logging(&config);

    let result = match cli.command {
        Commands::Run {
            file,
            dry_run,
            params,
            checkpoint_dir,
            resume,
        } => {
            let config = config.with_checkpoint_dir(checkpoint_dir);
            run_strategy(&config, file, dry_run, &params, resume).await
        }
        Commands::Validate { file } => validate_strategy(&config, file).await,
    };

    if let Err(e) = result {
        handle_fatal_error(e, cli.verbose);
    }
}

async fn run_strategy(
    config: &AppConfig,
    file: PathBuf,
    dry_run: bool,
    params: &[String],
    resume: Option<PathBuf>,
) -> Result<()> {
    let strategy = Strategy::from_file(config.resolve(&file)).await?;
    let parameters = parse_params(params)?;
    debug!("Runtime parameters: {:?}", parameters);

    let mut executor =
        StrategyExecutor::new(strategy, ActionRegistry::with_builtins()).with_dry_run(dry_run);
    if let Some(dir) = config.checkpoint_dir() {
        executor = executor.with_checkpoint_dir(dir);
    }
    if let Some(checkpoint) = resume {
        executor.restore_checkpoint(config.resolve(&checkpoint)).await?;
    }

    let mut initial = Map::new();
    if !parameters.is_empty() {
        initial.insert("parameters".to_string(), Value::Object(parameters));
    }
    let context = executor.execute(Some(initial)).await?;

    let output = serde_json::to_string_pretty(&context).context("Failed to serialize context")?;
    println!("{output}");
    Ok(())
}

async fn validate_strategy(config: &AppConfig, file: PathBuf) -> Result<()> {
    let strategy = Strategy::from_file(config.resolve(&file)).await?;
    println!(
        "Strategy '{}' v{} is valid ({} steps, {} cleanup steps)",
        strategy.name,
        strategy.version,
        strategy.steps.len(),
        strategy.finally_steps.len()
    );
    Ok(())
}

/// Parse `key=value` pairs; values are read as YAML scalars so numbers and
/// booleans keep their type
fn parse_params(params: &[String]) -> Result<Map<String, Value>> {
    params
        .iter()
        .map(|param| {
            let (key, raw) = param
                .split_once('=')
                .ok_or_else(|| anyhow!("Invalid parameter '{}': expected KEY=VALUE", param))?;
            let value = serde_yaml::from_str::<Value>(raw)
                .unwrap_or_else(|_| Value::String(raw.to_string()));
            let value = if value.is_null() && !raw.trim().is_empty() && raw.trim() != "null" {
                Value::String(raw.to_string())
            } else {
                value
            };
            Ok((key.trim().to_string(), value))
        })
        .collect()
}
