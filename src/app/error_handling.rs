//! Fatal error reporting for the binary

use crate::error::{ExecutionFailure, StrategyError};
use tracing::error;

/// Exit code for a failed command: 2 for documents that never ran
/// (unreadable, malformed or invalid), 1 for everything else
pub fn exit_code(error: &anyhow::Error) -> i32 {
    let strategy_error = error
        .downcast_ref::<StrategyError>()
        .or_else(|| error.downcast_ref::<ExecutionFailure>().map(|f| &f.source));
    match strategy_error {
        Some(StrategyError::Validation(_) | StrategyError::Parse(_) | StrategyError::Io(_)) => 2,
        _ => 1,
    }
}

/// Report a fatal error and exit.
///
/// The error chain is printed in verbose mode.
pub fn handle_fatal_error(error: anyhow::Error, verbose: u8) -> ! {
    error!("Fatal error: {}", error);
    eprintln!("Error: {error}");

    if verbose >= 1 {
        eprintln!("\nError chain:");
        for (i, cause) in error.chain().enumerate() {
            eprintln!("  {}: {}", i, cause);
        }
    }

    std::process::exit(exit_code(&error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let invalid = anyhow::Error::new(StrategyError::Validation("no steps".into()));
        assert_eq!(exit_code(&invalid), 2);

        let runtime = anyhow::Error::new(StrategyError::PreCondition("x".into()));
        assert_eq!(exit_code(&runtime), 1);

        assert_eq!(exit_code(&anyhow::anyhow!("other")), 1);
    }
}
