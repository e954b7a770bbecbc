//! Retry backoff

use crate::strategy::{BackoffStrategy, ErrorHandling};
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

/// Delay before the attempt following failed attempt number `attempt`
/// (1-based): linear is `delay * attempt`, exponential `delay * 2^(attempt-1)`
pub fn retry_delay(policy: &ErrorHandling, attempt: u32) -> Duration {
    let base = policy.delay;
    let secs = match policy.backoff {
        BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt)),
        BackoffStrategy::Exponential => {
            let shift = attempt.saturating_sub(1).min(20);
            base.saturating_mul(1u64 << shift)
        }
    };
    Duration::from_secs(secs)
}

/// Sleep out the backoff after a failed attempt
pub async fn backoff(step: &str, policy: &ErrorHandling, attempt: u32) {
    let delay = retry_delay(policy, attempt);
    info!(
        "Retrying step '{}' in {:?} (attempt {}/{})",
        step,
        delay,
        attempt + 1,
        policy.effective_attempts()
    );
    sleep(delay).await;
}
