use std::future::Future;

use llmvm_common::{Error, ErrorClass, Result, RetryPolicy};
use tokio::time::Instant;

/// Run `op` under the policy's bounded retry.
///
/// Only `Retryable` errors are attempted again; fatal errors, `NotFound`,
/// and try-another-zone errors return immediately so the caller can react.
/// The deadline (`policy.timeout` from the first attempt) is the hard
/// ceiling: no sleep is started that would cross it, even with attempts
/// remaining. On exhaustion the last observed error propagates unchanged.
pub async fn run<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    policy.validate()?;
    let deadline = Instant::now() + policy.timeout;
    let mut last_err = None;
    for attempt in 1..=policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.class() == ErrorClass::Retryable => {
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "attempt failed, will retry"
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
        if attempt == policy.max_attempts {
            break;
        }
        if Instant::now() + policy.interval >= deadline {
            tracing::warn!(attempt, "retry deadline reached before next attempt");
            break;
        }
        tokio::time::sleep(policy.interval).await;
    }
    // max_attempts >= 1 is enforced by validate, so an error was recorded.
    Err(last_err.unwrap_or_else(|| Error::Provider("retry loop made no attempt".into())))
}
