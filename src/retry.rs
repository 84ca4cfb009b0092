//! Retry with exponential backoff for transient store failures

use crate::config::RetryPolicy;
use crate::error::Result;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Run `op`, retrying transient failures according to `policy`
///
/// Non-transient errors are returned immediately. The last transient error
/// is returned once `policy.max_attempts` is exhausted.
pub fn with_backoff<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = jitter(policy.backoff(attempt));
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, policy.max_attempts, err, delay
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Spread the delay over [delay/2, delay]
fn jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    if ms < 2 {
        return delay;
    }
    Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms))
}
