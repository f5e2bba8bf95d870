//! Retry helper for LLM calls — capped exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::LlmError;

/// Maximum attempts per logical call (1 initial + retries).
const MAX_ATTEMPTS: u32 = 3;

/// Base delay doubled per attempt.
const BASE_DELAY_MS: u64 = 500;

/// Ceiling on a single backoff sleep.
const MAX_DELAY_MS: u64 = 8_000;

/// Run `op` with retries on retryable errors.
pub async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "LLM call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Exponential delay for `attempt` (1-based), with up to 25% added jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_DELAY_MS.saturating_mul(1 << (attempt - 1)).min(MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=base / 4);
    Duration::from_millis(base + jitter)
}
