//! Bounded-backoff retry helper for transient I/O and mount/unmount errors.
//!
//! Spec §7: "Transient I/O and mount errors are retried up to three times
//! with exponential backoff (100 ms base) before surfacing." Exhausted
//! retries on a lifecycle mount/unmount transition it to `error` (spec
//! §4.6); the caller decides that, this helper only owns the retry loop.

use crate::errors::AgentFenseResult;
use std::future::Future;
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_millis(100);

/// Run `operation` up to [`MAX_ATTEMPTS`] times, doubling the delay after
/// each transient failure (spec's "100ms base" exponential backoff).
/// Non-transient errors (as judged by
/// [`AgentFenseError::is_transient`](crate::errors::AgentFenseError::is_transient))
/// surface immediately without waiting out the remaining attempts.
pub async fn with_retry<T, F, Fut>(mut operation: F) -> AgentFenseResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AgentFenseResult<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                let delay = BASE_DELAY * 2u32.pow(attempt);
                tracing::warn!(attempt, ?delay, error = %err, "retrying transient operation");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
