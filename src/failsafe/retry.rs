//! Bounded retry for idempotent upstream reads
//!
//! Transient upstream failures are retried with exponential backoff only
//! for read operations; mutations are never retried. Three attempts total.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::{Error, Result};

/// Total attempts for a retried read (1 initial + 2 retries)
const MAX_ATTEMPTS: usize = 3;

/// Execute an idempotent read with bounded exponential backoff.
///
/// Only upstream and timeout errors are retried; protocol, auth, and
/// not-found failures surface immediately.
pub async fn with_read_retry<F, Fut, T>(name: &str, f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    f.retry(
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
            .with_max_times(MAX_ATTEMPTS - 1),
    )
    .when(is_retryable)
    .notify(|err, dur| {
        debug!(operation = name, delay_ms = dur.as_millis(), error = %err, "Retrying read");
    })
    .await
}

fn is_retryable(error: &Error) -> bool {
    matches!(
        error,
        Error::Upstream(_) | Error::UpstreamTimeout(_) | Error::Http(_) | Error::Io(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn transient_upstream_errors_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_read_retry("test", move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Upstream("flaky".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempts_are_capped() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32> = with_read_retry("test", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Upstream("always down".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS as u32);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<u32> = with_read_retry("test", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::NotFound("job".to_string()))
            }
        })
        .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
