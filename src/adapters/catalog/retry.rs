//! Retry policy for catalog calls.
//!
//! Exponential backoff starting at 250ms, doubling per attempt with ±20%
//! jitter, capped at 5 retries or 30 seconds of total elapsed failure time.
//! Only transport errors and 5xx responses are retried; a 4xx is fatal for
//! the call.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;

use crate::domain::errors::{DomainError, DomainResult};

const MAX_RETRIES: u32 = 5;

fn catalog_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(250),
        randomization_factor: 0.2,
        multiplier: 2.0,
        max_interval: Duration::from_secs(30),
        max_elapsed_time: Some(Duration::from_secs(30)),
        ..ExponentialBackoff::default()
    }
}

/// Run `op` under the catalog retry policy.
pub async fn with_retry<T, F, Fut>(op_name: &'static str, mut op: F) -> DomainResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DomainResult<T>>,
{
    let mut attempts: u32 = 0;
    backoff::future::retry(catalog_backoff(), || {
        attempts += 1;
        let attempt = attempts;
        let fut = op();
        async move {
            match fut.await {
                Ok(value) => Ok(value),
                Err(err @ DomainError::CatalogUnreachable(_)) if attempt <= MAX_RETRIES => {
                    tracing::debug!(
                        target: "catsync::catalog",
                        op = op_name,
                        attempt,
                        error = %err,
                        "retrying catalog call"
                    );
                    Err(backoff::Error::transient(err))
                }
                Err(err) => Err(backoff::Error::permanent(err)),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: DomainResult<()> = with_retry("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DomainError::CatalogBadRequest("no".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DomainError::CatalogUnreachable("down".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
