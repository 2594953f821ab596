//! Backoff wrapper for idempotent calls.
//!
//! Queue replay retries are counted per item by the sync coordinator
//! across passes; this helper exists for read calls that are safe to
//! repeat within a single attempt window. Mutations must not go through
//! it, or a slow success could be replayed twice.

use crate::client::TransportError;
use backoff::ExponentialBackoffBuilder;
use std::future::Future;
use std::time::Duration;

/// Retry window configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// First wait between attempts
    pub initial_interval: Duration,
    /// Give up once this much time has elapsed
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(250),
            max_elapsed: Duration::from_secs(5),
        }
    }
}

/// Run `op`, retrying with exponential backoff while it fails with a
/// retryable transport error. Permanent errors return immediately.
pub async fn retry_transient<T, F, Fut>(config: &RetryConfig, op: F) -> Result<T, TransportError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_interval)
        .with_max_elapsed_time(Some(config.max_elapsed))
        .build();

    let op = &op;
    backoff::future::retry(backoff, || async move {
        op().await.map_err(|err| {
            if err.is_retryable() {
                tracing::debug!(%err, "transient transport failure, backing off");
                backoff::Error::transient(err)
            } else {
                backoff::Error::permanent(err)
            }
        })
    })
    .await
}
