//! Retry policy for unary requests.
//!
//! Retries only on the status codes the caller names, with randomized
//! exponential backoff, and honors `Retry-After` on HTTP 429.

use std::future::Future;
use std::time::Duration;

use firekit_models::Code;
use tracing::{info_span, warn, Instrument};

use crate::backoff::{BackoffSettings, ExponentialBackoff};
use crate::error::FirestoreResult;
use crate::metrics::record_retry;

// =============================================================================
// Configuration
// =============================================================================

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first call).
    pub max_retries: u32,
    /// Base delay for exponential backoff (in milliseconds).
    pub base_delay_ms: u64,
    /// Maximum delay cap (in milliseconds).
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_parse("FIRESTORE_MAX_RETRIES").unwrap_or(defaults.max_retries),
            base_delay_ms: env_parse("FIRESTORE_RETRY_BASE_MS").unwrap_or(defaults.base_delay_ms),
            max_delay_ms: env_parse("FIRESTORE_RETRY_MAX_MS").unwrap_or(defaults.max_delay_ms),
        }
    }

    /// Backoff settings for this policy.
    pub fn backoff_settings(&self) -> BackoffSettings {
        BackoffSettings {
            initial_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            backoff_factor: 2.0,
            jitter_factor: 1.0,
        }
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

// =============================================================================
// Retry Loop
// =============================================================================

/// Execute an async operation, retrying on `retry_codes`.
///
/// Errors without a status code (usage errors, decode failures) are never
/// retried.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    retry_codes: &[Code],
    mut op: F,
) -> FirestoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FirestoreResult<T>>,
{
    let mut backoff = ExponentialBackoff::new(config.backoff_settings());
    let mut attempt = 0u32;

    loop {
        let span = info_span!("firestore_retry", operation = %operation, attempt = attempt + 1);

        match op().instrument(span).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let retryable = e.code().is_some_and(|code| retry_codes.contains(&code));
                if !retryable || attempt >= config.max_retries {
                    return Err(e);
                }

                let delay = match e.retry_after_ms() {
                    Some(after) => Duration::from_millis(after),
                    None => backoff.next_delay(),
                };

                warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Firestore request failed, retrying: {}",
                    e
                );
                record_retry(operation);

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
