//! Pre-stream retry for the initial HTTP request of an exchange.
//!
//! Only the request that opens a stream is retried. Once response bytes start
//! flowing, failures surface to the caller unchanged.

use tracing::warn;

use crate::config::RetryConfig;
use crate::providers::shared::{ProviderError, ProviderResult, classify_reqwest_error};

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Sends the request produced by `build`, retrying connection failures and
/// 429/5xx responses according to `retry`. Returns a successful response.
///
/// # Errors
/// Returns the last transport or HTTP status error once attempts are exhausted.
pub async fn send_with_retry<F>(
    retry: &RetryConfig,
    mut build: F,
) -> ProviderResult<reqwest::Response>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let attempts = retry.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match build().send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let error = ProviderError::http_status(status, &body);
                if !is_retryable_status(status) {
                    return Err(error);
                }
                error
            }
            Err(e) => {
                let error = classify_reqwest_error(&e);
                if !(e.is_connect() || e.is_timeout()) {
                    return Err(error);
                }
                error
            }
        };

        if attempt >= attempts {
            return Err(error);
        }
        let delay = retry.delay_for(attempt);
        warn!(
            attempt,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "request failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
