//! Shared HTTP plumbing: client construction and bounded retry.
//!
//! Transient failures (connection errors, timeouts, 5xx, 429) are retried
//! with exponential backoff. Everything else is handed back to the caller
//! untouched so that 404 and 403 keep their meaning.

use crate::config::HttpConfig;
use crate::error::{AppError, AppResult};
use fedlink_types::GraphError;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// `User-Agent` sent on every request
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build the reqwest client used by every service client.
pub fn build_client(config: &HttpConfig) -> AppResult<Client> {
    Client::builder()
        .timeout(config.timeout())
        .user_agent(USER_AGENT)
        .build()
        .map_err(AppError::Http)
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &HttpConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `min(base_delay * 2^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Send a request, rebuilding it for each attempt.
    ///
    /// Returns the final response whatever its status; only transport errors
    /// become `Err`. A 5xx that survives every retry is returned as-is.
    pub async fn send<F>(&self, operation: &str, build: F) -> AppResult<Response>
    where
        F: FnMut() -> RequestBuilder,
    {
        self.dispatch(operation, build, true).await
    }

    /// Like [`send`](Self::send) but only transport failures are retried;
    /// any HTTP response, 5xx included, is returned on the first attempt.
    pub async fn send_transport_retry<F>(&self, operation: &str, build: F) -> AppResult<Response>
    where
        F: FnMut() -> RequestBuilder,
    {
        self.dispatch(operation, build, false).await
    }

    async fn dispatch<F>(&self, operation: &str, mut build: F, retry_status: bool) -> AppResult<Response>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            let delay = match build().send().await {
                Ok(response)
                    if retry_status
                        && is_transient_status(response.status())
                        && attempt < self.max_retries =>
                {
                    let delay = retry_after(&response)
                        .map(|d| d.min(self.max_delay))
                        .unwrap_or_else(|| self.delay_for(attempt));
                    warn!(
                        operation,
                        status = %response.status(),
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        ?delay,
                        "Transient response, retrying"
                    );
                    delay
                }
                Ok(response) => {
                    if attempt > 0 {
                        debug!(operation, attempts = attempt + 1, "Request completed after retries");
                    }
                    return Ok(response);
                }
                Err(e) if is_transient_error(&e) && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        error = %e,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        ?delay,
                        "Request failed, retrying"
                    );
                    delay
                }
                Err(e) => return Err(AppError::Http(e)),
            };

            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_transient_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Consume an error response into `(status, message)`.
///
/// OData-shaped bodies (Graph and ARM) are reduced to `code: message`.
pub async fn error_details(response: Response) -> (StatusCode, String) {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<GraphError>(&body) {
        Ok(odata) => format!("{}: {}", odata.error.code, odata.error.message),
        Err(_) => body,
    };
    (status, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn test_user_agent() {
        assert!(USER_AGENT.starts_with("fedlink/"));
    }
}
