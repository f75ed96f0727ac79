//! OAuth 2.0 device authorization grant (RFC 8628) against GitHub.
//!
//! The authenticator walks `Requesting -> WaitingForUser -> Polling` and ends
//! in one of `Succeeded`, `Expired` or `Denied`. Polling honours `slow_down`
//! by widening the interval, and stops at a deadline computed from the
//! session's own `expires_in` plus a grace margin.

use crate::config::{AppConfig, DeviceFlowConfig};
use crate::error::{AppError, AppResult};
use crate::http::{build_client, RetryPolicy};
use crate::token::AccessToken;
use async_trait::async_trait;
use fedlink_types::{DeviceCodeResponse, TokenPollResponse};
use reqwest::{header::ACCEPT, Client};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info};
use zeroize::Zeroize;

pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Floor for the provider's `interval`; zero would poll back to back.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// In-flight device authorization.
///
/// Only `interval` changes after creation. The device code is wiped on drop.
pub struct DeviceCodeSession {
    device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub interval: Duration,
    pub expires_in: Duration,
    /// Monotonic start, drives the poll schedule
    pub started_at: Instant,
    /// Wall-clock start, catches time spent suspended
    pub issued_at: SystemTime,
}

impl DeviceCodeSession {
    pub fn new(response: DeviceCodeResponse) -> Self {
        let DeviceCodeResponse {
            device_code,
            user_code,
            verification_uri,
            expires_in,
            interval,
        } = response;

        Self {
            device_code,
            user_code,
            verification_uri,
            interval: Duration::from_secs(interval).max(MIN_POLL_INTERVAL),
            expires_in: Duration::from_secs(expires_in),
            started_at: Instant::now(),
            issued_at: SystemTime::now(),
        }
    }

    pub fn device_code(&self) -> &str {
        &self.device_code
    }

    /// Point after which no further poll is attempted. `None` when the
    /// provider's `expires_in` does not fit on the clock.
    pub fn deadline(&self, grace: Duration) -> Option<Instant> {
        self.started_at.checked_add(self.expires_in.checked_add(grace)?)
    }

    /// True once either clock says the session is past `expires_in + grace`.
    pub fn is_expired(&self, grace: Duration) -> bool {
        let Some(deadline) = self.deadline(grace) else {
            return true;
        };
        if Instant::now() >= deadline {
            return true;
        }
        self.issued_at
            .elapsed()
            .map(|elapsed| elapsed >= self.expires_in + grace)
            .unwrap_or(false)
    }
}

impl Drop for DeviceCodeSession {
    fn drop(&mut self) {
        self.device_code.zeroize();
    }
}

impl std::fmt::Debug for DeviceCodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCodeSession")
            .field("user_code", &self.user_code)
            .field("verification_uri", &self.verification_uri)
            .field("interval", &self.interval)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

/// Classified answer from the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Granted(AccessToken),
    Pending,
    SlowDown,
    Expired,
    Denied(String),
}

impl PollOutcome {
    pub fn classify(response: TokenPollResponse) -> Self {
        if let Some(token) = response.access_token.filter(|t| !t.is_empty()) {
            return Self::Granted(AccessToken::new(token));
        }

        match response.error.as_deref() {
            Some("authorization_pending") => Self::Pending,
            Some("slow_down") => Self::SlowDown,
            Some("expired_token") => Self::Expired,
            Some(code) => Self::Denied(match response.error_description {
                Some(description) => format!("{code} ({description})"),
                None => code.to_string(),
            }),
            None => Self::Denied("token response carried neither a token nor an error".to_string()),
        }
    }
}

/// The two endpoints of the device grant.
#[async_trait]
pub trait DeviceGrantClient: Send + Sync {
    /// Ask the provider for a device and user code.
    async fn request_device_code(&self) -> AppResult<DeviceCodeResponse>;

    /// Exchange the device code, once.
    async fn poll_token(&self, device_code: &str) -> AppResult<PollOutcome>;
}

/// GitHub's `/login/device/code` and `/login/oauth/access_token`.
pub struct GitHubDeviceGrant {
    http: Client,
    device_code_url: String,
    token_url: String,
    client_id: String,
    scope: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for GitHubDeviceGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubDeviceGrant")
            .field("device_code_url", &self.device_code_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl GitHubDeviceGrant {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        Ok(Self {
            http: build_client(&config.http)?,
            device_code_url: config.github.device_code_url(),
            token_url: config.github.access_token_url(),
            client_id: config.github.client_id.clone(),
            scope: config.github.scopes.join(" "),
            retry: RetryPolicy::from_config(&config.http),
        })
    }
}

#[async_trait]
impl DeviceGrantClient for GitHubDeviceGrant {
    async fn request_device_code(&self) -> AppResult<DeviceCodeResponse> {
        let params = [("client_id", self.client_id.as_str()), ("scope", self.scope.as_str())];

        let response = self
            .retry
            .send_transport_retry("device code", || {
                self.http
                    .post(&self.device_code_url)
                    .header(ACCEPT, "application/json")
                    .form(&params)
            })
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::DeviceCodeRequest { status, body });
        }

        Ok(response.json().await?)
    }

    async fn poll_token(&self, device_code: &str) -> AppResult<PollOutcome> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("device_code", device_code),
            ("grant_type", DEVICE_CODE_GRANT_TYPE),
        ];

        let response = self
            .retry
            .send("device token poll", || {
                self.http
                    .post(&self.token_url)
                    .header(ACCEPT, "application/json")
                    .form(&params)
            })
            .await?;

        // RFC 8628 errors arrive as 400, GitHub sends them with 200
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<TokenPollResponse>(&body) {
            Ok(parsed) if parsed.access_token.is_some() || parsed.error.is_some() => {
                Ok(PollOutcome::classify(parsed))
            }
            _ => Err(AppError::api("GitHub OAuth", status.as_u16(), body)),
        }
    }
}

/// Drives a [`DeviceGrantClient`] to a bearer token.
pub struct DeviceFlowAuthenticator<C> {
    client: C,
    expiry_grace: Duration,
    slow_down_increment: Duration,
}

impl<C: DeviceGrantClient> DeviceFlowAuthenticator<C> {
    pub fn new(client: C, config: &DeviceFlowConfig) -> Self {
        Self {
            client,
            expiry_grace: Duration::from_secs(config.expiry_grace_secs),
            slow_down_increment: Duration::from_secs(config.slow_down_increment_secs),
        }
    }

    /// Run the whole flow. `display` shows the user code to the operator.
    pub async fn authenticate<F>(&self, display: F) -> AppResult<AccessToken>
    where
        F: FnOnce(&DeviceCodeSession),
    {
        let mut session = self.start().await?;
        display(&session);
        self.poll(&mut session).await
    }

    /// Requesting: a non-2xx here is a misconfiguration and is not retried.
    pub async fn start(&self) -> AppResult<DeviceCodeSession> {
        let response = self.client.request_device_code().await?;
        let session = DeviceCodeSession::new(response);
        debug!(
            interval = ?session.interval,
            expires_in = ?session.expires_in,
            "Device code issued"
        );
        Ok(session)
    }

    /// Polling: sleep `interval`, ask once, classify, repeat until a terminal state.
    pub async fn poll(&self, session: &mut DeviceCodeSession) -> AppResult<AccessToken> {
        let deadline = session
            .deadline(self.expiry_grace)
            .ok_or(AppError::DeviceCodeExpired)?;

        loop {
            if session.is_expired(self.expiry_grace) {
                return Err(AppError::DeviceCodeExpired);
            }

            let wake = Instant::now()
                .checked_add(session.interval)
                .map_or(deadline, |next| next.min(deadline));
            tokio::time::sleep_until(wake).await;
            if wake >= deadline {
                return Err(AppError::DeviceCodeExpired);
            }

            let outcome = tokio::time::timeout_at(deadline, self.client.poll_token(session.device_code()))
                .await
                .map_err(|_| AppError::DeviceCodeExpired)??;

            match outcome {
                PollOutcome::Granted(token) => {
                    info!("Device authorization granted");
                    return Ok(token);
                }
                PollOutcome::Pending => {
                    debug!("Authorization pending");
                }
                PollOutcome::SlowDown => {
                    session.interval = session.interval.saturating_add(self.slow_down_increment);
                    debug!(interval = ?session.interval, "Provider asked to slow down");
                }
                PollOutcome::Expired => return Err(AppError::DeviceCodeExpired),
                PollOutcome::Denied(reason) => return Err(AppError::AuthorizationDenied(reason)),
            }
        }
    }
}
