//! GitHub Actions repository secrets.
//!
//! The publisher fetches the repository public key once per run, seals each
//! value with it and PUTs the result. A rejected PUT is recorded and the
//! remaining secrets are still attempted.

use crate::config::{join_url, AppConfig};
use crate::error::{AppError, AppResult};
use crate::github::crypto::{parse_public_key_base64, seal_base64};
use crate::http::{build_client, error_details, RetryPolicy};
use crate::token::AccessToken;
use async_trait::async_trait;
use fedlink_types::{GitHubPublicKey, GitHubSecretPayload};
use reqwest::{header::ACCEPT, Client, RequestBuilder};
use tracing::{info, warn};

const GITHUB_API_VERSION: &str = "2022-11-28";

/// Write side of a CI secret store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Current public key for sealing. Not cached.
    async fn public_key(&self) -> AppResult<GitHubPublicKey>;

    /// Create or overwrite one secret.
    async fn put_secret(&self, name: &str, payload: &GitHubSecretPayload) -> AppResult<()>;
}

/// Client for `/repos/{owner}/{repo}/actions/secrets`.
pub struct GitHubSecretsClient {
    http: Client,
    base_url: String,
    token: AccessToken,
    retry: RetryPolicy,
}

impl std::fmt::Debug for GitHubSecretsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubSecretsClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GitHubSecretsClient {
    /// `repo` is the full `owner/repo` slug.
    pub fn new(config: &AppConfig, repo: &str, token: AccessToken) -> AppResult<Self> {
        Ok(Self {
            http: build_client(&config.http)?,
            base_url: join_url(&config.github.api_url, &format!("repos/{}/actions/secrets", repo)),
            token,
            retry: RetryPolicy::from_config(&config.http),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(self.token.secret())
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
    }
}

#[async_trait]
impl SecretStore for GitHubSecretsClient {
    async fn public_key(&self) -> AppResult<GitHubPublicKey> {
        let url = format!("{}/public-key", self.base_url);
        let response = self
            .retry
            .send("fetch public key", || self.authorized(self.http.get(&url)))
            .await?;

        if !response.status().is_success() {
            let (status, message) = error_details(response).await;
            return Err(AppError::api("GitHub", status.as_u16(), message));
        }

        Ok(response.json().await?)
    }

    async fn put_secret(&self, name: &str, payload: &GitHubSecretPayload) -> AppResult<()> {
        let url = format!("{}/{}", self.base_url, name);
        let response = self
            .retry
            .send("put secret", || self.authorized(self.http.put(&url)).json(payload))
            .await?;

        if !response.status().is_success() {
            let (status, message) = error_details(response).await;
            return Err(AppError::api("GitHub", status.as_u16(), message));
        }

        Ok(())
    }
}

/// Why one secret was not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretFailure {
    /// HTTP status when the store answered, `None` for transport or sealing failures
    pub status: Option<u16>,
    pub message: String,
}

impl From<AppError> for SecretFailure {
    fn from(error: AppError) -> Self {
        match error {
            AppError::Api { status, message, .. } => Self {
                status: Some(status),
                message,
            },
            other => Self {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

/// Result for a single named secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretOutcome {
    pub name: String,
    pub result: Result<(), SecretFailure>,
}

/// Per-secret results of one publish run, in input order.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub outcomes: Vec<SecretOutcome>,
}

impl PublishReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| o.name.as_str())
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &SecretFailure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.name.as_str(), e)))
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// GetPublicKey -> Seal -> Put, for every secret.
pub struct SecretPublisher<S> {
    store: S,
}

impl<S: SecretStore> SecretPublisher<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Publish `(name, value)` pairs in order.
    ///
    /// Fails as a whole only when the public key cannot be fetched or parsed.
    pub async fn publish(&self, secrets: &[(&str, &str)]) -> AppResult<PublishReport> {
        let key = self.store.public_key().await?;
        let recipient = parse_public_key_base64(&key.key)?;

        let mut report = PublishReport::default();
        for (name, value) in secrets {
            let result = match seal_base64(&recipient, value) {
                Ok(encrypted_value) => {
                    let payload = GitHubSecretPayload {
                        encrypted_value,
                        key_id: key.key_id.clone(),
                    };
                    self.store.put_secret(name, &payload).await.map_err(SecretFailure::from)
                }
                Err(e) => Err(SecretFailure::from(AppError::Crypto(e))),
            };

            match &result {
                Ok(()) => info!("Secret '{}' set successfully", name),
                Err(failure) => warn!(
                    status = ?failure.status,
                    "Failed to set secret '{}': {}",
                    name,
                    failure.message
                ),
            }

            report.outcomes.push(SecretOutcome {
                name: name.to_string(),
                result,
            });
        }

        Ok(report)
    }
}
