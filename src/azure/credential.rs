//! Bearer tokens for Microsoft Graph and Azure Resource Manager.

use crate::azure::process::{check_output, find_executable, CommandRunner};
use crate::config::{join_url, AppConfig, AzureConfig};
use crate::error::{AppError, AppResult};
use crate::http::{build_client, error_details, RetryPolicy};
use crate::token::AccessToken;
use async_trait::async_trait;
use fedlink_types::{CliAccessToken, ClientCredentialsToken};
use reqwest::{Client, Url};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// API a token is minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Graph,
    Management,
}

/// Resource identifiers (token audiences) derived from the configured endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIds {
    pub graph: String,
    pub management: String,
}

impl ResourceIds {
    pub fn from_config(config: &AzureConfig) -> AppResult<Self> {
        Ok(Self {
            graph: origin(&config.graph_url)?,
            management: origin(&config.management_url)?,
        })
    }

    pub fn get(&self, resource: Resource) -> &str {
        match resource {
            Resource::Graph => &self.graph,
            Resource::Management => &self.management,
        }
    }
}

fn origin(url: &str) -> AppResult<String> {
    let parsed = Url::parse(url).map_err(|e| AppError::invalid_config(format!("{url}: {e}")))?;
    Ok(parsed.origin().ascii_serialization())
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self, resource: Resource) -> AppResult<AccessToken>;
}

/// Tokens kept for the lifetime of one run.
#[derive(Default)]
struct TokenCache {
    tokens: Mutex<HashMap<Resource, AccessToken>>,
}

impl TokenCache {
    async fn get_or_fetch<F, Fut>(&self, resource: Resource, fetch: F) -> AppResult<AccessToken>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = AppResult<AccessToken>>,
    {
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(&resource) {
            return Ok(token.clone());
        }
        let token = fetch().await?;
        tokens.insert(resource, token.clone());
        Ok(token)
    }
}

/// OAuth client-credentials grant for a service principal with a secret.
pub struct ClientSecretCredential {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: Zeroizing<String>,
    resources: ResourceIds,
    retry: RetryPolicy,
    cache: TokenCache,
}

impl std::fmt::Debug for ClientSecretCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSecretCredential")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl ClientSecretCredential {
    pub fn new(
        config: &AppConfig,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
    ) -> AppResult<Self> {
        Ok(Self {
            http: build_client(&config.http)?,
            token_url: join_url(
                &config.azure.login_url,
                &format!("{}/oauth2/v2.0/token", tenant_id),
            ),
            client_id: client_id.to_string(),
            client_secret: Zeroizing::new(client_secret.to_string()),
            resources: ResourceIds::from_config(&config.azure)?,
            retry: RetryPolicy::from_config(&config.http),
            cache: TokenCache::default(),
        })
    }

    async fn fetch(&self, resource: Resource) -> AppResult<AccessToken> {
        let scope = format!("{}/.default", self.resources.get(resource));
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", scope.as_str()),
        ];

        let response = self
            .retry
            .send("client credentials token", || self.http.post(&self.token_url).form(&params))
            .await?;

        if !response.status().is_success() {
            let (status, message) = error_details(response).await;
            return Err(AppError::MissingCredentials(format!(
                "token request for {scope} failed with {status}: {message}"
            )));
        }

        let token: ClientCredentialsToken = response.json().await?;
        debug!(?resource, expires_in = ?token.expires_in, "Acquired client credentials token");
        Ok(AccessToken::new(token.access_token))
    }
}

#[async_trait]
impl TokenSource for ClientSecretCredential {
    async fn token(&self, resource: Resource) -> AppResult<AccessToken> {
        self.cache.get_or_fetch(resource, || self.fetch(resource)).await
    }
}

/// Borrows the signed-in Azure CLI session.
pub struct AzCliCredential {
    runner: Arc<dyn CommandRunner>,
    program: PathBuf,
    resources: ResourceIds,
    cache: TokenCache,
}

impl AzCliCredential {
    pub fn new(runner: Arc<dyn CommandRunner>, program: PathBuf, resources: ResourceIds) -> Self {
        Self {
            runner,
            program,
            resources,
            cache: TokenCache::default(),
        }
    }

    async fn fetch(&self, resource: Resource) -> AppResult<AccessToken> {
        let args: Vec<String> = [
            "account",
            "get-access-token",
            "--resource",
            self.resources.get(resource),
            "--output",
            "json",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let output = self.runner.run(&self.program, &args).await?;
        let output = check_output("az", &args, output).map_err(|e| match e {
            AppError::Cli { stderr, .. } => {
                AppError::MissingCredentials(format!("az account get-access-token failed: {stderr}. Run `az login` first"))
            }
            other => other,
        })?;

        let token: CliAccessToken = serde_json::from_str(&output.stdout)?;
        debug!(?resource, tenant = ?token.tenant, "Acquired Azure CLI token");
        Ok(AccessToken::new(token.access_token))
    }
}

#[async_trait]
impl TokenSource for AzCliCredential {
    async fn token(&self, resource: Resource) -> AppResult<AccessToken> {
        self.cache.get_or_fetch(resource, || self.fetch(resource)).await
    }
}

/// Pick a token source: a configured service principal wins, otherwise the
/// Azure CLI session.
pub fn token_source_from_config(
    config: &AppConfig,
    runner: Arc<dyn CommandRunner>,
) -> AppResult<Box<dyn TokenSource>> {
    let azure = &config.azure;
    match (&azure.tenant_id, &azure.client_id, &azure.client_secret) {
        (Some(tenant), Some(client_id), Some(secret)) => {
            info!("Authenticating to Azure with client credentials for {}", client_id);
            Ok(Box::new(ClientSecretCredential::new(config, tenant, client_id, secret)?))
        }
        (None, None, None) => {
            let program = find_executable(&azure.cli_program).ok_or_else(|| {
                AppError::MissingCredentials(format!(
                    "'{}' was not found on PATH and no client secret is configured",
                    azure.cli_program
                ))
            })?;
            info!("Authenticating to Azure with the Azure CLI session");
            Ok(Box::new(AzCliCredential::new(
                runner,
                program,
                ResourceIds::from_config(azure)?,
            )))
        }
        _ => Err(AppError::MissingCredentials(
            "azure.tenant_id, azure.client_id and azure.client_secret must be set together".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::azure::process::ProcessOutput;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    struct RecordingRunner {
        calls: StdMutex<Vec<Vec<String>>>,
        output: ProcessOutput,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, _program: &Path, args: &[String]) -> AppResult<ProcessOutput> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(self.output.clone())
        }
    }

    fn resources() -> ResourceIds {
        ResourceIds::from_config(&AzureConfig::default()).unwrap()
    }

    #[test]
    fn test_resource_ids_strip_api_version() {
        let ids = resources();
        assert_eq!(ids.graph, "https://graph.microsoft.com");
        assert_eq!(ids.management, "https://management.azure.com");
    }

    #[tokio::test]
    async fn test_cli_token_is_cached_per_resource() {
        let runner = Arc::new(RecordingRunner {
            calls: StdMutex::new(Vec::new()),
            output: ProcessOutput {
                exit_code: Some(0),
                stdout: r#"{"accessToken":"eyJ0eXAi","tenant":"t-1"}"#.to_string(),
                stderr: String::new(),
            },
        });
        let credential = AzCliCredential::new(runner.clone(), PathBuf::from("az"), resources());

        let first = credential.token(Resource::Graph).await.unwrap();
        let second = credential.token(Resource::Graph).await.unwrap();
        credential.token(Resource::Management).await.unwrap();

        assert_eq!(first.secret(), "eyJ0eXAi");
        assert_eq!(first, second);
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][3], "https://graph.microsoft.com");
        assert_eq!(calls[1][3], "https://management.azure.com");
    }

    #[tokio::test]
    async fn test_cli_not_logged_in() {
        let runner = Arc::new(RecordingRunner {
            calls: StdMutex::new(Vec::new()),
            output: ProcessOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "ERROR: Please run 'az login' to setup account.".to_string(),
            },
        });
        let credential = AzCliCredential::new(runner, PathBuf::from("az"), resources());

        let result = credential.token(Resource::Graph).await;
        assert!(matches!(result, Err(AppError::MissingCredentials(_))));
    }

    #[test]
    fn test_partial_client_secret_config_is_rejected() {
        let mut config = AppConfig::default();
        config.azure.client_id = Some("id".to_string());

        let result = token_source_from_config(
            &config,
            Arc::new(crate::azure::process::TokioCommandRunner),
        );
        assert!(matches!(result, Err(AppError::MissingCredentials(_))));
    }
}
