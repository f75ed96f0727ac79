//! Provision, authenticate, publish.
//!
//! The three phases run strictly in sequence. A failure in the first two
//! aborts the run; failures while publishing are reported per secret.

use crate::azure::{build_provisioner, Backend, GitHubSecretData, ProvisionRequest, Provisioner};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::github::{
    DeviceCodeSession, DeviceFlowAuthenticator, DeviceGrantClient, GitHubDeviceGrant,
    GitHubSecretsClient, PublishReport, SecretPublisher, SecretStore,
};
use crate::token::AccessToken;
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// `owner/repo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSlug {
    pub owner: String,
    pub repo: String,
}

impl FromStr for RepoSlug {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
                Ok(Self {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                })
            }
            _ => Err(AppError::InvalidRepository(s.to_string())),
        }
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Operator choices for one run.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub subscription_id: String,
    pub repo: RepoSlug,
    /// Defaults to `gh-{owner}-{repo}`
    pub app_name: Option<String>,
    pub branch: String,
    /// `None` skips the role assignment
    pub role: Option<String>,
}

impl ConnectOptions {
    pub fn app_name(&self) -> String {
        self.app_name
            .clone()
            .unwrap_or_else(|| format!("gh-{}-{}", self.repo.owner, self.repo.repo))
    }

    pub fn provision_request(&self) -> ProvisionRequest {
        ProvisionRequest {
            app_name: self.app_name(),
            subscription_id: self.subscription_id.clone(),
            owner: self.repo.owner.clone(),
            repo: self.repo.repo.clone(),
            branch: self.branch.clone(),
            role: self.role.clone(),
        }
    }
}

#[derive(Debug)]
pub struct ConnectOutcome {
    pub identity: GitHubSecretData,
    pub report: PublishReport,
}

/// Run the three phases against explicit collaborators.
///
/// `open_store` receives the device-flow token and returns the secret store
/// to publish into.
pub async fn connect<C, S, F, D>(
    options: &ConnectOptions,
    provisioner: &dyn Provisioner,
    authenticator: &DeviceFlowAuthenticator<C>,
    open_store: F,
    display: D,
) -> AppResult<ConnectOutcome>
where
    C: DeviceGrantClient,
    S: SecretStore,
    F: FnOnce(AccessToken) -> AppResult<S>,
    D: FnOnce(&DeviceCodeSession),
{
    info!(repo = %options.repo, app_name = %options.app_name(), "Provisioning Azure identity");
    let identity = provisioner.provision(&options.provision_request()).await?;

    info!("Authenticating with GitHub...");
    let token = authenticator.authenticate(display).await?;

    info!("Setting GitHub secrets...");
    let publisher = SecretPublisher::new(open_store(token)?);
    let report = publisher.publish(&identity.secrets()).await?;

    Ok(ConnectOutcome { identity, report })
}

/// Operator-facing device-flow instructions.
pub fn print_instructions(session: &DeviceCodeSession) {
    println!();
    println!("To authenticate with GitHub, open {}", session.verification_uri);
    println!("and enter the code: {}", session.user_code);
    println!();
}

/// Wire the production components from configuration and run.
pub async fn run(config: &AppConfig, backend: Backend, options: &ConnectOptions) -> AppResult<ConnectOutcome> {
    let provisioner = build_provisioner(backend, config)?;
    let authenticator = DeviceFlowAuthenticator::new(GitHubDeviceGrant::new(config)?, &config.device_flow);
    let repo = options.repo.to_string();

    connect(
        options,
        provisioner.as_ref(),
        &authenticator,
        |token| GitHubSecretsClient::new(config, &repo, token),
        print_instructions,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceFlowConfig;
    use crate::github::PollOutcome;
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use crypto_box::SecretKey;
    use fedlink_types::{DeviceCodeResponse, GitHubPublicKey, GitHubSecretPayload};
    use rand::rngs::OsRng;
    use std::sync::{Arc, Mutex};

    struct FixedProvisioner {
        seen: Mutex<Option<ProvisionRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl Provisioner for FixedProvisioner {
        async fn provision(&self, request: &ProvisionRequest) -> AppResult<GitHubSecretData> {
            *self.seen.lock().unwrap() = Some(request.clone());
            if self.fail {
                return Err(AppError::InsufficientPermissions("403".to_string()));
            }
            Ok(GitHubSecretData {
                app_id: "client-1".to_string(),
                tenant_id: "tenant-1".to_string(),
                subscription_id: request.subscription_id.clone(),
            })
        }
    }

    /// Grants on the first poll.
    struct InstantGrant {
        requested: Mutex<u32>,
    }

    #[async_trait]
    impl DeviceGrantClient for InstantGrant {
        async fn request_device_code(&self) -> AppResult<DeviceCodeResponse> {
            *self.requested.lock().unwrap() += 1;
            Ok(DeviceCodeResponse {
                device_code: "dc".to_string(),
                user_code: "WXYZ-0000".to_string(),
                verification_uri: "https://github.com/login/device".to_string(),
                expires_in: 900,
                interval: 5,
            })
        }

        async fn poll_token(&self, _device_code: &str) -> AppResult<PollOutcome> {
            Ok(PollOutcome::Granted(AccessToken::new("gho_test")))
        }
    }

    struct RecordingStore {
        key: SecretKey,
        names: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SecretStore for RecordingStore {
        async fn public_key(&self) -> AppResult<GitHubPublicKey> {
            Ok(GitHubPublicKey {
                key_id: "k1".to_string(),
                key: BASE64.encode(self.key.public_key().as_bytes()),
            })
        }

        async fn put_secret(&self, name: &str, _payload: &GitHubSecretPayload) -> AppResult<()> {
            self.names.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn options(app_name: Option<&str>) -> ConnectOptions {
        ConnectOptions {
            subscription_id: "sub-1".to_string(),
            repo: "octo/widgets".parse().unwrap(),
            app_name: app_name.map(str::to_string),
            branch: "main".to_string(),
            role: Some("Contributor".to_string()),
        }
    }

    fn authenticator() -> DeviceFlowAuthenticator<InstantGrant> {
        DeviceFlowAuthenticator::new(
            InstantGrant {
                requested: Mutex::new(0),
            },
            &DeviceFlowConfig::default(),
        )
    }

    #[test]
    fn test_repo_slug_parsing() {
        let slug: RepoSlug = "octo/widgets".parse().unwrap();
        assert_eq!(slug.owner, "octo");
        assert_eq!(slug.repo, "widgets");
        assert_eq!(slug.to_string(), "octo/widgets");

        for bad in ["octo", "/widgets", "octo/", "a/b/c", ""] {
            assert!(
                matches!(bad.parse::<RepoSlug>(), Err(AppError::InvalidRepository(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_default_app_name() {
        assert_eq!(options(None).app_name(), "gh-octo-widgets");
        assert_eq!(options(Some("custom")).app_name(), "custom");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_runs_phases_in_order() {
        let provisioner = FixedProvisioner {
            seen: Mutex::new(None),
            fail: false,
        };
        let names = Arc::new(Mutex::new(Vec::new()));
        let store = RecordingStore {
            key: SecretKey::generate(&mut OsRng),
            names: names.clone(),
        };
        let mut shown = None;

        let outcome = connect(
            &options(None),
            &provisioner,
            &authenticator(),
            |token| {
                assert_eq!(token.secret(), "gho_test");
                Ok(store)
            },
            |session| shown = Some(session.user_code.clone()),
        )
        .await
        .unwrap();

        assert!(outcome.report.all_succeeded());
        assert_eq!(outcome.identity.app_id, "client-1");
        assert_eq!(shown.as_deref(), Some("WXYZ-0000"));
        assert_eq!(
            *names.lock().unwrap(),
            vec!["AZURE_CLIENT_ID", "AZURE_TENANT_ID", "AZURE_SUBSCRIPTION_ID"]
        );
        let seen = provisioner.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.app_name, "gh-octo-widgets");
        assert_eq!(seen.branch, "main");
    }

    #[tokio::test]
    async fn test_provisioning_failure_skips_login() {
        let provisioner = FixedProvisioner {
            seen: Mutex::new(None),
            fail: true,
        };
        let authenticator = authenticator();

        let result = connect(
            &options(None),
            &provisioner,
            &authenticator,
            |_token| -> AppResult<RecordingStore> { panic!("store opened after failed provisioning") },
            |_session| {},
        )
        .await;

        assert!(matches!(result, Err(AppError::InsufficientPermissions(_))));
    }
}
