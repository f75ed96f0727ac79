//! Idempotent reconciliation of the Azure side of the trust relationship.
//!
//! Every step reads current directory state before mutating it, so a run
//! that failed half-way can simply be repeated. Find-then-create is not
//! atomic: two concurrent runs for the same application name can both
//! create one. The tool is meant for a single operator and does not guard
//! against that race.

use crate::config::GitHubConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use fedlink_types::{Application, FederatedIdentityCredential, ServicePrincipal};
use std::collections::HashSet;
use tracing::{info, warn};

/// Name of the credential trusting pull request workflows
pub const PULL_REQUEST_CREDENTIAL: &str = "gh-pr";

/// Name of the credential trusting pushes to `branch`
pub fn branch_credential_name(branch: &str) -> String {
    format!("gh-{}", branch)
}

pub fn branch_subject(owner: &str, repo: &str, branch: &str) -> String {
    format!("repo:{}/{}:ref:refs/heads/{}", owner, repo, branch)
}

pub fn pull_request_subject(owner: &str, repo: &str) -> String {
    format!("repo:{}/{}:pull_request", owner, repo)
}

/// What the provisioning step hands to the secret publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitHubSecretData {
    pub app_id: String,
    pub tenant_id: String,
    pub subscription_id: String,
}

impl GitHubSecretData {
    /// The three repository secrets `azure/login` expects, in publish order.
    pub fn secrets(&self) -> [(&'static str, &str); 3] {
        [
            ("AZURE_CLIENT_ID", self.app_id.as_str()),
            ("AZURE_TENANT_ID", self.tenant_id.as_str()),
            ("AZURE_SUBSCRIPTION_ID", self.subscription_id.as_str()),
        ]
    }
}

/// Inputs for one provisioning run.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub app_name: String,
    pub subscription_id: String,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Role granted at subscription scope; `None` skips the step
    pub role: Option<String>,
}

/// Issuer and audience stamped on every federated credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FederationSettings {
    pub issuer: String,
    pub audience: String,
}

impl FederationSettings {
    pub fn from_github(config: &GitHubConfig) -> Self {
        Self {
            issuer: config.oidc_issuer.clone(),
            audience: config.token_audience.clone(),
        }
    }

    /// The two credentials a repository needs, branch first.
    pub fn required_credentials(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> [FederatedIdentityCredential; 2] {
        [
            self.credential(branch_credential_name(branch), branch_subject(owner, repo, branch)),
            self.credential(PULL_REQUEST_CREDENTIAL.to_string(), pull_request_subject(owner, repo)),
        ]
    }

    fn credential(&self, name: String, subject: String) -> FederatedIdentityCredential {
        FederatedIdentityCredential {
            name,
            issuer: self.issuer.clone(),
            subject,
            audiences: vec![self.audience.clone()],
            description: None,
        }
    }
}

impl Default for FederationSettings {
    fn default() -> Self {
        Self::from_github(&GitHubConfig::default())
    }
}

/// Capability: turn a request into provisioned identifiers.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> AppResult<GitHubSecretData>;
}

/// The directory operations the provisioner needs, nothing more.
///
/// Lookups return `Ok(None)` / empty for absence; only real failures are
/// errors. A 403 must surface as [`AppError::InsufficientPermissions`].
#[async_trait]
pub trait Directory: Send + Sync {
    /// Fail early when the caller cannot manage applications.
    async fn verify_access(&self) -> AppResult<()>;

    async fn tenant_id(&self, subscription_id: &str) -> AppResult<Option<String>>;

    async fn find_applications(&self, display_name: &str) -> AppResult<Vec<Application>>;

    async fn create_application(&self, display_name: &str) -> AppResult<Application>;

    async fn find_service_principal(&self, app_id: &str) -> AppResult<Option<ServicePrincipal>>;

    async fn create_service_principal(&self, app_id: &str) -> AppResult<ServicePrincipal>;

    /// `application_id` is the directory object id, not the client id.
    async fn list_federated_credentials(
        &self,
        application_id: &str,
    ) -> AppResult<Vec<FederatedIdentityCredential>>;

    async fn create_federated_credential(
        &self,
        application_id: &str,
        credential: &FederatedIdentityCredential,
    ) -> AppResult<()>;

    async fn has_role_assignment(
        &self,
        subscription_id: &str,
        principal_id: &str,
        role: &str,
    ) -> AppResult<bool>;

    /// Must succeed if the assignment appeared in the meantime.
    async fn create_role_assignment(
        &self,
        subscription_id: &str,
        principal_id: &str,
        role: &str,
    ) -> AppResult<()>;
}

/// Reconciles application, service principal, federated credentials and
/// role assignment against any [`Directory`].
pub struct IdentityProvisioner<D> {
    directory: D,
    federation: FederationSettings,
}

impl<D: Directory> IdentityProvisioner<D> {
    pub fn new(directory: D, federation: FederationSettings) -> Self {
        Self {
            directory,
            federation,
        }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// Reuse the application with this exact display name, or create it.
    pub async fn find_or_create_application(&self, display_name: &str) -> AppResult<Application> {
        let mut matches: Vec<Application> = self
            .directory
            .find_applications(display_name)
            .await?
            .into_iter()
            .filter(|app| app.display_name == display_name)
            .collect();

        if matches.len() > 1 {
            // The directory gives no ordering guarantee here
            warn!(
                count = matches.len(),
                app_id = %matches[0].app_id,
                "Several applications are named '{}', using the first one returned",
                display_name
            );
        }

        if matches.is_empty() {
            info!("Creating Azure AD application '{}'...", display_name);
            let created = self.directory.create_application(display_name).await?;
            info!("Application created with App ID: {}", created.app_id);
            return Ok(created);
        }

        let existing = matches.swap_remove(0);
        info!(
            "Reusing existing application '{}' (App ID: {})",
            display_name, existing.app_id
        );
        Ok(existing)
    }

    pub async fn ensure_service_principal(&self, app_id: &str) -> AppResult<ServicePrincipal> {
        if let Some(existing) = self.directory.find_service_principal(app_id).await? {
            info!("Service principal already exists");
            return Ok(existing);
        }

        info!("Creating service principal...");
        let created = self.directory.create_service_principal(app_id).await?;
        info!("Service principal created");
        Ok(created)
    }

    /// Create whichever of the two credentials is missing, by name.
    ///
    /// Returns the names created in this call.
    pub async fn ensure_federated_credentials(
        &self,
        application_id: &str,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> AppResult<Vec<String>> {
        let existing: HashSet<String> = self
            .directory
            .list_federated_credentials(application_id)
            .await?
            .into_iter()
            .map(|c| c.name)
            .collect();

        let mut created = Vec::new();
        for credential in self.federation.required_credentials(owner, repo, branch) {
            if existing.contains(&credential.name) {
                info!(
                    subject = %credential.subject,
                    "Federated identity credential '{}' already exists",
                    credential.name
                );
                continue;
            }

            info!(
                subject = %credential.subject,
                "Adding federated identity credential '{}'...",
                credential.name
            );
            self.directory
                .create_federated_credential(application_id, &credential)
                .await?;
            created.push(credential.name);
        }

        Ok(created)
    }

    pub async fn ensure_role_assignment(
        &self,
        subscription_id: &str,
        principal_id: &str,
        role: &str,
    ) -> AppResult<()> {
        if self
            .directory
            .has_role_assignment(subscription_id, principal_id, role)
            .await?
        {
            info!("Role '{}' already assigned at subscription scope", role);
            return Ok(());
        }

        info!("Assigning role '{}' at subscription scope...", role);
        self.directory
            .create_role_assignment(subscription_id, principal_id, role)
            .await
    }
}

#[async_trait]
impl<D: Directory> Provisioner for IdentityProvisioner<D> {
    async fn provision(&self, request: &ProvisionRequest) -> AppResult<GitHubSecretData> {
        info!("Verifying directory permissions...");
        self.directory.verify_access().await?;

        let tenant_id = self
            .directory
            .tenant_id(&request.subscription_id)
            .await?
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::MissingTenant(request.subscription_id.clone()))?;

        let application = self.find_or_create_application(&request.app_name).await?;
        let principal = self.ensure_service_principal(&application.app_id).await?;

        self.ensure_federated_credentials(
            &application.id,
            &request.owner,
            &request.repo,
            &request.branch,
        )
        .await?;

        if let Some(role) = &request.role {
            self.ensure_role_assignment(&request.subscription_id, &principal.id, role)
                .await?;
        }

        Ok(GitHubSecretData {
            app_id: application.app_id,
            tenant_id,
            subscription_id: request.subscription_id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        applications: Vec<Application>,
        principals: Vec<ServicePrincipal>,
        credentials: HashMap<String, Vec<FederatedIdentityCredential>>,
        roles: HashSet<(String, String, String)>,
        calls: HashMap<&'static str, u32>,
        fail_credential: Option<String>,
    }

    /// In-memory directory with call counting and one-shot failure injection.
    struct FakeDirectory {
        tenant: Option<String>,
        deny_access: bool,
        state: Mutex<State>,
    }

    impl FakeDirectory {
        fn new() -> Self {
            Self {
                tenant: Some("tenant-1".to_string()),
                deny_access: false,
                state: Mutex::new(State::default()),
            }
        }

        fn with_application(self, id: &str, app_id: &str, name: &str) -> Self {
            self.state.lock().unwrap().applications.push(Application {
                id: id.to_string(),
                app_id: app_id.to_string(),
                display_name: name.to_string(),
            });
            self
        }

        fn calls(&self, op: &'static str) -> u32 {
            self.state.lock().unwrap().calls.get(op).copied().unwrap_or(0)
        }

        fn credential_names(&self, application_id: &str) -> Vec<String> {
            self.state
                .lock()
                .unwrap()
                .credentials
                .get(application_id)
                .map(|c| c.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default()
        }

        fn record(&self, op: &'static str) {
            *self.state.lock().unwrap().calls.entry(op).or_insert(0) += 1;
        }
    }

    #[async_trait]
    impl Directory for FakeDirectory {
        async fn verify_access(&self) -> AppResult<()> {
            if self.deny_access {
                return Err(AppError::InsufficientPermissions("403 Forbidden".to_string()));
            }
            Ok(())
        }

        async fn tenant_id(&self, _subscription_id: &str) -> AppResult<Option<String>> {
            Ok(self.tenant.clone())
        }

        async fn find_applications(&self, display_name: &str) -> AppResult<Vec<Application>> {
            self.record("find_applications");
            Ok(self
                .state
                .lock()
                .unwrap()
                .applications
                .iter()
                .filter(|a| a.display_name == display_name)
                .cloned()
                .collect())
        }

        async fn create_application(&self, display_name: &str) -> AppResult<Application> {
            self.record("create_application");
            let mut state = self.state.lock().unwrap();
            let n = state.applications.len() + 1;
            let app = Application {
                id: format!("obj-{}", n),
                app_id: format!("client-{}", n),
                display_name: display_name.to_string(),
            };
            state.applications.push(app.clone());
            Ok(app)
        }

        async fn find_service_principal(&self, app_id: &str) -> AppResult<Option<ServicePrincipal>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .principals
                .iter()
                .find(|sp| sp.app_id == app_id)
                .cloned())
        }

        async fn create_service_principal(&self, app_id: &str) -> AppResult<ServicePrincipal> {
            self.record("create_service_principal");
            let sp = ServicePrincipal {
                id: format!("sp-{}", app_id),
                app_id: app_id.to_string(),
            };
            self.state.lock().unwrap().principals.push(sp.clone());
            Ok(sp)
        }

        async fn list_federated_credentials(
            &self,
            application_id: &str,
        ) -> AppResult<Vec<FederatedIdentityCredential>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .credentials
                .get(application_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn create_federated_credential(
            &self,
            application_id: &str,
            credential: &FederatedIdentityCredential,
        ) -> AppResult<()> {
            self.record("create_federated_credential");
            let mut state = self.state.lock().unwrap();
            if state.fail_credential.as_deref() == Some(credential.name.as_str()) {
                state.fail_credential = None;
                return Err(AppError::api("Microsoft Graph", 503, "ServiceUnavailable"));
            }
            let list = state.credentials.entry(application_id.to_string()).or_default();
            assert!(
                list.iter().all(|c| c.name != credential.name),
                "duplicate credential {}",
                credential.name
            );
            list.push(credential.clone());
            Ok(())
        }

        async fn has_role_assignment(
            &self,
            subscription_id: &str,
            principal_id: &str,
            role: &str,
        ) -> AppResult<bool> {
            let key = (subscription_id.to_string(), principal_id.to_string(), role.to_string());
            Ok(self.state.lock().unwrap().roles.contains(&key))
        }

        async fn create_role_assignment(
            &self,
            subscription_id: &str,
            principal_id: &str,
            role: &str,
        ) -> AppResult<()> {
            self.record("create_role_assignment");
            let key = (subscription_id.to_string(), principal_id.to_string(), role.to_string());
            self.state.lock().unwrap().roles.insert(key);
            Ok(())
        }
    }

    fn request(role: Option<&str>) -> ProvisionRequest {
        ProvisionRequest {
            app_name: "gh-org-repo".to_string(),
            subscription_id: "sub-1".to_string(),
            owner: "org".to_string(),
            repo: "repo".to_string(),
            branch: "main".to_string(),
            role: role.map(str::to_string),
        }
    }

    fn provisioner(directory: FakeDirectory) -> IdentityProvisioner<FakeDirectory> {
        IdentityProvisioner::new(directory, FederationSettings::default())
    }

    #[tokio::test]
    async fn test_provision_is_idempotent() {
        let provisioner = provisioner(FakeDirectory::new());

        let first = provisioner.provision(&request(Some("Contributor"))).await.unwrap();
        let second = provisioner.provision(&request(Some("Contributor"))).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.tenant_id, "tenant-1");
        assert_eq!(first.subscription_id, "sub-1");

        let directory = provisioner.directory();
        assert_eq!(directory.calls("create_application"), 1);
        assert_eq!(directory.calls("create_service_principal"), 1);
        assert_eq!(directory.calls("create_federated_credential"), 2);
        assert_eq!(directory.calls("create_role_assignment"), 1);
        assert_eq!(directory.credential_names("obj-1"), vec!["gh-main", "gh-pr"]);
    }

    #[tokio::test]
    async fn test_existing_application_is_not_recreated() {
        let directory = FakeDirectory::new().with_application("obj-9", "client-9", "gh-org-repo");
        let provisioner = provisioner(directory);

        let data = provisioner.provision(&request(None)).await.unwrap();

        assert_eq!(data.app_id, "client-9");
        assert_eq!(provisioner.directory().calls("create_application"), 0);
        assert_eq!(provisioner.directory().calls("find_applications"), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_name_uses_first_match() {
        let directory = FakeDirectory::new()
            .with_application("obj-a", "client-a", "gh-org-repo")
            .with_application("obj-b", "client-b", "gh-org-repo");
        let provisioner = provisioner(directory);

        let app = provisioner.find_or_create_application("gh-org-repo").await.unwrap();
        assert_eq!(app.app_id, "client-a");
    }

    #[tokio::test]
    async fn test_credentials_carry_expected_subjects() {
        let provisioner = provisioner(FakeDirectory::new());
        provisioner.provision(&request(None)).await.unwrap();

        let state = provisioner.directory().state.lock().unwrap();
        let creds = &state.credentials["obj-1"];
        assert_eq!(creds[0].subject, "repo:org/repo:ref:refs/heads/main");
        assert_eq!(creds[1].subject, "repo:org/repo:pull_request");
        for cred in creds {
            assert_eq!(cred.issuer, "https://token.actions.githubusercontent.com");
            assert_eq!(cred.audiences, vec!["api://AzureADTokenExchange".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_rerun_completes_after_partial_failure() {
        let directory = FakeDirectory::new();
        directory.state.lock().unwrap().fail_credential = Some("gh-pr".to_string());
        let provisioner = provisioner(directory);

        assert!(provisioner.provision(&request(None)).await.is_err());
        assert_eq!(provisioner.directory().credential_names("obj-1"), vec!["gh-main"]);

        provisioner.provision(&request(None)).await.unwrap();
        assert_eq!(provisioner.directory().credential_names("obj-1"), vec!["gh-main", "gh-pr"]);
        assert_eq!(provisioner.directory().calls("create_application"), 1);
    }

    #[tokio::test]
    async fn test_new_branch_adds_only_its_credential() {
        let provisioner = provisioner(FakeDirectory::new());
        provisioner.provision(&request(None)).await.unwrap();

        let created = provisioner
            .ensure_federated_credentials("obj-1", "org", "repo", "release")
            .await
            .unwrap();

        assert_eq!(created, vec!["gh-release".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_tenant_is_fatal_before_mutation() {
        let mut directory = FakeDirectory::new();
        directory.tenant = None;
        let provisioner = provisioner(directory);

        let result = provisioner.provision(&request(None)).await;

        assert!(matches!(result, Err(AppError::MissingTenant(ref sub)) if sub == "sub-1"));
        assert_eq!(provisioner.directory().calls("create_application"), 0);
    }

    #[tokio::test]
    async fn test_permission_failure_is_distinct() {
        let mut directory = FakeDirectory::new();
        directory.deny_access = true;
        let provisioner = provisioner(directory);

        let result = provisioner.provision(&request(None)).await;

        assert!(matches!(result, Err(AppError::InsufficientPermissions(_))));
        assert_eq!(provisioner.directory().calls("find_applications"), 0);
    }

    #[tokio::test]
    async fn test_role_step_skipped_without_role() {
        let provisioner = provisioner(FakeDirectory::new());
        provisioner.provision(&request(None)).await.unwrap();
        assert_eq!(provisioner.directory().calls("create_role_assignment"), 0);
    }

    #[test]
    fn test_secret_names() {
        let data = GitHubSecretData {
            app_id: "a".to_string(),
            tenant_id: "t".to_string(),
            subscription_id: "s".to_string(),
        };
        assert_eq!(
            data.secrets(),
            [
                ("AZURE_CLIENT_ID", "a"),
                ("AZURE_TENANT_ID", "t"),
                ("AZURE_SUBSCRIPTION_ID", "s")
            ]
        );
    }

    proptest! {
        #[test]
        fn subjects_follow_github_claim_format(
            owner in "[A-Za-z0-9][A-Za-z0-9-]{0,38}",
            repo in "[A-Za-z0-9._-]{1,100}",
            branch in "[A-Za-z0-9._/-]{1,60}",
        ) {
            let [branch_cred, pr_cred] =
                FederationSettings::default().required_credentials(&owner, &repo, &branch);

            prop_assert_eq!(branch_cred.subject, format!("repo:{}/{}:ref:refs/heads/{}", owner, repo, branch));
            prop_assert_eq!(pr_cred.subject, format!("repo:{}/{}:pull_request", owner, repo));
            prop_assert_eq!(branch_cred.name, format!("gh-{}", branch));
            prop_assert_eq!(pr_cred.name, "gh-pr");
        }
    }
}
