//! Directory backend that drives the Azure CLI (`az`).
//!
//! Uses whatever account `az login` signed in with. Structured parameters
//! go through a temporary JSON file passed as `@path`, which avoids shell
//! quoting differences between platforms.

use crate::azure::process::{check_output, CommandRunner, JsonParamFile};
use crate::azure::provisioner::Directory;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use fedlink_types::{Application, FederatedIdentityCredential, ServicePrincipal};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Subset of `az account show`
#[derive(Debug, Deserialize)]
struct CliAccount {
    #[serde(rename = "tenantId", default)]
    tenant_id: Option<String>,
}

pub struct AzCliDirectory {
    runner: Arc<dyn CommandRunner>,
    program: PathBuf,
}

impl std::fmt::Debug for AzCliDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzCliDirectory")
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl AzCliDirectory {
    pub fn new(runner: Arc<dyn CommandRunner>, program: PathBuf) -> Self {
        Self { runner, program }
    }

    /// Run `az <args> --output json`, returning stdout.
    async fn run(&self, args: &[&str]) -> AppResult<String> {
        let mut args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        args.extend(["--output".to_string(), "json".to_string()]);

        let output = self.runner.run(&self.program, &args).await?;
        Ok(check_output("az", &args, output)?.stdout)
    }

    async fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> AppResult<T> {
        let stdout = self.run(args).await?;
        Ok(serde_json::from_str(&stdout)?)
    }
}

/// Matches nothing in a normal tenant; only the permission check matters.
const ACCESS_CHECK_FILTER: &str = "displayName eq 'fedlink-access-check'";

fn subscription_scope(subscription_id: &str) -> String {
    format!("/subscriptions/{}", subscription_id)
}

#[async_trait]
impl Directory for AzCliDirectory {
    async fn verify_access(&self) -> AppResult<()> {
        // Any application read goes through Graph's permission check
        self.run(&["ad", "app", "list", "--filter", ACCESS_CHECK_FILTER]).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn tenant_id(&self, subscription_id: &str) -> AppResult<Option<String>> {
        match self
            .run_json::<CliAccount>(&["account", "show", "--subscription", subscription_id])
            .await
        {
            Ok(account) => Ok(account.tenant_id),
            Err(AppError::Cli { stderr, .. })
                if stderr.contains("doesn't exist") || stderr.contains("not found") =>
            {
                debug!(%stderr, "Subscription not visible to the signed-in account");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn find_applications(&self, display_name: &str) -> AppResult<Vec<Application>> {
        self.run_json(&["ad", "app", "list", "--display-name", display_name])
            .await
    }

    async fn create_application(&self, display_name: &str) -> AppResult<Application> {
        self.run_json(&["ad", "app", "create", "--display-name", display_name])
            .await
    }

    async fn find_service_principal(&self, app_id: &str) -> AppResult<Option<ServicePrincipal>> {
        let filter = format!("appId eq '{}'", app_id);
        let principals: Vec<ServicePrincipal> =
            self.run_json(&["ad", "sp", "list", "--filter", &filter]).await?;
        Ok(principals.into_iter().next())
    }

    async fn create_service_principal(&self, app_id: &str) -> AppResult<ServicePrincipal> {
        self.run_json(&["ad", "sp", "create", "--id", app_id]).await
    }

    async fn list_federated_credentials(
        &self,
        application_id: &str,
    ) -> AppResult<Vec<FederatedIdentityCredential>> {
        self.run_json(&["ad", "app", "federated-credential", "list", "--id", application_id])
            .await
    }

    async fn create_federated_credential(
        &self,
        application_id: &str,
        credential: &FederatedIdentityCredential,
    ) -> AppResult<()> {
        // Removed when `params` drops, on success or error
        let params = JsonParamFile::write(credential)?;
        let parameters = params.cli_argument();
        self.run(&[
            "ad",
            "app",
            "federated-credential",
            "create",
            "--id",
            application_id,
            "--parameters",
            &parameters,
        ])
        .await?;
        Ok(())
    }

    async fn has_role_assignment(
        &self,
        subscription_id: &str,
        principal_id: &str,
        role: &str,
    ) -> AppResult<bool> {
        let scope = subscription_scope(subscription_id);
        let assignments: Vec<serde_json::Value> = self
            .run_json(&[
                "role",
                "assignment",
                "list",
                "--assignee",
                principal_id,
                "--role",
                role,
                "--scope",
                &scope,
            ])
            .await?;
        Ok(!assignments.is_empty())
    }

    async fn create_role_assignment(
        &self,
        subscription_id: &str,
        principal_id: &str,
        role: &str,
    ) -> AppResult<()> {
        let scope = subscription_scope(subscription_id);
        let result = self
            .run(&[
                "role",
                "assignment",
                "create",
                "--assignee-object-id",
                principal_id,
                "--assignee-principal-type",
                "ServicePrincipal",
                "--role",
                role,
                "--scope",
                &scope,
            ])
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(AppError::Cli { stderr, .. }) if stderr.contains("RoleAssignmentExists") => {
                debug!("Role assignment already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
