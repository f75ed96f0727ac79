//! REST backend: Microsoft Graph for directory objects, Azure Resource
//! Manager for the subscription and role assignments.

use crate::azure::credential::{Resource, TokenSource};
use crate::azure::provisioner::Directory;
use crate::config::{join_url, AppConfig};
use crate::error::{AppError, AppResult};
use crate::http::{build_client, error_details, RetryPolicy};
use async_trait::async_trait;
use fedlink_types::{
    Application, FederatedIdentityCredential, NewApplication, NewServicePrincipal, ODataList,
    RoleAssignment, RoleAssignmentProperties, RoleDefinition, ServicePrincipal, Subscription,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";
const AUTHORIZATION_API_VERSION: &str = "2022-04-01";

/// Escape a value for an OData string literal.
pub fn odata_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Directory backed by the Graph and ARM REST APIs.
pub struct GraphDirectory {
    http: Client,
    graph_url: String,
    management_url: String,
    tokens: Box<dyn TokenSource>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for GraphDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDirectory")
            .field("graph_url", &self.graph_url)
            .field("management_url", &self.management_url)
            .finish_non_exhaustive()
    }
}

impl GraphDirectory {
    pub fn new(config: &AppConfig, tokens: Box<dyn TokenSource>) -> AppResult<Self> {
        Ok(Self {
            http: build_client(&config.http)?,
            graph_url: config.azure.graph_url.trim_end_matches('/').to_string(),
            management_url: config.azure.management_url.trim_end_matches('/').to_string(),
            tokens,
            retry: RetryPolicy::from_config(&config.http),
        })
    }

    fn graph(&self, path: &str) -> String {
        join_url(&self.graph_url, path)
    }

    fn arm(&self, path: &str) -> String {
        join_url(&self.management_url, path)
    }

    /// Send with a bearer token for `resource` and transient-failure retry.
    async fn send<F>(&self, resource: Resource, operation: &str, build: F) -> AppResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.tokens.token(resource).await?;
        self.retry
            .send(operation, || build(&self.http).bearer_auth(token.secret()))
            .await
    }

    /// Pass 2xx through; 403 becomes `InsufficientPermissions`.
    async fn check(resource: Resource, response: Response) -> AppResult<Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let (status, message) = error_details(response).await;
        if status == StatusCode::FORBIDDEN {
            return Err(AppError::InsufficientPermissions(message));
        }
        Err(AppError::api(service_name(resource), status.as_u16(), message))
    }

    async fn json<T: DeserializeOwned>(
        &self,
        resource: Resource,
        operation: &str,
        build: impl Fn(&Client) -> RequestBuilder,
    ) -> AppResult<T> {
        let response = self.send(resource, operation, build).await?;
        Ok(Self::check(resource, response).await?.json().await?)
    }

    /// GET that maps 404 to `None`.
    async fn find<T: DeserializeOwned>(
        &self,
        resource: Resource,
        operation: &str,
        url: &str,
    ) -> AppResult<Option<T>> {
        let response = self.send(resource, operation, |http| http.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(operation, "Not found");
            return Ok(None);
        }
        Ok(Some(Self::check(resource, response).await?.json().await?))
    }

    /// Follow `@odata.nextLink` until the collection is exhausted.
    async fn list_all<T: DeserializeOwned>(
        &self,
        operation: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> AppResult<Vec<T>> {
        let mut items = Vec::new();
        let mut page: ODataList<T> = self
            .json(Resource::Graph, operation, |http| http.get(url).query(query))
            .await?;

        loop {
            items.append(&mut page.value);
            let Some(next) = page.next_link.take() else {
                return Ok(items);
            };
            debug!(operation, "Fetching next page");
            page = self.json(Resource::Graph, operation, |http| http.get(&next)).await?;
        }
    }

    /// Retry while a freshly created object has not replicated yet.
    async fn while_replicating<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match attempt_fn().await {
                Err(e) if is_replication_lag(&e) && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(operation, attempt = attempt + 1, ?delay, error = %e, "Waiting for directory replication");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn role_definition_id(&self, subscription_id: &str, role: &str) -> AppResult<String> {
        let url = self.arm(&format!(
            "subscriptions/{}/providers/Microsoft.Authorization/roleDefinitions",
            subscription_id
        ));
        let filter = format!("roleName eq {}", odata_quote(role));
        let definitions: ODataList<RoleDefinition> = self
            .json(Resource::Management, "role definitions", |http| {
                http.get(&url).query(&[
                    ("api-version", AUTHORIZATION_API_VERSION),
                    ("$filter", filter.as_str()),
                ])
            })
            .await?;

        definitions
            .value
            .into_iter()
            .next()
            .map(|d| d.id)
            .ok_or_else(|| AppError::invalid_config(format!("role '{}' does not exist", role)))
    }
}

fn service_name(resource: Resource) -> &'static str {
    match resource {
        Resource::Graph => "Microsoft Graph",
        Resource::Management => "Azure Resource Manager",
    }
}

fn is_replication_lag(error: &AppError) -> bool {
    match error {
        AppError::Api { status: 404, .. } => true,
        AppError::Api { status: 400, message, .. } => message.contains("PrincipalNotFound"),
        _ => false,
    }
}

/// Role definition ids differ by scope prefix; the trailing GUID does not.
fn same_role_definition(a: &str, b: &str) -> bool {
    let last = |id: &str| id.rsplit('/').next().unwrap_or_default().to_ascii_lowercase();
    last(a) == last(b)
}

#[async_trait]
impl Directory for GraphDirectory {
    #[instrument(skip(self))]
    async fn verify_access(&self) -> AppResult<()> {
        let url = self.graph("applications");
        let response = self
            .send(Resource::Graph, "verify access", |http| http.get(&url).query(&[("$top", "1")]))
            .await?;
        Self::check(Resource::Graph, response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn tenant_id(&self, subscription_id: &str) -> AppResult<Option<String>> {
        let url = self.arm(&format!(
            "subscriptions/{}?api-version={}",
            subscription_id, SUBSCRIPTIONS_API_VERSION
        ));
        let subscription: Option<Subscription> =
            self.find(Resource::Management, "subscription", &url).await?;
        Ok(subscription.and_then(|s| s.tenant_id))
    }

    #[instrument(skip(self))]
    async fn find_applications(&self, display_name: &str) -> AppResult<Vec<Application>> {
        let filter = format!("displayName eq {}", odata_quote(display_name));
        self.list_all("list applications", &self.graph("applications"), &[("$filter", filter)])
            .await
    }

    #[instrument(skip(self))]
    async fn create_application(&self, display_name: &str) -> AppResult<Application> {
        let url = self.graph("applications");
        let body = NewApplication { display_name };
        self.json(Resource::Graph, "create application", |http| http.post(&url).json(&body))
            .await
    }

    #[instrument(skip(self))]
    async fn find_service_principal(&self, app_id: &str) -> AppResult<Option<ServicePrincipal>> {
        let url = self.graph(&format!("servicePrincipals(appId={})", odata_quote(app_id)));
        self.find(Resource::Graph, "service principal", &url).await
    }

    #[instrument(skip(self))]
    async fn create_service_principal(&self, app_id: &str) -> AppResult<ServicePrincipal> {
        let url = self.graph("servicePrincipals");
        let body = NewServicePrincipal { app_id };
        let (url, body) = (&url, &body);

        // The application may not have replicated yet
        self.while_replicating("create service principal", || async move {
            self.json(Resource::Graph, "create service principal", |http| {
                http.post(url.as_str()).json(body)
            })
            .await
        })
        .await
    }

    #[instrument(skip(self))]
    async fn list_federated_credentials(
        &self,
        application_id: &str,
    ) -> AppResult<Vec<FederatedIdentityCredential>> {
        let url = self.graph(&format!("applications/{}/federatedIdentityCredentials", application_id));
        self.list_all("list federated credentials", &url, &[]).await
    }

    #[instrument(skip(self, credential), fields(name = %credential.name))]
    async fn create_federated_credential(
        &self,
        application_id: &str,
        credential: &FederatedIdentityCredential,
    ) -> AppResult<()> {
        let url = self.graph(&format!("applications/{}/federatedIdentityCredentials", application_id));
        let url = &url;
        self.while_replicating("create federated credential", || async move {
            let _: FederatedIdentityCredential = self
                .json(Resource::Graph, "create federated credential", |http| {
                    http.post(url.as_str()).json(credential)
                })
                .await?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn has_role_assignment(
        &self,
        subscription_id: &str,
        principal_id: &str,
        role: &str,
    ) -> AppResult<bool> {
        let definition_id = self.role_definition_id(subscription_id, role).await?;
        let url = self.arm(&format!(
            "subscriptions/{}/providers/Microsoft.Authorization/roleAssignments",
            subscription_id
        ));
        let filter = format!("assignedTo({})", odata_quote(principal_id));
        let assignments: ODataList<RoleAssignment> = self
            .json(Resource::Management, "role assignments", |http| {
                http.get(&url).query(&[
                    ("api-version", AUTHORIZATION_API_VERSION),
                    ("$filter", filter.as_str()),
                ])
            })
            .await?;

        Ok(assignments.value.iter().any(|a| {
            a.properties.principal_id == principal_id
                && same_role_definition(&a.properties.role_definition_id, &definition_id)
        }))
    }

    #[instrument(skip(self))]
    async fn create_role_assignment(
        &self,
        subscription_id: &str,
        principal_id: &str,
        role: &str,
    ) -> AppResult<()> {
        let role_definition_id = self.role_definition_id(subscription_id, role).await?;
        let url = self.arm(&format!(
            "subscriptions/{}/providers/Microsoft.Authorization/roleAssignments/{}",
            subscription_id,
            Uuid::new_v4()
        ));
        let body = RoleAssignment {
            id: None,
            properties: RoleAssignmentProperties {
                role_definition_id,
                principal_id: principal_id.to_string(),
                principal_type: Some("ServicePrincipal".to_string()),
                scope: None,
            },
        };

        let (url, body) = (&url, &body);
        self.while_replicating("create role assignment", || async move {
            let response = self
                .send(Resource::Management, "create role assignment", |http| {
                    http.put(url.as_str())
                        .query(&[("api-version", AUTHORIZATION_API_VERSION)])
                        .json(body)
                })
                .await?;

            if response.status() == StatusCode::CONFLICT {
                debug!("Role assignment already exists");
                return Ok(());
            }
            Self::check(Resource::Management, response).await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_odata_quote_escapes_single_quotes() {
        assert_eq!(odata_quote("gh-org-repo"), "'gh-org-repo'");
        assert_eq!(odata_quote("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_same_role_definition_ignores_scope() {
        assert!(same_role_definition(
            "/subscriptions/s/providers/Microsoft.Authorization/roleDefinitions/B24988AC-6180-42A0-AB88-20F7382DD24C",
            "/providers/Microsoft.Authorization/roleDefinitions/b24988ac-6180-42a0-ab88-20f7382dd24c",
        ));
        assert!(!same_role_definition(
            "/providers/Microsoft.Authorization/roleDefinitions/aaaa",
            "/providers/Microsoft.Authorization/roleDefinitions/bbbb",
        ));
    }

    #[test]
    fn test_replication_lag_detection() {
        assert!(is_replication_lag(&AppError::api("Microsoft Graph", 404, "Request_ResourceNotFound: x")));
        assert!(is_replication_lag(&AppError::api(
            "Azure Resource Manager",
            400,
            "PrincipalNotFound: Principal abc does not exist in the directory"
        )));
        assert!(!is_replication_lag(&AppError::api("Microsoft Graph", 400, "BadRequest: nope")));
        assert!(!is_replication_lag(&AppError::InsufficientPermissions("x".to_string())));
    }
}
