//! Microsoft Graph directory objects.

use serde::{Deserialize, Serialize};

/// Application registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    /// Directory object id (used in `/applications/{id}` paths)
    pub id: String,
    /// Client id
    pub app_id: String,
    pub display_name: String,
}

/// Body for `POST /applications`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApplication<'a> {
    pub display_name: &'a str,
}

/// Service principal backing an application in a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePrincipal {
    pub id: String,
    pub app_id: String,
}

/// Body for `POST /servicePrincipals`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServicePrincipal<'a> {
    pub app_id: &'a str,
}

/// Federated identity credential attached to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedIdentityCredential {
    pub name: String,
    pub issuer: String,
    pub subject: String,
    pub audiences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// OData collection envelope.
#[derive(Debug, Deserialize)]
pub struct ODataList<T> {
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
}

/// OData error response.
#[derive(Debug, Deserialize)]
pub struct GraphError {
    pub error: GraphErrorBody,
}

/// OData error body. Azure Resource Manager uses the same shape.
#[derive(Debug, Deserialize)]
pub struct GraphErrorBody {
    pub code: String,
    #[serde(default)]
    pub message: String,
}
