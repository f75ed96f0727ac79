//! OAuth 2.0 device authorization grant payloads (RFC 8628).

use serde::Deserialize;

/// Device-code issuance response.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    /// Lifetime of `device_code` in seconds
    pub expires_in: u64,
    /// Minimum polling interval in seconds
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    5
}

/// Token endpoint response while polling.
///
/// GitHub answers pending polls with `200 OK` and an `error` field, so both
/// halves are optional and classification happens on content.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenPollResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Microsoft identity platform client-credentials token response.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientCredentialsToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Output of `az account get-access-token --output json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliAccessToken {
    pub access_token: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub expires_on: Option<String>,
}
