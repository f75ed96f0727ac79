//! Shared fixtures for the HTTP integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use fedlink::azure::{Resource, TokenSource};
use fedlink::{AccessToken, AppConfig, AppResult};
use serde_json::{json, Value};
use wiremock::MockServer;

pub const TEST_TOKEN: &str = "test-token";

/// Configuration pointing every endpoint at `server`, with fast retries.
pub fn config_for(server: &MockServer) -> AppConfig {
    let mut config = AppConfig::default();
    config.github.api_url = server.uri();
    config.github.oauth_url = server.uri();
    config.azure.graph_url = format!("{}/v1.0", server.uri());
    config.azure.management_url = server.uri();
    config.azure.login_url = server.uri();
    config.http.max_retries = 2;
    config.http.base_delay_ms = 10;
    config.http.max_delay_ms = 50;
    config.http.timeout_secs = 5;
    config
}

/// Hands out the same bearer token for every resource.
pub struct StaticTokens;

#[async_trait]
impl TokenSource for StaticTokens {
    async fn token(&self, _resource: Resource) -> AppResult<AccessToken> {
        Ok(AccessToken::new(TEST_TOKEN))
    }
}

pub fn bearer() -> String {
    format!("Bearer {}", TEST_TOKEN)
}

pub fn odata(items: Vec<Value>, next_link: Option<&str>) -> Value {
    let mut response = json!({ "value": items });
    if let Some(link) = next_link {
        response["@odata.nextLink"] = json!(link);
    }
    response
}

pub fn odata_error(code: &str, message: &str) -> Value {
    json!({ "error": { "code": code, "message": message } })
}

pub fn application(id: &str, app_id: &str, name: &str) -> Value {
    json!({
        "id": id,
        "appId": app_id,
        "displayName": name,
        "signInAudience": "AzureADMyOrg"
    })
}
