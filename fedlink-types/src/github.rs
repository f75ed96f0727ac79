//! GitHub Actions secrets API payloads.

use serde::{Deserialize, Serialize};

/// Repository public key used to seal secrets.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GitHubPublicKey {
    pub key_id: String,
    /// Base64-encoded Curve25519 public key
    pub key: String,
}

/// Body for `PUT /repos/{owner}/{repo}/actions/secrets/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubSecretPayload {
    /// Base64 sealed box
    pub encrypted_value: String,
    pub key_id: String,
}
