//! GitHub side of the link: device-flow login and Actions secrets.
//!
//! ## Flow
//!
//! ```ignore
//! let authenticator = DeviceFlowAuthenticator::new(GitHubDeviceGrant::new(&config)?, &config.device_flow);
//! let token = authenticator.authenticate(print_instructions).await?;
//!
//! let store = GitHubSecretsClient::new(&config, "owner/repo", token)?;
//! let report = SecretPublisher::new(store).publish(&secrets).await?;
//! ```
//!
//! Secret values are sealed client-side with the repository public key, so
//! plaintext never leaves the process.

pub mod crypto;
pub mod device_flow;
pub mod secrets;

pub use crypto::CryptoError;
pub use device_flow::{DeviceCodeSession, DeviceFlowAuthenticator, DeviceGrantClient, GitHubDeviceGrant, PollOutcome};
pub use secrets::{GitHubSecretsClient, PublishReport, SecretOutcome, SecretPublisher, SecretStore};
