//! Wire records for the services fedlink talks to.
//!
//! Each struct mirrors one JSON schema field-for-field. Nothing here carries
//! behaviour beyond small accessors; decoding is plain serde field mapping.

pub mod arm;
pub mod github;
pub mod graph;
pub mod oauth;

pub use arm::{RoleAssignment, RoleAssignmentProperties, RoleDefinition, Subscription};
pub use github::{GitHubPublicKey, GitHubSecretPayload};
pub use graph::{
    Application, FederatedIdentityCredential, GraphError, GraphErrorBody, NewApplication,
    NewServicePrincipal, ODataList, ServicePrincipal,
};
pub use oauth::{CliAccessToken, ClientCredentialsToken, DeviceCodeResponse, TokenPollResponse};
