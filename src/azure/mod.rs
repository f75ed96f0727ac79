//! Azure side of the link: application, service principal, federated
//! credentials and role assignment.
//!
//! [`IdentityProvisioner`] holds the reconciliation logic and talks to a
//! [`Directory`]. Two directories exist:
//!
//! - [`GraphDirectory`]: Microsoft Graph and Resource Manager over REST,
//!   authenticated by a [`TokenSource`]
//! - [`AzCliDirectory`]: the locally signed-in Azure CLI

pub mod cli;
pub mod credential;
pub mod graph;
pub mod process;
pub mod provisioner;

pub use cli::AzCliDirectory;
pub use credential::{token_source_from_config, AzCliCredential, ClientSecretCredential, Resource, TokenSource};
pub use graph::GraphDirectory;
pub use process::{CommandRunner, JsonParamFile, ProcessOutput, TokioCommandRunner};
pub use provisioner::{
    Directory, FederationSettings, GitHubSecretData, IdentityProvisioner, ProvisionRequest,
    Provisioner,
};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use std::sync::Arc;
use tracing::info;

/// Which [`Directory`] implementation to provision through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// Microsoft Graph and Resource Manager REST APIs
    #[default]
    Graph,
    /// The `az` command line
    AzCli,
}

/// Build the provisioner for `backend` from configuration.
pub fn build_provisioner(backend: Backend, config: &AppConfig) -> AppResult<Box<dyn Provisioner>> {
    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
    let federation = FederationSettings::from_github(&config.github);

    match backend {
        Backend::Graph => {
            let tokens = token_source_from_config(config, runner)?;
            let directory = GraphDirectory::new(config, tokens)?;
            Ok(Box::new(IdentityProvisioner::new(directory, federation)))
        }
        Backend::AzCli => {
            let program = process::find_executable(&config.azure.cli_program).ok_or_else(|| {
                AppError::MissingCredentials(format!(
                    "'{}' was not found on PATH. Install the Azure CLI or use the graph backend",
                    config.azure.cli_program
                ))
            })?;
            info!(program = %program.display(), "Using the Azure CLI backend");
            let directory = AzCliDirectory::new(runner, program);
            Ok(Box::new(IdentityProvisioner::new(directory, federation)))
        }
    }
}
