use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// GitHub endpoints and the device-flow OAuth app
#[derive(Debug, Deserialize, Clone)]
pub struct GitHubConfig {
    /// REST API base, e.g. `https://api.github.com`
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
    /// Host serving `/login/device/code` and `/login/oauth/access_token`
    #[serde(default = "default_github_oauth_url")]
    pub oauth_url: String,
    /// Client id of a GitHub app with device flow enabled
    #[serde(default = "default_github_client_id")]
    pub client_id: String,
    #[serde(default = "default_github_scopes")]
    pub scopes: Vec<String>,
    /// Issuer of the tokens GitHub Actions presents to Azure
    #[serde(default = "default_oidc_issuer")]
    pub oidc_issuer: String,
    #[serde(default = "default_token_audience")]
    pub token_audience: String,
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_github_oauth_url() -> String {
    "https://github.com".to_string()
}

fn default_github_client_id() -> String {
    "Ov23liBhP6pOLo4HJgKO".to_string()
}

fn default_github_scopes() -> Vec<String> {
    vec!["repo".to_string(), "read:org".to_string()]
}

fn default_oidc_issuer() -> String {
    "https://token.actions.githubusercontent.com".to_string()
}

fn default_token_audience() -> String {
    "api://AzureADTokenExchange".to_string()
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_api_url(),
            oauth_url: default_github_oauth_url(),
            client_id: default_github_client_id(),
            scopes: default_github_scopes(),
            oidc_issuer: default_oidc_issuer(),
            token_audience: default_token_audience(),
        }
    }
}

impl GitHubConfig {
    pub fn device_code_url(&self) -> String {
        join_url(&self.oauth_url, "login/device/code")
    }

    pub fn access_token_url(&self) -> String {
        join_url(&self.oauth_url, "login/oauth/access_token")
    }
}

/// Azure endpoints and optional service principal credentials
#[derive(Debug, Deserialize, Clone)]
pub struct AzureConfig {
    #[serde(default = "default_graph_url")]
    pub graph_url: String,
    #[serde(default = "default_management_url")]
    pub management_url: String,
    #[serde(default = "default_login_url")]
    pub login_url: String,
    /// Tenant for the client-credentials grant
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Name or path of the Azure CLI
    #[serde(default = "default_cli_program")]
    pub cli_program: String,
}

fn default_graph_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_management_url() -> String {
    "https://management.azure.com".to_string()
}

fn default_login_url() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_cli_program() -> String {
    "az".to_string()
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            graph_url: default_graph_url(),
            management_url: default_management_url(),
            login_url: default_login_url(),
            tenant_id: None,
            client_id: None,
            client_secret: None,
            cli_program: default_cli_program(),
        }
    }
}

/// Device authorization grant tuning
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceFlowConfig {
    /// Added to the provider's `expires_in` before giving up
    #[serde(default = "default_expiry_grace_secs")]
    pub expiry_grace_secs: u64,
    /// Added to the polling interval on every `slow_down`
    #[serde(default = "default_slow_down_increment_secs")]
    pub slow_down_increment_secs: u64,
}

fn default_expiry_grace_secs() -> u64 {
    100
}

fn default_slow_down_increment_secs() -> u64 {
    5
}

impl Default for DeviceFlowConfig {
    fn default() -> Self {
        Self {
            expiry_grace_secs: default_expiry_grace_secs(),
            slow_down_increment_secs: default_slow_down_increment_secs(),
        }
    }
}

/// Outbound HTTP settings shared by every client
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default)]
    pub device_flow: DeviceFlowConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // e.g., FEDLINK_HTTP__MAX_RETRIES, FEDLINK_AZURE__CLIENT_SECRET
            .add_source(
                Environment::with_prefix("FEDLINK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }
}

/// Join a base URL and a path with exactly one slash between them
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{}/{}", base, path)
}
