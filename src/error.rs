use crate::github::crypto::CryptoError;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid repository '{0}'. Please use the format 'owner/repo'")]
    InvalidRepository(String),

    #[error("Failed to retrieve tenant id for subscription {0}")]
    MissingTenant(String),

    #[error("No usable credentials: {0}")]
    MissingCredentials(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned {status}: {message}")]
    Api {
        service: &'static str,
        status: u16,
        message: String,
    },

    #[error("Insufficient permissions: {0}. Check the directory permissions (Application.ReadWrite.All) and grant admin consent")]
    InsufficientPermissions(String),

    #[error("Device code request failed with {status}: {body}")]
    DeviceCodeRequest { status: u16, body: String },

    #[error("Device code has expired. Please restart the authentication process")]
    DeviceCodeExpired,

    #[error("Authorization denied: {0}. Please restart the authentication process")]
    AuthorizationDenied(String),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("`{command}` exited with {code:?}: {stderr}")]
    Cli {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn api<S: Into<String>>(service: &'static str, status: u16, message: S) -> Self {
        Self::Api {
            service,
            status,
            message: message.into(),
        }
    }

    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Configuration problems abort the run and are never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::InvalidConfig(_)
                | Self::InvalidRepository(_)
                | Self::MissingTenant(_)
                | Self::MissingCredentials(_)
        )
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
