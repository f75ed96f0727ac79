pub mod azure;
pub mod config;
pub mod connect;
pub mod error;
pub mod github;
pub mod http;
pub mod token;

pub use config::AppConfig;
pub use connect::{ConnectOptions, ConnectOutcome, RepoSlug};
pub use error::{AppError, AppResult};
pub use token::AccessToken;
