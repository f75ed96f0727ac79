use clap::Parser;
use fedlink::{
    azure::Backend,
    config::AppConfig,
    connect::{self, ConnectOptions, RepoSlug},
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fedlink")]
#[command(version, about = "Connect a GitHub repository to Azure with OIDC federated credentials")]
struct Cli {
    /// Azure subscription to grant access to
    #[arg(long)]
    subscription_id: String,

    /// GitHub repository as owner/repo
    #[arg(long)]
    repo: RepoSlug,

    /// Application display name [default: gh-{owner}-{repo}]
    #[arg(long)]
    app_name: Option<String>,

    /// Branch whose pushes are trusted
    #[arg(long, default_value = "main")]
    branch: String,

    #[arg(long, value_enum, default_value_t = Backend::Graph)]
    backend: Backend,

    /// Role granted to the service principal at subscription scope
    #[arg(long, default_value = "Contributor")]
    role: String,

    #[arg(long)]
    skip_role_assignment: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Pick up a local .env before anything reads the environment
    dotenvy::dotenv().ok();

    // Initialize logging first
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fedlink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting fedlink v{}", env!("CARGO_PKG_VERSION"));

    // Parse arguments and load configuration
    let cli = Cli::parse();
    let config = AppConfig::init()?;
    info!("Configuration loaded");

    let options = ConnectOptions {
        subscription_id: cli.subscription_id,
        repo: cli.repo,
        app_name: cli.app_name,
        branch: cli.branch,
        role: (!cli.skip_role_assignment).then_some(cli.role),
    };

    // Provision first; GitHub sign-in only happens once Azure is ready
    let outcome = connect::run(config, cli.backend, &options).await?;

    // Report per-secret results
    println!();
    for name in outcome.report.succeeded() {
        println!("  [ok]     {}", name);
    }
    for (name, failure) in outcome.report.failed() {
        println!("  [failed] {}: {}", name, failure.message);
    }

    if !outcome.report.all_succeeded() {
        error!("Some secrets could not be set");
        std::process::exit(1);
    }

    info!(
        app_id = %outcome.identity.app_id,
        "GitHub repository {} is connected to Azure",
        options.repo
    );
    Ok(())
}
