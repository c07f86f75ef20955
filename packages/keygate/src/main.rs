use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use color_eyre::{Result, eyre::Context};
use keygate::{
    api,
    auth::UserId,
    crypto::SessionKeys,
    gate::Gate,
    policy::PolicyTable,
    quota::{MemoryCounters, QuotaTracker, SystemClock},
    store::Store,
    upstream::Upstream,
};
use time::OffsetDateTime;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing_tree::{HierarchicalLayer, time::Uptime};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server.
    Serve(ServeConfig),

    /// Mint a session token for a user.
    MintToken(MintConfig),

    /// Print the effective rate limit policy and exit.
    Policy(PolicyConfig),
}

#[derive(clap::Args, Debug)]
struct ServeConfig {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "5000")]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// TOML file overriding the default rate limits
    #[arg(long, env = "KEYGATE_POLICY")]
    policy: Option<PathBuf>,

    /// Secret session tokens are signed with
    #[arg(long, env = "KEYGATE_SESSION_SECRET", hide_env_values = true)]
    session_secret: String,

    /// How often expired rate limit counters are dropped, in seconds
    #[arg(long, env = "KEYGATE_SWEEP_INTERVAL", default_value = "300")]
    sweep_interval_secs: u64,

    /// Timeout for calls to registered APIs, in seconds
    #[arg(long, env = "KEYGATE_UPSTREAM_TIMEOUT", default_value = "30")]
    upstream_timeout_secs: u64,
}

#[derive(clap::Args, Debug)]
struct MintConfig {
    /// User the token is for
    #[arg(long)]
    user: String,

    /// Token lifetime in seconds
    #[arg(long, default_value = "86400")]
    ttl_secs: u64,

    /// Secret session tokens are signed with
    #[arg(long, env = "KEYGATE_SESSION_SECRET", hide_env_values = true)]
    session_secret: String,
}

#[derive(clap::Args, Debug)]
struct PolicyConfig {
    /// TOML file overriding the default rate limits
    #[arg(long, env = "KEYGATE_POLICY")]
    policy: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    color_eyre::install()?;
    init_tracing();

    match cli.command {
        Command::Serve(config) => serve(config).await,
        Command::MintToken(config) => mint_token(config),
        Command::Policy(config) => {
            let policy = load_policy(config.policy.as_deref()).await?;
            for rule in policy.rules() {
                println!("{rule}");
            }
            Ok(())
        }
    }
}

/// Logs go to stderr as an indented span tree, filtered by `RUST_LOG`.
fn init_tracing() {
    let tree = HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true)
        .with_deferred_spans(true)
        .with_timer(Uptime::default());
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(tree)
        .with(filter)
        .init();
}

async fn serve(config: ServeConfig) -> Result<()> {
    let policy = load_policy(config.policy.as_deref()).await?;
    let sessions = SessionKeys::from_secret(&config.session_secret)?;
    let upstream_timeout = Duration::from_secs(config.upstream_timeout_secs);
    let upstream = Upstream::new(upstream_timeout)?;
    let store = Store::default();
    let quota = QuotaTracker::new(MemoryCounters::default(), SystemClock);

    for rule in policy.rules() {
        info!(%rule, "policy.rule");
    }

    let sweeper = quota.clone();
    let sweep_interval = Duration::from_secs(config.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            if let Err(err) = sweeper.sweep().await {
                error!(?err, "quota.sweep.error");
            }
        }
    });

    let gate = Gate::new(policy, quota, store.clone(), sessions);
    let app = api::router(api::state(store, upstream), &gate, upstream_timeout);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

fn mint_token(config: MintConfig) -> Result<()> {
    let sessions = SessionKeys::from_secret(&config.session_secret)?;
    let user = UserId::new(config.user);
    let expires_at = OffsetDateTime::now_utc() + Duration::from_secs(config.ttl_secs);
    let token = sessions.mint(&user, expires_at)?;
    println!("{}", token.as_str());
    Ok(())
}

async fn load_policy(path: Option<&std::path::Path>) -> Result<PolicyTable> {
    match path {
        Some(path) => PolicyTable::load(path).await,
        None => Ok(PolicyTable::default()),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(?err, "shutdown.signal.error");
    }
    info!("shutting down");
}
