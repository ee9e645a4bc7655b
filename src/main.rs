use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repowatch::config::Overrides;
use repowatch::daemon::spawn_signal_handler;
use repowatch::metrics;
use repowatch::{Config, Daemon, GitHubClient, RepoCounter, RepoStore, StdoutNotifier};

#[derive(Parser)]
#[command(name = "repowatch")]
#[command(about = "Announces newly created repositories of a GitHub account")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// GitHub account to watch
    #[arg(short = 'u', long, env = "REPOWATCH_ACCOUNT", global = true)]
    account: Option<String>,

    /// Time between polls, e.g. "20", "30s", "5m"
    #[arg(short, long, env = "REPOWATCH_INTERVAL", global = true)]
    interval: Option<String>,

    /// Database file for the tracked repository set
    #[arg(long, env = "REPOWATCH_DB", global = true)]
    db: Option<String>,

    /// Listen address for the metrics endpoint
    #[arg(long, env = "REPOWATCH_METRICS_ADDR", global = true)]
    metrics_addr: Option<String>,

    /// GitHub token used to raise the API rate limit
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true, global = true)]
    token: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Poll forever, serving metrics, until interrupted (default)
    Run,

    /// Run a single poll cycle and exit
    Once,

    /// List every repository recorded for the account
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    config.apply_overrides(Overrides {
        account: cli.account,
        interval: cli.interval,
        db_path: cli.db,
        metrics_bind: cli.metrics_addr,
        token: cli.token,
    })?;

    init_logging(cli.verbose, &config.logging.level)?;
    info!("Starting repowatch v{}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&config).await,
        Commands::Once => cmd_once(&config).await,
        Commands::List => cmd_list(&config),
    }
}

/// Initialize logging. Logs go to stderr; stdout carries announcements only.
fn init_logging(verbose: bool, level: &str) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_or_default(),
    }
}

fn build_daemon(
    config: &Config,
    counter: RepoCounter,
) -> Result<Daemon<GitHubClient, StdoutNotifier>> {
    config.validate()?;
    let store = RepoStore::open_at(&config.store.path)?;
    let client = GitHubClient::new(&config.github)?;
    Daemon::new(config, client, store, StdoutNotifier, counter)
}

/// Poll until SIGINT/SIGTERM, serving metrics alongside
async fn cmd_run(config: &Config) -> Result<()> {
    let counter = RepoCounter::new();
    let mut daemon = build_daemon(config, counter.clone())?;

    let (shutdown_sender, shutdown_receiver) = broadcast::channel(1);
    spawn_signal_handler(shutdown_sender.clone());

    let metrics_task = if config.metrics.enabled {
        let addr = config.metrics_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics endpoint to {}", addr))?;
        let app = metrics::router(&config.account, counter);
        let mut stop = shutdown_sender.subscribe();
        Some(tokio::spawn(metrics::serve(listener, app, async move {
            let _ = stop.recv().await;
        })))
    } else {
        info!("Metrics endpoint disabled");
        None
    };

    let result = daemon.run(shutdown_receiver).await;

    // The loop can also end on an aborting error; take the server down too
    let _ = shutdown_sender.send(());
    if let Some(task) = metrics_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{:#}", e),
            Err(e) => error!("Metrics server task failed: {}", e),
        }
    }

    let status = daemon.status();
    info!(
        "Stopped after {} cycles ({} failed), {} repositories announced",
        status.total_cycles, status.failed_cycles, status.announced
    );

    result
}

/// Run exactly one cycle; any fetch failure is an error exit
async fn cmd_once(config: &Config) -> Result<()> {
    let mut daemon = build_daemon(config, RepoCounter::new())?;

    let summary = daemon.run_cycle().await?;

    info!(
        "Cycle completed: {} listed, {} new, {} known, {} failed",
        summary.listed, summary.reconcile.new, summary.reconcile.known, summary.reconcile.failed
    );
    Ok(())
}

/// Print the tracked set for the configured account
fn cmd_list(config: &Config) -> Result<()> {
    if config.account.trim().is_empty() {
        anyhow::bail!("No account configured. Pass --account or set REPOWATCH_ACCOUNT");
    }

    let store = match RepoStore::open_read_only(&config.store.path)? {
        Some(store) if store.bucket_exists(&config.account)? => store,
        _ => {
            println!("No repositories recorded for {} yet", config.account);
            return Ok(());
        }
    };

    let entries = store.entries(&config.account)?;
    for entry in &entries {
        println!("{} {}", entry.created_at, entry.full_name);
    }
    println!("{} repositories tracked for {}", entries.len(), config.account);

    Ok(())
}
