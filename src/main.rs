use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shadowd::config::EngineConfig;
use shadowd::storage::model::{NotificationPreference, RepositoryConfig};
use shadowd::supervisor::Supervisor;
use shadowd::AppContext;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "shadowd", about = "Auto-commit engine for shadow branches", version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Data directory for the store, logs, and pattern files.
    #[arg(long, env = "AUTOCOMMIT_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    /// SQLite store path, overriding the default under the data dir.
    #[arg(long, env = "AUTOCOMMIT_STORE_PATH", global = true)]
    store_path: Option<PathBuf>,

    /// Root directory tailed for session transcripts.
    #[arg(long, env = "AUTOCOMMIT_TRANSCRIPT_ROOT", global = true)]
    transcript_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "AUTOCOMMIT_LOG", global = true)]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Launch the engine in the foreground.
    Start,
    /// Signal a running engine to shut down.
    Stop,
    /// Print commit and repository counts for the running engine.
    Status,
    /// Register a repository for auto-commit.
    Add {
        repo_path: PathBuf,
        #[arg(long)]
        throttle: Option<u64>,
        #[arg(long = "max-size")]
        max_size: Option<u64>,
        #[arg(long = "exclude")]
        exclude: Vec<String>,
    },
    /// Deregister a repository.
    Remove { repo_path: PathBuf },
    /// List registered repositories.
    List,
}

const EXIT_OK: i32 = 0;
const EXIT_VALIDATION_FAILURE: i32 = 2;
const EXIT_DUPLICATE: i32 = 3;
const EXIT_UNKNOWN_REPO: i32 = 4;
const EXIT_UNKNOWN_COMMAND: i32 = 64;

#[tokio::main]
async fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            if matches!(e.kind(), clap::error::ErrorKind::InvalidSubcommand) {
                eprintln!("{e}");
                std::process::exit(EXIT_UNKNOWN_COMMAND);
            }
            e.exit();
        }
    };
    let config = EngineConfig::new(
        args.data_dir.clone(),
        args.store_path.clone(),
        args.transcript_root.clone(),
        args.log.clone(),
    );

    let result = match args.command {
        Command::Start => run_start(config).await,
        Command::Stop => Ok(run_stop(&config)),
        Command::Status => run_status(config).await,
        Command::Add {
            repo_path,
            throttle,
            max_size,
            exclude,
        } => run_add(config, &repo_path, throttle, max_size, exclude).await,
        Command::Remove { repo_path } => run_remove(config, &repo_path).await,
        Command::List => run_list(config).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            EXIT_VALIDATION_FAILURE
        }
    };

    std::process::exit(code);
}

fn setup_logging(log_level: &str, log_dir: &std::path::Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!(
            "warn: could not create log directory '{}': {e} — falling back to stdout",
            log_dir.display()
        );
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(log_dir, "shadowd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    Some(guard)
}

fn pid_file(config: &EngineConfig) -> PathBuf {
    config.data_dir.join("engine.pid")
}

/// Waits for either Ctrl-C or, on unix, the SIGTERM `stop` sends via `kill`.
/// `tokio::signal::ctrl_c()` alone only ever resolves on SIGINT, so without
/// this a `stop`-issued SIGTERM would just kill the process under its
/// default disposition, skipping the drain/PID-cleanup path entirely.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!(err = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("failed to listen for shutdown signal");
        }
    }
}

async fn run_start(config: EngineConfig) -> Result<i32> {
    let _log_guard = setup_logging(&config.log, &config.logs_dir());

    std::fs::create_dir_all(&config.data_dir).context("failed to create data directory")?;
    let pid_path = pid_file(&config);
    if let Err(e) = std::fs::write(&pid_path, std::process::id().to_string()) {
        error!(err = %e, "failed to write pid file");
    }

    let ctx = AppContext::bootstrap(config)
        .await
        .context("failed to initialize engine")?;

    let supervisor = Arc::new(Supervisor::new(ctx.clone()));
    if let Err(e) = supervisor.restore_from_store().await {
        error!(err = %e, "failed to restore repositories from store");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let poll_handle = tokio::spawn(supervisor.clone().run_settings_poll(shutdown_rx.clone()));
    let reconciler_handle = tokio::spawn(shadowd::storage::reconciler::run(ctx.storage.clone(), shutdown_rx));

    info!(data_dir = %ctx.config.data_dir.display(), "engine started");

    wait_for_shutdown_signal().await;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    supervisor.shutdown().await;
    let _ = poll_handle.await;
    let _ = reconciler_handle.await;
    let _ = std::fs::remove_file(&pid_path);

    Ok(EXIT_OK)
}

fn run_stop(config: &EngineConfig) -> i32 {
    let pid_path = pid_file(config);
    let pid = match std::fs::read_to_string(&pid_path) {
        Ok(s) => s.trim().to_string(),
        Err(_) => {
            eprintln!("no running engine found at {}", pid_path.display());
            return EXIT_OK;
        }
    };

    match std::process::Command::new("kill").arg("-TERM").arg(&pid).status() {
        Ok(status) if status.success() => EXIT_OK,
        _ => {
            eprintln!("failed to signal process {pid}");
            EXIT_OK
        }
    }
}

async fn run_status(config: EngineConfig) -> Result<i32> {
    let ctx = AppContext::bootstrap(config).await.context("failed to open store")?;

    let commits = ctx.storage.count_commits().await.unwrap_or(0);
    let active = ctx.storage.count_active_repositories().await.unwrap_or(0);
    println!("Total Commits: {commits}");
    println!("Active Repositories: {active}");
    println!("Uptime: {}", ctx.started_at.elapsed().as_secs());
    Ok(EXIT_OK)
}

/// Writes directly to `repository_settings`; a running `start` process (if
/// any) picks up the change on its next settings-poll tick.
async fn run_add(
    config: EngineConfig,
    repo_path: &std::path::Path,
    throttle: Option<u64>,
    max_size: Option<u64>,
    exclude: Vec<String>,
) -> Result<i32> {
    let ctx = AppContext::bootstrap(config).await.context("failed to open store")?;

    let canonical = match repo_path.canonicalize() {
        Ok(p) if p.join(".git").exists() => p,
        _ => {
            eprintln!("not a git repository: {}", repo_path.display());
            return Ok(EXIT_VALIDATION_FAILURE);
        }
    };
    let key = canonical.to_string_lossy().to_string();

    if ctx.storage.get_settings(&key).await.ok().flatten().is_some() {
        eprintln!("already registered: {}", canonical.display());
        return Ok(EXIT_DUPLICATE);
    }

    let repo_config = RepositoryConfig {
        repo_root: key,
        enabled: true,
        throttle_ms: throttle.unwrap_or(ctx.config.default_throttle_ms),
        max_file_bytes: max_size.unwrap_or(ctx.config.default_max_file_bytes),
        notification: NotificationPreference::EveryCommit,
        auto_add_untracked: true,
        patterns: exclude,
    };

    ctx.storage
        .upsert_settings(&repo_config)
        .await
        .context("failed to register repository")?;
    println!("registered {}", canonical.display());
    Ok(EXIT_OK)
}

async fn run_remove(config: EngineConfig, repo_path: &std::path::Path) -> Result<i32> {
    let ctx = AppContext::bootstrap(config).await.context("failed to open store")?;

    let key = match repo_path.canonicalize() {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => repo_path.to_string_lossy().to_string(),
    };

    let removed = ctx
        .storage
        .remove_settings(&key)
        .await
        .context("failed to remove repository")?;
    if removed {
        println!("removed {}", repo_path.display());
        Ok(EXIT_OK)
    } else {
        eprintln!("not registered: {}", repo_path.display());
        Ok(EXIT_UNKNOWN_REPO)
    }
}

async fn run_list(config: EngineConfig) -> Result<i32> {
    let ctx = AppContext::bootstrap(config).await.context("failed to open store")?;
    let repos = ctx.storage.list_settings().await.context("failed to list repositories")?;

    for repo in repos {
        println!(
            "Monitoring: {} {} ({})",
            if repo.enabled { "\u{2713}" } else { "\u{2717}" },
            repo.repo_root,
            if repo.enabled { "enabled" } else { "disabled" },
        );
    }
    Ok(EXIT_OK)
}
