//! ShellPort Daemon
//!
//! Serves browser terminals bridged to shells on this host.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::server::{self, AppState};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// ShellPort - browser terminals for managed hosts.
#[derive(Parser, Debug)]
#[command(name = "shellport")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the terminal server
    Start {
        /// Listen address, overriding the configuration
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Also write it to the configuration file if none exists yet
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let config = load_config(&cli, &config_path, std::io::stderr)?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.server.log_level.as_str()
    };
    let _log_guard = init_tracing(level, config.server.log_file.as_deref())?;

    match cli.command {
        Commands::Start { .. } => run_server(config).await,
        Commands::Config { init } => {
            print!("{}", config.to_toml()?);
            if init {
                if config_path.exists() {
                    eprintln!("Config file already exists: {}", config_path.display());
                } else {
                    config.save(&config_path)?;
                    eprintln!("Wrote {}", config_path.display());
                }
            }
            Ok(())
        }
    }
}

/// Loads the configuration and applies environment and CLI overrides.
///
/// The global subscriber depends on the loaded configuration, so loading
/// logs through a scoped subscriber writing to `writer`.
fn load_config<W>(cli: &Cli, path: &Path, writer: W) -> anyhow::Result<Config>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish();

    tracing::subscriber::with_default(subscriber, || {
        tracing::debug!("Using config file: {:?}", path);

        let mut config = Config::load(path)?;
        config.apply_env_overrides();
        if let Commands::Start { bind: Some(bind) } = &cli.command {
            config.server.bind = bind.clone();
        }
        config.validate()?;
        Ok(config)
    })
}

/// Installs the global subscriber: stderr, plus a daily file when configured.
///
/// `RUST_LOG` takes precedence over `level`. The returned guard flushes the
/// file writer and must live until exit.
fn init_tracing(level: &str, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log filter")?;
    let stderr = fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "shellport.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            Ok(None)
        }
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    let local_addr = listener.local_addr()?;

    let state = AppState::from_config(&config);
    let shutdown = CancellationToken::new();

    let reaper = state.registry.start_reaper(
        Duration::from_secs(config.session.reap_interval_secs),
        shutdown.clone(),
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("Received shutdown signal");
        signal_token.cancel();
    });

    tracing::info!(
        addr = %local_addr,
        shell = %state.options.shell,
        max_sessions = config.session.max_sessions,
        "ShellPort listening"
    );

    server::serve(
        listener,
        state,
        &config.server.allowed_origins,
        shutdown.clone(),
    )
    .await
    .context("Server error")?;

    shutdown.cancel();
    let _ = reaper.await;

    tracing::info!("ShellPort stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                tracing::warn!("Failed to register signal handlers, waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
}

/// Wait for Ctrl+C.
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Received Ctrl+C");
    }
}
