use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use lazycomm::commands;
use lazycomm::config::{self, Config};
use lazycomm::error::Result;
use lazycomm::logging;
use lazycomm::state::AppState;
use lazycomm::web;

#[derive(Parser, Debug)]
#[command(name = "lazycomm")]
#[command(about = "Serve scripts over HTTP, one process per request", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Port to listen on, overriding the configuration
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Directory holding the scripts, overriding the configuration
    #[arg(long, value_name = "DIR", global = true)]
    scripts_dir: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the server (default)
    Run,
    /// Check configuration and list available scripts
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // The log directory comes from the configuration, so it loads first
    let config = load_config(&args).await?;
    let _log_guard = logging::init(&config.logging, args.debug);

    match &args.config {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("Configuration loaded from default locations"),
    }

    match args.command.unwrap_or(Command::Run) {
        Command::Check => commands::run_config_check(config).await,
        Command::Run => run(config).await,
    }
}

async fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => config::load_from_path(path).await,
        None => config::load_from_env_or_file().await,
    }
    .inspect_err(|e| eprintln!("Failed to load configuration: {}", e))?;

    // Command-line flags win over files and environment
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(dir) = &args.scripts_dir {
        config.scripts.dir = dir.clone();
    }
    config::validate(&config).inspect_err(|e| eprintln!("Invalid configuration: {}", e))?;

    Ok(config)
}

async fn run(config: Config) -> Result<()> {
    info!("Starting lazycomm");
    info!(
        "Serving *.{} scripts from {} with {}",
        config.scripts.extension,
        config.scripts.dir.display(),
        config.scripts.interpreter
    );
    if !config.scripts.dir.is_dir() {
        error!(
            "Scripts directory {} does not exist, every request will be answered with 404",
            config.scripts.dir.display()
        );
    }

    // Initialize application state
    let (state, _shutdown_rx) = AppState::new(config);

    let web_state = state.clone();
    let mut web_handle = tokio::spawn(async move { web::start_server(web_state).await });

    // Wait for shutdown signal, or for the server to fail on its own
    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut web_handle => {
            return match result {
                Ok(result) => result,
                Err(e) => Err(lazycomm::error::LazycommError::Server(e.to_string())),
            };
        }
    }

    info!("Shutting down lazycomm");
    state.shutdown();

    // Graceful shutdown with timeout
    match tokio::time::timeout(tokio::time::Duration::from_secs(30), web_handle).await {
        Ok(Ok(result)) => {
            info!("Graceful shutdown completed");
            result
        }
        Ok(Err(e)) => Err(lazycomm::error::LazycommError::Server(e.to_string())),
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
