use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};

use dirmirror::api;
use dirmirror::mirror::{MirrorWorker, RestoreEngine, SupervisorHandle};
use dirmirror::shell::Shell;
use dirmirror::utils::{self, Config};

#[derive(Parser, Debug)]
#[command(name = "dirmirror", version, about = "Live one-way directory mirroring")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive command shell (default)
    Shell,

    /// Serve the HTTP control API
    Serve {
        /// Listen address, overrides `api_bind`
        #[arg(long)]
        bind: Option<String>,
    },

    /// Make SOURCE match TARGET again and exit
    Restore { source: PathBuf, target: PathBuf },

    /// Run a single mirror worker (started by the supervisor)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        target: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = utils::config::load_config(cli.config.as_deref())?;
    utils::logging::init_tracing(&config.log_filter, config.log_format);

    match cli.command.unwrap_or(Commands::Shell) {
        Commands::Shell => run_shell(&config).await,
        Commands::Serve { bind } => serve(&config, bind).await,
        Commands::Restore { source, target } => {
            let report = tokio::task::spawn_blocking(move || RestoreEngine::new().restore(&source, &target))
                .await??;
            println!("Restore complete: {}", report);
            Ok(())
        }
        Commands::Worker { source, target } => run_worker(&config, source, target).await,
    }
}

async fn run_shell(config: &Config) -> Result<()> {
    let supervisor = SupervisorHandle::from_config(config)?;
    let interactive = std::io::stdin().is_terminal();
    let shell = Shell::new(supervisor, tokio::io::stdout(), interactive);
    shell.run(BufReader::new(tokio::io::stdin())).await?;
    Ok(())
}

async fn serve(config: &Config, bind: Option<String>) -> Result<()> {
    let supervisor = SupervisorHandle::from_config(config)?;
    let app = api::app(supervisor.clone());

    let addr = bind.unwrap_or_else(|| config.api_bind.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot listen on {}", addr))?;
    info!("Control API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.shutdown().await?;
    info!("Server stopped gracefully");
    Ok(())
}

/// Entry point of an isolated worker process. SIGTERM or Ctrl+C raises the
/// stop flag; the loop notices it at its next poll.
async fn run_worker(config: &Config, source: PathBuf, target: PathBuf) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    // Installed before any work starts so an early SIGTERM is not fatal
    let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    let stop = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&stop);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = tokio::signal::ctrl_c() => {},
        }
        info!("Worker stop requested");
        flag.store(true, Ordering::Relaxed);
    });

    let worker = MirrorWorker::new(&source, &target, config);
    let result = tokio::task::spawn_blocking(move || worker.run(&stop)).await?;
    if let Err(e) = &result {
        error!("Worker for {} failed: {}", source.display(), e);
    }
    result.map_err(Into::into)
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

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

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
