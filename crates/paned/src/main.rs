//! paned — the pane worker daemon.
//!
//! Runs one worker: binds the state backend, starts maintenance, and serves
//! widget sockets plus the admin API.
//!
//! # Usage
//!
//! ```text
//! paned serve --port 8765
//! paned serve --deploy --redis-url redis://cache:6379/0 --worker-id worker-a
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pane_core::{LogFormat, PaneConfig};
use pane_state::{BackgroundTasks, Dispatcher, ServerStateManager};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "paned", about = "pane worker daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one worker process.
    Serve {
        /// Path to pane.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind.
        #[arg(long)]
        host: Option<String>,

        /// Multi-worker mode; selects the shared backend.
        #[arg(long)]
        deploy: bool,

        /// Shared store URL.
        #[arg(long)]
        redis_url: Option<String>,

        /// Stable worker identity.
        #[arg(long)]
        worker_id: Option<String>,

        /// Log output: pretty or json.
        #[arg(long)]
        log_format: Option<LogFormat>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            host,
            deploy,
            redis_url,
            worker_id,
            log_format,
        } => {
            let mut config = PaneConfig::load(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if deploy {
                config.state.deploy_mode = true;
            }
            if redis_url.is_some() {
                config.state.backend_url = redis_url;
            }
            if worker_id.is_some() {
                config.state.worker_id = worker_id;
            }
            if let Some(format) = log_format {
                config.server.log_format = format;
            }
            config.validate()?;

            init_tracing(config.server.log_format);
            serve(config).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,paned=debug,pane_state=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn serve(config: PaneConfig) -> anyhow::Result<()> {
    info!(
        deploy_mode = config.state.deploy_mode,
        "pane worker starting"
    );

    // ── State backend ──────────────────────────────────────────

    let manager = Arc::new(
        ServerStateManager::start(config.state.clone())
            .await
            .context("failed to bind state backend")?,
    );
    info!(
        backend = %manager.backend(),
        worker_id = %manager.worker_id(),
        "state backend ready"
    );

    // ── Background maintenance ─────────────────────────────────

    let tasks = BackgroundTasks::spawn(Arc::clone(&manager));
    let dispatcher = Dispatcher::new(Arc::clone(&manager));

    // ── HTTP + WebSocket server ────────────────────────────────

    let router = paned::build_router(dispatcher.clone(), config.server.send_queue);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    dispatcher.shutdown().await;
    tasks.shutdown().await;

    info!("pane worker stopped");
    Ok(())
}
