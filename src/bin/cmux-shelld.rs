//! cmux-shelld binary entry point.
//!
//! Serves sandboxed shell sessions over WebSocket at `/ws/terminal/`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use cmux_shell::config::{DEFAULT_COLS, DEFAULT_ROWS};
use cmux_shell::{serve, AppState, IsolationTool, ShellConfig};

/// Sandboxed shell sessions over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "cmux-shelld")]
#[command(about = "Sandboxed interactive shell sessions over WebSocket")]
struct Args {
    /// Address to listen on
    #[arg(short, long, env = "CMUX_SHELL_BIND", default_value = "127.0.0.1:39390")]
    bind: SocketAddr,

    /// Directory under which per-session workspaces are created
    /// (defaults to the system temp directory)
    #[arg(long, env = "CMUX_SHELL_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Isolation tool: firejail, bwrap, or none
    #[arg(long, env = "CMUX_SHELL_ISOLATION", default_value = "firejail")]
    isolation: String,

    /// Path of the isolation tool binary
    #[arg(long, env = "CMUX_SHELL_ISOLATION_PATH")]
    isolation_path: Option<PathBuf>,

    /// Candidate shells, tried in order (comma separated)
    #[arg(long, env = "CMUX_SHELL_SHELLS", value_delimiter = ',')]
    shells: Vec<PathBuf>,

    /// Do not create starter files in new workspaces
    #[arg(long, env = "CMUX_SHELL_NO_SEED")]
    no_seed: bool,

    /// Terminal columns
    #[arg(long, default_value_t = DEFAULT_COLS)]
    cols: u16,

    /// Terminal rows
    #[arg(long, default_value_t = DEFAULT_ROWS)]
    rows: u16,

    /// Milliseconds a shell gets to exit after SIGTERM before SIGKILL
    #[arg(long, env = "CMUX_SHELL_TERMINATE_GRACE_MS", default_value = "2000")]
    terminate_grace_ms: u64,

    /// Write logs to daily-rotated files in this directory as well
    #[arg(long, env = "CMUX_SHELL_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn shell_config(&self) -> anyhow::Result<ShellConfig> {
        let Some(isolation) = IsolationTool::from_name(&self.isolation, self.isolation_path.clone())
        else {
            bail!(
                "unknown isolation tool '{}' (expected firejail, bwrap or none)",
                self.isolation
            );
        };

        let mut config = ShellConfig::default().with_isolation(isolation);
        if let Some(root) = &self.workspace_root {
            config = config.with_workspace_root(root);
        }
        if !self.shells.is_empty() {
            config = config.with_shell_candidates(self.shells.iter().cloned());
        }
        config.seed_workspace = !self.no_seed;
        config.cols = self.cols;
        config.rows = self.rows;
        config.terminate_grace = Duration::from_millis(self.terminate_grace_ms);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = if args.verbose {
        EnvFilter::default().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()))
    };

    // Keep the guard alive so buffered file logs are flushed on exit.
    let (file_layer, _log_guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cmux-shelld.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(file_layer)
        .init();

    let config = args.shell_config()?;

    if let IsolationTool::Firejail { path } | IsolationTool::Bubblewrap { path } =
        &config.isolation
    {
        if !path.exists() {
            warn!(
                tool = %config.isolation,
                path = %path.display(),
                "Isolation tool not found, sessions will run in direct mode"
            );
        }
    }

    info!(
        bind = %args.bind,
        workspace_root = %config.workspace_root.display(),
        isolation = %config.isolation,
        "Starting cmux-shelld"
    );

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!("Listening on {}", args.bind);

    serve(listener, AppState::new(config), shutdown_signal()).await?;

    info!("cmux-shelld stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
