//! Sharebox Daemon
//!
//! Headless service for ephemeral file shares.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::ipc::{get_socket_path, IpcClient, IpcResponse, IpcShareInfo};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Sharebox Daemon - ephemeral token-addressed file shares.
#[derive(Parser, Debug)]
#[command(name = "sharebox")]
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
    /// Start the Sharebox daemon
    Start,

    /// Stop the running daemon
    Stop {
        /// Timeout in seconds for graceful shutdown (default: 30)
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Run an eviction sweep now
    Sweep,

    /// Manage shares
    #[command(subcommand)]
    Shares(SharesCommands),
}

/// Subcommands for share management.
#[derive(Subcommand, Debug, Clone)]
pub enum SharesCommands {
    /// List shares, newest first
    List {
        /// Page to show, starting at 1
        #[arg(long, default_value = "1")]
        page: u32,

        /// Shares per page
        #[arg(long, default_value = "20")]
        per_page: u32,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Create a share
    Create {
        /// Recipient address; without one the share never expires
        #[arg(long, short)]
        recipient: Option<String>,
    },

    /// Delete a share and its files
    Delete {
        /// Share token
        token: String,
    },

    /// Restart a share's retention period
    Reactivate {
        /// Share token
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    let _log_guard = init_tracing(&config, cli.verbose)?;

    config.validate()?;

    match cli.command {
        Commands::Start => {
            let socket_path = get_socket_path();
            if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(500))
                .await
                .is_ok()
            {
                eprintln!("Error: Daemon already running ({})", socket_path.display());
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  sharebox-daemon stop");
                std::process::exit(1);
            }

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_daemon(&mut orchestrator).await?;
        }
        Commands::Stop { timeout } => match graceful_stop_daemon(timeout).await {
            Ok(()) => println!("Daemon stopped successfully"),
            Err(e) => {
                eprintln!("Failed to stop daemon: {:#}", e);
                std::process::exit(1);
            }
        },
        Commands::Status => {
            let mut client = connect().await?;
            match client.status().await? {
                IpcResponse::Status {
                    running,
                    uptime_secs,
                    total_shares,
                    active_shares,
                } => {
                    println!(
                        "Daemon Status: {}",
                        if running { "running" } else { "stopped" }
                    );
                    println!("  Uptime: {}", format_duration(uptime_secs));
                    println!("  Shares: {} ({} active)", total_shares, active_shares);
                }
                other => return unexpected(other),
            }
        }
        Commands::Sweep => {
            let mut client = connect().await?;
            match client.sweep().await? {
                IpcResponse::SweepCompleted { removed } => {
                    println!("Sweep finished: {} share(s) reclaimed", removed);
                }
                other => return unexpected(other),
            }
        }
        Commands::Shares(cmd) => run_shares_command(cmd).await?,
    }

    Ok(())
}

/// Set up stderr logging, plus a daily log file when `log_dir` is set.
///
/// `RUST_LOG` wins over `--verbose`, which wins over the configured level.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match config.log_dir() {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "sharebox-daemon.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

async fn run_shares_command(cmd: SharesCommands) -> anyhow::Result<()> {
    let mut client = connect().await?;

    match cmd {
        SharesCommands::List {
            page,
            per_page,
            json,
        } => match client.list_shares(page, per_page).await? {
            IpcResponse::Shares {
                page,
                pages,
                total,
                shares,
            } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&shares)?);
                } else {
                    print_shares_table(&shares);
                    println!();
                    println!("Page {} of {} ({} share(s))", page, pages.max(1), total);
                }
            }
            other => return unexpected(other),
        },
        SharesCommands::Create { recipient } => match client.create_share(recipient).await? {
            IpcResponse::ShareCreated { token } => println!("{}", token),
            other => return unexpected(other),
        },
        SharesCommands::Delete { token } => match client.delete_share(token).await? {
            IpcResponse::ShareDeleted { token } => println!("Share {} deleted", token),
            other => return unexpected(other),
        },
        SharesCommands::Reactivate { token } => match client.reactivate(token).await? {
            IpcResponse::ShareReactivated {
                token,
                expires_at: Some(expires_at),
            } => println!("Share {} now expires {}", token, format_timestamp(expires_at)),
            IpcResponse::ShareReactivated {
                token,
                expires_at: None,
            } => println!("Share {} has no recipient and does not expire", token),
            other => return unexpected(other),
        },
    }

    Ok(())
}

/// Connect to the running daemon.
async fn connect() -> anyhow::Result<IpcClient> {
    let socket_path = get_socket_path();
    IpcClient::connect(&socket_path)
        .await
        .with_context(|| {
            format!(
                "Daemon is not running (cannot connect to {})",
                socket_path.display()
            )
        })
}

fn unexpected(response: IpcResponse) -> anyhow::Result<()> {
    match response {
        IpcResponse::Error { message } => anyhow::bail!("Daemon returned error: {}", message),
        other => anyhow::bail!("Unexpected response from daemon: {:?}", other),
    }
}

/// Print shares in a formatted ASCII table.
fn print_shares_table(shares: &[IpcShareInfo]) {
    if shares.is_empty() {
        println!("No shares.");
        return;
    }

    let token_width = shares.iter().map(|s| s.token.len()).max().unwrap_or(5).max(5);
    let recipient_width = shares
        .iter()
        .map(|s| s.recipient.as_ref().map(|r| r.len()).unwrap_or(1))
        .max()
        .unwrap_or(9)
        .clamp(9, 32);

    println!(
        "{:<token_width$}  {:<recipient_width$}  {:>5}  {:>9}  {:<16}",
        "TOKEN",
        "RECIPIENT",
        "FILES",
        "DOWNLOADS",
        "EXPIRES",
        token_width = token_width,
        recipient_width = recipient_width
    );
    println!("{}", "-".repeat(token_width + recipient_width + 42));

    for share in shares {
        let recipient = share.recipient.as_deref().unwrap_or("-");
        let expires = match share.expires_at {
            _ if share.expired => "expired".to_string(),
            Some(ts) => format_timestamp(ts),
            None => "never".to_string(),
        };

        println!(
            "{:<token_width$}  {:<recipient_width$}  {:>5}  {:>9}  {:<16}",
            share.token,
            truncate_str(recipient, recipient_width),
            share.files,
            share.download_count,
            expires,
            token_width = token_width,
            recipient_width = recipient_width
        );
    }
}

/// Format a Unix timestamp relative to now (e.g., "in 5h").
fn format_timestamp(timestamp: i64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let remaining = timestamp.saturating_sub(now);
    if remaining <= 0 {
        "now".to_string()
    } else if remaining < 3600 {
        format!("in {}m", remaining / 60)
    } else if remaining < 86400 {
        format!("in {}h", remaining / 3600)
    } else {
        format!("in {}d", remaining / 86400)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Gracefully stop the daemon via IPC.
///
/// Sends a shutdown request to the daemon and waits for the socket to go away.
async fn graceful_stop_daemon(timeout_secs: u64) -> anyhow::Result<()> {
    let socket_path = get_socket_path();
    let mut client = connect().await?;

    println!("Sending shutdown request...");

    client.set_timeout(Duration::from_secs(timeout_secs));
    match client.stop().await.context("Failed to send stop request")? {
        IpcResponse::Stopping => {
            println!("Shutdown acknowledged, waiting for daemon to exit...");
        }
        other => return unexpected(other),
    }

    let start = std::time::Instant::now();
    let timeout = Duration::from_secs(timeout_secs);

    while start.elapsed() < timeout {
        if !socket_path.exists() {
            return Ok(());
        }

        if IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .is_err()
        {
            return Ok(());
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Run the daemon until a signal or a `Stop` request arrives.
async fn run_daemon(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!(?state, "Orchestrator state changed");
                }
                OrchestratorEvent::SweepCompleted { reclaimed } => {
                    tracing::debug!(reclaimed, "Manual sweep completed");
                }
                OrchestratorEvent::ShareCreated { token } => {
                    tracing::debug!(%token, "Share created");
                }
                OrchestratorEvent::ShareDeleted { token } => {
                    tracing::debug!(%token, "Share deleted");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    let shutdown = orchestrator.shutdown_token();
    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {
            tracing::info!("Shutdown requested");
        }
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
