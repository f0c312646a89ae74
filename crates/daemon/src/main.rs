//! Wireless Helper
//!
//! Finds the headunit and hands the projection session to the local client.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::Config;
use daemon::discovery::{
    ActiveScanner, DiscoveryEvent, PortProber, TcpProber, DEFAULT_PROBE_TIMEOUT,
};
use daemon::ipc::{get_socket_path, IpcClient, IpcResponse, IpcServer, RequestHandler};
use daemon::strategy::{ConnectionMode, StrategySelector};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Wireless Helper - finds the headunit and starts the projection session.
#[derive(Parser, Debug)]
#[command(name = "wireless-helper")]
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

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the daemon in the foreground
    Run {
        /// Connection mode (defaults to daemon.mode from the config)
        #[arg(long, short, value_enum)]
        mode: Option<ConnectionMode>,
    },

    /// (Re)start discovery on a running daemon
    Start {
        /// Connection mode
        #[arg(long, short, value_enum)]
        mode: ConnectionMode,
    },

    /// Stop discovery on a running daemon
    Stop,

    /// Show daemon status
    Status,

    /// Ask a running daemon to exit
    Shutdown,

    /// Probe a single TCP port
    Probe {
        /// Host address
        host: IpAddr,

        /// TCP port
        port: u16,

        /// Connect timeout in milliseconds
        #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT.as_millis() as u64)]
        timeout_ms: u64,
    },

    /// Run one active scan pass and print the headunit, if found
    Scan,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Run { mode } => {
            let mode = mode.unwrap_or(config.daemon.mode);
            run_daemon(config, mode).await?;
        }
        Commands::Start { mode } => {
            let response = connect().await?.start(mode).await?;
            print_response(response)?;
        }
        Commands::Stop => {
            let response = connect().await?.stop().await?;
            print_response(response)?;
        }
        Commands::Status => match query_daemon_status().await {
            Ok(response) => print_response(response)?,
            Err(_) => {
                println!("Wireless helper daemon is not running");
                std::process::exit(1);
            }
        },
        Commands::Shutdown => {
            let response = connect().await?.shutdown().await?;
            print_response(response)?;
        }
        Commands::Probe {
            host,
            port,
            timeout_ms,
        } => {
            let open = TcpProber
                .probe(host, port, Duration::from_millis(timeout_ms))
                .await;
            if open {
                println!("{}:{} is open", host, port);
            } else {
                println!("{}:{} is closed", host, port);
                std::process::exit(1);
            }
        }
        Commands::Scan => {
            if !scan_once(&config).await? {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Runs the selector and the IPC server until a signal or an IPC shutdown.
async fn run_daemon(config: Config, mode: ConnectionMode) -> anyhow::Result<()> {
    tracing::info!("Wireless helper starting in {} mode", mode);

    let socket_path = get_socket_path();
    if IpcClient::connect_with_timeout(&socket_path, Duration::from_secs(1))
        .await
        .is_ok()
    {
        anyhow::bail!(
            "another daemon is already listening on {}",
            socket_path.display()
        );
    }

    let selector = Arc::new(
        StrategySelector::from_config(&config).context("Failed to set up platform handoff")?,
    );
    let shutdown = CancellationToken::new();

    let server = IpcServer::bind(&socket_path)
        .await
        .with_context(|| format!("Failed to bind IPC socket {}", socket_path.display()))?;
    let handler = Arc::new(RequestHandler::new(Arc::clone(&selector), shutdown.clone()));
    let server_task = tokio::spawn(server.serve(handler, shutdown.clone()));

    if let Err(e) = selector.start(mode).await {
        tracing::error!("Failed to start discovery: {}", e);
    }

    tokio::select! {
        result = wait_for_shutdown_signal() => result?,
        _ = shutdown.cancelled() => {}
    }

    tracing::info!("Shutting down...");
    shutdown.cancel();
    selector.stop().await;
    if let Err(e) = server_task.await {
        tracing::warn!("IPC server task failed: {}", e);
    }
    tracing::info!("Wireless helper stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
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

/// Runs one active scan pass. Returns whether a headunit was found.
async fn scan_once(config: &Config) -> anyhow::Result<bool> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut scanner = ActiveScanner::new(config.scan.scan_config(&config.ports), tx);
    scanner.start_scan();

    let mut found = false;
    while let Some(event) = rx.recv().await {
        match event {
            DiscoveryEvent::Found { endpoint, .. } => {
                println!("Headunit found at {}", endpoint);
                found = true;
            }
            DiscoveryEvent::PassComplete { .. } => break,
        }
    }
    scanner.stop();

    if !found {
        println!("No headunit found");
    }
    Ok(found)
}

async fn connect() -> anyhow::Result<IpcClient> {
    let socket_path = get_socket_path();
    IpcClient::connect_with_timeout(&socket_path, Duration::from_secs(5))
        .await
        .with_context(|| {
            format!(
                "Failed to connect to daemon at {} (is it running?)",
                socket_path.display()
            )
        })
}

async fn query_daemon_status() -> anyhow::Result<IpcResponse> {
    let mut client = connect().await?;
    Ok(client.status().await?)
}

fn print_response(response: IpcResponse) -> anyhow::Result<()> {
    match response {
        IpcResponse::Pong => println!("Daemon is alive"),
        IpcResponse::Status {
            running,
            uptime_secs,
            state,
            mode,
            engaged,
            relay_port,
        } => {
            println!("Wireless Helper Status");
            println!("======================");
            println!("  Running:  {}", running);
            println!("  Uptime:   {}", format_duration(uptime_secs));
            println!("  State:    {}", state);
            match mode {
                Some(mode) => println!("  Mode:     {}", mode),
                None => println!("  Mode:     -"),
            }
            println!("  Launch:   {}", if engaged { "engaged" } else { "idle" });
            if let Some(port) = relay_port {
                println!("  Relay:    127.0.0.1:{}", port);
            }
        }
        IpcResponse::Started { mode } => println!("Discovery started in {} mode", mode),
        IpcResponse::Stopped => println!("Discovery stopped"),
        IpcResponse::ShuttingDown => println!("Daemon is shutting down"),
        IpcResponse::Error { message } => anyhow::bail!("Daemon error: {}", message),
    }
    Ok(())
}

/// Format a duration in seconds as a human-readable string.
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
