//! busagent - keeps supervised workers alive against an MQTT bus

use busagent::config::BusAgentConfig;
use busagent::error::{AgentError, AgentResult};
use busagent::observability::logging::{init_logging, parse_level, parse_spans_flag, LogFormat};
use busagent::observability::{metrics::metrics, HealthServer};
use busagent::supervisor::Supervisor;
use busagent::transport::mqtt::MqttConnection;
use busagent::worker::KeepaliveWorker;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, Level};

/// Agent supervisor for an unreliable message bus
#[derive(Parser)]
#[command(name = "busagent")]
#[command(about = "Keeps background workers alive against an unreliable MQTT connection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "BUSAGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace); overrides LOG_LEVEL
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and supervise workers until SIGINT or SIGTERM
    Run,
    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(long)]
        show: bool,
    },
}

const DEFAULT_CONFIG_PATHS: &[&str] = &["busagent.toml", "config/busagent.toml"];

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_cli_logging(cli.verbose);

    info!("Starting busagent v{}", env!("CARGO_PKG_VERSION"));

    let result = match load_configuration(cli.config.as_deref()) {
        Ok(config) => match cli.command {
            Commands::Run => run_agent(config).await,
            Commands::Config { show } => handle_config_command(&config, show),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(e.exit_code());
    }

    info!("Application shutdown complete");
}

fn init_cli_logging(verbose: u8) {
    let level = match verbose {
        0 => parse_level(&std::env::var("LOG_LEVEL").unwrap_or_default()),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
    let include_spans = parse_spans_flag(&std::env::var("LOG_SPANS").unwrap_or_default());

    init_logging(level, format, include_spans);
}

fn load_configuration(config_path: Option<&Path>) -> AgentResult<BusAgentConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(BusAgentConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(BusAgentConfig::load_from_file(path)?);
        }
    }

    Err(AgentError::Config(
        busagent::config::ConfigError::InvalidConfig(
            "No configuration file found. Provide one with -c/--config or create busagent.toml"
                .to_string(),
        ),
    ))
}

async fn run_agent(config: BusAgentConfig) -> AgentResult<()> {
    info!(agent_id = %config.agent.id, "Agent starting");
    let collector = metrics();
    collector.set_supervisor_state("initializing");

    let connection = Arc::new(MqttConnection::new(&config.agent.id, config.mqtt.clone())?);
    let keepalive = config.keepalive_settings();
    let keepalive_interval = keepalive.interval;

    let mut supervisor = Supervisor::new(connection.clone(), config.reconnect.backoff());
    supervisor.register(KeepaliveWorker::new(connection.clone(), keepalive))?;

    if config.health.enabled {
        let health_server = Arc::new(
            HealthServer::new(config.agent.id.clone(), config.health.port, supervisor.status())
                .with_keepalive_staleness(keepalive_interval * 3),
        );
        let (_, serving) = health_server.bind()?;
        tokio::spawn(serving);
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .map_err(|e| AgentError::internal(format!("Failed to install SIGINT handler: {e}")))?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| AgentError::internal(format!("Failed to install SIGTERM handler: {e}")))?;

    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut supervision = tokio::spawn(async move {
        let outcome = supervisor.start(errors_tx, shutdown_rx).await;
        (supervisor, outcome)
    });

    let mut fatal = None;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        Some(e) = errors_rx.recv() => {
            error!(error = %e, "Bus connection cannot be established, shutting down");
            fatal = Some(AgentError::Bus(e));
        }
        joined = &mut supervision => {
            // The loop only returns on shutdown, so this is a crash
            let message = match joined {
                Ok((_, Err(e))) => e.to_string(),
                Ok((_, Ok(()))) => "supervision loop exited unexpectedly".to_string(),
                Err(e) => e.to_string(),
            };
            return Err(AgentError::internal(message));
        }
    }

    collector.set_supervisor_state("stopping");
    let _ = shutdown_tx.send(true);

    let (mut supervisor, outcome) = supervision
        .await
        .map_err(|e| AgentError::internal(format!("Supervisor task failed: {e}")))?;
    outcome?;

    if let Err(e) = supervisor.shutdown().await {
        error!("Error during shutdown: {}", e);
    }
    connection.close().await;
    collector.set_supervisor_state("stopped");

    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn handle_config_command(config: &BusAgentConfig, show: bool) -> AgentResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| AgentError::internal(format!("Failed to render configuration: {e}")))?;
        println!("{rendered}");
    }

    info!("Configuration validation complete");
    Ok(())
}
