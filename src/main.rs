//! unitgate - TCP to MQTT unit gateway
//!
//! Usage:
//!   unitgate [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path (default: unitgate.toml)
//!   -b, --bind <ADDR>      Backend listener address (default: 127.0.0.1:6080)
//!   --broker <ADDR>        MQTT broker address (host:port)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use unitgate::config::Config;
use unitgate::Service;

/// Config file used when `--config` is not given; may be absent
const DEFAULT_CONFIG_PATH: &str = "unitgate.toml";

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// unitgate - TCP to MQTT unit gateway
#[derive(Parser, Debug)]
#[command(name = "unitgate")]
#[command(version)]
#[command(about = "Bridges Backend TCP commands to device units over MQTT")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backend listener address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// MQTT broker address (host:port)
    #[arg(long)]
    broker: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = match Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config file {:?}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    // CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(broker) = args.broker {
        config.mqtt.address = broker;
    }
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    info!("Starting unitgate");
    info!("  Config file: {:?}", config_path);
    info!("  Backend listener: {}", config.server.bind);
    info!("  Framing: {}", config.server.framing);
    info!("  Broker: {}", config.mqtt.address);
    info!("  Command namespace: {}", config.topics.command_namespace);
    info!("  Device namespace: {}", config.topics.device_namespace);

    let service = match Service::start(&config).await {
        Ok(service) => service,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    shutdown_signal().await;
    info!("Shutdown signal received");
    service.shutdown().await;

    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
