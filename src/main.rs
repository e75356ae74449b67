//! MQTT Connector - Main Entry Point
//!
//! Connects to a WebSocket MQTT broker and either monitors a topic, publishes
//! a single message envelope, or validates the configuration.

use clap::{Parser, Subcommand};
use mqtt_connector::config::{BrokerPreset, ConnectorConfig};
use mqtt_connector::connector::{ConnectionManager, ConnectionState, ConnectorSnapshot};
use mqtt_connector::observability::logging::{init_default_logging, init_logging, LogFormat};
use mqtt_connector::protocol::ParsedPayload;
use mqtt_connector::transport::mqtt::RumqttProvider;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::{
    signal,
    time::{sleep, Duration},
};
use tracing::{error, info, warn, Level};

/// Configuration files tried when `--config` is not given
const DEFAULT_CONFIG_PATHS: [&str; 2] = ["mqtt-connector.toml", "config/mqtt-connector.toml"];

/// Time given to an outgoing publish before the session is closed
const PUBLISH_FLUSH: Duration = Duration::from_millis(500);

/// WebSocket MQTT connector
#[derive(Parser)]
#[command(name = "mqtt-connector")]
#[command(about = "Persistent MQTT-over-WebSocket connector with bounded automatic retry")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker preset (hivemq, mosquitto, mosquitto-auth, aws-iot)
    #[arg(long, value_name = "NAME")]
    preset: Option<String>,

    /// Broker host, overriding the configuration file
    #[arg(long, env = "MQTT_HOST")]
    host: Option<String>,

    /// Broker WebSocket port, overriding the configuration file
    #[arg(long, env = "MQTT_PORT")]
    port: Option<u32>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe and log every message until Ctrl+C
    Monitor {
        /// Topic to subscribe to (defaults to topics.default)
        #[arg(short, long)]
        topic: Option<String>,
    },
    /// Publish one message envelope and exit
    Publish {
        #[arg(short, long)]
        topic: Option<String>,
        #[arg(short, long)]
        message: String,
    },
    /// Validate the configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    }

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Monitor { topic } => run_monitor(config, topic).await,
        Commands::Publish { topic, message } => run_publish(config, topic, message).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<ConnectorConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ConnectorConfig::load_from_file(path)?
        }
        None => match DEFAULT_CONFIG_PATHS
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
        {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                ConnectorConfig::load_from_file(path)?
            }
            None => {
                info!("No configuration file found, using defaults");
                ConnectorConfig::default()
            }
        },
    };

    if let Some(name) = &cli.preset {
        let preset =
            BrokerPreset::parse(name).ok_or_else(|| format!("Unknown broker preset: {name}"))?;
        config.broker.preset = Some(preset);
    }
    if let Some(host) = &cli.host {
        config.broker.host = Some(host.clone());
    }
    if let Some(port) = cli.port {
        config.broker.port = Some(port);
    }

    config.validate()?;
    Ok(config)
}

async fn run_monitor(
    config: ConnectorConfig,
    topic: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let topic = topic.unwrap_or_else(|| config.topics.default.clone());
    let manager = ConnectionManager::from_config(&config, Arc::new(RumqttProvider::new()))?;
    let mut updates = manager.watch();
    let mut was_connected = false;
    let mut seen = 0u64;

    info!(client_id = manager.client_id(), %topic, "Monitoring; press Ctrl+C to stop");

    let outcome: Result<(), Box<dyn std::error::Error>> = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break Ok(());
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break Err("connection manager stopped unexpectedly".into());
                }
                let snapshot = updates.borrow_and_update().clone();

                // Subscriptions do not survive a new session
                if snapshot.is_connected() && !was_connected {
                    match manager.subscribe(topic.clone()) {
                        Ok(()) => info!(%topic, "Subscribed"),
                        Err(e) => break Err(e.into()),
                    }
                }
                was_connected = snapshot.is_connected();

                log_new_messages(&snapshot, seen);
                seen = snapshot.messages_received;

                if snapshot.state == ConnectionState::Failed {
                    break Err(format!(
                        "gave up after {} failed attempts: {}",
                        snapshot.retry_count,
                        snapshot
                            .last_error
                            .as_ref()
                            .map(|failure| failure.message.as_str())
                            .unwrap_or("unknown error"),
                    )
                    .into());
                }
            }
        }
    };

    manager.shutdown().await;
    outcome
}

fn log_new_messages(snapshot: &ConnectorSnapshot, seen: u64) {
    let fresh =
        usize::try_from(snapshot.messages_received.saturating_sub(seen)).unwrap_or(usize::MAX);
    if fresh > snapshot.messages.len() {
        warn!(
            dropped = fresh - snapshot.messages.len(),
            "Messages evicted before they could be logged"
        );
    }

    // History is newest first; log oldest first
    let mut batch: Vec<&String> = snapshot.messages.iter().take(fresh).collect();
    batch.reverse();
    for payload in batch {
        match ParsedPayload::from_payload(payload) {
            ParsedPayload::Envelope(parsed) => {
                info!(timestamp = %parsed.timestamp, "Message: {}", parsed.message)
            }
            ParsedPayload::Raw(raw) => info!("Raw payload: {}", raw),
        }
    }
}

async fn run_publish(
    config: ConnectorConfig,
    topic: Option<String>,
    message: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let topic = topic.unwrap_or_else(|| config.topics.default.clone());
    let manager = ConnectionManager::from_config(&config, Arc::new(RumqttProvider::new()))?;

    if let Err(e) = manager.wait_until_connected(config.connect_deadline()).await {
        manager.shutdown().await;
        return Err(e.into());
    }

    manager.publish_envelope(topic.clone(), message)?;
    info!(%topic, "Message published");

    sleep(PUBLISH_FLUSH).await;
    manager.disconnect()?;
    manager.shutdown().await;
    Ok(())
}

fn handle_config_command(
    config: ConnectorConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection = config.connection_config()?;
    let policy = config.retry_policy();

    if show {
        let mut masked = config.clone();
        if masked.broker.password.is_some() {
            masked.broker.password = Some("***".to_string());
        }
        println!("Configuration file:");
        println!("{}", toml::to_string_pretty(&masked)?);
        println!("Effective connection: {connection:#?}");
        println!(
            "Retry: {} attempts, worst case {:?} of waiting",
            policy.max_attempts,
            policy.calculate_max_total_time()
        );
    }

    info!(
        client_id = %connection.client_id,
        host = %connection.host,
        port = connection.port,
        "Configuration is valid"
    );
    Ok(())
}
