//! roberta-connectord - headless robot connector
//!
//! Detects a robot, registers it with the programming server and uploads
//! the programs the server hands out. Ctrl-C closes the active connector
//! and exits.
//!
//! Usage:
//!   roberta-connectord [OPTIONS]
//!
//! Examples:
//!   # Use the config in the default location
//!   roberta-connectord
//!
//!   # Local server, register without a UI
//!   roberta-connectord --server localhost:1999 --auto-connect
//!
//!   # Show what would be driven and exit
//!   roberta-connectord --scan

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use roberta_connector::{
    ConnectorConfig, ConnectorSupervisor, Detector, StaticDetector, UsbSerialDetector,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str =
    "roberta_connectord=info,roberta_connector=info,roberta_client=info,roberta_device=debug";

#[derive(Parser)]
#[command(name = "roberta-connectord")]
#[command(author, version, about = "Connects robots to the programming server")]
struct Cli {
    /// Programming server address (overrides the config file)
    #[arg(short, long, env = "ROBERTA_SERVER")]
    server: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "ROBERTA_CONFIG")]
    config: Option<PathBuf>,

    /// Password for SSH robots (NAO, Robotino)
    #[arg(long, env = "ROBERTA_ROBOT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Register as soon as a robot is found
    #[arg(short, long)]
    auto_connect: bool,

    /// Print detected robots and exit
    #[arg(long)]
    scan: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };

    if cli.log_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("Could not determine config directory")?
        .join("roberta-connector");
    Ok(dir.join("config.toml"))
}

fn load_config(cli: &Cli) -> Result<ConnectorConfig> {
    let mut config = match &cli.config {
        Some(path) => ConnectorConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => {
            let path = default_config_path()?;
            ConnectorConfig::load_or_default(&path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?
        }
    };

    if let Some(server) = &cli.server {
        config.server.custom_address = Some(server.clone());
    }
    if cli.auto_connect {
        config.connector.auto_connect = true;
    }
    Ok(config)
}

fn detectors(config: &ConnectorConfig) -> Result<Vec<Box<dyn Detector>>> {
    let robots = config
        .static_robots()
        .context("Invalid [[robots]] entry")?;
    let detectors: Vec<Box<dyn Detector>> = vec![
        Box::new(StaticDetector::new(robots)),
        Box::new(UsbSerialDetector::new(config.usb_ids.clone())),
    ];
    Ok(detectors)
}

async fn scan(config: &ConnectorConfig) -> Result<()> {
    for detector in detectors(config)? {
        for robot in detector.detect_robots().await {
            println!("{:<12} {}", detector.name(), robot);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = load_config(&cli)?;
    if cli.scan {
        return scan(&config).await;
    }

    tracing::info!(
        server = %config.server.address().current(),
        auto_connect = config.connector.auto_connect,
        "Starting roberta-connectord"
    );

    let supervisor = ConnectorSupervisor::new(
        &config,
        config.channel_config(cli.password.clone()),
        detectors(&config)?,
    );
    let handle = supervisor.handle();
    let mut supervisor_task = tokio::spawn(supervisor.run());

    // Log robot selection changes
    let mut active = handle.watch_active();
    tokio::spawn(async move {
        while active.changed().await.is_ok() {
            let robot = active.borrow().as_ref().map(|h| h.robot().to_string());
            match robot {
                Some(robot) => tracing::info!(robot = %robot, "Robot selected"),
                None => tracing::info!("No robot selected"),
            }
        }
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            tracing::info!("Shutting down");
            handle.shutdown();
            supervisor_task.await.context("Supervisor task failed")??;
        }
        result = &mut supervisor_task => {
            result.context("Supervisor task failed")??;
        }
    }

    Ok(())
}
