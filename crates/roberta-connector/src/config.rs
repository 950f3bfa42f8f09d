//! Connector configuration (TOML)
//!
//! ```toml
//! [server]
//! default_address = "lab.open-roberta.org"
//! custom_address = "192.168.0.10:1999"
//!
//! [tools]
//! avrdude = "/usr/bin/avrdude"
//!
//! [[robots]]
//! name = "EV3"
//! family = "ev3"
//! address = "10.0.1.1"
//!
//! [[usb_ids]]
//! vid = 0x2341
//! pid = 0x0043
//! family = "uno"
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use roberta_client::{ServerAddress, DEFAULT_SERVER_ADDRESS};
use roberta_core::{Link, Robot, RobotFamily};
use roberta_device::{ChannelConfig, SerialConfig, SshConfig, ToolPaths};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ConnectorError, Result};

/// Complete connector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    /// Robots that are always offered
    #[serde(default)]
    pub robots: Vec<RobotEntry>,
    /// USB ids recognised by the serial detector
    #[serde(default)]
    pub usb_ids: Vec<UsbId>,
    #[serde(default)]
    pub connector: ConnectorSettings,
}

impl ConnectorConfig {
    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load a config file, falling back to defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            info!(path = %path.display(), "Loading config");
            Self::load(path)
        } else {
            info!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Settings handed to the device channel factory
    pub fn channel_config(&self, password: Option<String>) -> ChannelConfig {
        ChannelConfig {
            tools: self.tools.clone(),
            serial: self.serial.clone(),
            ssh: self.ssh.clone(),
            password,
        }
    }

    /// Robots listed in `[[robots]]`
    pub fn static_robots(&self) -> Result<Vec<Robot>> {
        self.robots.iter().map(RobotEntry::to_robot).collect()
    }
}

// =============================================================================
// Server
// =============================================================================

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_address")]
    pub default_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_address: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_server_address() -> String {
    DEFAULT_SERVER_ADDRESS.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    300_000
}

impl ServerConfig {
    /// Shared address seeded from this section
    pub fn address(&self) -> Arc<ServerAddress> {
        Arc::new(ServerAddress::with_custom(
            self.default_address.clone(),
            self.custom_address.clone(),
        ))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_address: default_server_address(),
            custom_address: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

// =============================================================================
// Robots
// =============================================================================

/// `[[robots]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobotEntry {
    pub name: String,
    /// Server robot id, e.g. "uno", "ev3", "nao"
    pub family: String,
    /// Serial port for wired robots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Host or IP for network robots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default)]
    pub wireless: bool,
}

impl RobotEntry {
    pub fn to_robot(&self) -> Result<Robot> {
        let family = parse_family(&self.family)?;
        let link = match (&self.port, &self.address) {
            (Some(port), None) => Link::Serial(port.clone()),
            (None, Some(address)) => Link::Network(address.clone()),
            _ => {
                return Err(ConnectorError::Config(format!(
                    "robot '{}' needs exactly one of port or address",
                    self.name
                )))
            }
        };
        Ok(Robot::new(self.name.clone(), family, link).wireless(self.wireless))
    }
}

/// `[[usb_ids]]` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
    /// Server robot id
    pub family: String,
    /// Display name; defaults to the family id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl UsbId {
    pub fn family(&self) -> Result<RobotFamily> {
        parse_family(&self.family)
    }
}

fn parse_family(id: &str) -> Result<RobotFamily> {
    RobotFamily::from_server_id(id)
        .ok_or_else(|| ConnectorError::Config(format!("unknown robot family '{}'", id)))
}

// =============================================================================
// Connector
// =============================================================================

/// `[connector]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorSettings {
    /// Pause between probes while discovering
    #[serde(default = "default_discover_interval_ms")]
    pub discover_interval_ms: u64,
    /// Pause between "is the program still running" polls
    #[serde(default = "default_execution_poll_ms")]
    pub execution_poll_ms: u64,
    /// Register without waiting for a connect request
    #[serde(default)]
    pub auto_connect: bool,
}

fn default_discover_interval_ms() -> u64 {
    1_000
}

fn default_execution_poll_ms() -> u64 {
    500
}

impl ConnectorSettings {
    pub fn discover_interval(&self) -> Duration {
        Duration::from_millis(self.discover_interval_ms)
    }

    pub fn execution_poll(&self) -> Duration {
        Duration::from_millis(self.execution_poll_ms)
    }
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            discover_interval_ms: default_discover_interval_ms(),
            execution_poll_ms: default_execution_poll_ms(),
            auto_connect: false,
        }
    }
}
