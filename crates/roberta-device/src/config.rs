//! Device channel configuration
//!
//! These sections are embedded in the connector's TOML file
//! (`[tools]`, `[serial]`, `[ssh]`).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Everything a channel needs besides the robot descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// External flashing tools
    #[serde(default)]
    pub tools: ToolPaths,
    /// Serial protocol settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// SSH robot settings
    #[serde(default)]
    pub ssh: SshConfig,
    /// Password for SSH robots; never read from the config file
    #[serde(skip)]
    pub password: Option<String>,
}

// =============================================================================
// Tools
// =============================================================================

/// Locations of external flashing tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPaths {
    /// avrdude binary
    #[serde(default = "default_avrdude")]
    pub avrdude: PathBuf,
    /// avrdude configuration file (`-C`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avrdude_conf: Option<PathBuf>,
    /// bossac binary
    #[serde(default = "default_bossac")]
    pub bossac: PathBuf,
    /// esptool script, run through `python`
    #[serde(default = "default_esptool")]
    pub esptool: PathBuf,
    /// Python interpreter
    #[serde(default = "default_python")]
    pub python: PathBuf,
}

fn default_avrdude() -> PathBuf {
    PathBuf::from("avrdude")
}

fn default_bossac() -> PathBuf {
    PathBuf::from("bossac")
}

fn default_esptool() -> PathBuf {
    PathBuf::from("esptool.py")
}

fn default_python() -> PathBuf {
    PathBuf::from("python3")
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            avrdude: default_avrdude(),
            avrdude_conf: None,
            bossac: default_bossac(),
            esptool: default_esptool(),
            python: default_python(),
        }
    }
}

// =============================================================================
// Serial
// =============================================================================

/// Serial protocol overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Hub answer timeout; defaults to the product line's own value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_ack_timeout_ms: Option<u64>,
}

impl SerialConfig {
    pub fn hub_ack_timeout(&self) -> Option<Duration> {
        self.hub_ack_timeout_ms.map(Duration::from_millis)
    }
}

// =============================================================================
// SSH
// =============================================================================

/// SSH robot settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Local files copied next to every program
    #[serde(default)]
    pub support_files: Vec<PathBuf>,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Connect timeout (milliseconds)
    #[serde(default = "default_ssh_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_connect_timeout_ms() -> u64 {
    3000
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            support_files: Vec::new(),
            port: default_ssh_port(),
            connect_timeout_ms: default_ssh_connect_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: ChannelConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tools.avrdude, PathBuf::from("avrdude"));
        assert_eq!(config.tools.python, PathBuf::from("python3"));
        assert_eq!(config.ssh.port, 22);
        assert!(config.serial.hub_ack_timeout().is_none());
        assert!(config.password.is_none());
    }

    #[test]
    fn test_partial_tools_section() {
        let config: ChannelConfig = serde_json::from_str(
            r#"{"tools": {"avrdude": "/opt/arduino/avrdude",
                          "avrdude_conf": "/opt/arduino/avrdude.conf"},
                "serial": {"hub_ack_timeout_ms": 2000}}"#,
        )
        .unwrap();
        assert_eq!(config.tools.avrdude, PathBuf::from("/opt/arduino/avrdude"));
        assert_eq!(
            config.tools.avrdude_conf,
            Some(PathBuf::from("/opt/arduino/avrdude.conf"))
        );
        assert_eq!(config.tools.bossac, PathBuf::from("bossac"));
        assert_eq!(
            config.serial.hub_ack_timeout(),
            Some(Duration::from_millis(2000))
        );
    }
}
