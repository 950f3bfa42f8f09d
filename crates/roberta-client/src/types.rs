//! Push protocol response types

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Raw `/rest/pushcmd` response
///
/// Only `cmd` is interpreted; everything else is kept for logging
/// (e.g. the payload of a `configuration` command).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub cmd: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PushResponse {
    pub fn command(&self) -> Result<ServerCommand> {
        ServerCommand::parse(&self.cmd)
    }
}

/// Command returned by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    /// Nothing to do, push again
    Repeat,
    /// Session rejected or timed out on the server
    Abort,
    /// A program is ready for download
    Download,
    /// New runtime files are available
    Update,
    /// Robot configuration changed (informational)
    Configuration,
}

impl ServerCommand {
    pub fn parse(cmd: &str) -> Result<Self> {
        match cmd {
            "repeat" => Ok(ServerCommand::Repeat),
            "abort" => Ok(ServerCommand::Abort),
            "download" => Ok(ServerCommand::Download),
            "update" => Ok(ServerCommand::Update),
            "configuration" => Ok(ServerCommand::Configuration),
            other => Err(ClientError::UnknownCommand(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerCommand::Repeat => "repeat",
            ServerCommand::Abort => "abort",
            ServerCommand::Download => "download",
            ServerCommand::Update => "update",
            ServerCommand::Configuration => "configuration",
        }
    }
}

/// Binary artifact with the name from its `Filename` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub filename: String,
    pub bytes: Vec<u8>,
}
