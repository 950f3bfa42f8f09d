//! Connector errors

use roberta_client::ClientError;
use roberta_core::{ChannelError, State};
use thiserror::Error;

/// Result type for connector operations
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Errors raised while driving a robot session
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Programming server request failed
    #[error("Server error: {0}")]
    Client(#[from] ClientError),

    /// Robot transport or protocol failed
    #[error("Robot error: {0}")]
    Channel(#[from] ChannelError),

    /// Local I/O failed (config file, temporary program file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConnectorError {
    /// UI state fired for a failure during the given phase
    ///
    /// Server failures map to the phase's own error state; robot failures
    /// carry their own.
    pub fn state_in(&self, server_failure: State) -> State {
        match self {
            ConnectorError::Channel(e) => e.state(),
            ConnectorError::Client(_) | ConnectorError::Io(_) => server_failure,
            ConnectorError::Config(_) => State::ErrorBrick,
        }
    }
}

impl From<toml::de::Error> for ConnectorError {
    fn from(e: toml::de::Error) -> Self {
        ConnectorError::Config(e.to_string())
    }
}
