//! Error types for server session operations

use thiserror::Error;

/// Result type alias for server session operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur while talking to the programming server
#[derive(Error, Debug)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Server address could not be turned into a URL
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    /// Server returned an error response
    #[error("Server error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Response lacked a required header
    #[error("Missing response header: {0}")]
    MissingHeader(&'static str),

    /// Server replied with a `cmd` this connector does not know
    #[error("Unknown server command: {0}")]
    UnknownCommand(String),
}

impl ClientError {
    /// Create a server error from status code and message
    pub fn server_error(status: u16, message: impl Into<String>) -> Self {
        Self::ServerError {
            status,
            message: message.into(),
        }
    }

    /// Whether the request timed out
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::HttpError(e) if e.is_timeout())
    }
}
