//! Errors reported by device channels

use thiserror::Error;

use crate::state::State;

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Errors that can occur while talking to a robot
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The link (serial port, HTTP endpoint, SSH session) failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The robot did not answer in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The robot answered with something unexpected
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A password is needed before the robot can be reached
    #[error("Password required")]
    MissingPassword,

    /// The robot rejected the credentials
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A Python interpreter is needed for the flashing tool
    #[error("Python interpreter required: {0}")]
    PythonRequired(String),

    /// Firmware or HAL installation failed on the robot
    #[error("Update failed: {0}")]
    Update(String),

    /// Operation not offered by this robot family
    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl ChannelError {
    /// The UI state fired for this error
    pub fn state(&self) -> State {
        match self {
            ChannelError::Transport(_)
            | ChannelError::Timeout(_)
            | ChannelError::Protocol(_)
            | ChannelError::NotSupported(_) => State::ErrorBrick,
            ChannelError::MissingPassword => State::ErrorMissingPassword,
            ChannelError::AuthenticationFailed(_) => State::ErrorAuth,
            ChannelError::PythonRequired(_) => State::ErrorPythonRequire,
            ChannelError::Update(_) => State::ErrorUpdate,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => ChannelError::Timeout(e.to_string()),
            _ => ChannelError::Transport(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(ChannelError::MissingPassword.state(), State::ErrorMissingPassword);
        assert_eq!(
            ChannelError::AuthenticationFailed("denied".into()).state(),
            State::ErrorAuth
        );
        assert_eq!(
            ChannelError::PythonRequired("esptool".into()).state(),
            State::ErrorPythonRequire
        );
        assert_eq!(ChannelError::Timeout("ack".into()).state(), State::ErrorBrick);
    }

    #[test]
    fn test_io_timeout_maps_to_timeout() {
        let err: ChannelError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(matches!(err, ChannelError::Timeout(_)));
    }
}
