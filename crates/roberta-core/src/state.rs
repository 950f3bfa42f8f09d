//! Connector states and the events observers receive

use std::fmt;

use serde::{Deserialize, Serialize};

/// Connector phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Discover,
    Reconnect,
    WaitForConnectButtonPress,
    ConnectButtonIsPressed,
    WaitForCmd,
    WaitUpload,
    WaitExecution,
    Disconnect,
    WaitForServer,
    UpdateSuccess,
    UpdateFail,
    ErrorHttp,
    ErrorUpdate,
    ErrorBrick,
    ErrorDownload,
    ErrorAuth,
    ErrorUploadToRobot,
    ErrorMissingPassword,
    ErrorPythonRequire,
    TokenTimeout,
}

impl State {
    /// Name as shown to operators and in logs (e.g. "WAIT_FOR_CMD")
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Discover => "DISCOVER",
            State::Reconnect => "RECONNECT",
            State::WaitForConnectButtonPress => "WAIT_FOR_CONNECT_BUTTON_PRESS",
            State::ConnectButtonIsPressed => "CONNECT_BUTTON_IS_PRESSED",
            State::WaitForCmd => "WAIT_FOR_CMD",
            State::WaitUpload => "WAIT_UPLOAD",
            State::WaitExecution => "WAIT_EXECUTION",
            State::Disconnect => "DISCONNECT",
            State::WaitForServer => "WAIT_FOR_SERVER",
            State::UpdateSuccess => "UPDATE_SUCCESS",
            State::UpdateFail => "UPDATE_FAIL",
            State::ErrorHttp => "ERROR_HTTP",
            State::ErrorUpdate => "ERROR_UPDATE",
            State::ErrorBrick => "ERROR_BRICK",
            State::ErrorDownload => "ERROR_DOWNLOAD",
            State::ErrorAuth => "ERROR_AUTH",
            State::ErrorUploadToRobot => "ERROR_UPLOAD_TO_ROBOT",
            State::ErrorMissingPassword => "ERROR_MISSING_PASSWORD",
            State::ErrorPythonRequire => "ERROR_PYTHON_REQUIRE",
            State::TokenTimeout => "TOKEN_TIMEOUT",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fired state plus advisory diagnostics
///
/// Diagnostics are free text for display. The connector never inspects them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEvent {
    pub state: State,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl StateEvent {
    pub fn new(state: State) -> Self {
        Self {
            state,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_diagnostics(state: State, diagnostics: Vec<String>) -> Self {
        Self { state, diagnostics }
    }
}

impl From<State> for StateEvent {
    fn from(state: State) -> Self {
        StateEvent::new(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_name_matches_display() {
        for state in [
            State::Discover,
            State::WaitForConnectButtonPress,
            State::ErrorUploadToRobot,
            State::ErrorPythonRequire,
            State::TokenTimeout,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }

    #[test]
    fn test_event_without_diagnostics_serializes_state_only() {
        let event = StateEvent::new(State::WaitForCmd);
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"state":"WAIT_FOR_CMD"}"#
        );
    }
}
