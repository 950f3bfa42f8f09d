//! Device information sent with every server request

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::robot::RobotFamily;
use crate::token::Token;

/// Command sent to the server in the `cmd` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushCmd {
    Register,
    Push,
}

impl PushCmd {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushCmd::Register => "register",
            PushCmd::Push => "push",
        }
    }
}

/// Flat string map serialised as a JSON object
///
/// Built fresh by a channel for every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceInfo(BTreeMap<String, String>);

impl DeviceInfo {
    pub const FIRMWARE_NAME: &'static str = "firmwarename";
    pub const ROBOT: &'static str = "robot";
    pub const BRICK_NAME: &'static str = "brickname";
    pub const TOKEN: &'static str = "token";
    pub const CMD: &'static str = "cmd";

    pub fn new() -> Self {
        Self::default()
    }

    /// Map with the mandatory `firmwarename`, `robot` and `brickname` fields
    pub fn for_robot(family: RobotFamily, brick_name: impl Into<String>) -> Self {
        let mut info = Self::new();
        info.insert(Self::FIRMWARE_NAME, family.firmware_name());
        info.insert(Self::ROBOT, family.server_id());
        info.insert(Self::BRICK_NAME, brick_name);
        info
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn with_token(self, token: &Token) -> Self {
        self.with(Self::TOKEN, token.as_str())
    }

    pub fn with_cmd(self, cmd: PushCmd) -> Self {
        self.with(Self::CMD, cmd.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robot::ArduinoBoard;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_for_robot_sets_mandatory_fields() {
        let info = DeviceInfo::for_robot(RobotFamily::Arduino(ArduinoBoard::Uno), "Uno");
        assert_eq!(info.get("firmwarename"), Some("arduino"));
        assert_eq!(info.get("robot"), Some("uno"));
        assert_eq!(info.get("brickname"), Some("Uno"));
        assert!(!info.contains("token"));
    }

    #[test]
    fn test_token_and_cmd_serialize_flat() {
        let token = Token::parse("ABCD1234").unwrap();
        let info = DeviceInfo::for_robot(RobotFamily::Ev3, "EV3")
            .with("battery", "7.9")
            .with_token(&token)
            .with_cmd(PushCmd::Register);

        let json: serde_json::Value = serde_json::to_value(&info).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "battery": "7.9",
                "brickname": "EV3",
                "cmd": "register",
                "firmwarename": "ev3lejosv1",
                "robot": "ev3",
                "token": "ABCD1234",
            })
        );
    }

    #[test]
    fn test_cmd_is_replaced_per_call() {
        let info = DeviceInfo::new()
            .with_cmd(PushCmd::Register)
            .with_cmd(PushCmd::Push);
        assert_eq!(info.get("cmd"), Some("push"));
        assert_eq!(info.len(), 1);
    }
}
