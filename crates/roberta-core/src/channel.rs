//! Device channel trait
//!
//! One implementation exists per wire protocol family. The connector owns
//! exactly one channel and drives it from its worker; no method is ever
//! called concurrently with another on the same channel.

use async_trait::async_trait;

use crate::device_info::DeviceInfo;
use crate::error::{ChannelError, ChannelResult};
use crate::program::{FirmwareFile, Program, UploadOutcome};
use crate::robot::{Robot, SessionPolicy};

/// What the connector does after a successful upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Return to waiting for commands immediately
    FireAndForget,
    /// Poll [`DeviceChannel::is_running`] until the program ends
    UntilFinished,
}

/// Physical link to one robot plus its upload protocol
#[async_trait]
pub trait DeviceChannel: Send {
    /// The robot this channel talks to
    fn robot(&self) -> &Robot;

    /// Liveness probe run in `DISCOVER`
    ///
    /// `Ok(false)` means the robot is not reachable yet and discovery should
    /// simply continue. An error carries the UI state to display.
    async fn probe(&mut self) -> ChannelResult<bool>;

    /// Build a fresh device info map (no caching across ticks)
    async fn device_info(&mut self) -> ChannelResult<DeviceInfo>;

    /// Push a program onto the robot
    ///
    /// Never fails with an error: every failure is reported through the
    /// returned outcome so the session survives it.
    async fn upload(&mut self, program: &Program) -> UploadOutcome;

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::FireAndForget
    }

    /// Whether a program is still running on the robot
    async fn is_running(&mut self) -> ChannelResult<bool> {
        Ok(false)
    }

    /// Runtime files the server must provide for a firmware update
    fn firmware_files(&self) -> Vec<String> {
        Vec::new()
    }

    /// Install the given runtime files and restart the robot's menu
    async fn update_firmware(&mut self, _files: &[FirmwareFile]) -> ChannelResult<()> {
        Err(ChannelError::NotSupported(format!(
            "firmware update for {}",
            self.robot().family
        )))
    }

    /// Firmware version whose HAL must be present before registering
    fn hal_firmware(&self) -> Option<String> {
        None
    }

    /// Checksum of the HAL currently installed on the robot
    async fn installed_hal_checksum(&mut self) -> ChannelResult<Option<String>> {
        Ok(None)
    }

    /// Install a HAL archive and remember its checksum
    async fn install_hal(&mut self, _archive: &[u8], _checksum: &str) -> ChannelResult<()> {
        Err(ChannelError::NotSupported(format!(
            "HAL installation for {}",
            self.robot().family
        )))
    }

    fn session_policy(&self) -> SessionPolicy {
        self.robot().family.session_policy()
    }

    /// Provide credentials for password protected robots
    fn set_password(&mut self, _password: String) {}

    /// Release the underlying transport
    ///
    /// Must be safe to call repeatedly and after an interrupted operation.
    async fn close(&mut self);

    /// Whether the transport is currently held open
    fn is_open(&self) -> bool;
}
