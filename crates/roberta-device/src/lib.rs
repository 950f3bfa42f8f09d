//! roberta-device - robot transports and upload protocols
//!
//! One [`DeviceChannel`] implementation per wire protocol family:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     create_channel()                          │
//! │                                                               │
//! │  Arduino ─► ProcessChannel   avrdude / bossac / esptool       │
//! │  EV3     ─► Ev3Channel       HTTP to the brick                │
//! │  mBot2   ─► Mbot2Channel     binary frames   ┐                │
//! │  Spike   ─► HubChannel       JSON chunks     ├─► SerialLink   │
//! │  Hub     ─► HubChannel       JSON chunks     ┘                │
//! │  NAO     ─► SshChannel       scp + remote python              │
//! │  Robotino─► SshChannel                                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod ev3;
pub mod hub;
pub mod mbot2;
pub mod mock;
pub mod process;
pub mod serial;
pub mod ssh;

pub use config::{ChannelConfig, SerialConfig, SshConfig, ToolPaths};
pub use ev3::Ev3Channel;
pub use hub::{HubChannel, HubVariant};
pub use mbot2::Mbot2Channel;
pub use mock::{MockDeviceChannel, MockHandle, MockSerialLink};
pub use process::ProcessChannel;
pub use serial::{list_ports, PortEntry, SerialLink};
pub use ssh::SshChannel;

pub use roberta_core::{ChannelError, ChannelResult, DeviceChannel};

use roberta_core::{Robot, RobotFamily};
use tracing::debug;

/// Create the device channel for a robot
pub fn create_channel(
    robot: &Robot,
    config: &ChannelConfig,
) -> ChannelResult<Box<dyn DeviceChannel>> {
    debug!(robot = %robot, kind = ?robot.family.channel_kind(), "Creating device channel");

    let mut channel: Box<dyn DeviceChannel> = match robot.family {
        RobotFamily::Arduino(_) => Box::new(ProcessChannel::new(
            robot.clone(),
            config.tools.clone(),
        )?),
        RobotFamily::Ev3 => Box::new(Ev3Channel::new(robot.clone())?),
        RobotFamily::Mbot2 => Box::new(Mbot2Channel::new(robot.clone())),
        RobotFamily::Spike | RobotFamily::LegoLargeHub => {
            let variant = HubVariant::for_family(robot.family).ok_or_else(|| {
                ChannelError::NotSupported(format!("{} is not a hub", robot.family))
            })?;
            let hub = HubChannel::new(robot.clone(), variant);
            match config.serial.hub_ack_timeout() {
                Some(timeout) => Box::new(hub.with_timeout(timeout)),
                None => Box::new(hub),
            }
        }
        RobotFamily::Nao | RobotFamily::Robotino => {
            Box::new(SshChannel::new(robot.clone(), config.ssh.clone()))
        }
    };

    if let Some(password) = &config.password {
        channel.set_password(password.clone());
    }
    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use roberta_core::{ArduinoBoard, ExecutionMode, Link, SessionPolicy};

    #[test]
    fn test_factory_picks_channel_per_family() {
        let config = ChannelConfig::default();

        let uno = Robot::new(
            "Uno",
            RobotFamily::Arduino(ArduinoBoard::Uno),
            Link::Serial("/dev/ttyACM0".into()),
        );
        let channel = create_channel(&uno, &config).unwrap();
        assert_eq!(channel.execution_mode(), ExecutionMode::FireAndForget);
        assert_eq!(channel.session_policy(), SessionPolicy::Register);

        let ev3 = Robot::new("EV3", RobotFamily::Ev3, Link::Network("10.0.1.1".into()));
        let channel = create_channel(&ev3, &config).unwrap();
        assert_eq!(channel.execution_mode(), ExecutionMode::UntilFinished);
        assert!(!channel.firmware_files().is_empty());

        let nao = Robot::new("NAO", RobotFamily::Nao, Link::Network("10.0.1.2".into()));
        let channel = create_channel(&nao, &config).unwrap();
        assert_eq!(channel.session_policy(), SessionPolicy::ReuseToken);
        assert_eq!(channel.robot(), &nao);
    }

    #[test]
    fn test_factory_serial_families() {
        let config = ChannelConfig::default();
        for family in [RobotFamily::Mbot2, RobotFamily::Spike, RobotFamily::LegoLargeHub] {
            let robot = Robot::new("r", family, Link::Serial("/dev/ttyACM0".into()));
            let channel = create_channel(&robot, &config).unwrap();
            assert_eq!(channel.robot().family, family);
            assert!(channel.firmware_files().is_empty());
        }
    }
}
