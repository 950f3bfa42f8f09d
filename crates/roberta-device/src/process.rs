//! Boards flashed by an external tool (avrdude, bossac, esptool)

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use roberta_core::{
    ArduinoBoard, ChannelError, ChannelResult, DeviceChannel, DeviceInfo, Program, Robot,
    RobotFamily, UploadOutcome,
};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ToolPaths;
use crate::serial::{list_ports, port_present, PortEntry};

/// Baud rate that makes BLE-class boards reset into their bootloader
pub const BOOTLOADER_TOUCH_BAUD: u32 = 1200;
/// Wait after the touch before looking for the bootloader port
pub const BOOTLOADER_RESET_DELAY: Duration = Duration::from_millis(500);

/// Flashing tool used by a board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashTool {
    Avrdude,
    Bossac,
    Esptool,
}

/// avrdude settings for a board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvrSettings {
    /// Chip part number (`-p`)
    pub part: &'static str,
    /// Programmer id (`-c`)
    pub programmer: &'static str,
    pub baud: u32,
    /// Erase the chip before writing instead of disabling auto-erase
    pub erase: bool,
}

pub fn flash_tool(board: ArduinoBoard) -> FlashTool {
    match board {
        ArduinoBoard::Nano33Ble => FlashTool::Bossac,
        ArduinoBoard::FestoBionic => FlashTool::Esptool,
        _ => FlashTool::Avrdude,
    }
}

pub fn avr_settings(board: ArduinoBoard) -> Option<AvrSettings> {
    let settings = |part, programmer, baud, erase| AvrSettings {
        part,
        programmer,
        baud,
        erase,
    };
    match board {
        ArduinoBoard::Uno | ArduinoBoard::Botnroll | ArduinoBoard::Mbot => {
            Some(settings("atmega328p", "arduino", 115_200, false))
        }
        ArduinoBoard::Nano => Some(settings("atmega328p", "arduino", 57_600, false)),
        ArduinoBoard::Mega => Some(settings("atmega2560", "wiring", 115_200, false)),
        ArduinoBoard::Bob3 => Some(settings("atmega88", "avrisp2", 115_200, true)),
        ArduinoBoard::Rob3rta => Some(settings("atmega328pb", "avr109", 57_600, true)),
        ArduinoBoard::UnoWifiRev2 => Some(settings("atmega4809", "jtag2updi", 115_200, true)),
        ArduinoBoard::Nano33Ble | ArduinoBoard::FestoBionic => None,
    }
}

/// Program and argument vector flashing `file` onto `board` at `port`
pub fn command_line(
    board: ArduinoBoard,
    port: &str,
    file: &Path,
    tools: &ToolPaths,
) -> (PathBuf, Vec<String>) {
    let file = file.display().to_string();
    match flash_tool(board) {
        FlashTool::Avrdude => {
            let mut args = Vec::new();
            if let Some(conf) = &tools.avrdude_conf {
                args.push("-C".to_string());
                args.push(conf.display().to_string());
            }
            // avr_settings covers every avrdude board
            let s = avr_settings(board).unwrap_or(AvrSettings {
                part: "atmega328p",
                programmer: "arduino",
                baud: 115_200,
                erase: false,
            });
            args.extend([
                "-v".to_string(),
                format!("-p{}", s.part),
                format!("-c{}", s.programmer),
                format!("-P{}", port),
                format!("-b{}", s.baud),
                if s.erase { "-e" } else { "-D" }.to_string(),
                format!("-Uflash:w:{}:i", file),
            ]);
            (tools.avrdude.clone(), args)
        }
        FlashTool::Bossac => (
            tools.bossac.clone(),
            vec![
                "-d".to_string(),
                format!("--port={}", port),
                "-U".to_string(),
                "-i".to_string(),
                "-e".to_string(),
                "-w".to_string(),
                file,
                "-R".to_string(),
            ],
        ),
        FlashTool::Esptool => (
            tools.python.clone(),
            vec![
                tools.esptool.display().to_string(),
                "--chip".to_string(),
                "esp32".to_string(),
                "--port".to_string(),
                port.to_string(),
                "--baud".to_string(),
                "921600".to_string(),
                "--before".to_string(),
                "default_reset".to_string(),
                "--after".to_string(),
                "hard_reset".to_string(),
                "write_flash".to_string(),
                "-z".to_string(),
                "0x10000".to_string(),
                file,
            ],
        ),
    }
}

/// Port to flash after a bootloader touch
///
/// A port that appeared since the touch wins. Otherwise a port with the
/// same USB vendor id as the original, otherwise the original itself.
pub fn pick_flash_port(original: &str, before: &[PortEntry], after: &[PortEntry]) -> String {
    if let Some(new) = after
        .iter()
        .find(|p| !before.iter().any(|b| b.name == p.name))
    {
        return new.name.clone();
    }

    let vid = before
        .iter()
        .find(|p| p.name == original)
        .and_then(|p| p.vid);
    if let Some(vid) = vid {
        if let Some(same) = after
            .iter()
            .find(|p| p.vid == Some(vid) && p.name != original)
        {
            return same.name.clone();
        }
    }

    original.to_string()
}

/// Reset a BLE-class board into its bootloader and return the flashing port
async fn enter_bootloader(port: &str) -> String {
    let original = port.to_string();
    let fallback = original.clone();
    tokio::task::spawn_blocking(move || {
        let before = list_ports();
        match serialport::new(&original, BOOTLOADER_TOUCH_BAUD)
            .timeout(Duration::from_millis(100))
            .open()
        {
            Ok(port) => drop(port),
            Err(e) => debug!(port = %original, error = %e, "Bootloader touch failed"),
        }
        std::thread::sleep(BOOTLOADER_RESET_DELAY);
        let after = list_ports();
        pick_flash_port(&original, &before, &after)
    })
    .await
    .unwrap_or(fallback)
}

/// Exit code and captured diagnostics of a tool run
pub async fn run_tool(program: &Path, args: &[String]) -> io::Result<(i32, String)> {
    debug!(program = %program.display(), ?args, "Spawning flashing tool");
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = child.wait_with_output().await?;
    let stderr = String::from_utf8_lossy(&output.stderr);
    // esptool reports on stdout
    let text = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).into_owned()
    } else {
        stderr.into_owned()
    };
    Ok((output.status.code().unwrap_or(-1), text))
}

/// Device channel for boards flashed by a spawned tool
pub struct ProcessChannel {
    robot: Robot,
    board: ArduinoBoard,
    tools: ToolPaths,
    open: bool,
    python_checked: bool,
}

impl ProcessChannel {
    pub fn new(robot: Robot, tools: ToolPaths) -> ChannelResult<Self> {
        let RobotFamily::Arduino(board) = robot.family else {
            return Err(ChannelError::NotSupported(format!(
                "{} is not flashed by an external tool",
                robot.family
            )));
        };
        Ok(Self {
            robot,
            board,
            tools,
            open: false,
            python_checked: false,
        })
    }

    pub fn board(&self) -> ArduinoBoard {
        self.board
    }

    async fn check_python(&mut self) -> ChannelResult<()> {
        if self.python_checked || flash_tool(self.board) != FlashTool::Esptool {
            return Ok(());
        }
        match run_tool(&self.tools.python, &["--version".to_string()]).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ChannelError::PythonRequired(
                format!("{} not found", self.tools.python.display()),
            )),
            _ => {
                self.python_checked = true;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DeviceChannel for ProcessChannel {
    fn robot(&self) -> &Robot {
        &self.robot
    }

    async fn probe(&mut self) -> ChannelResult<bool> {
        self.check_python().await?;
        self.open = port_present(self.robot.link.address()).await;
        Ok(self.open)
    }

    async fn device_info(&mut self) -> ChannelResult<DeviceInfo> {
        Ok(DeviceInfo::for_robot(self.robot.family, &self.robot.name))
    }

    async fn upload(&mut self, program: &Program) -> UploadOutcome {
        let mut port = self.robot.link.address().to_string();
        if self.board == ArduinoBoard::Nano33Ble {
            port = enter_bootloader(&port).await;
            debug!(%port, "Bootloader port selected");
        }

        let (tool, args) = command_line(self.board, &port, program.path(), &self.tools);
        info!(robot = %self.robot, tool = %tool.display(), "Flashing");

        match run_tool(&tool, &args).await {
            Ok((code, output)) => {
                let outcome = UploadOutcome::from_output(code, &output);
                if !outcome.is_success() {
                    warn!(robot = %self.robot, code, "Flashing tool failed");
                }
                outcome
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                UploadOutcome::failed(1, format!("{} not found", tool.display()))
            }
            Err(e) => UploadOutcome::failed(1, format!("{}: {}", tool.display(), e)),
        }
    }

    async fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use roberta_core::Link;
    use rstest::rstest;

    fn tools() -> ToolPaths {
        ToolPaths::default()
    }

    #[rstest]
    #[case(ArduinoBoard::Uno, "-patmega328p", "-carduino", "-b115200", "-D")]
    #[case(ArduinoBoard::Nano, "-patmega328p", "-carduino", "-b57600", "-D")]
    #[case(ArduinoBoard::Mega, "-patmega2560", "-cwiring", "-b115200", "-D")]
    #[case(ArduinoBoard::Bob3, "-patmega88", "-cavrisp2", "-b115200", "-e")]
    #[case(ArduinoBoard::Botnroll, "-patmega328p", "-carduino", "-b115200", "-D")]
    #[case(ArduinoBoard::Mbot, "-patmega328p", "-carduino", "-b115200", "-D")]
    #[case(ArduinoBoard::Rob3rta, "-patmega328pb", "-cavr109", "-b57600", "-e")]
    #[case(ArduinoBoard::UnoWifiRev2, "-patmega4809", "-cjtag2updi", "-b115200", "-e")]
    fn test_avrdude_arguments(
        #[case] board: ArduinoBoard,
        #[case] part: &str,
        #[case] programmer: &str,
        #[case] baud: &str,
        #[case] erase: &str,
    ) {
        let (program, args) =
            command_line(board, "/dev/ttyACM0", Path::new("/tmp/p.hex"), &tools());
        assert_eq!(program, PathBuf::from("avrdude"));
        assert_eq!(
            args,
            vec![
                "-v",
                part,
                programmer,
                "-P/dev/ttyACM0",
                baud,
                erase,
                "-Uflash:w:/tmp/p.hex:i",
            ]
        );
    }

    #[test]
    fn test_avrdude_config_file_goes_first() {
        let mut tools = tools();
        tools.avrdude_conf = Some(PathBuf::from("/etc/avrdude.conf"));
        let (_, args) = command_line(ArduinoBoard::Uno, "COM3", Path::new("p.hex"), &tools);
        assert_eq!(&args[..2], &["-C", "/etc/avrdude.conf"]);
        assert!(args.contains(&"-PCOM3".to_string()));
    }

    #[test]
    fn test_bossac_arguments() {
        let (program, args) =
            command_line(ArduinoBoard::Nano33Ble, "/dev/ttyACM1", Path::new("p.bin"), &tools());
        assert_eq!(program, PathBuf::from("bossac"));
        assert_eq!(
            args,
            vec!["-d", "--port=/dev/ttyACM1", "-U", "-i", "-e", "-w", "p.bin", "-R"]
        );
    }

    #[test]
    fn test_esptool_runs_through_python() {
        let (program, args) =
            command_line(ArduinoBoard::FestoBionic, "/dev/ttyUSB0", Path::new("p.bin"), &tools());
        assert_eq!(program, PathBuf::from("python3"));
        assert_eq!(args[0], "esptool.py");
        assert_eq!(&args[args.len() - 4..], &["write_flash", "-z", "0x10000", "p.bin"]);
    }

    fn entry(name: &str, vid: Option<u16>) -> PortEntry {
        PortEntry {
            name: name.to_string(),
            vid,
            pid: None,
        }
    }

    #[test]
    fn test_new_port_after_touch_wins() {
        let before = vec![entry("/dev/ttyACM0", Some(0x2341))];
        let after = vec![entry("/dev/ttyACM1", Some(0x2341))];
        assert_eq!(pick_flash_port("/dev/ttyACM0", &before, &after), "/dev/ttyACM1");
    }

    #[test]
    fn test_same_vendor_port_is_second_choice() {
        let before = vec![
            entry("/dev/ttyACM0", Some(0x2341)),
            entry("/dev/ttyACM1", Some(0x2341)),
            entry("/dev/ttyS0", None),
        ];
        let after = vec![entry("/dev/ttyS0", None), entry("/dev/ttyACM1", Some(0x2341))];
        assert_eq!(pick_flash_port("/dev/ttyACM0", &before, &after), "/dev/ttyACM1");
    }

    #[test]
    fn test_original_port_is_last_resort() {
        let before = vec![entry("/dev/ttyACM0", None)];
        assert_eq!(pick_flash_port("/dev/ttyACM0", &before, &before), "/dev/ttyACM0");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tool_captures_exit_code_and_stderr() {
        let (code, text) = run_tool(
            Path::new("sh"),
            &["-c".to_string(), "echo out; echo boom >&2; exit 3".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(code, 3);
        assert_eq!(text.trim(), "boom");
    }

    fn festo(tools: ToolPaths) -> ProcessChannel {
        let robot = Robot::new(
            "Bionic",
            RobotFamily::Arduino(ArduinoBoard::FestoBionic),
            Link::Serial("/dev/roberta-test-missing".into()),
        );
        ProcessChannel::new(robot, tools).unwrap()
    }

    #[tokio::test]
    async fn test_missing_python_is_reported_on_probe() {
        let mut tools = tools();
        tools.python = PathBuf::from("/nonexistent/python3");
        let mut channel = festo(tools);

        let result = channel.probe().await;
        assert!(matches!(result, Err(ChannelError::PythonRequired(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_flash_reports_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("esptool.py");
        let body: String = (1..=12).map(|i| format!("echo 'error {}' >&2\n", i)).collect();
        std::fs::write(&script, format!("{}exit 2\n", body)).unwrap();

        let mut tools = tools();
        tools.python = PathBuf::from("sh");
        tools.esptool = script;
        let mut channel = festo(tools);

        let program = Program::persist("prog.bin", vec![0; 16]).unwrap();
        let outcome = channel.upload(&program).await;
        assert_eq!(outcome.code, 2);
        assert_eq!(outcome.message.lines().count(), 10);
        assert!(outcome.message.starts_with("error 3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_flash() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("esptool.py");
        std::fs::write(&script, "test -f \"${14}\" || exit 9\necho done\n").unwrap();

        let mut tools = tools();
        tools.python = PathBuf::from("sh");
        tools.esptool = script;
        let mut channel = festo(tools);

        let program = Program::persist("prog.bin", vec![1, 2, 3]).unwrap();
        assert!(channel.upload(&program).await.is_success());
    }

    #[tokio::test]
    async fn test_missing_tool_fails_upload_without_panicking() {
        let mut tools = tools();
        tools.avrdude = PathBuf::from("/nonexistent/avrdude");
        let robot = Robot::new(
            "Uno",
            RobotFamily::Arduino(ArduinoBoard::Uno),
            Link::Serial("/dev/ttyACM0".into()),
        );
        let mut channel = ProcessChannel::new(robot, tools).unwrap();

        let program = Program::persist("prog.hex", vec![0]).unwrap();
        let outcome = channel.upload(&program).await;
        assert!(!outcome.is_success());
        assert!(outcome.message.contains("not found"));
    }

    #[test]
    fn test_non_arduino_family_is_rejected() {
        let robot = Robot::new("EV3", RobotFamily::Ev3, Link::Network("10.0.1.1".into()));
        assert!(ProcessChannel::new(robot, tools()).is_err());
    }
}
