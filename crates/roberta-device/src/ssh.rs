//! SSH robots (NAO, Robotino)
//!
//! Every operation opens its own password-authenticated session and closes
//! it before returning. Files are copied with the `scp -t` sink protocol
//! over an exec channel, so the robot needs no SFTP subsystem.
//!
//! Remote layout (relative to the login user's home):
//!
//! ```text
//! roberta/          program + support files, wiped before each upload
//! roberta/roberta.log
//! roberta_hal/      NAO hardware abstraction layer
//! roberta_hal/checksum
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use roberta_core::{
    ChannelError, ChannelResult, DeviceChannel, DeviceInfo, ExecutionMode, Program, Robot,
    RobotFamily, UploadOutcome,
};
use russh::client;
use russh::{ChannelMsg, Disconnect};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SshConfig;

const PROGRAM_DIR: &str = "roberta";
const HAL_DIR: &str = "roberta_hal";
const HAL_ARCHIVE: &str = "hal.zip";
const NAO_VERSION_COMMAND: &str = "naoqi-bin --version";

/// First NAO firmware shipping Python 3
const NAO_PYTHON3_SINCE: (u32, u32) = (2, 9);

/// SSH level failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SshError {
    #[error("Robot unreachable: {0}")]
    Unreachable(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("SSH channel error: {0}")]
    Channel(String),

    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: u32,
        stderr: String,
    },

    #[error("File transfer rejected: {0}")]
    Transfer(String),
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::Channel(e.to_string())
    }
}

impl From<SshError> for ChannelError {
    fn from(e: SshError) -> Self {
        match e {
            SshError::AuthenticationFailed => {
                ChannelError::AuthenticationFailed("password rejected".to_string())
            }
            SshError::Timeout => ChannelError::Timeout("SSH connect".to_string()),
            other => ChannelError::Transport(other.to_string()),
        }
    }
}

// =============================================================================
// Remote shell seam
// =============================================================================

/// Output of a remote command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub status: u32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// An authenticated session on the robot
#[async_trait]
pub trait RemoteShell: Send {
    /// Run a command and collect its output
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SshError>;

    /// Copy `bytes` to `dir/name` on the robot
    async fn copy(&mut self, dir: &str, name: &str, bytes: &[u8]) -> Result<(), SshError>;

    async fn disconnect(&mut self);
}

/// Opens [`RemoteShell`] sessions
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteShell>, SshError>;
}

async fn run_checked(
    shell: &mut dyn RemoteShell,
    command: &str,
) -> Result<CommandOutput, SshError> {
    let output = shell.exec(command).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(SshError::Command {
            command: command.to_string(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

// =============================================================================
// russh implementation
// =============================================================================

struct Client;

#[async_trait]
impl client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are not pinned
        Ok(true)
    }
}

/// [`ShellConnector`] backed by russh
pub struct RusshConnector;

#[async_trait]
impl ShellConnector for RusshConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteShell>, SshError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let mut handle =
            match tokio::time::timeout(timeout, client::connect(config, (host, port), Client)).await
            {
                Ok(Ok(handle)) => handle,
                Ok(Err(e)) => return Err(SshError::Unreachable(e.to_string())),
                Err(_) => return Err(SshError::Timeout),
            };

        if !handle.authenticate_password(user, password).await? {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await;
            return Err(SshError::AuthenticationFailed);
        }

        debug!(host, port, user, "SSH session established");
        Ok(Box::new(RusshShell { handle }))
    }
}

struct RusshShell {
    handle: client::Handle<Client>,
}

impl RusshShell {
    /// Wait for the scp sink's status byte
    async fn await_scp_ack(channel: &mut russh::Channel<client::Msg>) -> Result<(), SshError> {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    return match data.first() {
                        Some(0) => Ok(()),
                        Some(_) => Err(SshError::Transfer(
                            String::from_utf8_lossy(&data[1..]).trim().to_string(),
                        )),
                        None => continue,
                    };
                }
                ChannelMsg::ExtendedData { data, .. } => {
                    return Err(SshError::Transfer(
                        String::from_utf8_lossy(&data).trim().to_string(),
                    ));
                }
                ChannelMsg::ExitStatus { exit_status } if exit_status != 0 => {
                    return Err(SshError::Transfer(format!("scp exited with {}", exit_status)));
                }
                _ => {}
            }
        }
        Err(SshError::Channel("channel closed during transfer".to_string()))
    }
}

#[async_trait]
impl RemoteShell for RusshShell {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput, SshError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }

        Ok(CommandOutput {
            status: status.unwrap_or(255),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn copy(&mut self, dir: &str, name: &str, bytes: &[u8]) -> Result<(), SshError> {
        // The sink reads the name up to the end of the header line
        if name.is_empty() || name.contains(['\n', '/']) {
            return Err(SshError::Transfer(format!("bad file name {:?}", name)));
        }
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, format!("scp -t {}", dir)).await?;
        Self::await_scp_ack(&mut channel).await?;

        let header = format!("C0644 {} {}\n", bytes.len(), name);
        channel.data(header.as_bytes()).await?;
        Self::await_scp_ack(&mut channel).await?;

        channel.data(bytes).await?;
        channel.data(&[0u8][..]).await?;
        Self::await_scp_ack(&mut channel).await?;

        channel.eof().await?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

// =============================================================================
// NAO firmware version
// =============================================================================

/// Parse `major.minor` out of a version banner (e.g. "2.8.6.23")
pub fn parse_version(text: &str) -> Option<(u32, u32)> {
    text.split_whitespace().find_map(|word| {
        let mut parts = word.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some((major, minor))
    })
}

/// HAL firmware tag for a NAO version, e.g. `v2-8`
pub fn firmware_tag(version: (u32, u32)) -> String {
    format!("v{}-{}", version.0, version.1)
}

/// Interpreter to launch programs with
pub fn python_for(family: RobotFamily, version: Option<(u32, u32)>) -> &'static str {
    match (family, version) {
        (RobotFamily::Nao, Some(v)) if v < NAO_PYTHON3_SINCE => "python",
        _ => "python3",
    }
}

/// Name a program is stored under on the robot
///
/// Only the final path component is kept. Names the launch command or the
/// scp header could not carry verbatim are refused.
pub fn remote_name(program: &Program) -> Result<String, SshError> {
    let name = program
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.is_empty() || name.contains(['\'', '\n', '\r', '\0', '/']) {
        return Err(SshError::Transfer(format!(
            "unusable program name {:?}",
            program.filename()
        )));
    }
    Ok(name)
}

/// Shell command starting a program in the background and printing its pid
///
/// `filename` must come from [`remote_name`]; it is single-quoted as is.
pub fn launch_command(python: &str, filename: &str) -> String {
    format!(
        "cd {dir} && PYTHONPATH=$HOME/{hal} nohup {python} '{file}' > roberta.log 2>&1 & echo $!",
        dir = PROGRAM_DIR,
        hal = HAL_DIR,
        python = python,
        file = filename,
    )
}

// =============================================================================
// Channel
// =============================================================================

/// Device channel for NAO and Robotino
pub struct SshChannel {
    robot: Robot,
    config: SshConfig,
    connector: Arc<dyn ShellConnector>,
    password: Option<String>,
    version: Option<(u32, u32)>,
    pid: Option<u32>,
    open: bool,
}

impl SshChannel {
    pub fn new(robot: Robot, config: SshConfig) -> Self {
        Self::with_connector(robot, config, Arc::new(RusshConnector))
    }

    pub fn with_connector(
        robot: Robot,
        config: SshConfig,
        connector: Arc<dyn ShellConnector>,
    ) -> Self {
        Self {
            robot,
            config,
            connector,
            password: None,
            version: None,
            pid: None,
            open: true,
        }
    }

    fn user(&self) -> &'static str {
        match self.robot.family {
            RobotFamily::Robotino => "robotino",
            _ => "nao",
        }
    }

    async fn open_shell(&self) -> Result<Box<dyn RemoteShell>, ChannelError> {
        let password = self
            .password
            .as_deref()
            .ok_or(ChannelError::MissingPassword)?;
        self.connector
            .connect(
                self.robot.link.address(),
                self.config.port,
                self.user(),
                password,
                self.config.connect_timeout(),
            )
            .await
            .map_err(ChannelError::from)
    }

    async fn deploy(
        &self,
        shell: &mut dyn RemoteShell,
        program: &Program,
    ) -> Result<u32, SshError> {
        let name = remote_name(program)?;
        run_checked(
            shell,
            &format!("rm -rf {dir} && mkdir -p {dir}", dir = PROGRAM_DIR),
        )
        .await?;

        for path in &self.config.support_files {
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| SshError::Transfer(format!("{}: {}", path.display(), e)))?;
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| SshError::Transfer(format!("{}: no file name", path.display())))?;
            shell.copy(PROGRAM_DIR, &name, &bytes).await?;
        }
        shell.copy(PROGRAM_DIR, &name, program.bytes()).await?;

        let python = python_for(self.robot.family, self.version);
        let output = run_checked(shell, &launch_command(python, &name)).await?;
        output
            .stdout
            .trim()
            .parse()
            .map_err(|_| SshError::Channel(format!("no pid in {:?}", output.stdout.trim())))
    }
}

#[async_trait]
impl DeviceChannel for SshChannel {
    fn robot(&self) -> &Robot {
        &self.robot
    }

    async fn probe(&mut self) -> ChannelResult<bool> {
        let mut shell = match self.open_shell().await {
            Ok(shell) => shell,
            Err(ChannelError::Transport(e)) | Err(ChannelError::Timeout(e)) => {
                debug!(robot = %self.robot, error = %e, "SSH robot not reachable");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if self.robot.family == RobotFamily::Nao && self.version.is_none() {
            match shell.exec(NAO_VERSION_COMMAND).await {
                Ok(output) => {
                    self.version = parse_version(&output.stdout);
                    info!(robot = %self.robot, version = ?self.version, "NAO firmware detected");
                }
                Err(e) => warn!(robot = %self.robot, error = %e, "NAO version query failed"),
            }
        }
        shell.disconnect().await;
        self.open = true;
        Ok(true)
    }

    async fn device_info(&mut self) -> ChannelResult<DeviceInfo> {
        let mut info = DeviceInfo::for_robot(self.robot.family, &self.robot.name);
        if let Some(version) = self.version {
            info.insert("firmwareversion", format!("{}.{}", version.0, version.1));
        }
        Ok(info)
    }

    async fn upload(&mut self, program: &Program) -> UploadOutcome {
        let mut shell = match self.open_shell().await {
            Ok(shell) => shell,
            Err(e) => return UploadOutcome::failed(1, e.to_string()),
        };

        let result = self.deploy(shell.as_mut(), program).await;
        shell.disconnect().await;

        match result {
            Ok(pid) => {
                info!(robot = %self.robot, pid, "Program started");
                self.pid = Some(pid);
                UploadOutcome::ok()
            }
            Err(e) => {
                warn!(robot = %self.robot, error = %e, "SSH upload failed");
                self.pid = None;
                UploadOutcome::failed(1, e.to_string())
            }
        }
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::UntilFinished
    }

    async fn is_running(&mut self) -> ChannelResult<bool> {
        let Some(pid) = self.pid else {
            return Ok(false);
        };
        let mut shell = self.open_shell().await?;
        let result = shell
            .exec(&format!("kill -0 {} 2>/dev/null && echo running", pid))
            .await;
        shell.disconnect().await;

        let running = result?.stdout.contains("running");
        if !running {
            self.pid = None;
        }
        Ok(running)
    }

    fn hal_firmware(&self) -> Option<String> {
        match self.robot.family {
            RobotFamily::Nao => self.version.map(firmware_tag),
            _ => None,
        }
    }

    async fn installed_hal_checksum(&mut self) -> ChannelResult<Option<String>> {
        let mut shell = self.open_shell().await?;
        let result = shell
            .exec(&format!("cat {}/checksum 2>/dev/null", HAL_DIR))
            .await;
        shell.disconnect().await;

        let output = result?;
        let checksum = output.stdout.trim();
        if output.success() && !checksum.is_empty() {
            Ok(Some(checksum.to_string()))
        } else {
            Ok(None)
        }
    }

    async fn install_hal(&mut self, archive: &[u8], checksum: &str) -> ChannelResult<()> {
        if checksum.contains('\'') || checksum.contains('\n') {
            return Err(ChannelError::Update(format!("invalid checksum {:?}", checksum)));
        }
        let mut shell = self.open_shell().await?;
        let result = async {
            run_checked(
                shell.as_mut(),
                &format!("rm -rf {dir} && mkdir -p {dir}", dir = HAL_DIR),
            )
            .await?;
            shell.copy(HAL_DIR, HAL_ARCHIVE, archive).await?;
            run_checked(
                shell.as_mut(),
                &format!(
                    "cd {dir} && unzip -o -q {zip} && rm {zip} \
                     && printf '%s\\n' '{sum}' > checksum",
                    dir = HAL_DIR,
                    zip = HAL_ARCHIVE,
                    sum = checksum,
                ),
            )
            .await
        }
        .await;
        shell.disconnect().await;

        result.map(|_| ()).map_err(|e| ChannelError::Update(e.to_string()))
    }

    fn set_password(&mut self, password: String) {
        self.password = Some(password);
    }

    async fn close(&mut self) {
        self.pid = None;
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
