//! EV3 brick with an onboard HTTP server

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderValue};
use reqwest::Client;
use roberta_core::{
    ChannelError, ChannelResult, DeviceChannel, DeviceInfo, ExecutionMode, FirmwareFile, Program,
    Robot, UploadOutcome,
};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const INFO_PATH: &str = "/brickman/info";
const PROGRAM_PATH: &str = "/brickman/program";
const FIRMWARE_PATH: &str = "/brickman/firmware";
const IS_RUNNING_PATH: &str = "/brickman/isrunning";
const RESTART_MENU_PATH: &str = "/brickman/restartmenu";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Runtime files the server provides for a brick update
pub const FIRMWARE_FILES: &[&str] = &[
    "EV3Runtime.jar",
    "Java-WebSocket.jar",
    "json.jar",
    "OpenRobertaRobot.jar",
    "OpenRobertaShared.jar",
    "EV3Menu.jar",
];

/// Device info keys copied from the brick's answer
const INFO_KEYS: &[&str] = &[
    DeviceInfo::BRICK_NAME,
    DeviceInfo::FIRMWARE_NAME,
    "battery",
    "macaddr",
    "firmwareversion",
    "menuversion",
];

/// Device channel for an EV3 brick
pub struct Ev3Channel {
    robot: Robot,
    base_url: String,
    client: Option<Client>,
}

impl Ev3Channel {
    pub fn new(robot: Robot) -> ChannelResult<Self> {
        let address = robot.link.address().trim_end_matches('/');
        let base_url = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };
        Ok(Self {
            base_url,
            client: Some(build_client()?),
            robot,
        })
    }

    fn client(&mut self) -> ChannelResult<&Client> {
        if self.client.is_none() {
            self.client = Some(build_client()?);
        }
        self.client
            .as_ref()
            .ok_or_else(|| ChannelError::Transport("HTTP client unavailable".to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST a command envelope and return the brick's JSON answer
    async fn command(&mut self, path: &str, cmd: &str) -> ChannelResult<Value> {
        let url = self.url(path);
        let response = self
            .client()?
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&json!({ "cmd": cmd }))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChannelError::Protocol(format!("{} answered {}", path, status)));
        }
        let body = response.text().await.map_err(transport_error)?;
        serde_json::from_str(&body)
            .map_err(|e| ChannelError::Protocol(format!("{}: {}", path, e)))
    }

    /// POST a file with a `Filename` header
    async fn post_file(&mut self, path: &str, filename: &str, bytes: Vec<u8>) -> ChannelResult<()> {
        let url = self.url(path);
        let filename = HeaderValue::from_str(filename)
            .map_err(|e| ChannelError::Protocol(format!("invalid filename: {}", e)))?;
        let response = self
            .client()?
            .post(&url)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header("Filename", filename)
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(ChannelError::Protocol(format!(
                "{} answered {}: {}",
                path,
                status,
                body.trim()
            )))
        }
    }
}

fn build_client() -> ChannelResult<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ChannelError::Transport(e.to_string()))
}

fn transport_error(e: reqwest::Error) -> ChannelError {
    if e.is_timeout() {
        ChannelError::Timeout(e.to_string())
    } else {
        ChannelError::Transport(e.to_string())
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[async_trait]
impl DeviceChannel for Ev3Channel {
    fn robot(&self) -> &Robot {
        &self.robot
    }

    async fn probe(&mut self) -> ChannelResult<bool> {
        match self.command(INFO_PATH, "info").await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!(robot = %self.robot, error = %e, "EV3 not reachable");
                Ok(false)
            }
        }
    }

    async fn device_info(&mut self) -> ChannelResult<DeviceInfo> {
        let answer = self.command(INFO_PATH, "info").await?;
        let mut info = DeviceInfo::for_robot(self.robot.family, &self.robot.name);
        for key in INFO_KEYS {
            if let Some(value) = answer.get(*key).and_then(as_text) {
                info.insert(*key, value);
            }
        }
        Ok(info)
    }

    async fn upload(&mut self, program: &Program) -> UploadOutcome {
        info!(robot = %self.robot, filename = program.filename(), "Sending program to EV3");
        match self
            .post_file(PROGRAM_PATH, program.filename(), program.bytes().to_vec())
            .await
        {
            Ok(()) => UploadOutcome::ok(),
            Err(e) => {
                warn!(robot = %self.robot, error = %e, "EV3 upload failed");
                UploadOutcome::failed(1, e.to_string())
            }
        }
    }

    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::UntilFinished
    }

    async fn is_running(&mut self) -> ChannelResult<bool> {
        let answer = self.command(IS_RUNNING_PATH, "isrunning").await?;
        match answer.get("isrunning") {
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) => Ok(s.eq_ignore_ascii_case("true")),
            other => Err(ChannelError::Protocol(format!(
                "unexpected isrunning answer: {:?}",
                other
            ))),
        }
    }

    fn firmware_files(&self) -> Vec<String> {
        FIRMWARE_FILES.iter().map(|f| f.to_string()).collect()
    }

    async fn update_firmware(&mut self, files: &[FirmwareFile]) -> ChannelResult<()> {
        for file in files {
            debug!(file = %file.name, size = file.bytes.len(), "Installing runtime file");
            self.post_file(FIRMWARE_PATH, &file.name, file.bytes.clone())
                .await
                .map_err(|e| ChannelError::Update(e.to_string()))?;
        }
        self.command(RESTART_MENU_PATH, "restartmenu")
            .await
            .map_err(|e| ChannelError::Update(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) {
        self.client = None;
    }

    fn is_open(&self) -> bool {
        self.client.is_some()
    }
}
