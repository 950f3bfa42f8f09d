//! End-to-end tests for the robot connector
//!
//! Runs a real [`Connector`] task against a scripted programming server and a
//! [`MockDeviceChannel`]:
//!
//! ```text
//!  ┌──────────────┐   HTTP    ┌─────────────┐  DeviceChannel  ┌───────────────────┐
//!  │  MockServer  │◄─────────►│  Connector  │◄───────────────►│ MockDeviceChannel │
//!  │ (axum, :0)   │           │   (task)    │                 │   (MockHandle)    │
//!  └──────────────┘           └──────┬──────┘                 └───────────────────┘
//!                                    │ listeners
//!                                    ▼
//!                               ┌──────────┐
//!                               │ StateLog │
//!                               └──────────┘
//! ```
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p roberta-tests
//! ```
//!
//! # Test Structure
//!
//! - `session_e2e.rs` - registration, downloads, execution and updates
//! - `failure_e2e.rs` - server and robot failures, aborts and close

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State as AxumState};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use roberta_client::testing::TestServer;
use roberta_client::ServerSession;
use roberta_connector::{Connector, ConnectorHandle, ConnectorSettings};
use roberta_core::{Link, Robot, RobotFamily, State, StateEvent};
use roberta_device::MockDeviceChannel;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

pub use roberta_client::testing::wait_for;

/// Upper bound for anything a test waits on
pub const TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Mock programming server
// =============================================================================

struct ServerInner {
    answers: VecDeque<String>,
    pushes: Vec<Value>,
    downloads: Vec<Value>,
    program: Option<(String, Vec<u8>)>,
    firmware: HashMap<String, Vec<u8>>,
    hal: Option<(String, Vec<u8>)>,
    hal_downloads: usize,
    push_failure: Option<StatusCode>,
    push_delay: Duration,
}

#[derive(Clone)]
struct Script {
    inner: Arc<Mutex<ServerInner>>,
}

/// Programming server with scripted push answers
///
/// `/rest/pushcmd` answers with the queued commands in order, then `repeat`.
/// Every request body is recorded.
pub struct MockServer {
    server: TestServer,
    script: Script,
}

impl MockServer {
    pub async fn start() -> Self {
        let script = Script {
            inner: Arc::new(Mutex::new(ServerInner {
                answers: VecDeque::new(),
                pushes: Vec::new(),
                downloads: Vec::new(),
                program: None,
                firmware: HashMap::new(),
                hal: None,
                hal_downloads: 0,
                push_failure: None,
                // Keeps the repeat loop from spinning
                push_delay: Duration::from_millis(5),
            })),
        };

        let router = Router::new()
            .route("/rest/pushcmd", post(pushcmd))
            .route("/rest/download", post(download))
            .route("/rest/update/{name}", get(update_file))
            .route("/rest/update/{name}/hal/checksum", get(hal_checksum))
            .route("/update/nao/{firmware}/hal", get(hal_archive))
            .with_state(script.clone());

        let server = TestServer::start(router)
            .await
            .expect("Failed to start mock server");
        Self { server, script }
    }

    /// Session pointed at this server
    pub fn session(&self) -> ServerSession {
        self.server.session().clone()
    }

    pub fn base_url(&self) -> String {
        self.server.base_url()
    }

    /// Queue the `cmd` of the next unanswered push
    pub fn answer(&self, cmd: &str) {
        self.script.inner.lock().answers.push_back(cmd.to_string());
    }

    /// Program served by `/rest/download`; without one it answers 404
    pub fn set_program(&self, filename: &str, bytes: Vec<u8>) {
        self.script.inner.lock().program = Some((filename.to_string(), bytes));
    }

    pub fn add_firmware(&self, name: &str, bytes: Vec<u8>) {
        self.script
            .inner
            .lock()
            .firmware
            .insert(name.to_string(), bytes);
    }

    pub fn set_hal(&self, checksum: &str, archive: Vec<u8>) {
        self.script.inner.lock().hal = Some((checksum.to_string(), archive));
    }

    /// Answer every push with this HTTP status
    pub fn fail_pushes(&self, status: u16) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.script.inner.lock().push_failure = Some(status);
    }

    /// Hold every push this long before answering
    pub fn set_push_delay(&self, delay: Duration) {
        self.script.inner.lock().push_delay = delay;
    }

    /// Bodies of all pushes, oldest first
    pub fn pushes(&self) -> Vec<Value> {
        self.script.inner.lock().pushes.clone()
    }

    /// Pushes sent with `cmd` set to `cmd`
    pub fn pushes_with_cmd(&self, cmd: &str) -> usize {
        self.script
            .inner
            .lock()
            .pushes
            .iter()
            .filter(|body| body["cmd"] == cmd)
            .count()
    }

    pub fn downloads(&self) -> Vec<Value> {
        self.script.inner.lock().downloads.clone()
    }

    pub fn hal_downloads(&self) -> usize {
        self.script.inner.lock().hal_downloads
    }
}

async fn pushcmd(AxumState(script): AxumState<Script>, Json(body): Json<Value>) -> Response {
    let delay = script.inner.lock().push_delay;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut inner = script.inner.lock();
    inner.pushes.push(body);
    if let Some(status) = inner.push_failure {
        return (status, "server failure").into_response();
    }
    let cmd = match inner.answers.pop_front() {
        Some(cmd) => cmd,
        None => "repeat".to_string(),
    };
    Json(json!({ "cmd": cmd })).into_response()
}

async fn download(AxumState(script): AxumState<Script>, Json(body): Json<Value>) -> Response {
    let mut inner = script.inner.lock();
    inner.downloads.push(body);
    match inner.program.clone() {
        Some((filename, bytes)) => ([("Filename", filename)], bytes).into_response(),
        None => (StatusCode::NOT_FOUND, "no program").into_response(),
    }
}

async fn update_file(AxumState(script): AxumState<Script>, Path(name): Path<String>) -> Response {
    let bytes = script.inner.lock().firmware.get(&name).cloned();
    match bytes {
        Some(bytes) => ([("Filename", name)], bytes).into_response(),
        None => (StatusCode::NOT_FOUND, "unknown runtime file").into_response(),
    }
}

async fn hal_checksum(
    AxumState(script): AxumState<Script>,
    Path(_firmware): Path<String>,
) -> Response {
    match &script.inner.lock().hal {
        Some((checksum, _)) => format!("{}\n", checksum).into_response(),
        None => (StatusCode::NOT_FOUND, "no HAL").into_response(),
    }
}

async fn hal_archive(
    AxumState(script): AxumState<Script>,
    Path(_firmware): Path<String>,
) -> Response {
    let mut inner = script.inner.lock();
    inner.hal_downloads += 1;
    match &inner.hal {
        Some((_, archive)) => archive.clone().into_response(),
        None => (StatusCode::NOT_FOUND, "no HAL").into_response(),
    }
}

// =============================================================================
// State recording
// =============================================================================

/// Every event a connector fired, in order
#[derive(Clone, Default)]
pub struct StateLog {
    events: Arc<Mutex<Vec<StateEvent>>>,
}

impl StateLog {
    pub fn attach(handle: &ConnectorHandle) -> Self {
        let log = Self::default();
        let sink = log.events.clone();
        handle.register_listener(move |event| sink.lock().push(event.clone()));
        log
    }

    pub fn events(&self) -> Vec<StateEvent> {
        self.events.lock().clone()
    }

    pub fn states(&self) -> Vec<State> {
        self.events.lock().iter().map(|e| e.state).collect()
    }

    /// First event fired with `state`
    pub fn event(&self, state: State) -> Option<StateEvent> {
        self.events.lock().iter().find(|e| e.state == state).cloned()
    }

    pub fn count(&self, state: State) -> usize {
        self.events.lock().iter().filter(|e| e.state == state).count()
    }

    pub fn contains(&self, state: State) -> bool {
        self.count(state) > 0
    }

    /// Whether `sequence` was fired back to back
    pub fn contains_sequence(&self, sequence: &[State]) -> bool {
        let states = self.states();
        sequence.is_empty() || states.windows(sequence.len()).any(|w| w == sequence)
    }

    pub fn last(&self) -> Option<State> {
        self.events.lock().last().map(|e| e.state)
    }

    pub async fn wait_for_count(&self, state: State, count: usize) -> bool {
        wait_for(
            || {
                let log = self.clone();
                async move { log.count(state) >= count }
            },
            TIMEOUT,
        )
        .await
    }

    pub async fn wait_for_state(&self, state: State) -> bool {
        self.wait_for_count(state, 1).await
    }

    pub async fn wait_for_sequence(&self, sequence: &[State]) -> bool {
        wait_for(
            || {
                let log = self.clone();
                async move { log.contains_sequence(sequence) }
            },
            TIMEOUT,
        )
        .await
    }
}

/// Fired states from now on
pub fn state_stream(handle: &ConnectorHandle) -> impl Stream<Item = State> {
    BroadcastStream::new(handle.subscribe()).filter_map(|event| event.ok().map(|e| e.state))
}

// =============================================================================
// Connector harness
// =============================================================================

/// A connector task with its handle and state log
pub struct RunningConnector {
    pub handle: ConnectorHandle,
    pub log: StateLog,
    task: JoinHandle<()>,
}

impl RunningConnector {
    /// Spawn a connector; the log is attached before the first state fires
    pub fn start(
        channel: MockDeviceChannel,
        server: &MockServer,
        settings: ConnectorSettings,
    ) -> Self {
        let connector = Connector::new(Box::new(channel), server.session(), settings);
        let handle = connector.handle();
        let log = StateLog::attach(&handle);
        let task = tokio::spawn(connector.run());
        Self { handle, log, task }
    }

    /// Close and wait for the task; false if it did not stop in time
    pub async fn close(self) -> bool {
        let Self { handle, task, .. } = self;
        handle.close();
        matches!(tokio::time::timeout(TIMEOUT, task).await, Ok(Ok(())))
    }
}

/// Short intervals, waiting for [`ConnectorHandle::connect`]
pub fn fast_settings() -> ConnectorSettings {
    ConnectorSettings {
        discover_interval_ms: 10,
        execution_poll_ms: 10,
        auto_connect: false,
    }
}

/// Short intervals, registering as soon as the robot answers
pub fn auto_connect_settings() -> ConnectorSettings {
    ConnectorSettings {
        auto_connect: true,
        ..fast_settings()
    }
}

// =============================================================================
// Robots
// =============================================================================

pub fn ev3() -> Robot {
    Robot::new("EV3", RobotFamily::Ev3, Link::Network("10.0.1.1".into()))
}

pub fn nao() -> Robot {
    Robot::new("NAO", RobotFamily::Nao, Link::Network("10.0.1.2".into()))
}
