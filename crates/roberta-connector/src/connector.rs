//! Connector state machine
//!
//! One [`Connector`] drives one robot through the session with the
//! programming server. It runs on its own task; everything else talks to it
//! through a cloneable [`ConnectorHandle`].
//!
//! ```text
//!  DISCOVER ──probe ok──► WAIT_FOR_CONNECT_BUTTON_PRESS ──connect()──► CONNECT_BUTTON_IS_PRESSED
//!     ▲                                                                      │ register
//!     │ reset                                                                ▼
//!     ├──────────────── WAIT_EXECUTION ◄──── WAIT_UPLOAD ◄──download──── WAIT_FOR_CMD ◄─┐
//!     │                       │                   │                           │  repeat │
//!     │                       └──finished─────────┴──────────────────────────►└─────────┘
//! ```
//!
//! Only the connector task fires states. Observers are called synchronously
//! from that task and must not block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use roberta_client::{ServerAddress, ServerCommand, ServerSession};
use roberta_core::{
    ChannelError, DeviceChannel, DeviceInfo, ExecutionMode, Program, PushCmd, Robot,
    SessionPolicy, State, StateEvent, Token, UploadOutcome,
};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectorSettings;
use crate::error::ConnectorError;

/// Observer callback
pub type Listener = Arc<dyn Fn(&StateEvent) + Send + Sync>;

/// Identifies a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

const EVENT_CAPACITY: usize = 64;

// =============================================================================
// Shared state
// =============================================================================

struct Shared {
    robot: Robot,
    address: Arc<ServerAddress>,
    state: RwLock<StateEvent>,
    token: RwLock<Option<Token>>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    events: broadcast::Sender<StateEvent>,
    connect_requested: AtomicBool,
    pending_password: Mutex<Option<String>>,
    wake: Notify,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn publish(&self, event: StateEvent) {
        *self.state.write() = event.clone();

        // Snapshot so listeners may (un)register from inside a callback
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(&event);
        }
        let _ = self.events.send(event);
    }
}

/// Observer and command interface to a running [`Connector`]
#[derive(Clone)]
pub struct ConnectorHandle {
    shared: Arc<Shared>,
}

impl ConnectorHandle {
    pub fn robot(&self) -> &Robot {
        &self.shared.robot
    }

    /// Last fired state
    pub fn state(&self) -> State {
        self.shared.state.read().state
    }

    /// Last fired state with its diagnostics
    pub fn state_event(&self) -> StateEvent {
        self.shared.state.read().clone()
    }

    /// Token of the current registration, if any
    pub fn token(&self) -> Option<Token> {
        self.shared.token.read().clone()
    }

    pub fn current_server_address(&self) -> String {
        self.shared.address.current()
    }

    pub fn update_custom_server_address(&self, address: &str) {
        info!(address, "Custom server address set");
        self.shared.address.set_custom(address);
    }

    pub fn reset_to_default_server_address(&self) {
        info!(address = self.shared.address.default_address(), "Server address reset");
        self.shared.address.reset_to_default();
    }

    /// Register an observer called for every fired state
    pub fn register_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Remove an observer; returns whether it was registered
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }

    /// Stream of fired states
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.shared.events.subscribe()
    }

    /// The operator pressed "connect"
    pub fn connect(&self) {
        debug!(robot = %self.shared.robot, "Connect requested");
        self.shared.connect_requested.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    /// Password for robots behind an SSH login
    pub fn set_password(&self, password: impl Into<String>) {
        *self.shared.pending_password.lock() = Some(password.into());
        self.shared.wake.notify_one();
    }

    /// Stop the connector
    ///
    /// Safe from any state, including while a network call is in flight.
    /// The connector fires `DISCOVER` and releases its transport.
    pub fn close(&self) {
        self.shared.closed.send_replace(true);
        self.shared.wake.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Drives one robot's session with the programming server
pub struct Connector {
    shared: Arc<Shared>,
    channel: Box<dyn DeviceChannel>,
    session: ServerSession,
    settings: ConnectorSettings,
    hal_synced: bool,
}

impl Connector {
    /// Create a connector in `DISCOVER`
    ///
    /// The session's server address is shared with the handle.
    pub fn new(
        channel: Box<dyn DeviceChannel>,
        session: ServerSession,
        settings: ConnectorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            robot: channel.robot().clone(),
            address: session.address().clone(),
            state: RwLock::new(StateEvent::new(State::Discover)),
            token: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            events,
            connect_requested: AtomicBool::new(false),
            pending_password: Mutex::new(None),
            wake: Notify::new(),
            closed,
        });
        Self {
            shared,
            channel,
            session,
            settings,
            hal_synced: false,
        }
    }

    pub fn handle(&self) -> ConnectorHandle {
        ConnectorHandle {
            shared: self.shared.clone(),
        }
    }

    /// Run on a new task
    pub fn spawn(self) -> (ConnectorHandle, JoinHandle<()>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    /// Execute state handlers until closed
    pub async fn run(mut self) {
        info!(robot = %self.shared.robot, "Connector started");
        let mut closed = self.shared.closed.subscribe();

        while !*closed.borrow() {
            self.apply_pending_password();
            tokio::select! {
                biased;
                _ = closed.changed() => break,
                _ = self.tick() => {}
            }
            tokio::task::yield_now().await;
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.shared.token.write().take();
        self.fire(State::Discover);
        self.channel.close().await;
        info!(robot = %self.shared.robot, "Connector closed");
    }

    async fn tick(&mut self) {
        let state = self.shared.state.read().state;
        match state {
            State::Discover => self.discover().await,
            State::WaitForConnectButtonPress => self.wait_for_connect().await,
            State::ConnectButtonIsPressed => self.register().await,
            State::WaitForCmd => self.wait_for_cmd().await,
            State::WaitUpload => self.upload().await,
            State::WaitExecution => self.wait_execution().await,
            other => {
                // Transient states are always followed by a resting state
                warn!(state = %other, "Connector resting in transient state");
                self.reset(None);
            }
        }
    }

    // =========================================================================
    // State handlers
    // =========================================================================

    async fn discover(&mut self) {
        match self.channel.probe().await {
            Ok(true) => {
                let reuse = self.channel.session_policy() == SessionPolicy::ReuseToken;
                if reuse && self.shared.token.read().is_some() {
                    self.fire(State::Reconnect);
                    self.fire(State::WaitForCmd);
                } else {
                    self.fire(State::WaitForConnectButtonPress);
                }
            }
            Ok(false) => idle(&self.shared, self.settings.discover_interval()).await,
            Err(e) => {
                // Retrying the same credentials cannot succeed
                let waits_for_password = matches!(
                    e,
                    ChannelError::MissingPassword | ChannelError::AuthenticationFailed(_)
                );
                self.robot_lost(ConnectorError::Channel(e));
                if waits_for_password {
                    self.shared.wake.notified().await;
                } else {
                    idle(&self.shared, self.settings.discover_interval()).await;
                }
            }
        }
    }

    async fn wait_for_connect(&mut self) {
        let requested = self.shared.connect_requested.swap(false, Ordering::SeqCst);
        if self.settings.auto_connect || requested {
            self.fire(State::ConnectButtonIsPressed);
            return;
        }

        let woken = tokio::select! {
            _ = self.shared.wake.notified() => true,
            _ = tokio::time::sleep(self.settings.discover_interval()) => false,
        };
        if woken {
            return;
        }

        // Robot may have gone away while nobody pressed connect
        match self.channel.probe().await {
            Ok(true) => {}
            Ok(false) => {
                self.fire(State::Disconnect);
                self.fire(State::Discover);
            }
            Err(e) => self.robot_lost(ConnectorError::Channel(e)),
        }
    }

    async fn register(&mut self) {
        if let Err(e) = self.sync_hal().await {
            warn!(robot = %self.shared.robot, error = %e, "HAL synchronisation failed");
            self.reset(Some(diagnostic(State::ErrorUpdate, &e)));
            return;
        }

        let token = Token::generate();
        *self.shared.token.write() = Some(token.clone());
        info!(robot = %self.shared.robot, token = %token, "Registering with server");
        if self.settings.auto_connect {
            info!(token = %token, "Enter this token in the programming web UI");
        }

        let info = match self.channel.device_info().await {
            Ok(info) => info.with_token(&token).with_cmd(PushCmd::Register),
            Err(e) => {
                self.robot_lost(ConnectorError::Channel(e));
                return;
            }
        };

        self.fire(State::WaitForServer);
        let answer = self.session.push(&info).await.and_then(|r| r.command());
        match answer {
            Ok(ServerCommand::Repeat) => self.fire(State::WaitForCmd),
            Ok(ServerCommand::Abort) => {
                info!(robot = %self.shared.robot, "Registration timed out");
                self.reset(Some(StateEvent::new(State::TokenTimeout)));
            }
            Ok(other) => {
                let message = format!("unexpected answer to register: {}", other.as_str());
                self.reset(Some(StateEvent::with_diagnostics(State::ErrorHttp, vec![message])));
            }
            Err(e) => self.reset(Some(diagnostic(State::ErrorHttp, &e))),
        }
    }

    async fn wait_for_cmd(&mut self) {
        let Some(info) = self.request_info(PushCmd::Push).await else {
            return;
        };

        let response = match self.session.push(&info).await {
            Ok(response) => response,
            Err(e) => {
                self.reset(Some(diagnostic(State::ErrorHttp, &e)));
                return;
            }
        };
        let command = match response.command() {
            Ok(command) => command,
            Err(e) => {
                self.reset(Some(diagnostic(State::ErrorHttp, &e)));
                return;
            }
        };

        match command {
            ServerCommand::Repeat => {}
            ServerCommand::Configuration => {
                debug!(payload = ?response.extra, "Configuration received");
            }
            ServerCommand::Download => self.fire(State::WaitUpload),
            ServerCommand::Update => self.update_firmware().await,
            ServerCommand::Abort => {
                info!(robot = %self.shared.robot, "Server ended the session");
                self.fire(State::Disconnect);
                self.reset(None);
            }
        }
    }

    async fn upload(&mut self) {
        let Some(info) = self.request_info(PushCmd::Push).await else {
            return;
        };

        let download = match self.session.download_program(&info).await {
            Ok(download) => download,
            Err(e) => {
                self.reset(Some(diagnostic(State::ErrorDownload, &e)));
                return;
            }
        };
        info!(
            robot = %self.shared.robot,
            filename = %download.filename,
            size = download.bytes.len(),
            "Uploading program"
        );

        let outcome = match Program::persist(download.filename, download.bytes) {
            Ok(program) => self.channel.upload(&program).await,
            Err(e) => UploadOutcome::failed(1, e.to_string()),
        };

        if !outcome.is_success() {
            warn!(robot = %self.shared.robot, code = outcome.code, "Upload failed");
            let diagnostics = outcome.message.lines().map(str::to_string).collect();
            self.fire_event(StateEvent::with_diagnostics(State::ErrorUploadToRobot, diagnostics));
            self.fire(State::WaitForCmd);
            return;
        }

        match self.channel.execution_mode() {
            ExecutionMode::UntilFinished => self.fire(State::WaitExecution),
            ExecutionMode::FireAndForget => self.fire(State::WaitForCmd),
        }
    }

    async fn wait_execution(&mut self) {
        match self.channel.is_running().await {
            Ok(true) => idle(&self.shared, self.settings.execution_poll()).await,
            Ok(false) => {
                debug!(robot = %self.shared.robot, "Program finished");
                self.fire(State::WaitForCmd);
            }
            Err(e) => self.robot_lost(ConnectorError::Channel(e)),
        }
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Download the runtime files and install them on the robot
    async fn update_firmware(&mut self) {
        let names = self.channel.firmware_files();
        if names.is_empty() {
            warn!(robot = %self.shared.robot, "Update requested for a robot without runtime files");
            self.reset(Some(StateEvent::with_diagnostics(
                State::UpdateFail,
                vec![format!("{} has no updatable runtime", self.shared.robot.family)],
            )));
            return;
        }

        let mut files = Vec::with_capacity(names.len());
        for name in &names {
            match self.session.download_firmware_file(name).await {
                Ok(file) => files.push(file),
                Err(e) => {
                    self.reset(Some(diagnostic(State::ErrorUpdate, &e)));
                    return;
                }
            }
        }

        match self.channel.update_firmware(&files).await {
            Ok(()) => {
                info!(robot = %self.shared.robot, files = files.len(), "Runtime updated");
                self.reset(Some(StateEvent::new(State::UpdateSuccess)));
            }
            Err(e) => self.reset(Some(diagnostic(State::UpdateFail, &e))),
        }
    }

    /// Bring the robot's HAL in line with the server's before registering
    async fn sync_hal(&mut self) -> Result<(), ConnectorError> {
        if self.hal_synced {
            return Ok(());
        }
        let Some(firmware) = self.channel.hal_firmware() else {
            return Ok(());
        };

        let expected = self.session.hal_checksum(&firmware).await?;
        let installed = self.channel.installed_hal_checksum().await?;
        if installed.as_deref() != Some(expected.as_str()) {
            info!(
                robot = %self.shared.robot,
                firmware = %firmware,
                installed = ?installed,
                "Installing HAL"
            );
            let archive = self.session.download_hal(&firmware).await?;
            self.channel.install_hal(&archive, &expected).await?;
        }
        self.hal_synced = true;
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Device info with the current token, or `None` after resetting
    async fn request_info(&mut self, cmd: PushCmd) -> Option<DeviceInfo> {
        let token = self.shared.token.read().clone();
        let Some(token) = token else {
            warn!(robot = %self.shared.robot, "No token, rediscovering");
            self.reset(None);
            return None;
        };
        match self.channel.device_info().await {
            Ok(info) => Some(info.with_token(&token).with_cmd(cmd)),
            Err(e) => {
                self.robot_lost(ConnectorError::Channel(e));
                None
            }
        }
    }

    fn apply_pending_password(&mut self) {
        if let Some(password) = self.shared.pending_password.lock().take() {
            debug!(robot = %self.shared.robot, "Password updated");
            self.channel.set_password(password);
        }
    }

    fn fire(&self, state: State) {
        self.fire_event(StateEvent::new(state));
    }

    fn fire_event(&self, event: StateEvent) {
        if event.diagnostics.is_empty() {
            info!(robot = %self.shared.robot, state = %event.state, "State changed");
        } else {
            info!(
                robot = %self.shared.robot,
                state = %event.state,
                diagnostics = ?event.diagnostics,
                "State changed"
            );
        }
        self.shared.publish(event);
    }

    /// Fire the error (if any), drop the token and go back to `DISCOVER`
    fn reset(&mut self, error: Option<StateEvent>) {
        if let Some(event) = error {
            self.fire_event(event);
        }
        self.shared.token.write().take();
        self.shared.connect_requested.store(false, Ordering::SeqCst);
        self.fire(State::Discover);
    }

    /// Robot-side failure: token-gated families keep their token for `RECONNECT`
    fn robot_lost(&mut self, error: ConnectorError) {
        warn!(robot = %self.shared.robot, error = %error, "Robot failure");
        let event = diagnostic(error.state_in(State::ErrorBrick), &error);
        if self.channel.session_policy() == SessionPolicy::ReuseToken {
            self.fire_event(event);
            self.fire(State::Discover);
        } else {
            self.reset(Some(event));
        }
    }
}

/// Sleep, cut short by any command on the handle
async fn idle(shared: &Shared, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shared.wake.notified() => {}
    }
}

fn diagnostic(state: State, error: &dyn std::fmt::Display) -> StateEvent {
    StateEvent::with_diagnostics(state, vec![error.to_string()])
}
