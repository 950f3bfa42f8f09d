//! Mock links and channels for testing

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use roberta_core::{
    ChannelError, ChannelResult, DeviceChannel, DeviceInfo, ExecutionMode, FirmwareFile, Program,
    Robot, SessionPolicy, UploadOutcome,
};

use crate::serial::SerialLink;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

// =============================================================================
// Serial Link
// =============================================================================

/// Scripted serial link
///
/// Every write is logged and handed to a responder whose output becomes
/// readable, simulating a robot answering each message.
pub struct MockSerialLink {
    name: String,
    responder: Responder,
    pending: VecDeque<u8>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
}

impl MockSerialLink {
    pub fn new<F>(name: &str, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            responder: Box::new(responder),
            pending: VecDeque::new(),
            writes: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Queue bytes as if the robot sent them unprompted
    pub fn inject(&mut self, data: &[u8]) {
        self.pending.extend(data);
    }

    /// Shared log of every write
    pub fn writes(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.writes.clone()
    }

    /// Flag set once the link is dropped
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        self.closed.clone()
    }
}

impl SerialLink for MockSerialLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed"));
        }
        self.writes.lock().push(data.to_vec());
        let reply = (self.responder)(data);
        self.pending.extend(reply);
        Ok(())
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MockSerialLink {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Device Channel
// =============================================================================

/// Calls recorded by [`MockDeviceChannel`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockCall {
    Probe,
    DeviceInfo,
    Upload,
    IsRunning,
    UpdateFirmware,
    InstalledHalChecksum,
    InstallHal,
    SetPassword,
    Close,
}

struct MockInner {
    calls: Vec<MockCall>,
    probes: VecDeque<ChannelResult<bool>>,
    default_probe: ChannelResult<bool>,
    device_info_error: Option<ChannelError>,
    upload_outcome: UploadOutcome,
    upload_delay: Duration,
    uploads: Vec<(String, Vec<u8>)>,
    running_polls: usize,
    firmware_files: Vec<String>,
    update_result: ChannelResult<()>,
    installed_firmware: Vec<FirmwareFile>,
    hal_firmware: Option<String>,
    hal_checksum: Option<String>,
    hal_installs: Vec<(Vec<u8>, String)>,
    passwords: Vec<String>,
    open: bool,
}

/// Handle for scripting and inspecting a [`MockDeviceChannel`]
///
/// Stays valid after the channel itself moved into a connector.
#[derive(Clone)]
pub struct MockHandle {
    inner: Arc<Mutex<MockInner>>,
}

impl MockHandle {
    /// Queue a probe result; once drained probes use the default
    pub fn push_probe(&self, result: ChannelResult<bool>) {
        self.inner.lock().probes.push_back(result);
    }

    pub fn set_default_probe(&self, result: ChannelResult<bool>) {
        self.inner.lock().default_probe = result;
    }

    pub fn set_device_info_error(&self, error: Option<ChannelError>) {
        self.inner.lock().device_info_error = error;
    }

    pub fn set_upload_outcome(&self, outcome: UploadOutcome) {
        self.inner.lock().upload_outcome = outcome;
    }

    /// Make uploads block for `delay` (to exercise cancellation)
    pub fn set_upload_delay(&self, delay: Duration) {
        self.inner.lock().upload_delay = delay;
    }

    /// Number of `is_running` polls answering `true`
    pub fn set_running_polls(&self, polls: usize) {
        self.inner.lock().running_polls = polls;
    }

    pub fn set_firmware_files(&self, files: Vec<String>) {
        self.inner.lock().firmware_files = files;
    }

    pub fn set_update_result(&self, result: ChannelResult<()>) {
        self.inner.lock().update_result = result;
    }

    pub fn set_hal(&self, firmware: Option<String>, installed_checksum: Option<String>) {
        let mut inner = self.inner.lock();
        inner.hal_firmware = firmware;
        inner.hal_checksum = installed_checksum;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.lock().calls.clone()
    }

    pub fn count(&self, call: MockCall) -> usize {
        self.inner.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Filename and bytes of every upload
    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().uploads.clone()
    }

    pub fn installed_firmware(&self) -> Vec<FirmwareFile> {
        self.inner.lock().installed_firmware.clone()
    }

    pub fn hal_installs(&self) -> Vec<(Vec<u8>, String)> {
        self.inner.lock().hal_installs.clone()
    }

    pub fn passwords(&self) -> Vec<String> {
        self.inner.lock().passwords.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }
}

/// Device channel with scripted answers and a shared call recorder
pub struct MockDeviceChannel {
    robot: Robot,
    mode: ExecutionMode,
    policy: SessionPolicy,
    handle: MockHandle,
}

impl MockDeviceChannel {
    pub fn new(robot: Robot) -> Self {
        let policy = robot.family.session_policy();
        let inner = MockInner {
            calls: Vec::new(),
            probes: VecDeque::new(),
            default_probe: Ok(true),
            device_info_error: None,
            upload_outcome: UploadOutcome::ok(),
            upload_delay: Duration::ZERO,
            uploads: Vec::new(),
            running_polls: 0,
            firmware_files: Vec::new(),
            update_result: Ok(()),
            installed_firmware: Vec::new(),
            hal_firmware: None,
            hal_checksum: None,
            hal_installs: Vec::new(),
            passwords: Vec::new(),
            open: true,
        };
        Self {
            robot,
            mode: ExecutionMode::FireAndForget,
            policy,
            handle: MockHandle {
                inner: Arc::new(Mutex::new(inner)),
            },
        }
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_session_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }

    fn record(&self, call: MockCall) {
        self.handle.inner.lock().calls.push(call);
    }
}

#[async_trait]
impl DeviceChannel for MockDeviceChannel {
    fn robot(&self) -> &Robot {
        &self.robot
    }

    async fn probe(&mut self) -> ChannelResult<bool> {
        self.record(MockCall::Probe);
        let mut inner = self.handle.inner.lock();
        match inner.probes.pop_front() {
            Some(result) => result,
            None => inner.default_probe.clone(),
        }
    }

    async fn device_info(&mut self) -> ChannelResult<DeviceInfo> {
        self.record(MockCall::DeviceInfo);
        if let Some(error) = self.handle.inner.lock().device_info_error.clone() {
            return Err(error);
        }
        Ok(DeviceInfo::for_robot(self.robot.family, &self.robot.name))
    }

    async fn upload(&mut self, program: &Program) -> UploadOutcome {
        self.record(MockCall::Upload);
        let delay = {
            let mut inner = self.handle.inner.lock();
            inner
                .uploads
                .push((program.filename().to_string(), program.bytes().to_vec()));
            inner.upload_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.handle.inner.lock().upload_outcome.clone()
    }

    fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    async fn is_running(&mut self) -> ChannelResult<bool> {
        self.record(MockCall::IsRunning);
        let mut inner = self.handle.inner.lock();
        if inner.running_polls > 0 {
            inner.running_polls -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn firmware_files(&self) -> Vec<String> {
        self.handle.inner.lock().firmware_files.clone()
    }

    async fn update_firmware(&mut self, files: &[FirmwareFile]) -> ChannelResult<()> {
        self.record(MockCall::UpdateFirmware);
        let mut inner = self.handle.inner.lock();
        inner.installed_firmware.extend_from_slice(files);
        inner.update_result.clone()
    }

    fn hal_firmware(&self) -> Option<String> {
        self.handle.inner.lock().hal_firmware.clone()
    }

    async fn installed_hal_checksum(&mut self) -> ChannelResult<Option<String>> {
        self.record(MockCall::InstalledHalChecksum);
        Ok(self.handle.inner.lock().hal_checksum.clone())
    }

    async fn install_hal(&mut self, archive: &[u8], checksum: &str) -> ChannelResult<()> {
        self.record(MockCall::InstallHal);
        let mut inner = self.handle.inner.lock();
        inner.hal_installs.push((archive.to_vec(), checksum.to_string()));
        inner.hal_checksum = Some(checksum.to_string());
        Ok(())
    }

    fn session_policy(&self) -> SessionPolicy {
        self.policy
    }

    fn set_password(&mut self, password: String) {
        self.record(MockCall::SetPassword);
        self.handle.inner.lock().passwords.push(password);
    }

    async fn close(&mut self) {
        self.record(MockCall::Close);
        self.handle.inner.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.handle.inner.lock().open
    }
}
