//! Chunked JSON protocol for LEGO hubs (SPIKE Prime, Robot Inventor)
//!
//! Every request is one JSON object `{"m": mode, "p": params, "i": id}`
//! terminated by `\r`. The hub answers with an object carrying the same
//! `i` and either a result `r` or an error `e`. Between answers the hub
//! streams telemetry lines, which are skipped.

use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::Rng;
use roberta_core::{
    ChannelError, ChannelResult, DeviceChannel, DeviceInfo, Program, Robot, RobotFamily,
    UploadOutcome,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::serial::{system_opener, CancelFlag, LinkOpener, SerialLink, SerialSession};

/// Raw bytes per `write_package` message (before base64)
pub const CHUNK_SIZE: usize = 512;
/// Pause between reads while waiting for an answer
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const BAUD_RATE: u32 = 115_200;
/// Program slot the upload goes to
pub const SLOT: u8 = 0;

/// Hub protocol failures
#[derive(Debug, Error)]
pub enum HubError {
    #[error("No answer to {mode} within {timeout:?}")]
    Timeout { mode: String, timeout: Duration },

    #[error("Hub rejected {mode}: {message}")]
    Rejected { mode: String, message: String },

    #[error("Malformed answer to {mode}: {detail}")]
    Malformed { mode: String, detail: String },

    #[error("Checksum mismatch for chunk {index}: sent {expected}, hub reported {actual}")]
    ChecksumMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("Transfer stopped before {mode}")]
    Cancelled { mode: String },

    #[error("Serial error: {0}")]
    Io(#[from] io::Error),
}

impl From<HubError> for ChannelError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::Timeout { .. } => ChannelError::Timeout(e.to_string()),
            HubError::Cancelled { .. } => ChannelError::Transport(e.to_string()),
            HubError::Io(io) => io.into(),
            other => ChannelError::Protocol(other.to_string()),
        }
    }
}

/// Product line specific behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubVariant {
    /// SPIKE Prime: 12s answers, one resend of a malformed start answer
    Spike,
    /// Robot Inventor large hub: 10s answers, no resend
    LargeHub,
}

impl HubVariant {
    pub fn for_family(family: RobotFamily) -> Option<Self> {
        match family {
            RobotFamily::Spike => Some(HubVariant::Spike),
            RobotFamily::LegoLargeHub => Some(HubVariant::LargeHub),
            _ => None,
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        match self {
            HubVariant::Spike => Duration::from_secs(12),
            HubVariant::LargeHub => Duration::from_secs(10),
        }
    }

    pub fn start_retries(&self) -> usize {
        match self {
            HubVariant::Spike => 1,
            HubVariant::LargeHub => 0,
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Random 4-character message id
pub fn message_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect()
}

/// Serialise a request line
pub fn encode_message(mode: &str, params: Value, id: &str) -> Vec<u8> {
    let mut line = json!({ "m": mode, "p": params, "i": id }).to_string();
    line.push('\r');
    line.into_bytes()
}

/// Hex SHA-256 of a chunk
pub fn chunk_checksum(chunk: &[u8]) -> String {
    hex::encode(Sha256::digest(chunk))
}

fn start_write_params(filename: &str, size: usize) -> Value {
    let now = chrono::Utc::now().timestamp_millis();
    json!({
        "slotid": SLOT,
        "size": size,
        "meta": {
            "created": now,
            "modified": now,
            "name": BASE64.encode(filename.as_bytes()),
            "type": "python",
            "project_id": "roberta",
        },
    })
}

/// Accumulates serial input and extracts the answer to a given id
///
/// Lines that are not JSON are skipped and counted; the transfer carries
/// on regardless.
#[derive(Debug, Default)]
pub struct ReplyScanner {
    buffer: String,
    skipped: usize,
}

impl ReplyScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.push_str(&String::from_utf8_lossy(data));
    }

    /// Lines dropped because they did not parse
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Consume complete lines until one answers `id`
    pub fn take_reply(&mut self, id: &str) -> Option<Value> {
        while let Some(end) = self.buffer.find(|c: char| c == '\r' || c == '\n') {
            let line: String = self.buffer.drain(..=end).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(value) => {
                    if value.get("i").and_then(Value::as_str) == Some(id) {
                        return Some(value);
                    }
                }
                Err(e) => {
                    self.skipped += 1;
                    debug!(error = %e, line, "Skipping unparseable hub line");
                }
            }
        }
        None
    }
}

// =============================================================================
// Transfer
// =============================================================================

/// Drives one upload over a link
pub struct HubTransfer<'a> {
    link: &'a mut dyn SerialLink,
    scanner: ReplyScanner,
    timeout: Duration,
    cancel: CancelFlag,
}

impl<'a> HubTransfer<'a> {
    pub fn new(link: &'a mut dyn SerialLink, timeout: Duration) -> Self {
        Self {
            link,
            scanner: ReplyScanner::new(),
            timeout,
            cancel: CancelFlag::new(),
        }
    }

    /// Stop at the next request or poll once `cancel` is set
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancelled(&self, mode: &str) -> Result<(), HubError> {
        if self.cancel.is_cancelled() {
            return Err(HubError::Cancelled {
                mode: mode.to_string(),
            });
        }
        Ok(())
    }

    /// Lines skipped so far
    pub fn skipped(&self) -> usize {
        self.scanner.skipped()
    }

    /// Send a request and wait for its answer's result object
    pub fn request(&mut self, mode: &str, params: Value) -> Result<Value, HubError> {
        self.check_cancelled(mode)?;
        let id = message_id();
        self.link.write_all(&encode_message(mode, params, &id))?;

        let reply = self.await_reply(mode, &id)?;
        if let Some(error) = reply.get("e").filter(|e| !e.is_null()) {
            let message = error
                .as_str()
                .and_then(|e| BASE64.decode(e).ok())
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_else(|| error.to_string());
            return Err(HubError::Rejected {
                mode: mode.to_string(),
                message,
            });
        }
        Ok(reply.get("r").cloned().unwrap_or(Value::Null))
    }

    fn await_reply(&mut self, mode: &str, id: &str) -> Result<Value, HubError> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 1024];

        loop {
            self.check_cancelled(mode)?;
            loop {
                let n = self.link.read_available(&mut buf)?;
                if n == 0 {
                    break;
                }
                self.scanner.feed(&buf[..n]);
            }
            if let Some(reply) = self.scanner.take_reply(id) {
                return Ok(reply);
            }
            if Instant::now() >= deadline {
                return Err(HubError::Timeout {
                    mode: mode.to_string(),
                    timeout: self.timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL.min(self.timeout));
        }
    }

    /// Full upload: terminate, start, chunks, execute
    pub fn upload(
        &mut self,
        filename: &str,
        data: &[u8],
        start_retries: usize,
    ) -> Result<(), HubError> {
        self.request("program_terminate", json!({}))?;

        let transfer_id = self.start_write(filename, data.len(), start_retries)?;
        debug!(%transfer_id, size = data.len(), "Hub transfer started");

        for (index, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
            let result = self.request(
                "write_package",
                json!({
                    "data": BASE64.encode(chunk),
                    "transferid": transfer_id,
                }),
            )?;
            verify_chunk(index, chunk, &result)?;
        }

        self.request("program_execute", json!({ "slotid": SLOT }))?;
        Ok(())
    }

    fn start_write(
        &mut self,
        filename: &str,
        size: usize,
        retries: usize,
    ) -> Result<String, HubError> {
        let mut attempt = 0;
        loop {
            let params = start_write_params(filename, size);
            let result = self.request("start_write_program", params)?;
            match result.get("transferid").and_then(Value::as_str) {
                Some(id) => return Ok(id.to_string()),
                None if attempt < retries => {
                    attempt += 1;
                    warn!(answer = %result, "Malformed start answer, resending");
                }
                None => {
                    return Err(HubError::Malformed {
                        mode: "start_write_program".to_string(),
                        detail: format!("no transferid in {}", result),
                    })
                }
            }
        }
    }
}

/// Check the hub's checksum for a chunk against our own
pub fn verify_chunk(index: usize, chunk: &[u8], result: &Value) -> Result<(), HubError> {
    let expected = chunk_checksum(chunk);
    let actual = result
        .get("checksum")
        .and_then(Value::as_str)
        .ok_or_else(|| HubError::Malformed {
            mode: "write_package".to_string(),
            detail: format!("no checksum for chunk {}", index),
        })?;
    if !actual.eq_ignore_ascii_case(&expected) {
        return Err(HubError::ChecksumMismatch {
            index,
            expected,
            actual: actual.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Channel
// =============================================================================

/// Device channel for LEGO hubs over USB serial
pub struct HubChannel {
    robot: Robot,
    variant: HubVariant,
    serial: SerialSession,
    timeout: Duration,
}

impl HubChannel {
    pub fn new(robot: Robot, variant: HubVariant) -> Self {
        Self::with_opener(robot, variant, system_opener())
    }

    pub fn with_opener(robot: Robot, variant: HubVariant, opener: LinkOpener) -> Self {
        let serial = SerialSession::new(robot.link.address(), BAUD_RATE, opener);
        Self {
            robot,
            variant,
            serial,
            timeout: variant.ack_timeout(),
        }
    }

    /// Override the answer timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn variant(&self) -> HubVariant {
        self.variant
    }
}

#[async_trait]
impl DeviceChannel for HubChannel {
    fn robot(&self) -> &Robot {
        &self.robot
    }

    async fn probe(&mut self) -> ChannelResult<bool> {
        match self.serial.ensure_open().await {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(port = %self.serial.port(), error = %e, "Hub not reachable");
                Ok(false)
            }
        }
    }

    async fn device_info(&mut self) -> ChannelResult<DeviceInfo> {
        Ok(DeviceInfo::for_robot(self.robot.family, &self.robot.name))
    }

    async fn upload(&mut self, program: &Program) -> UploadOutcome {
        if let Err(e) = self.serial.ensure_open().await {
            let message = format!("Cannot open {}: {}", self.serial.port(), e);
            return UploadOutcome::failed(1, message);
        }

        info!(robot = %self.robot, size = program.bytes().len(), "Uploading to hub");
        let filename = program.filename().to_string();
        let data = program.bytes().to_vec();
        let timeout = self.timeout;
        let retries = self.variant.start_retries();

        let result = self
            .serial
            .run(move |link: &mut dyn SerialLink, cancel: &CancelFlag| {
                let mut transfer = HubTransfer::new(link, timeout).with_cancel(cancel.clone());
                let result = transfer.upload(&filename, &data, retries);
                if transfer.skipped() > 0 {
                    warn!(skipped = transfer.skipped(), "Ignored unparseable hub lines");
                }
                result
            })
            .await;

        match result {
            Ok(()) => UploadOutcome::ok(),
            Err(e) => {
                warn!(robot = %self.robot, error = %e, "Hub upload failed");
                self.serial.close().await;
                UploadOutcome::failed(1, e.to_string())
            }
        }
    }

    async fn close(&mut self) {
        self.serial.close().await;
    }

    fn is_open(&self) -> bool {
        self.serial.is_open()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSerialLink;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    /// A hub answering every request; `corrupt` flips a byte of each chunk
    /// before hashing it.
    fn hub(corrupt: bool, malformed_starts: usize) -> MockSerialLink {
        MockSerialLink::new("/dev/ttyACM0", hub_responder(corrupt, malformed_starts))
    }

    /// A hub taking `delay` to answer each request
    fn slow_hub(delay: Duration) -> MockSerialLink {
        let mut respond = hub_responder(false, 0);
        MockSerialLink::new("/dev/ttyACM0", move |written: &[u8]| {
            std::thread::sleep(delay);
            respond(written)
        })
    }

    fn hub_responder(
        corrupt: bool,
        malformed_starts: usize,
    ) -> impl FnMut(&[u8]) -> Vec<u8> + Send + 'static {
        let mut malformed_left = malformed_starts;
        move |written: &[u8]| {
            let text = String::from_utf8_lossy(written);
            let request: Value = serde_json::from_str(text.trim_end_matches('\r')).unwrap();
            let id = request["i"].as_str().unwrap().to_string();
            let result = match request["m"].as_str().unwrap() {
                "start_write_program" if malformed_left > 0 => {
                    malformed_left -= 1;
                    json!({ "blocksize": 512 })
                }
                "start_write_program" => json!({ "transferid": "T1", "blocksize": 512 }),
                "write_package" => {
                    assert_eq!(request["p"]["transferid"], "T1");
                    let encoded = request["p"]["data"].as_str().unwrap();
                    let mut data = BASE64.decode(encoded).unwrap();
                    if corrupt {
                        data[0] ^= 0xFF;
                    }
                    json!({ "checksum": chunk_checksum(&data) })
                }
                _ => Value::Null,
            };
            // telemetry before the answer
            let mut reply = b"{\"m\":0,\"p\":[1,2,3]}\r".to_vec();
            reply.extend(format!("{}\r", json!({ "i": id, "r": result })).into_bytes());
            reply
        }
    }

    fn opener_for(link: MockSerialLink) -> LinkOpener {
        let slot = parking_lot::Mutex::new(Some(link));
        Arc::new(move |_: &str, _: u32| {
            slot.lock()
                .take()
                .map(|l| Box::new(l) as Box<dyn SerialLink>)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "gone"))
        })
    }

    fn spike() -> Robot {
        Robot::new(
            "Spike",
            RobotFamily::Spike,
            roberta_core::Link::Serial("/dev/ttyACM0".into()),
        )
    }

    fn modes(writes: &[Vec<u8>]) -> Vec<String> {
        writes
            .iter()
            .map(|w| {
                let v: Value = serde_json::from_slice(&w[..w.len() - 1]).unwrap();
                v["m"].as_str().unwrap().to_string()
            })
            .collect()
    }

    #[test]
    fn test_message_framing() {
        let bytes = encode_message("program_execute", json!({"slotid": 0}), "ab12");
        assert_eq!(*bytes.last().unwrap(), b'\r');
        let value: Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(value, json!({"m": "program_execute", "p": {"slotid": 0}, "i": "ab12"}));
        assert_eq!(message_id().len(), 4);
    }

    #[test]
    fn test_upload_sequence_and_chunking() {
        let mut link = hub(false, 0);
        let writes = link.writes();
        let data = vec![0x42; CHUNK_SIZE * 2 + 10];

        HubTransfer::new(&mut link, Duration::from_secs(1))
            .upload("main.py", &data, 0)
            .unwrap();

        assert_eq!(
            modes(&writes.lock()),
            vec![
                "program_terminate",
                "start_write_program",
                "write_package",
                "write_package",
                "write_package",
                "program_execute",
            ]
        );
    }

    #[test]
    fn test_chunk_checksum_matches_decoded_data() {
        let chunk = b"print('hello hub')";
        let encoded = BASE64.encode(chunk);
        let decoded = BASE64.decode(encoded).unwrap();
        let result = json!({ "checksum": chunk_checksum(&decoded) });
        assert!(verify_chunk(0, chunk, &result).is_ok());
    }

    #[test]
    fn test_flipped_byte_fails_checksum_validation() {
        let mut link = hub(true, 0);
        let result =
            HubTransfer::new(&mut link, Duration::from_secs(1)).upload("main.py", b"abc", 0);
        assert!(matches!(
            result,
            Err(HubError::ChecksumMismatch { index: 0, .. })
        ));
    }

    #[test]
    fn test_malformed_start_answer_is_resent_once_when_allowed() {
        let mut link = hub(false, 1);
        let writes = link.writes();
        HubTransfer::new(&mut link, Duration::from_secs(1))
            .upload("main.py", b"abc", HubVariant::Spike.start_retries())
            .unwrap();
        let starts = modes(&writes.lock())
            .iter()
            .filter(|m| *m == "start_write_program")
            .count();
        assert_eq!(starts, 2);

        let mut link = hub(false, 1);
        let result = HubTransfer::new(&mut link, Duration::from_secs(1)).upload(
            "main.py",
            b"abc",
            HubVariant::LargeHub.start_retries(),
        );
        assert!(matches!(result, Err(HubError::Malformed { .. })));
    }

    #[test]
    fn test_unparseable_lines_are_skipped_and_counted() {
        // Corrupt lines are masked rather than failing the transfer; the
        // count keeps that visible.
        let mut scanner = ReplyScanner::new();
        scanner.feed(b"\x00garbage{\r{\"i\":\"zz\",\"r\":1}\r{\"i\":\"ab");
        scanner.feed(b"cd\",\"r\":{\"ok\":true}}\r");
        let reply = scanner.take_reply("abcd").unwrap();
        assert_eq!(reply["r"]["ok"], true);
        assert_eq!(scanner.skipped(), 1);
    }

    #[test]
    fn test_rejection_is_reported() {
        let mut link = MockSerialLink::new("/dev/ttyACM0", |written: &[u8]| {
            let request: Value = serde_json::from_slice(&written[..written.len() - 1]).unwrap();
            let error = BASE64.encode("busy");
            format!("{}\r", json!({ "i": request["i"], "e": error })).into_bytes()
        });
        let result = HubTransfer::new(&mut link, Duration::from_secs(1))
            .request("program_terminate", json!({}));
        match result {
            Err(HubError::Rejected { message, .. }) => assert_eq!(message, "busy"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_silent_hub_times_out() {
        let mut link = MockSerialLink::new("/dev/ttyACM0", |_: &[u8]| Vec::new());
        let result = HubTransfer::new(&mut link, Duration::from_millis(50))
            .request("program_terminate", json!({}));
        assert!(matches!(result, Err(HubError::Timeout { .. })));
    }

    #[test]
    fn test_variant_timeouts() {
        assert_eq!(HubVariant::Spike.ack_timeout(), Duration::from_secs(12));
        assert_eq!(HubVariant::LargeHub.ack_timeout(), Duration::from_secs(10));
        assert_eq!(HubVariant::for_family(RobotFamily::Ev3), None);
    }

    #[test]
    fn test_cancelled_transfer_stops_before_next_request() {
        let mut link = hub(false, 0);
        let writes = link.writes();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = HubTransfer::new(&mut link, Duration::from_secs(1))
            .with_cancel(cancel)
            .upload("main.py", b"abc", 0);
        assert!(matches!(result, Err(HubError::Cancelled { .. })));
        assert!(writes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_channel_upload_reports_failure_as_outcome() {
        let opener = opener_for(hub(true, 0));
        let mut channel = HubChannel::with_opener(spike(), HubVariant::Spike, opener)
            .with_timeout(Duration::from_secs(1));

        let program = Program::persist("main.py", b"print(1)".to_vec()).unwrap();
        let outcome = channel.upload(&program).await;
        assert!(!outcome.is_success());
        assert!(outcome.message.contains("Checksum mismatch"), "{}", outcome.message);
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_close_during_upload_stops_transfer_and_releases_port() {
        let link = slow_hub(Duration::from_millis(30));
        let writes = link.writes();
        let closed = link.closed_flag();
        let mut channel = HubChannel::with_opener(spike(), HubVariant::Spike, opener_for(link))
            .with_timeout(Duration::from_secs(1));

        let program = Program::persist("main.py", vec![0x42; CHUNK_SIZE * 8]).unwrap();
        let abandoned =
            tokio::time::timeout(Duration::from_millis(80), channel.upload(&program)).await;
        assert!(abandoned.is_err(), "upload finished before being dropped");

        channel.close().await;
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!channel.is_open());

        let sent = writes.lock().len();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(writes.lock().len(), sent);
        assert!(!modes(&writes.lock()).contains(&"program_execute".to_string()));
    }
}
