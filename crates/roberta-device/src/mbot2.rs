//! mBot2 binary frame protocol
//!
//! Frame layout:
//!
//! ```text
//! 0xF3 <hdr-sum> <len-lo> <len-hi> <protocol> <device> <service> <payload..> <frame-sum> 0xF4
//! ```
//!
//! `hdr-sum = 0xF3 + len-lo + len-hi` and `frame-sum` is the additive sum
//! of protocol through payload, both truncated to a byte. The length
//! counts protocol, device, service and payload.

use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use roberta_core::{
    ChannelError, ChannelResult, DeviceChannel, DeviceInfo, Program, Robot, UploadOutcome,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::serial::{system_opener, CancelFlag, LinkOpener, SerialLink, SerialSession};

pub const FRAME_START: u8 = 0xF3;
pub const FRAME_END: u8 = 0xF4;

/// Bytes of file content per body frame
pub const CHUNK_SIZE: usize = 64;
/// Window for each acknowledgement
pub const ACK_TIMEOUT: Duration = Duration::from_secs(3);
/// Serial speed of the mBot2 bootloader
pub const BAUD_RATE: u32 = 115_200;
/// Location of the user program on the robot
pub const TARGET_FILE: &str = "/flash/main.py";

const PROTOCOL_UPLOAD_MODE: u8 = 0x0D;
const PROTOCOL_FILE: u8 = 0x01;
const DEVICE_ID: u8 = 0x00;
const SERVICE_FILE: u8 = 0x5E;

const INSTRUCTION_HEADER: u8 = 0x01;
const INSTRUCTION_BODY: u8 = 0x02;
const FILE_TYPE_PYTHON: u8 = 0x00;

/// Frame level failures
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Bad frame marker: {0:#04x}")]
    BadMarker(u8),

    #[error("Header checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    HeaderChecksum { expected: u8, actual: u8 },

    #[error("Frame checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    FrameChecksum { expected: u8, actual: u8 },

    #[error("Length mismatch: header says {declared}, frame carries {actual}")]
    Length { declared: usize, actual: usize },

    #[error("No acknowledgement {expected} within {timeout:?}")]
    AckTimeout { expected: String, timeout: Duration },

    #[error("Transfer stopped")]
    Cancelled,

    #[error("Serial error: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for ChannelError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::AckTimeout { .. } => ChannelError::Timeout(e.to_string()),
            FrameError::Cancelled => ChannelError::Transport(e.to_string()),
            FrameError::Io(io) => io.into(),
            other => ChannelError::Protocol(other.to_string()),
        }
    }
}

// =============================================================================
// Frame Encoding
// =============================================================================

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub protocol: u8,
    pub device: u8,
    pub service: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(protocol: u8, device: u8, service: u8, payload: Vec<u8>) -> Self {
        Self {
            protocol,
            device,
            service,
            payload,
        }
    }

    /// Additive checksum over protocol, device, service and payload
    pub fn checksum(&self) -> u8 {
        self.payload
            .iter()
            .fold(
                self.protocol
                    .wrapping_add(self.device)
                    .wrapping_add(self.service),
                |sum, b| sum.wrapping_add(*b),
            )
    }

    pub fn encode(&self) -> Vec<u8> {
        let len = (3 + self.payload.len()) as u16;
        let [len_lo, len_hi] = len.to_le_bytes();
        let header_sum = FRAME_START.wrapping_add(len_lo).wrapping_add(len_hi);

        let mut out = Vec::with_capacity(self.payload.len() + 9);
        out.extend_from_slice(&[FRAME_START, header_sum, len_lo, len_hi]);
        out.extend_from_slice(&[self.protocol, self.device, self.service]);
        out.extend_from_slice(&self.payload);
        out.push(self.checksum());
        out.push(FRAME_END);
        out
    }

    /// Decode one frame, verifying markers, length and both checksums
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 9 {
            return Err(FrameError::TooShort(bytes.len()));
        }
        if bytes[0] != FRAME_START {
            return Err(FrameError::BadMarker(bytes[0]));
        }
        let last = bytes[bytes.len() - 1];
        if last != FRAME_END {
            return Err(FrameError::BadMarker(last));
        }

        let expected = FRAME_START.wrapping_add(bytes[2]).wrapping_add(bytes[3]);
        if bytes[1] != expected {
            return Err(FrameError::HeaderChecksum {
                expected,
                actual: bytes[1],
            });
        }

        let declared = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        let body = &bytes[4..bytes.len() - 2];
        if declared != body.len() {
            return Err(FrameError::Length {
                declared,
                actual: body.len(),
            });
        }

        let frame = Frame::new(body[0], body[1], body[2], body[3..].to_vec());
        let actual = bytes[bytes.len() - 2];
        let expected = frame.checksum();
        if actual != expected {
            return Err(FrameError::FrameChecksum { expected, actual });
        }
        Ok(frame)
    }
}

/// XOR of the file taken as little-endian 32-bit words, zero padded
pub fn xor32(data: &[u8]) -> u32 {
    data.chunks(4).fold(0u32, |acc, chunk| {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        acc ^ u32::from_le_bytes(word)
    })
}

/// The 9-byte frame switching the robot into upload mode
pub fn enter_upload_mode_frame() -> Vec<u8> {
    Frame::new(PROTOCOL_UPLOAD_MODE, DEVICE_ID, 0x00, Vec::new()).encode()
}

/// File header frame: type, size, checksum and NUL-terminated name
pub fn header_frame(target: &str, data: &[u8]) -> Vec<u8> {
    let mut payload = vec![INSTRUCTION_HEADER, FILE_TYPE_PYTHON];
    payload.extend_from_slice(&(data.len() as u32).to_le_bytes());
    payload.extend_from_slice(&xor32(data).to_le_bytes());
    payload.extend_from_slice(target.as_bytes());
    payload.push(0x00);
    Frame::new(PROTOCOL_FILE, DEVICE_ID, SERVICE_FILE, payload).encode()
}

/// Body frame carrying at most [`CHUNK_SIZE`] bytes at `offset`
pub fn body_frame(offset: u32, chunk: &[u8]) -> Vec<u8> {
    let mut payload = vec![INSTRUCTION_BODY];
    payload.extend_from_slice(&offset.to_le_bytes());
    payload.extend_from_slice(chunk);
    Frame::new(PROTOCOL_FILE, DEVICE_ID, SERVICE_FILE, payload).encode()
}

/// Acknowledgement expected for a file instruction
pub fn file_ack(instruction: u8) -> Vec<u8> {
    Frame::new(PROTOCOL_FILE, DEVICE_ID, SERVICE_FILE, vec![instruction, 0x00]).encode()
}

/// All frames of an upload paired with the acknowledgement each expects
pub fn upload_frames(target: &str, data: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let enter = enter_upload_mode_frame();
    let mut frames = vec![
        (enter.clone(), enter),
        (header_frame(target, data), file_ack(INSTRUCTION_HEADER)),
    ];
    for (i, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
        let offset = (i * CHUNK_SIZE) as u32;
        frames.push((body_frame(offset, chunk), file_ack(INSTRUCTION_BODY)));
    }
    frames
}

// =============================================================================
// Transfer
// =============================================================================

/// Read until the hex form of `expected` appears in the accumulated input
pub fn await_ack(
    link: &mut dyn SerialLink,
    expected: &[u8],
    timeout: Duration,
    cancel: &CancelFlag,
) -> Result<(), FrameError> {
    let pattern = hex::encode(expected);
    let deadline = Instant::now() + timeout;
    let mut received = String::new();
    let mut buf = [0u8; 256];

    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return Err(FrameError::Cancelled);
        }
        let n = link.read_available(&mut buf)?;
        if n == 0 {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        received.push_str(&hex::encode(&buf[..n]));
        if received.contains(&pattern) {
            return Ok(());
        }
    }

    debug!(expected = %pattern, received = %received, "Acknowledgement missing");
    Err(FrameError::AckTimeout {
        expected: pattern,
        timeout,
    })
}

/// Send every frame of an upload, each confirmed within `ack_timeout`
///
/// `cancel` is checked before each frame and while waiting for its ack.
pub fn transfer(
    link: &mut dyn SerialLink,
    target: &str,
    data: &[u8],
    ack_timeout: Duration,
    cancel: &CancelFlag,
) -> Result<(), FrameError> {
    let frames = upload_frames(target, data);
    let total = frames.len();
    for (i, (frame, ack)) in frames.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(FrameError::Cancelled);
        }
        link.write_all(&frame)?;
        await_ack(link, &ack, ack_timeout, cancel)?;
        debug!(frame = i + 1, total, "Frame acknowledged");
    }
    Ok(())
}

// =============================================================================
// Channel
// =============================================================================

/// Device channel for the mBot2 serial bootloader
pub struct Mbot2Channel {
    robot: Robot,
    serial: SerialSession,
    ack_timeout: Duration,
}

impl Mbot2Channel {
    pub fn new(robot: Robot) -> Self {
        Self::with_opener(robot, system_opener())
    }

    /// Use a custom link opener (e.g. a scripted link in tests)
    pub fn with_opener(robot: Robot, opener: LinkOpener) -> Self {
        let serial = SerialSession::new(robot.link.address(), BAUD_RATE, opener);
        Self {
            robot,
            serial,
            ack_timeout: ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

#[async_trait]
impl DeviceChannel for Mbot2Channel {
    fn robot(&self) -> &Robot {
        &self.robot
    }

    async fn probe(&mut self) -> ChannelResult<bool> {
        match self.serial.ensure_open().await {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!(port = %self.serial.port(), error = %e, "mBot2 not reachable");
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

        info!(robot = %self.robot, size = program.bytes().len(), "Uploading to mBot2");
        let data = program.bytes().to_vec();
        let ack_timeout = self.ack_timeout;
        let result = self
            .serial
            .run(move |link: &mut dyn SerialLink, cancel: &CancelFlag| {
                transfer(link, TARGET_FILE, &data, ack_timeout, cancel)
            })
            .await;

        match result {
            Ok(()) => UploadOutcome::ok(),
            Err(e) => {
                warn!(robot = %self.robot, error = %e, "mBot2 upload failed");
                // Resynchronise with a fresh port on the next attempt
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
    use roberta_core::{Link, RobotFamily};
    use std::sync::Arc;

    #[test]
    fn test_enter_upload_mode_frame_bytes() {
        assert_eq!(
            enter_upload_mode_frame(),
            vec![0xF3, 0xF6, 0x03, 0x00, 0x0D, 0x00, 0x00, 0x0D, 0xF4]
        );
    }

    #[test]
    fn test_checksum_recomputed_from_emitted_bytes() {
        let frame = Frame::new(0x01, 0x00, 0x5E, (0..=200).collect());
        let bytes = frame.encode();

        let recomputed = bytes[4..bytes.len() - 2]
            .iter()
            .fold(0u8, |sum, b| sum.wrapping_add(*b));
        assert_eq!(recomputed, bytes[bytes.len() - 2]);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_any_corrupted_byte_is_detected() {
        let bytes = header_frame(TARGET_FILE, b"print('hello')\n");
        for i in 0..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[i] ^= 0x01;
            assert!(
                Frame::decode(&corrupted).is_err(),
                "corruption at byte {} went unnoticed",
                i
            );
        }
    }

    #[test]
    fn test_corrupted_payload_breaks_frame_checksum() {
        let bytes = body_frame(64, &[0xAA; 64]);
        let declared = bytes[bytes.len() - 2];
        for i in 4..bytes.len() - 2 {
            let mut corrupted = bytes.clone();
            corrupted[i] = corrupted[i].wrapping_add(7);
            let recomputed = corrupted[4..corrupted.len() - 2]
                .iter()
                .fold(0u8, |sum, b| sum.wrapping_add(*b));
            assert_ne!(recomputed, declared);
        }
    }

    #[test]
    fn test_xor32_pads_last_word() {
        assert_eq!(xor32(&[]), 0);
        assert_eq!(xor32(&[0x01, 0x02, 0x03, 0x04]), 0x0403_0201);
        assert_eq!(
            xor32(&[0x01, 0x02, 0x03, 0x04, 0xFF]),
            0x0403_0201 ^ 0x0000_00FF
        );
    }

    #[test]
    fn test_header_payload_layout() {
        let data = vec![0x11; 70];
        let frame = Frame::decode(&header_frame("/flash/main.py", &data)).unwrap();
        assert_eq!(frame.protocol, 0x01);
        assert_eq!(frame.service, 0x5E);
        assert_eq!(frame.payload[0], INSTRUCTION_HEADER);
        assert_eq!(&frame.payload[2..6], &70u32.to_le_bytes());
        assert_eq!(&frame.payload[6..10], &xor32(&data).to_le_bytes());
        assert_eq!(&frame.payload[10..frame.payload.len() - 1], b"/flash/main.py");
        assert_eq!(*frame.payload.last().unwrap(), 0x00);
    }

    #[test]
    fn test_body_frames_chunk_at_64_bytes() {
        let data: Vec<u8> = (0..150u8).collect();
        let frames = upload_frames(TARGET_FILE, &data);
        // enter + header + 3 body frames
        assert_eq!(frames.len(), 5);

        let last = Frame::decode(&frames[4].0).unwrap();
        assert_eq!(&last.payload[1..5], &128u32.to_le_bytes());
        assert_eq!(&last.payload[5..], &data[128..]);
    }

    fn acking_link() -> MockSerialLink {
        MockSerialLink::new("/dev/ttyUSB0", |written: &[u8]| {
            let frame = match Frame::decode(written) {
                Ok(frame) => frame,
                Err(_) => return Vec::new(),
            };
            if frame.protocol == PROTOCOL_UPLOAD_MODE {
                return written.to_vec();
            }
            // noise before the real acknowledgement
            let mut reply = vec![0x00, 0x42];
            reply.extend(file_ack(frame.payload[0]));
            reply
        })
    }

    #[test]
    fn test_transfer_succeeds_when_every_frame_is_acknowledged() {
        let mut link = acking_link();
        let writes = link.writes();
        let data = vec![0x55; 130];

        let ack_timeout = Duration::from_millis(200);
        transfer(&mut link, TARGET_FILE, &data, ack_timeout, &CancelFlag::new()).unwrap();
        assert_eq!(writes.lock().len(), 5);
    }

    #[test]
    fn test_cancelled_transfer_sends_nothing() {
        let mut link = acking_link();
        let writes = link.writes();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = transfer(&mut link, TARGET_FILE, b"x", Duration::from_secs(1), &cancel);
        assert!(matches!(result, Err(FrameError::Cancelled)));
        assert!(writes.lock().is_empty());
    }

    #[test]
    fn test_transfer_fails_on_missing_ack() {
        let mut link = MockSerialLink::new("/dev/ttyUSB0", |_: &[u8]| Vec::new());
        let ack_timeout = Duration::from_millis(50);
        let result = transfer(&mut link, TARGET_FILE, b"x", ack_timeout, &CancelFlag::new());
        assert!(matches!(result, Err(FrameError::AckTimeout { .. })));
    }

    #[tokio::test]
    async fn test_channel_upload_and_close() {
        let robot = Robot::new(
            "mBot2",
            RobotFamily::Mbot2,
            Link::Serial("/dev/ttyUSB0".into()),
        );
        let link = acking_link();
        let closed = link.closed_flag();
        let slot = parking_lot::Mutex::new(Some(link));
        let opener: LinkOpener = Arc::new(move |_: &str, _: u32| {
            let link = slot
                .lock()
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "already opened"))?;
            Ok(Box::new(link) as Box<dyn SerialLink>)
        });
        let mut channel = Mbot2Channel::with_opener(robot, opener)
            .with_ack_timeout(Duration::from_millis(200));

        assert!(channel.probe().await.unwrap());
        assert!(channel.is_open());

        let program = Program::persist("NEPOprog.py", b"print('hi')".to_vec()).unwrap();
        let outcome = channel.upload(&program).await;
        assert!(outcome.is_success(), "{}", outcome);

        channel.close().await;
        assert!(!channel.is_open());
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
