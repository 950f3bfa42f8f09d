//! Serial link abstraction
//!
//! Upload protocols talk to a [`SerialLink`] rather than to `serialport`
//! directly so they can be driven by a scripted link in tests. All calls
//! are blocking; channels run them on the blocking thread pool through a
//! [`SerialSession`].

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roberta_core::{ChannelError, ChannelResult};
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Read timeout of a single poll on a real port
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Blocking byte link to a robot
pub trait SerialLink: Send {
    /// Write the whole buffer
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Read whatever arrives within a short poll window; 0 if nothing did
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Port name (e.g. "/dev/ttyACM0")
    fn name(&self) -> &str;
}

/// Opens a link on a port at a baud rate
pub type LinkOpener = Arc<dyn Fn(&str, u32) -> io::Result<Box<dyn SerialLink>> + Send + Sync>;

/// Opener backed by real serial ports
pub fn system_opener() -> LinkOpener {
    Arc::new(|path: &str, baud_rate: u32| {
        let link = SerialPortLink::open(path, baud_rate)?;
        Ok(Box::new(link) as Box<dyn SerialLink>)
    })
}

/// Serial link over the `serialport` crate
pub struct SerialPortLink {
    name: String,
    port: Box<dyn SerialPort>,
}

impl SerialPortLink {
    /// Open a serial port (8N1, no flow control)
    ///
    /// # Arguments
    /// * `path` - Serial port path (e.g., "/dev/ttyACM0")
    /// * `baud_rate` - Baud rate (e.g., 115200)
    pub fn open(path: &str, baud_rate: u32) -> io::Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;

        info!(port = path, baud_rate, "Opened serial port");

        Ok(Self {
            name: path.to_string(),
            port,
        })
    }
}

impl SerialLink for SerialPortLink {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SerialPortLink {
    fn drop(&mut self) {
        debug!(port = %self.name, "Closed serial port");
    }
}

/// A port as seen by enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// Enumerate serial ports; enumeration failures yield an empty list
pub fn list_ports() -> Vec<PortEntry> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let (vid, pid) = match info.port_type {
                    SerialPortType::UsbPort(usb) => (Some(usb.vid), Some(usb.pid)),
                    _ => (None, None),
                };
                PortEntry {
                    name: info.port_name,
                    vid,
                    pid,
                }
            })
            .collect(),
        Err(e) => {
            debug!(error = %e, "Serial port enumeration failed");
            Vec::new()
        }
    }
}

/// Whether a port is currently present
pub async fn port_present(port: &str) -> bool {
    let port = port.to_string();
    tokio::task::spawn_blocking(move || {
        // Enumeration misses some device nodes (e.g. Bluetooth rfcomm)
        list_ports().iter().any(|p| p.name == port) || std::path::Path::new(&port).exists()
    })
    .await
    .unwrap_or(false)
}

/// Set once a transfer should stop at its next poll
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type TransferTask = JoinHandle<(Box<dyn SerialLink>, ChannelResult<()>)>;

struct Running {
    cancel: CancelFlag,
    task: TransferTask,
}

/// Owns the link of a serial channel and the transfer using it
///
/// Transfers run on the blocking pool with the link moved into the task.
/// The task handle stays here, so a transfer whose caller went away is
/// still stopped and joined by [`SerialSession::close`] before the port
/// counts as released.
pub struct SerialSession {
    port: String,
    baud_rate: u32,
    opener: LinkOpener,
    link: Option<Box<dyn SerialLink>>,
    running: Option<Running>,
}

impl SerialSession {
    pub fn new(port: &str, baud_rate: u32, opener: LinkOpener) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            opener,
            link: None,
            running: None,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// Open the port unless a link is already held
    ///
    /// A transfer left behind by a dropped caller is stopped first and its
    /// link discarded.
    pub async fn ensure_open(&mut self) -> io::Result<()> {
        self.stop_transfer().await;
        if self.link.is_none() {
            self.link = Some((self.opener)(&self.port, self.baud_rate)?);
        }
        Ok(())
    }

    /// Run a blocking protocol step against the link on the blocking pool
    ///
    /// The step gets the link and a [`CancelFlag`] it must poll. The link
    /// comes back with the result; a panicking step loses it.
    pub async fn run<E, F>(&mut self, step: F) -> ChannelResult<()>
    where
        E: Into<ChannelError>,
        F: FnOnce(&mut dyn SerialLink, &CancelFlag) -> Result<(), E> + Send + 'static,
    {
        self.ensure_open().await?;
        let Some(mut link) = self.link.take() else {
            return Err(ChannelError::Transport("serial link unavailable".to_string()));
        };

        let cancel = CancelFlag::new();
        let flag = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            let result = step(link.as_mut(), &flag).map_err(Into::into);
            (link, result)
        });

        let running = self.running.insert(Running { cancel, task });
        let joined = (&mut running.task).await;
        self.running = None;

        match joined {
            Ok((link, result)) => {
                self.link = Some(link);
                result
            }
            Err(e) => Err(ChannelError::Transport(format!(
                "serial transfer on {} failed: {}",
                self.port, e
            ))),
        }
    }

    /// Stop any transfer, wait for it, then drop the link
    pub async fn close(&mut self) {
        self.stop_transfer().await;
        if self.link.take().is_some() {
            debug!(port = %self.port, "Released serial link");
        }
    }

    /// Whether a link is held, either idle or inside a transfer
    pub fn is_open(&self) -> bool {
        self.link.is_some() || self.running.is_some()
    }

    async fn stop_transfer(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        match running.task.await {
            Ok((link, _)) => {
                debug!(port = %self.port, "Abandoned serial transfer stopped");
                drop(link);
            }
            Err(e) => warn!(port = %self.port, error = %e, "Serial transfer task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSerialLink;
    use std::time::Instant;

    fn opener_for(link: MockSerialLink) -> LinkOpener {
        let slot = parking_lot::Mutex::new(Some(link));
        Arc::new(move |_: &str, _: u32| {
            let link = slot
                .lock()
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "already opened"))?;
            Ok(Box::new(link) as Box<dyn SerialLink>)
        })
    }

    #[tokio::test]
    async fn test_run_returns_link_after_step() {
        let link = MockSerialLink::new("/dev/ttyACM0", |_: &[u8]| b"ok".to_vec());
        let writes = link.writes();
        let mut session = SerialSession::new("/dev/ttyACM0", 115_200, opener_for(link));

        session
            .run(|link: &mut dyn SerialLink, _: &CancelFlag| link.write_all(b"hello"))
            .await
            .unwrap();
        assert!(session.is_open());
        assert_eq!(writes.lock().len(), 1);

        // second step reuses the held link; the opener would refuse
        session
            .run(|link: &mut dyn SerialLink, _: &CancelFlag| link.write_all(b"again"))
            .await
            .unwrap();
        assert_eq!(writes.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_close_stops_abandoned_step() {
        let link = MockSerialLink::new("/dev/ttyACM0", |_: &[u8]| Vec::new());
        let closed = link.closed_flag();
        let mut session = SerialSession::new("/dev/ttyACM0", 115_200, opener_for(link));

        let step = |_: &mut dyn SerialLink, cancel: &CancelFlag| -> io::Result<()> {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !cancel.is_cancelled() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        };
        let abandoned = tokio::time::timeout(Duration::from_millis(50), session.run(step)).await;
        assert!(abandoned.is_err());
        assert!(session.is_open());

        let started = Instant::now();
        session.close().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(closed.load(Ordering::SeqCst));
        assert!(!session.is_open());
    }
}
