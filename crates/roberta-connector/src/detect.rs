//! Robot detection
//!
//! Detectors are polled by the supervisor. A scan must be idempotent and
//! finish in bounded time; it never opens a robot's port.

use std::sync::Arc;

use async_trait::async_trait;
use roberta_core::{Link, Robot};
use roberta_device::serial::{self, PortEntry};
use tracing::{debug, warn};

use crate::config::UsbId;

/// Source of robot descriptors
#[async_trait]
pub trait Detector: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Robots currently available
    async fn detect_robots(&self) -> Vec<Robot>;
}

// =============================================================================
// Static
// =============================================================================

/// Robots listed in the config file
///
/// Network robots are always offered. Serial robots only while their port
/// exists.
pub struct StaticDetector {
    robots: Vec<Robot>,
}

impl StaticDetector {
    pub fn new(robots: Vec<Robot>) -> Self {
        Self { robots }
    }
}

#[async_trait]
impl Detector for StaticDetector {
    fn name(&self) -> &str {
        "static"
    }

    async fn detect_robots(&self) -> Vec<Robot> {
        let mut found = Vec::with_capacity(self.robots.len());
        for robot in &self.robots {
            match &robot.link {
                Link::Network(_) => found.push(robot.clone()),
                Link::Serial(port) => {
                    if serial::port_present(port).await {
                        found.push(robot.clone());
                    }
                }
            }
        }
        found
    }
}

// =============================================================================
// USB serial
// =============================================================================

/// Port enumeration function
pub type PortLister = Arc<dyn Fn() -> Vec<PortEntry> + Send + Sync>;

/// Serial ports whose USB ids appear in the `[[usb_ids]]` table
pub struct UsbSerialDetector {
    table: Vec<UsbId>,
    lister: PortLister,
}

impl UsbSerialDetector {
    pub fn new(table: Vec<UsbId>) -> Self {
        Self::with_lister(table, Arc::new(serial::list_ports))
    }

    pub fn with_lister(table: Vec<UsbId>, lister: PortLister) -> Self {
        Self { table, lister }
    }

    fn lookup(&self, port: &PortEntry) -> Option<Robot> {
        let (vid, pid) = (port.vid?, port.pid?);
        let entry = self.table.iter().find(|id| id.vid == vid && id.pid == pid)?;
        let family = match entry.family() {
            Ok(family) => family,
            Err(e) => {
                warn!(error = %e, "Ignoring USB id entry");
                return None;
            }
        };
        let name = entry
            .name
            .clone()
            .unwrap_or_else(|| family.server_id().to_string());
        Some(Robot::new(name, family, Link::Serial(port.name.clone())))
    }
}

#[async_trait]
impl Detector for UsbSerialDetector {
    fn name(&self) -> &str {
        "usb-serial"
    }

    async fn detect_robots(&self) -> Vec<Robot> {
        let lister = self.lister.clone();
        let ports = match tokio::task::spawn_blocking(move || lister()).await {
            Ok(ports) => ports,
            Err(e) => {
                warn!(error = %e, "Port enumeration task failed");
                return Vec::new();
            }
        };

        let robots: Vec<Robot> = ports.iter().filter_map(|port| self.lookup(port)).collect();
        debug!(ports = ports.len(), robots = robots.len(), "USB serial scan");
        robots
    }
}
