//! Connector supervisor
//!
//! Scans the detectors, builds a [`Connector`] for the first robot found and
//! publishes its handle. A closed connector is discarded; the next scan
//! builds a fresh one. A connector idling in `DISCOVER` for a robot that no
//! detector reports any more is closed.

use std::sync::Arc;
use std::time::Duration;

use roberta_client::{ServerAddress, ServerSession};
use roberta_core::{ChannelResult, DeviceChannel, Robot, State};
use roberta_device::ChannelConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConnectorConfig, ConnectorSettings};
use crate::connector::{Connector, ConnectorHandle};
use crate::detect::Detector;
use crate::error::Result;

/// Builds the device channel for a selected robot
pub type ChannelFactory =
    Arc<dyn Fn(&Robot) -> ChannelResult<Box<dyn DeviceChannel>> + Send + Sync>;

/// Control interface to a running [`ConnectorSupervisor`]
#[derive(Clone)]
pub struct SupervisorHandle {
    active: watch::Receiver<Option<ConnectorHandle>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SupervisorHandle {
    /// Connector currently driving a robot
    pub fn active(&self) -> Option<ConnectorHandle> {
        self.active.borrow().clone()
    }

    /// Follow connector changes
    pub fn watch_active(&self) -> watch::Receiver<Option<ConnectorHandle>> {
        self.active.clone()
    }

    /// Close the active connector and stop scanning
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Owns the detectors and at most one active connector
pub struct ConnectorSupervisor {
    detectors: Vec<Box<dyn Detector>>,
    factory: ChannelFactory,
    address: Arc<ServerAddress>,
    connect_timeout: Duration,
    read_timeout: Duration,
    settings: ConnectorSettings,
    scan_interval: Duration,
    active_tx: watch::Sender<Option<ConnectorHandle>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ConnectorSupervisor {
    /// Supervisor whose channels come from [`roberta_device::create_channel`]
    pub fn new(
        config: &ConnectorConfig,
        channel_config: ChannelConfig,
        detectors: Vec<Box<dyn Detector>>,
    ) -> Self {
        let factory: ChannelFactory =
            Arc::new(move |robot: &Robot| roberta_device::create_channel(robot, &channel_config));
        Self::with_factory(config, detectors, factory)
    }

    pub fn with_factory(
        config: &ConnectorConfig,
        detectors: Vec<Box<dyn Detector>>,
        factory: ChannelFactory,
    ) -> Self {
        let (active_tx, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        Self {
            detectors,
            factory,
            address: config.server.address(),
            connect_timeout: config.server.connect_timeout(),
            read_timeout: config.server.read_timeout(),
            settings: config.connector.clone(),
            scan_interval: config.connector.discover_interval(),
            active_tx,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Shared server address (for UI-side changes before a robot exists)
    pub fn address(&self) -> Arc<ServerAddress> {
        self.address.clone()
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            active: self.active_tx.subscribe(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Scan and supervise until [`SupervisorHandle::shutdown`]
    pub async fn run(self) -> Result<()> {
        info!(detectors = self.detectors.len(), "Supervisor started");
        let mut shutdown = self.shutdown.subscribe();
        let mut active: Option<(ConnectorHandle, JoinHandle<()>)> = None;

        while !*shutdown.borrow() {
            let robots = self.detect().await;

            let finished = match &active {
                Some((handle, task)) => {
                    if !task.is_finished()
                        && handle.state() == State::Discover
                        && !robots.contains(handle.robot())
                    {
                        info!(robot = %handle.robot(), "Robot no longer detected");
                        handle.close();
                    }
                    task.is_finished()
                }
                None => false,
            };
            if finished {
                if let Some((handle, task)) = active.take() {
                    if let Err(e) = task.await {
                        warn!(robot = %handle.robot(), error = %e, "Connector task failed");
                    }
                    self.active_tx.send_replace(None);
                }
            }

            if active.is_none() {
                if let Some(robot) = robots.first() {
                    match self.start(robot) {
                        Ok((handle, task)) => {
                            self.active_tx.send_replace(Some(handle.clone()));
                            active = Some((handle, task));
                        }
                        Err(e) => warn!(robot = %robot, error = %e, "Cannot drive robot"),
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.scan_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        if let Some((handle, task)) = active.take() {
            handle.close();
            if let Err(e) = task.await {
                warn!(robot = %handle.robot(), error = %e, "Connector task failed");
            }
        }
        self.active_tx.send_replace(None);
        info!("Supervisor stopped");
        Ok(())
    }

    async fn detect(&self) -> Vec<Robot> {
        let mut robots: Vec<Robot> = Vec::new();
        for detector in &self.detectors {
            for robot in detector.detect_robots().await {
                if !robots.contains(&robot) {
                    robots.push(robot);
                }
            }
            debug!(detector = detector.name(), "Scan finished");
        }
        robots
    }

    fn start(&self, robot: &Robot) -> Result<(ConnectorHandle, JoinHandle<()>)> {
        let channel = (self.factory)(robot)?;
        let session = ServerSession::with_config(
            self.address.clone(),
            self.connect_timeout,
            self.read_timeout,
        )?;
        let connector = Connector::new(channel, session, self.settings.clone());

        info!(robot = %robot, "Starting connector");
        Ok(connector.spawn())
    }
}
