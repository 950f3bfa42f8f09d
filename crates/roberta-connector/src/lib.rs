//! roberta-connector - robot session state machine
//!
//! Bridges one detected robot to the programming server.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ConnectorSupervisor                        │
//! │   Detectors (static, USB serial) ──► select robot            │
//! │                          │                                   │
//! │                          ▼                                   │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │ Connector (own task)                                    │ │
//! │  │   state machine ──► ServerSession (push / download)     │ │
//! │  │        │                                                │ │
//! │  │        └─────────► DeviceChannel (probe / upload)       │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! │                          │                                   │
//! │                          ▼                                   │
//! │        ConnectorHandle (observers, connect, close)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connector;
pub mod detect;
pub mod error;
pub mod supervisor;

pub use config::{ConnectorConfig, ConnectorSettings, RobotEntry, ServerConfig, UsbId};
pub use connector::{Connector, ConnectorHandle, Listener, ListenerId};
pub use detect::{Detector, StaticDetector, UsbSerialDetector};
pub use error::{ConnectorError, Result};
pub use supervisor::{ChannelFactory, ConnectorSupervisor, SupervisorHandle};

// Re-export for convenience
pub use roberta_core::{Robot, RobotFamily, State, StateEvent, Token};
