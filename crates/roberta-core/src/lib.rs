//! roberta-core - Core types for the robot connector
//!
//! This crate provides the vocabulary shared by the server client, the
//! device channels and the connector state machine:
//!
//! - [`Robot`] descriptors produced by the detection layer
//! - the connector [`State`] and the [`StateEvent`] observers receive
//! - session [`Token`]s and the [`DeviceInfo`] map sent to the server
//! - [`Program`]s, [`FirmwareFile`]s and the [`UploadOutcome`] of a flash
//! - the [`DeviceChannel`] trait every robot family implements
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   Robot    ┌──────────────────────────────────────┐
//! │  Detector    │──────────▶│              Connector                │
//! └──────────────┘            │  State ── fire() ──▶ observers        │
//!                             │                                       │
//!                             │  ┌───────────────┐  ┌──────────────┐  │
//!                             │  │ ServerSession │  │DeviceChannel │  │
//!                             │  │ (HTTP push)   │  │(serial/HTTP/ │  │
//!                             │  └───────────────┘  │ SSH)         │  │
//!                             │                     └──────────────┘  │
//!                             └──────────────────────────────────────┘
//! ```

pub mod channel;
pub mod device_info;
pub mod error;
pub mod program;
pub mod robot;
pub mod state;
pub mod token;

pub use channel::{DeviceChannel, ExecutionMode};
pub use device_info::{DeviceInfo, PushCmd};
pub use error::{ChannelError, ChannelResult};
pub use program::{FirmwareFile, Program, UploadOutcome};
pub use robot::{ArduinoBoard, ChannelKind, Link, Robot, RobotFamily, SessionPolicy};
pub use state::{State, StateEvent};
pub use token::Token;
