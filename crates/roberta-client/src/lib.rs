//! roberta-client - Programming server client
//!
//! Speaks the long-poll push protocol of the programming server and
//! downloads program, firmware and HAL artifacts.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use roberta_client::{ServerAddress, ServerSession, ServerCommand};
//! use roberta_core::{DeviceInfo, PushCmd, RobotFamily, Token};
//!
//! let address = Arc::new(ServerAddress::default());
//! let session = ServerSession::new(address)?;
//!
//! let info = DeviceInfo::for_robot(RobotFamily::Ev3, "EV3")
//!     .with_token(&Token::generate())
//!     .with_cmd(PushCmd::Register);
//! match session.push(&info).await?.command()? {
//!     ServerCommand::Repeat => println!("registered"),
//!     other => println!("server said {:?}", other),
//! }
//! ```

pub mod address;
pub mod error;
pub mod session;
pub mod testing;
pub mod types;

pub use address::{ServerAddress, DEFAULT_SERVER_ADDRESS};
pub use error::{ClientError, Result};
pub use session::ServerSession;
pub use types::{Download, PushResponse, ServerCommand};
