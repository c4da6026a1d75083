//! Devices Connector: fiscal registrar (KKM) command processing.
//!
//! Callers submit JSON command documents to a [`queue::CommandQueue`]; a
//! single executor thread runs them in order against the target device's
//! driver and records the outcome on the command, where it can be read back
//! by id.
//!
//! ```no_run
//! use devices_connector::{config::ConnectorConfig, executor::Connector, init_logging};
//! use std::path::Path;
//!
//! # fn main() -> devices_connector::error::KkmResult<()> {
//! let config = ConnectorConfig::load(Path::new("connector.json"))?;
//! init_logging(config.log_dir.as_deref());
//! let connector = Connector::start(config)?;
//! let answer = connector.enqueue(serde_json::json!({
//!     "commandId": "7f1c",
//!     "deviceId": "kkm-1",
//!     "command": "getStatus"
//! }))?;
//! println!("{:?}", connector.get_result(&answer.command_id)?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod kkm;
pub mod logging;
pub mod queue;

pub use error::{KkmError, KkmResult};
pub use executor::Connector;
pub use logging::init_logging;
pub use queue::{Answer, CommandQueue, CommandStatus};
