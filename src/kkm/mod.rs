//! Fiscal registrar (KKM) support.
//!
//! - `protocol`: the `KkmDriver` contract, status snapshot, receipt slot
//! - `receipt` / `russia`: generic receipt model and the Russian regime tables
//! - `transport`: serial and JSON-over-HTTP transports
//! - `drivers`: vendor drivers and the driver factory
//! - `device_manager`: cache of connected drivers
//! - `facade` / `commands`: orchestration and the command set

pub mod commands;
pub mod device_manager;
pub mod drivers;
pub mod facade;
pub mod protocol;
pub mod receipt;
pub mod russia;
pub mod transport;
