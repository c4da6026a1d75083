//! Driver implementations and factory.

pub mod kkm_server;
pub mod pirit;
pub mod viki_print;

use crate::config::{DeviceConfig, KkmType};
use crate::error::{KkmError, KkmResult};
use crate::kkm::protocol::KkmDriver;
use crate::kkm::transport::{HttpJsonTransport, SerialTransport};
use std::time::Duration;

/// Fiscal servers print before answering; give them time.
const DEFAULT_SERVER_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_SERIAL_TIMEOUT_MS: u64 = 15_000;

/// Create the driver for a fiscal registrar device.
///
/// The driver is constructed but not connected.
pub fn create_driver(device: &DeviceConfig) -> KkmResult<Box<dyn KkmDriver>> {
    let kkm = device.kkm_config()?;

    match kkm.kkm_type {
        KkmType::KkmServer => {
            let lan = device.connection.lan.as_ref().ok_or_else(|| {
                KkmError::Configuration(format!("Device {}: KKM server needs a LAN connection", device.id))
            })?;
            let timeout = Duration::from_millis(kkm.timeout_ms.unwrap_or(DEFAULT_SERVER_TIMEOUT_MS));
            let transport = HttpJsonTransport::new(lan, timeout)?;
            Ok(Box::new(kkm_server::KkmServerDriver::new(
                Box::new(transport),
                &kkm,
            )))
        }
        KkmType::VikiPrint => {
            let com = device.connection.com_port.as_ref().ok_or_else(|| {
                KkmError::Configuration(format!("Device {}: VikiPrint needs a COM port", device.id))
            })?;
            let timeout_ms = kkm.timeout_ms.unwrap_or(DEFAULT_SERIAL_TIMEOUT_MS);
            let transport = SerialTransport::from_config(com, timeout_ms);
            let port = pirit::FramedPirit::new(Box::new(transport), timeout_ms);
            Ok(Box::new(viki_print::VikiPrintDriver::new(Box::new(port), &kkm)))
        }
        other => Err(KkmError::unsupported(format!(
            "Fiscal registrar type {other:?} is not supported"
        ))),
    }
}
