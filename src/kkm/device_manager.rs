//! Driver cache: one connected driver per fiscal registrar.
//!
//! Drivers are created lazily through a [`DriverFactory`] and reused across
//! commands. A transport failure evicts the driver so the next command
//! reconnects from scratch.

use crate::config::DeviceConfig;
use crate::error::{ErrorKind, KkmResult};
use crate::kkm::drivers;
use crate::kkm::protocol::KkmDriver;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Factory seam
// ---------------------------------------------------------------------------

/// Builds an unconnected driver for a device.
pub trait DriverFactory: Send + Sync {
    fn create(&self, device: &DeviceConfig) -> KkmResult<Box<dyn KkmDriver>>;
}

impl<F> DriverFactory for F
where
    F: Fn(&DeviceConfig) -> KkmResult<Box<dyn KkmDriver>> + Send + Sync,
{
    fn create(&self, device: &DeviceConfig) -> KkmResult<Box<dyn KkmDriver>> {
        self(device)
    }
}

/// Selects the driver by `kkmType`.
pub struct DefaultDriverFactory;

impl DriverFactory for DefaultDriverFactory {
    fn create(&self, device: &DeviceConfig) -> KkmResult<Box<dyn KkmDriver>> {
        drivers::create_driver(device)
    }
}

// ---------------------------------------------------------------------------
// Managed device
// ---------------------------------------------------------------------------

struct ManagedDevice {
    config: DeviceConfig,
    driver: Box<dyn KkmDriver>,
}

// ---------------------------------------------------------------------------
// Device Manager
// ---------------------------------------------------------------------------

pub struct DeviceManager {
    factory: Box<dyn DriverFactory>,
    devices: Mutex<HashMap<String, ManagedDevice>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::with_factory(DefaultDriverFactory)
    }

    pub fn with_factory(factory: impl DriverFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ManagedDevice>> {
        self.devices.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `op` against the device's driver, connecting it first if needed.
    ///
    /// A cached driver whose configuration changed is replaced.
    pub fn with_driver<R>(
        &self,
        device: &DeviceConfig,
        op: impl FnOnce(&mut dyn KkmDriver) -> KkmResult<R>,
    ) -> KkmResult<R> {
        let mut devices = self.lock();

        let stale = devices
            .get(&device.id)
            .is_some_and(|managed| managed.config != *device);
        if stale {
            if let Some(mut old) = devices.remove(&device.id) {
                info!(device_id = %device.id, "Configuration changed; reconnecting");
                let _ = old.driver.disconnect();
            }
        }

        let managed = match devices.entry(device.id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut driver = self.factory.create(device)?;
                driver.connect()?;
                info!(device_id = %device.id, driver = driver.name(), "Device connected");
                entry.insert(ManagedDevice {
                    config: device.clone(),
                    driver,
                })
            }
        };

        let result = op(managed.driver.as_mut());

        if let Err(e) = &result {
            if e.kind() == ErrorKind::Transport {
                if let Some(mut dead) = devices.remove(&device.id) {
                    warn!(device_id = %device.id, error = %e, "Transport failure; dropping driver");
                    let _ = dead.driver.disconnect();
                }
            }
        }
        result
    }

    /// Disconnect a device and remove it from the cache.
    pub fn disconnect_device(&self, device_id: &str) -> KkmResult<()> {
        let removed = self.lock().remove(device_id);
        if let Some(mut managed) = removed {
            managed.driver.disconnect()?;
            info!(device_id, "Device disconnected");
        }
        Ok(())
    }

    pub fn is_connected(&self, device_id: &str) -> bool {
        self.lock().contains_key(device_id)
    }

    pub fn connected_device_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Disconnect every cached driver.
    pub fn shutdown(&self) {
        let ids = self.connected_device_ids();
        for id in &ids {
            if let Err(e) = self.disconnect_device(id) {
                warn!("Error disconnecting {id} during shutdown: {e}");
            }
        }
        info!("DeviceManager shutdown: {} devices disconnected", ids.len());
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConnection, DeviceType};
    use crate::error::KkmError;
    use crate::kkm::protocol::{KkmStatus, ReportType};
    use crate::kkm::receipt::{Cashier, ReceiptData, ReceiptItem, ReceiptPayment};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Driver whose `get_status` fails with a transport error on demand.
    struct FlakyDriver {
        fail: bool,
        disconnects: Arc<AtomicUsize>,
    }

    impl KkmDriver for FlakyDriver {
        fn name(&self) -> &str {
            "Flaky"
        }
        fn connect(&mut self) -> KkmResult<()> {
            Ok(())
        }
        fn disconnect(&mut self) -> KkmResult<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn get_status(&mut self) -> KkmResult<KkmStatus> {
            if self.fail {
                Err(KkmError::Transport("cable unplugged".into()))
            } else {
                Ok(KkmStatus::default())
            }
        }
        fn open_session(&mut self, _: &Cashier) -> KkmResult<()> {
            Ok(())
        }
        fn get_report(&mut self, _: ReportType, _: &Cashier) -> KkmResult<()> {
            Ok(())
        }
        fn open_receipt(&mut self, _: Option<&ReceiptData>) -> KkmResult<()> {
            Ok(())
        }
        fn register_item(&mut self, _: &ReceiptItem) -> KkmResult<()> {
            Ok(())
        }
        fn register_payment(&mut self, _: &ReceiptPayment) -> KkmResult<()> {
            Ok(())
        }
        fn close_receipt(&mut self) -> KkmResult<()> {
            Ok(())
        }
        fn cancel_receipt(&mut self) -> KkmResult<()> {
            Ok(())
        }
        fn cash_in(&mut self, _: Decimal, _: &Cashier) -> KkmResult<()> {
            Ok(())
        }
        fn cash_out(&mut self, _: Decimal, _: &Cashier) -> KkmResult<()> {
            Ok(())
        }
        fn print_text(&mut self, _: &str) -> KkmResult<()> {
            Ok(())
        }
    }

    fn device(id: &str) -> DeviceConfig {
        DeviceConfig {
            id: id.into(),
            name: String::new(),
            device_type: DeviceType::FiscalRegistrar,
            connection: DeviceConnection::default(),
            device_specific_config: None,
        }
    }

    fn manager(fail: bool) -> (DeviceManager, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (c, d) = (created.clone(), disconnects.clone());
        let mgr = DeviceManager::with_factory(move |_: &DeviceConfig| -> KkmResult<Box<dyn KkmDriver>> {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FlakyDriver {
                fail,
                disconnects: d.clone(),
            }))
        });
        (mgr, created, disconnects)
    }

    #[test]
    fn test_device_manager_new() {
        let mgr = DeviceManager::new();
        assert!(mgr.connected_device_ids().is_empty());
        assert!(!mgr.is_connected("nonexistent"));
    }

    #[test]
    fn test_driver_is_reused() {
        let (mgr, created, _) = manager(false);
        let d = device("kkm-1");
        mgr.with_driver(&d, |drv| drv.get_status()).unwrap();
        mgr.with_driver(&d, |drv| drv.get_status()).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(mgr.is_connected("kkm-1"));
    }

    #[test]
    fn test_transport_error_evicts_driver() {
        let (mgr, created, disconnects) = manager(true);
        let d = device("kkm-1");
        let err = mgr.with_driver(&d, |drv| drv.get_status()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!mgr.is_connected("kkm-1"));
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        let _ = mgr.with_driver(&d, |drv| drv.get_status());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_other_errors_keep_driver() {
        let (mgr, _, _) = manager(false);
        let d = device("kkm-1");
        let err = mgr
            .with_driver(&d, |drv| drv.cut_paper())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
        assert!(mgr.is_connected("kkm-1"));
    }

    #[test]
    fn test_changed_config_recreates_driver() {
        let (mgr, created, disconnects) = manager(false);
        let mut d = device("kkm-1");
        mgr.with_driver(&d, |drv| drv.get_status()).unwrap();
        d.name = "Renamed".into();
        mgr.with_driver(&d, |drv| drv.get_status()).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_disconnects_all() {
        let (mgr, _, disconnects) = manager(false);
        mgr.with_driver(&device("a"), |drv| drv.get_status()).unwrap();
        mgr.with_driver(&device("b"), |drv| drv.get_status()).unwrap();
        mgr.shutdown();
        assert!(mgr.connected_device_ids().is_empty());
        assert_eq!(disconnects.load(Ordering::SeqCst), 2);
    }
}
