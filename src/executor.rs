//! Command executor: the single worker that drains the queue and routes
//! each command to its device.
//!
//! [`Connector`] is the process-wide state object: it owns the queue and the
//! executor thread, is created once at startup and lives until shutdown.

use crate::config::{resolve_device, ConnectorConfig, DeviceRegistry, DeviceType, QueueSettings};
use crate::error::{KkmError, KkmResult};
use crate::kkm::commands::KkmCommand;
use crate::kkm::device_manager::DeviceManager;
use crate::queue::{Answer, CommandHandler, CommandQueue, CommandRecord};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

const EXECUTOR_THREAD_NAME: &str = "kkm-command-executor";

// ---------------------------------------------------------------------------
// Device command handler
// ---------------------------------------------------------------------------

/// Resolves the target device and dispatches by device type.
pub struct DeviceCommandHandler {
    registry: Arc<dyn DeviceRegistry>,
    devices: DeviceManager,
}

impl DeviceCommandHandler {
    pub fn new(registry: Arc<dyn DeviceRegistry>, devices: DeviceManager) -> Self {
        Self { registry, devices }
    }
}

impl CommandHandler for DeviceCommandHandler {
    fn handle(&mut self, device_id: &str, payload: &Value) -> KkmResult<Option<Value>> {
        let device = resolve_device(self.registry.as_ref(), device_id)?;

        match device.device_type {
            DeviceType::FiscalRegistrar => {
                let command = KkmCommand::from_payload(payload)?;
                info!(device_id, command = command.name(), "Fiscal registrar command");
                self.devices
                    .with_driver(&device, |driver| command.execute(driver))
            }
            other => Err(KkmError::unsupported(format!(
                "Device {device_id}: no command handler for {other:?} devices"
            ))),
        }
    }

    fn shutdown(&mut self) {
        self.devices.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Executor thread
// ---------------------------------------------------------------------------

/// Spawn the executor. It runs commands one at a time in enqueue order and
/// exits after [`CommandQueue::stop`] once the queue is drained.
pub fn spawn_executor(
    queue: Arc<CommandQueue>,
    mut handler: Box<dyn CommandHandler>,
) -> KkmResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(EXECUTOR_THREAD_NAME.into())
        .spawn(move || {
            info!("Command executor started");
            while let Some(id) = queue.wait_next() {
                queue.execute(&id, handler.as_mut());
            }
            handler.shutdown();
            info!("Command executor stopped");
        })
        .map_err(|e| KkmError::InvalidState(format!("Cannot start command executor: {e}")))
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

pub struct Connector {
    queue: Arc<CommandQueue>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Connector {
    /// Start with the devices of an in-memory configuration.
    pub fn start(config: ConnectorConfig) -> KkmResult<Self> {
        let settings = config.queue.clone();
        Self::start_with_registry(Arc::new(config), settings)
    }

    pub fn start_with_registry(
        registry: Arc<dyn DeviceRegistry>,
        settings: QueueSettings,
    ) -> KkmResult<Self> {
        let handler = DeviceCommandHandler::new(registry, DeviceManager::new());
        Self::start_with_handler(Box::new(handler), settings)
    }

    pub fn start_with_handler(
        handler: Box<dyn CommandHandler>,
        settings: QueueSettings,
    ) -> KkmResult<Self> {
        let queue = Arc::new(CommandQueue::new(settings));
        let worker = spawn_executor(queue.clone(), handler)?;
        Ok(Self {
            queue,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn enqueue(&self, raw: Value) -> KkmResult<Answer> {
        self.queue.enqueue(raw)
    }

    pub fn get_command_state(&self, command_id: &str) -> KkmResult<CommandRecord> {
        self.queue.get_command_state(command_id)
    }

    pub fn get_result(&self, command_id: &str) -> KkmResult<Answer> {
        self.queue.get_result(command_id)
    }

    pub async fn add_command(&self, raw: Value) -> KkmResult<Answer> {
        self.queue.add_command(raw).await
    }

    pub fn add_command_blocking(&self, raw: Value) -> KkmResult<Answer> {
        self.queue.add_command_blocking(raw)
    }

    /// Let the executor finish every queued command, then join it.
    pub fn shutdown(&self) {
        self.queue.stop();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("Command executor thread panicked");
            }
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
