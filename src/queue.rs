//! Command queue: history of every accepted command plus the FIFO of work
//! still to run.
//!
//! Callers enqueue from any thread; a single executor thread drains the queue
//! (see [`crate::executor`]). History is the system of record for status
//! lookups and is never pruned.

use crate::config::QueueSettings;
use crate::error::{ErrorObject, KkmError, KkmResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandStatus {
    Wait,
    Ok,
    Error,
}

/// One accepted command. Only the executor changes `status` / `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command_id: String,
    pub device_id: String,
    pub payload: Value,
    pub status: CommandStatus,
    /// Handler output on `Ok`, an [`ErrorObject`] on `Error`.
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// What `enqueue` / `get_result` hand back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub command_id: String,
    pub device_id: String,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl From<&CommandRecord> for Answer {
    fn from(r: &CommandRecord) -> Self {
        Self {
            command_id: r.command_id.clone(),
            device_id: r.device_id.clone(),
            status: r.status,
            result: r.result.clone(),
        }
    }
}

/// Routing fields every command document carries.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    command_id: String,
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    with_out_queue: bool,
}

// ---------------------------------------------------------------------------
// Handler seam
// ---------------------------------------------------------------------------

/// Executes one command against its device.
pub trait CommandHandler: Send {
    /// `Ok(result)` marks the command `Ok`; any error marks it `Error`.
    fn handle(&mut self, device_id: &str, payload: &Value) -> KkmResult<Option<Value>>;

    /// Called once when the executor stops.
    fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    history: HashMap<String, CommandRecord>,
    stopped: bool,
}

pub struct CommandQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
    settings: QueueSettings,
}

impl CommandQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Condvar::new(),
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Accept a command document. Returns the `Wait` answer and whether the
    /// caller asked for a synchronous result.
    fn submit(&self, raw: Value) -> KkmResult<(Answer, bool)> {
        let envelope: Envelope = serde_json::from_value(raw.clone())
            .map_err(|e| KkmError::InvalidArgument(format!("Invalid command envelope: {e}")))?;
        if envelope.command_id.trim().is_empty() {
            return Err(KkmError::InvalidArgument("commandId is required".into()));
        }
        if envelope.device_id.trim().is_empty() {
            return Err(KkmError::InvalidArgument("deviceId is required".into()));
        }

        let record = CommandRecord {
            command_id: envelope.command_id.clone(),
            device_id: envelope.device_id,
            payload: raw,
            status: CommandStatus::Wait,
            result: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let answer = Answer::from(&record);

        {
            let mut state = self.lock();
            if state.history.contains_key(&record.command_id) {
                warn!(command_id = %record.command_id, "Duplicate command rejected");
                return Err(KkmError::DuplicateCommand(record.command_id));
            }
            state.pending.push_back(record.command_id.clone());
            state.history.insert(record.command_id.clone(), record);
        }
        self.ready.notify_one();

        info!(
            command_id = %answer.command_id,
            device_id = %answer.device_id,
            "Command enqueued"
        );
        Ok((answer, envelope.with_out_queue))
    }

    /// Accept a command document for background execution.
    pub fn enqueue(&self, raw: Value) -> KkmResult<Answer> {
        self.submit(raw).map(|(answer, _)| answer)
    }

    /// Same as [`enqueue`](Self::enqueue) for a raw JSON string.
    pub fn enqueue_str(&self, raw: &str) -> KkmResult<Answer> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| KkmError::InvalidArgument(format!("Command is not valid JSON: {e}")))?;
        self.enqueue(value)
    }

    pub fn get_command_state(&self, command_id: &str) -> KkmResult<CommandRecord> {
        self.lock()
            .history
            .get(command_id)
            .cloned()
            .ok_or_else(|| KkmError::NotFound(format!("Command {command_id} not found")))
    }

    pub fn get_result(&self, command_id: &str) -> KkmResult<Answer> {
        self.get_command_state(command_id).map(|r| Answer::from(&r))
    }

    /// Enqueue; for `withOutQueue` commands wait the configured interval and
    /// return whatever state the command has reached (possibly still `Wait`).
    pub async fn add_command(&self, raw: Value) -> KkmResult<Answer> {
        let (answer, sync) = self.submit(raw)?;
        if !sync {
            return Ok(answer);
        }
        tokio::time::sleep(self.settings.sync_wait()).await;
        self.get_result(&answer.command_id)
    }

    /// Blocking variant of [`add_command`](Self::add_command).
    pub fn add_command_blocking(&self, raw: Value) -> KkmResult<Answer> {
        let (answer, sync) = self.submit(raw)?;
        if !sync {
            return Ok(answer);
        }
        std::thread::sleep(self.settings.sync_wait());
        self.get_result(&answer.command_id)
    }

    /// Number of commands waiting to be picked up.
    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Ask the executor to exit once the queue is drained.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.ready.notify_all();
    }

    /// Block until a command id is available. `None` once stopped and empty.
    pub fn wait_next(&self) -> Option<String> {
        let mut state = self.lock();
        loop {
            if let Some(id) = state.pending.pop_front() {
                return Some(id);
            }
            if state.stopped {
                return None;
            }
            state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Run the oldest pending command, if any. Returns `false` when idle.
    pub fn process_next(&self, handler: &mut dyn CommandHandler) -> bool {
        let next = self.lock().pending.pop_front();
        match next {
            Some(id) => {
                self.execute(&id, handler);
                true
            }
            None => false,
        }
    }

    /// Execute one command to a terminal status. Never panics or returns an
    /// error; every failure lands on the record.
    pub fn execute(&self, command_id: &str, handler: &mut dyn CommandHandler) {
        let (device_id, payload) = {
            let state = self.lock();
            match state.history.get(command_id) {
                Some(r) if r.status == CommandStatus::Wait => (r.device_id.clone(), r.payload.clone()),
                Some(r) => {
                    debug!(command_id, status = ?r.status, "Command already handled; skipping");
                    return;
                }
                None => {
                    warn!(command_id, "Dequeued command missing from history");
                    return;
                }
            }
        };

        info!(command_id, device_id = %device_id, "Command started");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&device_id, &payload)))
            .unwrap_or_else(|panic| Err(KkmError::InvalidState(panic_message(panic.as_ref()))));

        let (status, result) = match outcome {
            Ok(result) => {
                info!(command_id, "Command completed");
                (CommandStatus::Ok, result)
            }
            Err(e) => {
                error!(command_id, device_id = %device_id, error = %e, "Command failed");
                let object = serde_json::to_value(ErrorObject::from(&e)).ok();
                (CommandStatus::Error, object)
            }
        };

        let mut state = self.lock();
        if let Some(record) = state.history.get_mut(command_id) {
            record.status = status;
            record.result = result;
            record.completed_at = Some(Utc::now());
        }
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Command handler panicked: {detail}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
