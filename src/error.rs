//! Error taxonomy for command processing and fiscal registrar drivers.
//!
//! Errors raised while a command executes are caught at the executor
//! boundary and written onto the command record as an [`ErrorObject`].
//! Errors raised by `enqueue` / `get_result` go straight back to the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Device error sub-kinds
// ---------------------------------------------------------------------------

/// Known kinds of vendor-reported failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceErrorKind {
    /// The fiscal session has been open longer than 24 hours; a Z-report is
    /// required before any further fiscal document.
    SessionMore24Hours,
    Unknown,
}

// ---------------------------------------------------------------------------
// Error enum
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum KkmError {
    /// A command with the same id was already enqueued.
    #[error("Command with id '{0}' is already queued")]
    DuplicateCommand(String),

    /// Unknown command id or unknown device id.
    #[error("{0}")]
    NotFound(String),

    /// Device registry or device-specific configuration is unusable.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation is not valid in the current receipt lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The vendor (or this driver) does not implement the operation.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Network, serial port or HTTP failure talking to the device.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device answered with a non-success result code.
    #[error("Device error {code} ({kind:?}): {message}")]
    Device {
        kind: DeviceErrorKind,
        code: i32,
        message: String,
    },
}

/// Result type for all command-processing operations.
pub type KkmResult<T> = Result<T, KkmError>;

/// Serializable discriminant of [`KkmError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    DuplicateCommand,
    NotFound,
    Configuration,
    InvalidState,
    InvalidArgument,
    UnsupportedOperation,
    Transport,
    Device,
}

impl KkmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            KkmError::DuplicateCommand(_) => ErrorKind::DuplicateCommand,
            KkmError::NotFound(_) => ErrorKind::NotFound,
            KkmError::Configuration(_) => ErrorKind::Configuration,
            KkmError::InvalidState(_) => ErrorKind::InvalidState,
            KkmError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            KkmError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            KkmError::Transport(_) => ErrorKind::Transport,
            KkmError::Device { .. } => ErrorKind::Device,
        }
    }

    /// Shorthand for a device failure with a known sub-kind.
    pub fn device(kind: DeviceErrorKind, code: i32, message: impl Into<String>) -> Self {
        KkmError::Device {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        KkmError::UnsupportedOperation(what.into())
    }
}

impl From<reqwest::Error> for KkmError {
    fn from(e: reqwest::Error) -> Self {
        KkmError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for KkmError {
    fn from(e: std::io::Error) -> Self {
        KkmError::Transport(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Structured error object
// ---------------------------------------------------------------------------

/// Error payload stored as the result of a command that ended in `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorObject {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_error_kind: Option<DeviceErrorKind>,
}

impl From<&KkmError> for ErrorObject {
    fn from(e: &KkmError) -> Self {
        let (code, device_error_kind) = match e {
            KkmError::Device { kind, code, .. } => (Some(*code), Some(*kind)),
            _ => (None, None),
        };
        Self {
            kind: e.kind(),
            message: e.to_string(),
            code,
            device_error_kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
