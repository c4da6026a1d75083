//! Transport layer for fiscal registrar communication.
//!
//! Two shapes of transport exist: a byte-level [`ByteTransport`] for
//! registers wired to a serial port, and a [`JsonTransport`] for fiscal
//! servers that accept JSON commands over HTTP.

use crate::config::{ComPortConnection, LanConnection};
use crate::error::{KkmError, KkmResult};
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Endpoint path of the fiscal server command API.
const EXECUTE_PATH: &str = "/Execute";

// ---------------------------------------------------------------------------
// Transport state
// ---------------------------------------------------------------------------

/// Connection state for transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

// ---------------------------------------------------------------------------
// Byte transport
// ---------------------------------------------------------------------------

/// Abstract byte-level transport for directly attached registers.
pub trait ByteTransport: Send {
    fn connect(&mut self) -> KkmResult<()>;

    fn disconnect(&mut self) -> KkmResult<()>;

    /// Send raw bytes. Returns number of bytes written.
    fn send(&mut self, data: &[u8]) -> KkmResult<usize>;

    /// Receive whatever arrives within `timeout_ms`. Empty on timeout.
    fn receive(&mut self, timeout_ms: u64) -> KkmResult<Vec<u8>>;

    /// Keep reading until `is_complete` accepts the buffer or the deadline
    /// passes.
    fn receive_until(
        &mut self,
        timeout_ms: u64,
        is_complete: &dyn Fn(&[u8]) -> bool,
    ) -> KkmResult<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut buf = Vec::new();
        while !is_complete(&buf) {
            let now = Instant::now();
            if now >= deadline {
                return Err(KkmError::Transport(format!(
                    "{}: no complete answer within {timeout_ms}ms ({} bytes read)",
                    self.description(),
                    buf.len()
                )));
            }
            let left = (deadline - now).as_millis().max(1) as u64;
            buf.extend(self.receive(left)?);
        }
        Ok(buf)
    }

    fn is_connected(&self) -> bool;

    fn state(&self) -> TransportState;

    /// Human-readable description of the connection target.
    fn description(&self) -> String;
}

// ---------------------------------------------------------------------------
// Serial transport
// ---------------------------------------------------------------------------

/// Serial (COM / RS-232 / USB-serial) transport using the `serialport` crate.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    timeout_ms: u64,
    port: Option<Box<dyn serialport::SerialPort>>,
    state: TransportState,
}

impl SerialTransport {
    pub fn new(port_name: &str, baud_rate: u32, timeout_ms: u64) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
            timeout_ms,
            port: None,
            state: TransportState::Disconnected,
        }
    }

    pub fn from_config(com: &ComPortConnection, timeout_ms: u64) -> Self {
        Self::new(&com.port_name, com.speed, timeout_ms)
    }
}

impl ByteTransport for SerialTransport {
    fn connect(&mut self) -> KkmResult<()> {
        self.state = TransportState::Connecting;
        info!(
            "Opening serial port {} @ {} baud",
            self.port_name, self.baud_rate
        );

        let port = serialport::new(&self.port_name, self.baud_rate)
            .timeout(Duration::from_millis(self.timeout_ms))
            .open()
            .map_err(|e| {
                self.state = TransportState::Error;
                KkmError::Transport(format!("Failed to open {}: {e}", self.port_name))
            })?;

        self.port = Some(port);
        self.state = TransportState::Connected;
        info!("Serial port {} connected", self.port_name);
        Ok(())
    }

    fn disconnect(&mut self) -> KkmResult<()> {
        self.port = None;
        self.state = TransportState::Disconnected;
        info!("Serial port {} disconnected", self.port_name);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> KkmResult<usize> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| KkmError::Transport("Serial port not connected".into()))?;
        debug!("Serial TX ({} bytes): {:02X?}", data.len(), data);
        let n = port
            .write(data)
            .map_err(|e| KkmError::Transport(format!("Serial write error: {e}")))?;
        port.flush()
            .map_err(|e| KkmError::Transport(format!("Serial flush error: {e}")))?;
        Ok(n)
    }

    fn receive(&mut self, timeout_ms: u64) -> KkmResult<Vec<u8>> {
        let port = self
            .port
            .as_mut()
            .ok_or_else(|| KkmError::Transport("Serial port not connected".into()))?;

        port.set_timeout(Duration::from_millis(timeout_ms))
            .map_err(|e| KkmError::Transport(format!("Set timeout: {e}")))?;

        let mut buf = vec![0u8; 4096];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                debug!("Serial RX ({n} bytes): {:02X?}", &buf);
                Ok(buf)
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                debug!("Serial RX timeout after {timeout_ms}ms");
                Ok(Vec::new())
            }
            Err(e) => {
                self.state = TransportState::Error;
                Err(KkmError::Transport(format!("Serial read error: {e}")))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.state == TransportState::Connected && self.port.is_some()
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn description(&self) -> String {
        format!("Serial({}@{})", self.port_name, self.baud_rate)
    }
}

// ---------------------------------------------------------------------------
// JSON transport
// ---------------------------------------------------------------------------

/// Structured request/response transport to a fiscal server.
pub trait JsonTransport: Send {
    /// Send one command document and return the server's answer document.
    fn execute(&mut self, request: &serde_json::Value) -> KkmResult<serde_json::Value>;

    fn description(&self) -> String;
}

/// JSON over HTTP (`POST {base}/Execute`) with optional basic auth.
pub struct HttpJsonTransport {
    base_url: String,
    user: Option<String>,
    password: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpJsonTransport {
    pub fn new(lan: &LanConnection, timeout: Duration) -> KkmResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KkmError::Transport(format!("HTTP client init: {e}")))?;
        Ok(Self {
            base_url: base_url(&lan.host, lan.port),
            user: lan.user.clone(),
            password: lan.password.clone(),
            client,
        })
    }
}

/// Build `http://host:port` unless the host already carries a scheme.
fn base_url(host: &str, port: u16) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{host}:{port}")
    } else {
        format!("http://{host}:{port}")
    }
}

impl JsonTransport for HttpJsonTransport {
    fn execute(&mut self, request: &serde_json::Value) -> KkmResult<serde_json::Value> {
        let url = format!("{}{}", self.base_url, EXECUTE_PATH);
        debug!(url = %url, "HTTP TX {request}");

        let mut builder = self.client.post(&url).json(request);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_deref());
        }

        let resp = builder.send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(KkmError::Transport(format!("{url} answered HTTP {status}")));
        }
        let body: serde_json::Value = resp.json()?;
        debug!(url = %url, "HTTP RX {body}");
        Ok(body)
    }

    fn description(&self) -> String {
        format!("HTTP({})", self.base_url)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
