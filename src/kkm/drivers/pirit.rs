//! Pirit command channel (VikiPrint and other Pirit-family registers).
//!
//! Frame format (host → register):
//! `STX | "PIRI" | PacketId | Cmd(2 hex) | Field FS Field FS ... | ETX | CRC(2 hex)`
//!
//! Answer: `STX | PacketId | Cmd(2 hex) | Err(2 hex) | Fields... | ETX | CRC(2 hex)`
//!
//! CRC is the XOR of every byte after STX up to and including ETX, written
//! as two upper-case hex digits. Text fields are IBM866.

use crate::error::{KkmError, KkmResult};
use crate::kkm::transport::ByteTransport;
use encoding_rs::IBM866;
use tracing::debug;

// ---------------------------------------------------------------------------
// Protocol constants
// ---------------------------------------------------------------------------

const STX: u8 = 0x02;
const ETX: u8 = 0x03;
const FS: u8 = 0x1C;
const PASSWORD: &[u8; 4] = b"PIRI";

const FIRST_PACKET_ID: u8 = 0x20;
const LAST_PACKET_ID: u8 = 0x7F;

/// Answer to one Pirit command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiritReply {
    /// 0 on success, vendor error code otherwise.
    pub code: u8,
    pub fields: Vec<String>,
}

impl PiritReply {
    pub fn ok(fields: Vec<String>) -> Self {
        Self { code: 0, fields }
    }

    /// Value field of an information request (field 0 echoes the request).
    pub fn value(&self) -> Option<&str> {
        self.fields
            .get(1)
            .or_else(|| self.fields.first())
            .map(|s| s.as_str())
    }

    pub fn field_i64(&self, index: usize) -> Option<i64> {
        self.fields.get(index).and_then(|s| s.trim().parse().ok())
    }
}

// ---------------------------------------------------------------------------
// Command channel trait
// ---------------------------------------------------------------------------

/// Synchronous call surface of a Pirit-family register.
///
/// A failed exchange is a `Transport` error; a vendor rejection is a reply
/// with a non-zero `code`.
pub trait PiritPort: Send {
    fn open(&mut self) -> KkmResult<()>;

    fn close(&mut self) -> KkmResult<()>;

    fn execute(&mut self, command: u8, fields: &[String]) -> KkmResult<PiritReply>;
}

// ---------------------------------------------------------------------------
// Framed implementation over a byte transport
// ---------------------------------------------------------------------------

pub struct FramedPirit {
    transport: Box<dyn ByteTransport>,
    packet_id: u8,
    timeout_ms: u64,
}

impl FramedPirit {
    pub fn new(transport: Box<dyn ByteTransport>, timeout_ms: u64) -> Self {
        Self {
            transport,
            packet_id: FIRST_PACKET_ID,
            timeout_ms,
        }
    }

    /// Next packet id (wraps 0x20..0x7F).
    fn next_packet_id(&mut self) -> u8 {
        let id = self.packet_id;
        self.packet_id = if self.packet_id >= LAST_PACKET_ID {
            FIRST_PACKET_ID
        } else {
            self.packet_id + 1
        };
        id
    }

    /// Encode a request. Returns the packet id the answer must echo.
    fn build_frame(&mut self, command: u8, fields: &[String]) -> (u8, Vec<u8>) {
        let id = self.next_packet_id();
        let mut frame = Vec::with_capacity(16 + fields.iter().map(|f| f.len() + 1).sum::<usize>());
        frame.push(STX);
        frame.extend_from_slice(PASSWORD);
        frame.push(id);
        frame.extend_from_slice(format!("{command:02X}").as_bytes());
        for field in fields {
            let (encoded, _, _) = IBM866.encode(field);
            frame.extend_from_slice(&encoded);
            frame.push(FS);
        }
        frame.push(ETX);
        let crc = crc(&frame[1..]);
        frame.extend_from_slice(format!("{crc:02X}").as_bytes());
        (id, frame)
    }

    fn parse_reply(&self, raw: &[u8], packet_id: u8, command: u8) -> KkmResult<PiritReply> {
        let start = raw
            .iter()
            .position(|&b| b == STX)
            .ok_or_else(|| bad_frame("no STX", raw))?;
        let end = raw[start..]
            .iter()
            .position(|&b| b == ETX)
            .map(|p| start + p)
            .ok_or_else(|| bad_frame("no ETX", raw))?;
        if raw.len() < end + 3 || end < start + 6 {
            return Err(bad_frame("truncated", raw));
        }

        let expected = crc(&raw[start + 1..=end]);
        let received = parse_hex(&raw[end + 1..end + 3]).ok_or_else(|| bad_frame("bad CRC digits", raw))?;
        if expected != received {
            return Err(bad_frame("CRC mismatch", raw));
        }

        if raw[start + 1] != packet_id {
            return Err(KkmError::Transport(format!(
                "Answer for packet {:02X} while waiting for {packet_id:02X}",
                raw[start + 1]
            )));
        }

        let cmd = parse_hex(&raw[start + 2..start + 4]).ok_or_else(|| bad_frame("bad command", raw))?;
        if cmd != command {
            return Err(KkmError::Transport(format!(
                "Answer for command {cmd:02X} while waiting for {command:02X}"
            )));
        }
        let code = parse_hex(&raw[start + 4..start + 6]).ok_or_else(|| bad_frame("bad error code", raw))?;

        let payload = &raw[start + 6..end];
        let mut fields: Vec<String> = payload
            .split(|&b| b == FS)
            .map(|chunk| IBM866.decode(chunk).0.into_owned())
            .collect();
        // Trailing separator yields one empty tail.
        if fields.last().is_some_and(|f| f.is_empty()) {
            fields.pop();
        }

        Ok(PiritReply { code, fields })
    }
}

fn crc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

fn parse_hex(digits: &[u8]) -> Option<u8> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok())
}

fn bad_frame(reason: &str, raw: &[u8]) -> KkmError {
    KkmError::Transport(format!(
        "Invalid Pirit answer ({reason}): {:02X?}",
        &raw[..raw.len().min(24)]
    ))
}

/// An answer is complete once ETX and its two CRC digits have arrived.
fn answer_complete(buf: &[u8]) -> bool {
    buf.iter()
        .rposition(|&b| b == ETX)
        .is_some_and(|p| buf.len() >= p + 3)
}

impl PiritPort for FramedPirit {
    fn open(&mut self) -> KkmResult<()> {
        if !self.transport.is_connected() {
            self.transport.connect()?;
        }
        Ok(())
    }

    fn close(&mut self) -> KkmResult<()> {
        self.transport.disconnect()
    }

    fn execute(&mut self, command: u8, fields: &[String]) -> KkmResult<PiritReply> {
        let (packet_id, frame) = self.build_frame(command, fields);
        debug!(command = format!("{command:02X}"), "Pirit TX {} bytes", frame.len());
        self.transport.send(&frame)?;
        let raw = self.transport.receive_until(self.timeout_ms, &answer_complete)?;
        self.parse_reply(&raw, packet_id, command)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kkm::transport::TransportState;
    use std::sync::{Arc, Mutex};

    /// Mock transport that records sent frames and returns canned answers.
    struct MockTransport {
        connected: bool,
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        responses: Vec<Vec<u8>>,
    }

    impl ByteTransport for MockTransport {
        fn connect(&mut self) -> KkmResult<()> {
            self.connected = true;
            Ok(())
        }
        fn disconnect(&mut self) -> KkmResult<()> {
            self.connected = false;
            Ok(())
        }
        fn send(&mut self, data: &[u8]) -> KkmResult<usize> {
            self.sent.lock().unwrap().push(data.to_vec());
            Ok(data.len())
        }
        fn receive(&mut self, _timeout_ms: u64) -> KkmResult<Vec<u8>> {
            if self.responses.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(self.responses.remove(0))
            }
        }
        fn is_connected(&self) -> bool {
            self.connected
        }
        fn state(&self) -> TransportState {
            if self.connected {
                TransportState::Connected
            } else {
                TransportState::Disconnected
            }
        }
        fn description(&self) -> String {
            "Mock".into()
        }
    }

    fn answer(id: u8, cmd: u8, code: u8, fields: &[&str]) -> Vec<u8> {
        let mut frame = vec![STX, id];
        frame.extend_from_slice(format!("{cmd:02X}{code:02X}").as_bytes());
        for f in fields {
            frame.extend_from_slice(&IBM866.encode(f).0);
            frame.push(FS);
        }
        frame.push(ETX);
        let c = crc(&frame[1..]);
        frame.extend_from_slice(format!("{c:02X}").as_bytes());
        frame
    }

    fn pirit(responses: Vec<Vec<u8>>) -> (FramedPirit, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport {
            connected: false,
            sent: sent.clone(),
            responses,
        };
        (FramedPirit::new(Box::new(transport), 200), sent)
    }

    #[test]
    fn test_build_frame_structure() {
        let (mut p, _) = pirit(vec![]);
        let (id, frame) = p.build_frame(0x42, &["Молоко".to_string(), "1".to_string()]);
        assert_eq!(id, FIRST_PACKET_ID);
        assert_eq!(frame[0], STX);
        assert_eq!(&frame[1..5], b"PIRI");
        assert_eq!(frame[5], FIRST_PACKET_ID);
        assert_eq!(&frame[6..8], b"42");
        // "Молоко" is six single-byte characters in IBM866.
        assert_eq!(frame[8 + 6], FS);
        let etx = frame.len() - 3;
        assert_eq!(frame[etx], ETX);
        let expected = format!("{:02X}", crc(&frame[1..=etx]));
        assert_eq!(&frame[etx + 1..], expected.as_bytes());
    }

    #[test]
    fn test_packet_id_wraps() {
        let (mut p, _) = pirit(vec![]);
        p.packet_id = LAST_PACKET_ID;
        assert_eq!(p.next_packet_id(), LAST_PACKET_ID);
        assert_eq!(p.packet_id, FIRST_PACKET_ID);
    }

    #[test]
    fn test_execute_parses_fields_and_code() {
        let (mut p, sent) = pirit(vec![answer(0x20, 0x02, 0, &["1", "0491000012345"])]);
        p.open().unwrap();
        let reply = p.execute(0x02, &["1".to_string()]).unwrap();
        assert_eq!(reply.code, 0);
        assert_eq!(reply.value(), Some("0491000012345"));
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_execute_reports_vendor_code() {
        let (mut p, _) = pirit(vec![answer(0x20, 0x30, 10, &[])]);
        let reply = p.execute(0x30, &[]).unwrap();
        assert_eq!(reply.code, 10);
        assert!(reply.fields.is_empty());
    }

    #[test]
    fn test_answer_split_across_reads() {
        let full = answer(0x20, 0x00, 0, &["0", "4", "0"]);
        let (head, tail) = full.split_at(5);
        let (mut p, _) = pirit(vec![head.to_vec(), tail.to_vec()]);
        let reply = p.execute(0x00, &[]).unwrap();
        assert_eq!(reply.field_i64(1), Some(4));
    }

    #[test]
    fn test_crc_mismatch_is_transport_error() {
        let mut bad = answer(0x20, 0x00, 0, &["0"]);
        let n = bad.len();
        bad[n - 1] = if bad[n - 1] == b'0' { b'1' } else { b'0' };
        let (mut p, _) = pirit(vec![bad]);
        assert!(matches!(p.execute(0x00, &[]), Err(KkmError::Transport(_))));
    }

    #[test]
    fn test_stale_packet_id_is_transport_error() {
        // Late answer to an earlier request with the same command code.
        let (mut p, _) = pirit(vec![answer(0x7F, 0x00, 0, &["0"])]);
        let err = p.execute(0x00, &[]).unwrap_err();
        assert!(matches!(err, KkmError::Transport(ref m) if m.contains("packet 7F")));
    }

    #[test]
    fn test_next_answer_carries_next_packet_id() {
        let (mut p, _) = pirit(vec![answer(0x20, 0x00, 0, &[]), answer(0x21, 0x00, 0, &[])]);
        p.execute(0x00, &[]).unwrap();
        p.execute(0x00, &[]).unwrap();
    }

    #[test]
    fn test_no_answer_is_transport_error() {
        let (mut p, _) = pirit(vec![]);
        assert!(matches!(p.execute(0x00, &[]), Err(KkmError::Transport(_))));
    }
}
