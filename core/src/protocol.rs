//! Wire codecs: the client<->server length-prefixed blob protocol, and the
//! controller<->worker-client opcode/payload-record protocol.

use std::io::{self, Read, Write};

/// Bytes read for a single request body, paired with whatever it was
/// measured against. `body.len() <= declared_len` always holds; the two are
/// only unequal when the peer closed mid-body (a truncation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBody {
    pub declared_len: u32,
    pub body: Vec<u8>,
}

/// Outcome of attempting to receive one length-prefixed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome {
    /// The peer closed the connection before sending any bytes of a new
    /// request. Normal end of a session.
    Idle,
    /// A full `declared_len`-byte body was received.
    Complete(ReceivedBody),
    /// The peer closed partway through the body. `body.len() < declared_len`.
    Truncated(ReceivedBody),
    /// `should_continue` returned `false` before the request completed.
    Terminated,
}

const HEADER_LEN: usize = 4;
/// Upper bound on a single `read` call, regardless of the declared body length.
pub const MAX_CHUNK_SIZE: usize = crate::config::MAX_CHUNK_SIZE;

enum Fill {
    Full,
    Eof(usize),
    Terminated,
}

/// Fills `buf` completely, calling `should_continue` before every underlying
/// `read`. Stops early (without error) on a zero-length read (peer closed)
/// or on `should_continue` returning `false`.
fn fill(
    reader: &mut impl Read,
    buf: &mut [u8],
    mut should_continue: impl FnMut() -> bool,
) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        if !should_continue() {
            return Ok(Fill::Terminated);
        }
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(Fill::Eof(filled)),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Fill::Full)
}

/// Receives one length-prefixed request: a 4-byte big-endian length followed
/// by that many bytes. `should_continue` is polled before every read so a
/// caller can fold in shutdown-signal detection; body chunks never exceed
/// [`MAX_CHUNK_SIZE`] bytes per underlying read.
pub fn receive_request<R: Read>(
    reader: &mut R,
    mut should_continue: impl FnMut() -> bool,
) -> io::Result<RecvOutcome> {
    let mut header = [0u8; HEADER_LEN];
    match fill(reader, &mut header, &mut should_continue)? {
        Fill::Full => {}
        Fill::Eof(0) => return Ok(RecvOutcome::Idle),
        Fill::Eof(_) => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed mid-header",
            ))
        }
        Fill::Terminated => return Ok(RecvOutcome::Terminated),
    }
    let declared_len = u32::from_be_bytes(header);

    let mut body = Vec::with_capacity((declared_len as usize).min(MAX_CHUNK_SIZE));
    let mut remaining = declared_len as usize;
    let mut chunk = vec![0u8; MAX_CHUNK_SIZE.min(remaining.max(1))];
    while remaining > 0 {
        let want = remaining.min(chunk.len());
        match fill(reader, &mut chunk[..want], &mut should_continue)? {
            Fill::Full => {
                body.extend_from_slice(&chunk[..want]);
                remaining -= want;
            }
            Fill::Eof(n) => {
                body.extend_from_slice(&chunk[..n]);
                return Ok(RecvOutcome::Truncated(ReceivedBody { declared_len, body }));
            }
            Fill::Terminated => return Ok(RecvOutcome::Terminated),
        }
    }

    Ok(RecvOutcome::Complete(ReceivedBody { declared_len, body }))
}

/// Sends the 4-byte big-endian received-byte-count reply, retrying partial
/// writes to completion.
pub fn send_reply<W: Write>(writer: &mut W, received_bytes: u32) -> io::Result<()> {
    writer.write_all(&received_bytes.to_be_bytes())
}

/// Client side of the length-prefixed blob protocol: writes a 4-byte
/// big-endian length followed by `body`, retrying partial writes to
/// completion (`Write::write_all` already retries on `Interrupted`).
pub fn send_request<W: Write>(writer: &mut W, body: &[u8]) -> io::Result<()> {
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(body)
}

/// Client side of the reply: reads the 4-byte big-endian received-byte-count
/// the server sends back.
pub fn receive_reply<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Reads a single control opcode (`uint16_be`) from a worker client's
/// connection to the controller.
pub fn read_opcode<R: Read>(reader: &mut R) -> io::Result<Result<ControlOpcode, u16>> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(ControlOpcode::from_be_bytes(buf))
}

/// Control opcode sent from the controller to a worker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOpcode {
    Start = 1,
    Stop = 2,
}

impl ControlOpcode {
    pub fn to_be_bytes(self) -> [u8; 2] {
        (self as u16).to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 2]) -> Result<Self, u16> {
        match u16::from_be_bytes(bytes) {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            other => Err(other),
        }
    }
}

/// The payload a controller sends immediately after a START opcode: the
/// server's address and the workload blob to replay against it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRecord {
    pub server_port: u16,
    pub server_ip: String,
    pub data: Vec<u8>,
}

impl PayloadRecord {
    pub fn encode(&self) -> Vec<u8> {
        let ip_bytes = self.server_ip.as_bytes();
        let mut out = Vec::with_capacity(2 + 4 + ip_bytes.len() + 4 + self.data.len());
        out.extend_from_slice(&self.server_port.to_be_bytes());
        out.extend_from_slice(&(ip_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(ip_bytes);
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode())
    }

    /// Reads a payload record from a stream that has just delivered a START
    /// opcode. Unlike [`receive_request`] this does not honor a
    /// `should_continue` hook: the controller protocol has no mid-payload
    /// cancellation point in its contract.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut port_buf = [0u8; 2];
        reader.read_exact(&mut port_buf)?;
        let server_port = u16::from_be_bytes(port_buf);

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let ip_len = u32::from_be_bytes(len_buf) as usize;
        let mut ip_buf = vec![0u8; ip_len];
        reader.read_exact(&mut ip_buf)?;
        let server_ip = String::from_utf8(ip_buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        reader.read_exact(&mut len_buf)?;
        let data_len = u32::from_be_bytes(len_buf) as usize;
        let mut data = vec![0u8; data_len];
        reader.read_exact(&mut data)?;

        Ok(Self {
            server_port,
            server_ip,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn receives_complete_request() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&5u32.to_be_bytes());
        wire.extend_from_slice(b"HELLO");
        let mut cursor = Cursor::new(wire);

        let outcome = receive_request(&mut cursor, || true).unwrap();
        assert_eq!(
            outcome,
            RecvOutcome::Complete(ReceivedBody {
                declared_len: 5,
                body: b"HELLO".to_vec(),
            })
        );
    }

    #[test]
    fn idle_on_clean_close_before_header() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let outcome = receive_request(&mut cursor, || true).unwrap();
        assert_eq!(outcome, RecvOutcome::Idle);
    }

    #[test]
    fn truncated_when_peer_closes_mid_body() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&100u32.to_be_bytes());
        wire.extend_from_slice(&[0xABu8; 50]);
        let mut cursor = Cursor::new(wire);

        let outcome = receive_request(&mut cursor, || true).unwrap();
        match outcome {
            RecvOutcome::Truncated(body) => {
                assert_eq!(body.declared_len, 100);
                assert_eq!(body.body.len(), 50);
                assert!(body.body.len() < body.declared_len as usize);
            }
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn terminates_before_touching_the_wire_when_told_to_stop() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&5u32.to_be_bytes());
        wire.extend_from_slice(b"HELLO");
        let mut cursor = Cursor::new(wire);

        let outcome = receive_request(&mut cursor, || false).unwrap();
        assert_eq!(outcome, RecvOutcome::Terminated);
    }

    #[test]
    fn reply_round_trips_received_byte_count() {
        let mut buf = Vec::new();
        send_reply(&mut buf, 1024).unwrap();
        assert_eq!(buf, 1024u32.to_be_bytes());
    }

    #[test]
    fn opcode_values_match_wire_contract() {
        assert_eq!(ControlOpcode::Start.to_be_bytes(), [0x00, 0x01]);
        assert_eq!(ControlOpcode::Stop.to_be_bytes(), [0x00, 0x02]);
        assert_eq!(ControlOpcode::from_be_bytes([0, 1]), Ok(ControlOpcode::Start));
        assert_eq!(ControlOpcode::from_be_bytes([0, 2]), Ok(ControlOpcode::Stop));
        assert_eq!(ControlOpcode::from_be_bytes([0, 9]), Err(9));
    }

    #[test]
    fn send_request_then_receive_reply_round_trips_through_a_buffer() {
        let mut wire = Vec::new();
        send_request(&mut wire, b"HELLO").unwrap();
        let mut cursor = Cursor::new(wire);
        let outcome = receive_request(&mut cursor, || true).unwrap();
        assert_eq!(
            outcome,
            RecvOutcome::Complete(ReceivedBody {
                declared_len: 5,
                body: b"HELLO".to_vec(),
            })
        );

        let mut reply_wire = Vec::new();
        send_reply(&mut reply_wire, 5).unwrap();
        let mut reply_cursor = Cursor::new(reply_wire);
        assert_eq!(receive_reply(&mut reply_cursor).unwrap(), 5);
    }

    #[test]
    fn read_opcode_rejects_unknown_values() {
        let mut cursor = Cursor::new(9u16.to_be_bytes().to_vec());
        assert_eq!(read_opcode(&mut cursor).unwrap(), Err(9));
    }

    #[test]
    fn payload_record_round_trips() {
        let record = PayloadRecord {
            server_port: 5000,
            server_ip: "127.0.0.1".to_string(),
            data: vec![1, 2, 3, 4, 5],
        };
        let mut buf = Vec::new();
        record.write_to(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = PayloadRecord::read_from(&mut cursor).unwrap();
        assert_eq!(decoded, record);
    }
}
