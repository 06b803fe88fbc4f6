//! Encoders for client-emitted wire commands.
//!
//! Every command is a CRLF-terminated text line; `PUB` additionally carries a
//! length-prefixed payload followed by its own CRLF. The encoded length of a
//! command is exactly what goes on the wire, so callers can account pending
//! bytes by buffer size alone.

use crate::error::ProtocolError;
use crate::info::ConnectInfo;
use bytes::{BufMut, BytesMut};

/// Encodes client commands into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes `CONNECT {json}\r\n`.
    pub fn encode_connect(info: &ConnectInfo) -> Result<BytesMut, ProtocolError> {
        let json = serde_json::to_vec(info)?;
        let mut buf = BytesMut::with_capacity(json.len() + 10);
        buf.put_slice(b"CONNECT ");
        buf.put_slice(&json);
        buf.put_slice(b"\r\n");
        Ok(buf)
    }

    /// Encodes `PUB <subject> [reply] <#bytes>\r\n<payload>\r\n`.
    pub fn encode_pub(subject: &str, reply: Option<&str>, payload: &[u8]) -> BytesMut {
        let reply_len = reply.map(|r| r.len() + 1).unwrap_or(0);
        let mut buf = BytesMut::with_capacity(subject.len() + reply_len + payload.len() + 20);
        buf.put_slice(b"PUB ");
        buf.put_slice(subject.as_bytes());
        if let Some(reply) = reply {
            buf.put_u8(b' ');
            buf.put_slice(reply.as_bytes());
        }
        buf.put_slice(format!(" {}\r\n", payload.len()).as_bytes());
        buf.put_slice(payload);
        buf.put_slice(b"\r\n");
        buf
    }

    /// Encodes `SUB <subject> [queue] <sid>\r\n`.
    pub fn encode_sub(subject: &str, queue: Option<&str>, sid: u64) -> BytesMut {
        let line = match queue {
            Some(queue) => format!("SUB {subject} {queue} {sid}\r\n"),
            None => format!("SUB {subject} {sid}\r\n"),
        };
        BytesMut::from(line.as_bytes())
    }

    /// Encodes `UNSUB <sid> [max]\r\n`.
    pub fn encode_unsub(sid: u64, max: Option<u64>) -> BytesMut {
        let line = match max {
            Some(max) => format!("UNSUB {sid} {max}\r\n"),
            None => format!("UNSUB {sid}\r\n"),
        };
        BytesMut::from(line.as_bytes())
    }

    /// Encodes `PING\r\n`.
    pub fn encode_ping() -> BytesMut {
        BytesMut::from(&b"PING\r\n"[..])
    }

    /// Encodes `PONG\r\n`.
    pub fn encode_pong() -> BytesMut {
        BytesMut::from(&b"PONG\r\n"[..])
    }
}
