//! Stateful scanner for server-emitted protocol operations.
//!
//! The parser accumulates raw transport bytes and recognizes one operation at
//! a time at the head of its buffer, invoking exactly one [`OpHandler`]
//! callback per complete operation. Operation boundaries may be split
//! arbitrarily across input chunks, including inside a `MSG` payload or the
//! trailing CRLF; partial input consumes nothing and is retried on the next
//! call.

use crate::error::ProtocolError;
use crate::info::ServerInfo;
use bytes::{Buf, Bytes, BytesMut};

/// Maximum accepted control line length in bytes.
///
/// A control line that grows past this without a terminating CRLF is a
/// protocol error; `MSG` payloads are not subject to the limit.
pub const MAX_CONTROL_LINE: usize = 4096;

/// Callbacks invoked by [`Parser::parse`], one per recognized operation.
pub trait OpHandler {
    /// Server `INFO {json}` line.
    fn on_info(&mut self, info: ServerInfo);

    /// A complete `MSG` frame. `payload` is the exact byte range announced by
    /// the header; it may contain any bytes, CR/LF included.
    fn on_msg(&mut self, subject: &str, sid: u64, reply: Option<&str>, payload: Bytes);

    /// Server `+OK` acknowledgement (verbose mode).
    fn on_ok(&mut self) {}

    /// Server `-ERR '<text>'` line, quotes stripped.
    fn on_err(&mut self, message: &str);

    /// Server `PING`.
    fn on_ping(&mut self);

    /// Server `PONG`.
    fn on_pong(&mut self);

    /// A complete line that matched no known operation.
    fn on_unknown(&mut self, line: &str);
}

enum ParseState {
    /// Scanning for the next CRLF-terminated control line.
    ControlLine,
    /// A `MSG` header has been consumed; waiting for `payload_len` bytes plus
    /// the trailing CRLF.
    MsgPayload {
        subject: String,
        sid: u64,
        reply: Option<String>,
        payload_len: usize,
    },
}

/// Incremental protocol parser.
pub struct Parser {
    buf: BytesMut,
    state: ParseState,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            state: ParseState::ControlLine,
        }
    }

    /// Appends `input` and scans for complete operations, invoking one
    /// handler callback per operation until only a partial operation remains
    /// buffered.
    ///
    /// On error the buffer and phase are left untouched; recovery is the
    /// caller's decision via [`Parser::reset`].
    pub fn parse<H: OpHandler>(&mut self, input: &[u8], handler: &mut H) -> Result<(), ProtocolError> {
        self.buf.extend_from_slice(input);
        loop {
            match self.state {
                ParseState::ControlLine => {
                    let Some(line_end) = find_crlf(&self.buf) else {
                        if self.buf.len() > MAX_CONTROL_LINE {
                            return Err(ProtocolError::ControlLineTooLong {
                                max: MAX_CONTROL_LINE,
                            });
                        }
                        return Ok(());
                    };
                    let line = self.buf.split_to(line_end);
                    self.buf.advance(2);
                    let line =
                        std::str::from_utf8(&line).map_err(|_| ProtocolError::InvalidUtf8)?;
                    self.control_line(line, handler)?;
                }
                ParseState::MsgPayload { payload_len, .. } => {
                    if self.buf.len() < payload_len + 2 {
                        return Ok(());
                    }
                    let payload = self.buf.split_to(payload_len).freeze();
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ProtocolError::BadPayloadTerminator);
                    }
                    self.buf.advance(2);
                    let ParseState::MsgPayload {
                        subject, sid, reply, ..
                    } = std::mem::replace(&mut self.state, ParseState::ControlLine)
                    else {
                        unreachable!()
                    };
                    handler.on_msg(&subject, sid, reply.as_deref(), payload);
                }
            }
        }
    }

    /// Clears the buffer and phase. Called on protocol error or reconnect,
    /// never spontaneously mid-message.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = ParseState::ControlLine;
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn control_line<H: OpHandler>(
        &mut self,
        line: &str,
        handler: &mut H,
    ) -> Result<(), ProtocolError> {
        let (op, args) = match line.find([' ', '\t']) {
            Some(i) => (&line[..i], line[i + 1..].trim()),
            None => (line, ""),
        };
        if op.eq_ignore_ascii_case("MSG") {
            self.state = msg_args(line, args)?;
        } else if op.eq_ignore_ascii_case("INFO") {
            handler.on_info(serde_json::from_str(args)?);
        } else if op.eq_ignore_ascii_case("PING") {
            handler.on_ping();
        } else if op.eq_ignore_ascii_case("PONG") {
            handler.on_pong();
        } else if op.eq_ignore_ascii_case("+OK") {
            handler.on_ok();
        } else if op.eq_ignore_ascii_case("-ERR") {
            handler.on_err(args.trim_matches('\''));
        } else {
            handler.on_unknown(line);
        }
        Ok(())
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes `MSG <subject> <sid> [reply] <#bytes>` header arguments.
fn msg_args(line: &str, args: &str) -> Result<ParseState, ProtocolError> {
    let malformed = || ProtocolError::MalformedMsg(line.to_string());

    let mut parts = args.split_ascii_whitespace();
    let subject = parts.next().ok_or_else(malformed)?;
    let sid = parts.next().ok_or_else(malformed)?;
    let third = parts.next().ok_or_else(malformed)?;
    let fourth = parts.next();
    if parts.next().is_some() {
        return Err(malformed());
    }

    let sid: u64 = sid.parse().map_err(|_| malformed())?;
    let (reply, len) = match fourth {
        Some(len) => (Some(third.to_string()), len),
        None => (None, third),
    };
    let payload_len: usize = len.parse().map_err(|_| malformed())?;

    Ok(ParseState::MsgPayload {
        subject: subject.to_string(),
        sid,
        reply,
        payload_len,
    })
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
