//! The message value delivered to subscription handlers.

use bytes::Bytes;
use std::collections::HashMap;

/// Header map attached to a message.
///
/// The courier wire operations carry no headers; the field exists so layers
/// above the client engine share a single message shape.
pub type HeaderMap = HashMap<String, Vec<String>>;

/// A message delivered to a subscription, or returned from a request.
#[derive(Debug, Clone)]
pub struct Message {
    /// Subject the message was published to.
    pub subject: String,

    /// Reply subject for request/reply, if any.
    pub reply: Option<String>,

    /// Exact payload bytes, as framed by the sender.
    pub payload: Bytes,

    /// Optional headers. Always `None` at this protocol level.
    pub headers: Option<HeaderMap>,
}

impl Message {
    /// Creates a message with no reply subject and no headers.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            payload: payload.into(),
            headers: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_new() {
        let msg = Message::new("orders.created", &b"hello"[..]);
        assert_eq!(msg.subject, "orders.created");
        assert!(msg.reply.is_none());
        assert_eq!(&msg.payload[..], b"hello");
        assert!(msg.headers.is_none());
    }
}
