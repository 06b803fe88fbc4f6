//! Protocol error types.

use thiserror::Error;

/// Errors raised while scanning or encoding the courier wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown protocol operation: {0}")]
    UnknownOperation(String),

    #[error("malformed MSG header: {0}")]
    MalformedMsg(String),

    #[error("control line exceeds {max} bytes")]
    ControlLineTooLong { max: usize },

    #[error("message payload missing trailing CRLF")]
    BadPayloadTerminator,

    #[error("invalid UTF-8 in control line")]
    InvalidUtf8,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
