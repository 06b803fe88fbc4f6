//! # courier-protocol
//!
//! Wire protocol implementation for courier, a subject-based
//! publish/subscribe messaging system.
//!
//! This crate provides:
//! - Incremental parsing of server-emitted operations (`INFO`, `MSG`, `+OK`,
//!   `-ERR`, `PING`, `PONG`) tolerant of arbitrary chunk boundaries
//! - Encoding of client-emitted commands (`CONNECT`, `PUB`, `SUB`, `UNSUB`,
//!   `PING`, `PONG`)
//! - Handshake JSON bodies and the message value type

pub mod command;
pub mod error;
pub mod info;
pub mod message;
pub mod parser;

pub use command::Encoder;
pub use error::ProtocolError;
pub use info::{ConnectInfo, ServerInfo};
pub use message::{HeaderMap, Message};
pub use parser::{OpHandler, Parser, MAX_CONTROL_LINE};

/// Protocol version the client advertises in `CONNECT`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default port for courier servers.
pub const DEFAULT_PORT: u16 = 4222;
