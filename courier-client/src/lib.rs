//! # courier-client
//!
//! Client library for courier, a subject-based publish/subscribe messaging
//! system.
//!
//! This crate provides:
//! - Async TCP client with a synchronous handshake and three background
//!   loops (read, write-flush, keepalive)
//! - Publish/subscribe with queue groups and auto-unsubscribe
//! - Request/reply over ephemeral inbox subjects
//! - Reconnection with endpoint failover and subscription replay
//! - Optional TLS support

pub mod client;
pub mod connection;
pub mod error;
pub mod options;
pub mod stream;
pub mod tls;

mod pending;
mod server_pool;
mod subscription;

pub use client::Client;
pub use connection::{Stats, Status};
pub use error::ClientError;
pub use options::{Options, ServerAddr, SubscribeOptions, TlsConfig};

pub use courier_protocol::{HeaderMap, Message, ServerInfo};
