//! Endpoint pool bookkeeping for connect and failover.

use crate::error::ClientError;
use crate::options::ServerAddr;
use courier_protocol::DEFAULT_PORT;
use rand::seq::SliceRandom;
use std::collections::VecDeque;

/// A candidate endpoint and its connection history.
#[derive(Debug, Clone)]
pub(crate) struct ServerEntry {
    pub addr: ServerAddr,
    /// The endpoint completed a handshake at least once.
    pub was_connected: bool,
    /// Consecutive failed attempts since the last successful handshake.
    pub reconnect_attempts: u32,
    /// The endpoint announced `auth_required` in its INFO.
    pub auth_required: bool,
    /// The endpoint sent a hard server error; it is never retried.
    pub error_received: bool,
}

impl ServerEntry {
    fn new(addr: ServerAddr) -> Self {
        Self {
            addr,
            was_connected: false,
            reconnect_attempts: 0,
            auth_required: false,
            error_received: false,
        }
    }
}

/// Ordered pool of candidate endpoints. The front entry is the current (or
/// next) connection target.
#[derive(Debug)]
pub(crate) struct ServerPool {
    entries: VecDeque<ServerEntry>,
}

impl ServerPool {
    pub fn empty() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Builds a pool from configured URLs, falling back to localhost when the
    /// list is empty. Order is shuffled unless `randomize` is off.
    pub fn from_urls<S: AsRef<str>>(urls: &[S], randomize: bool) -> Result<Self, ClientError> {
        let mut entries = Vec::with_capacity(urls.len().max(1));
        if urls.is_empty() {
            entries.push(ServerEntry::new(ServerAddr {
                host: "127.0.0.1".to_string(),
                port: DEFAULT_PORT,
                user: None,
                pass: None,
                token: None,
            }));
        }
        for url in urls {
            entries.push(ServerEntry::new(ServerAddr::parse(url.as_ref())?));
        }
        if randomize {
            entries.shuffle(&mut rand::thread_rng());
        }
        Ok(Self {
            entries: entries.into(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The current connection target.
    pub fn current(&self) -> Option<&ServerEntry> {
        self.entries.front()
    }

    pub fn current_mut(&mut self) -> Option<&mut ServerEntry> {
        self.entries.front_mut()
    }

    /// Drops the current endpoint from the front and selects the next target.
    ///
    /// The dropped endpoint is re-appended at the back only when re-appending
    /// is allowed at all, it has not received a hard server error, and its
    /// attempt count is within budget (or the budget is unlimited).
    pub fn rotate(&mut self, reappend: bool, unlimited: bool, max_attempts: u32) {
        if let Some(entry) = self.entries.pop_front() {
            let keep = reappend
                && !entry.error_received
                && (unlimited || entry.reconnect_attempts <= max_attempts);
            if keep {
                self.entries.push_back(entry);
            }
        }
    }
}
