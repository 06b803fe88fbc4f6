//! Connection state machine and background loops.
//!
//! A [`Connection`] owns the subscription registry, the outbound pipeline,
//! and the parser, and holds the current transport's write half. After a
//! successful handshake three tasks run until transport loss or close: a read
//! loop feeding the parser, a writer draining the pending queue, and a
//! keepalive timer. All fatal I/O and protocol errors funnel through
//! [`Connection::process_op_err`], the single place that moves status away
//! from `Connected`.

use crate::error::ClientError;
use crate::options::{EventCallback, Options, ServerAddr, SubscribeOptions};
use crate::pending::Pending;
use crate::server_pool::{ServerEntry, ServerPool};
use crate::stream::Transport;
use crate::subscription::{Deliver, DeliverOutcome, Registry, SubEntry};
use bytes::{BufMut, Bytes, BytesMut};
use courier_protocol::{
    ConnectInfo, Encoder, Message, OpHandler, Parser, ProtocolError, ServerInfo, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Connection lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Point-in-time snapshot of the connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    in_msgs: AtomicU64,
    out_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    reconnects: AtomicU64,
}

/// State guarded by the single client lock. Held only for state transitions
/// and structural mutation, never across I/O or handler invocations.
struct ConnState {
    status: Status,
    pool: ServerPool,
    server_info: Option<ServerInfo>,
    subs: Registry,
    pending: Pending,
    /// FIFO of PING round trips in flight. `Some` entries belong to flush
    /// callers; `None` entries to the keepalive timer.
    pongs: VecDeque<Option<oneshot::Sender<()>>>,
    pings_outstanding: u32,
    last_error: Option<Arc<ClientError>>,
    flush_tx: Option<mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

/// A connection to a courier server pool.
pub(crate) struct Connection {
    opts: Options,
    state: Mutex<ConnState>,
    /// Write half of the current transport, replaced wholesale on reconnect.
    writer: tokio::sync::Mutex<Option<WriteHalf<Transport>>>,
    stats: StatsInner,
    next_sid: AtomicU64,
}

/// Result of a completed handshake, ready to be installed.
struct Handshake {
    stream: Transport,
    info: ServerInfo,
    parser: Parser,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(opts: Options) -> Self {
        Self {
            opts,
            state: Mutex::new(ConnState {
                status: Status::Disconnected,
                pool: ServerPool::empty(),
                server_info: None,
                subs: Registry::default(),
                pending: Pending::new(),
                pongs: VecDeque::new(),
                pings_outstanding: 0,
                last_error: None,
                flush_tx: None,
                tasks: Vec::new(),
            }),
            writer: tokio::sync::Mutex::new(None),
            stats: StatsInner::default(),
            next_sid: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    // =========================================================================
    // Connect
    // =========================================================================

    /// Connects to the first reachable endpoint in the pool, rotating on
    /// failure. A terminal authorization error aborts the walk immediately.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        let pool = ServerPool::from_urls(&self.opts.servers, !self.opts.dont_randomize_servers)?;
        {
            let mut st = self.state.lock();
            match st.status {
                Status::Disconnected => {}
                Status::Closed => return Err(ClientError::ConnectionClosed),
                _ => return Ok(()),
            }
            st.status = Status::Connecting;
            st.last_error = None;
            st.pool = pool;
        }

        let (unlimited, max_attempts) = self.reconnect_policy();
        loop {
            let target = { self.state.lock().pool.current().cloned() };
            let Some(target) = target else {
                let mut st = self.state.lock();
                st.status = Status::Disconnected;
                if st.last_error.is_none() {
                    st.last_error = Some(Arc::new(ClientError::NoServers));
                }
                return Err(ClientError::NoServers);
            };

            match self.try_endpoint(&target).await {
                Ok(handshake) => {
                    self.install(handshake, false).await?;
                    tracing::debug!(server = %target.addr, "connected");
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(server = %target.addr, error = %err, "connect attempt failed");
                    let auth_failure = match &err {
                        ClientError::Auth(message) => Some(message.clone()),
                        _ => None,
                    };
                    {
                        let mut st = self.state.lock();
                        st.last_error = Some(Arc::new(err));
                        if let Some(current) = st.pool.current_mut() {
                            current.reconnect_attempts += 1;
                            if auth_failure.is_some() {
                                current.error_received = true;
                            }
                        }
                        st.pool.rotate(self.opts.reconnect, unlimited, max_attempts);
                        if auth_failure.is_some() {
                            st.status = Status::Disconnected;
                        }
                    }
                    // a terminal authorization error aborts the walk
                    if let Some(message) = auth_failure {
                        return Err(ClientError::Auth(message));
                    }
                }
            }
        }
    }

    fn reconnect_policy(&self) -> (bool, u32) {
        let unlimited = self.opts.max_reconnect_attempts < 0;
        (unlimited, self.opts.max_reconnect_attempts.max(0) as u32)
    }

    /// Opens a transport to one endpoint and runs the full handshake, all
    /// bounded by the connect timeout.
    async fn try_endpoint(&self, target: &ServerEntry) -> Result<Handshake, ClientError> {
        tracing::debug!(server = %target.addr, "connecting");
        let stream = Transport::connect(
            &target.addr,
            self.opts.tls.as_ref(),
            self.opts.connect_timeout,
        )
        .await?;

        tokio::time::timeout(self.opts.connect_timeout, self.handshake(stream, target))
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    /// INFO -> CONNECT -> [+OK] -> PING -> PONG, performed synchronously
    /// before any background activity starts.
    async fn handshake(
        &self,
        mut stream: Transport,
        target: &ServerEntry,
    ) -> Result<Handshake, ClientError> {
        let mut parser = Parser::new();
        let mut ops = HandshakeOps::default();
        let buf_size = self.opts.read_buffer_size;

        let info = match read_op(&mut stream, &mut parser, &mut ops, buf_size).await? {
            HsOp::Info(info) => *info,
            HsOp::Err(e) => return Err(ClientError::from_server_err(&e)),
            other => {
                return Err(ClientError::Connect(format!("expected INFO, got {other:?}")));
            }
        };
        if info.tls_required && !self.tls_enabled() {
            return Err(ClientError::Connect(
                "server requires a secured transport".to_string(),
            ));
        }

        let connect = Encoder::encode_connect(&self.connect_info(target))?;
        stream.write_all(&connect).await.map_err(ClientError::Io)?;

        if self.opts.verbose {
            match read_op(&mut stream, &mut parser, &mut ops, buf_size).await? {
                HsOp::Ok => {}
                HsOp::Err(e) => return Err(ClientError::from_server_err(&e)),
                other => {
                    return Err(ClientError::Connect(format!("expected +OK, got {other:?}")));
                }
            }
        }

        stream
            .write_all(&Encoder::encode_ping())
            .await
            .map_err(ClientError::Io)?;
        loop {
            match read_op(&mut stream, &mut parser, &mut ops, buf_size).await? {
                HsOp::Pong => break,
                HsOp::Ping => {
                    stream
                        .write_all(&Encoder::encode_pong())
                        .await
                        .map_err(ClientError::Io)?;
                }
                HsOp::Err(e) => return Err(ClientError::from_server_err(&e)),
                other => {
                    return Err(ClientError::Connect(format!("expected PONG, got {other:?}")));
                }
            }
        }

        tracing::debug!(server_id = %info.server_id, "handshake complete");
        Ok(Handshake {
            stream,
            info,
            parser,
        })
    }

    fn tls_enabled(&self) -> bool {
        self.opts.tls.as_ref().is_some_and(|t| t.enabled)
    }

    fn connect_info(&self, target: &ServerEntry) -> ConnectInfo {
        ConnectInfo {
            verbose: self.opts.verbose,
            pedantic: self.opts.pedantic,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
            name: self.opts.name.clone(),
            user: target.addr.user.clone().or_else(|| self.opts.user.clone()),
            pass: target.addr.pass.clone().or_else(|| self.opts.pass.clone()),
            auth_token: target.addr.token.clone().or_else(|| self.opts.token.clone()),
            tls_required: self.opts.tls.as_ref().map(|t| t.enabled),
        }
    }

    /// Installs a completed handshake: replays registered subscriptions,
    /// hands the transport to fresh background tasks, and marks the
    /// connection usable.
    async fn install(self: &Arc<Self>, handshake: Handshake, reconnecting: bool) -> Result<(), ClientError> {
        let Handshake {
            mut stream,
            info,
            parser,
        } = handshake;

        // Replay every registered subscription with its original sid so
        // application state referencing that id stays valid.
        let replay = {
            let st = self.state.lock();
            if st.status == Status::Closed {
                return Err(ClientError::ConnectionClosed);
            }
            let mut buf = BytesMut::new();
            for (sid, entry) in st.subs.iter() {
                buf.put_slice(&Encoder::encode_sub(
                    &entry.subject,
                    entry.queue_group.as_deref(),
                    *sid,
                ));
                if let Some(remaining) = entry.remaining() {
                    buf.put_slice(&Encoder::encode_unsub(*sid, Some(remaining)));
                }
            }
            buf
        };
        if !replay.is_empty() {
            stream.write_all(&replay).await.map_err(ClientError::Io)?;
        }

        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);

        let (flush_tx, flush_rx) = mpsc::channel(1);
        let auth_required = info.auth_required;
        let has_pending = {
            let mut st = self.state.lock();
            st.status = Status::Connected;
            st.server_info = Some(info);
            st.pings_outstanding = 0;
            st.flush_tx = Some(flush_tx.clone());
            if let Some(current) = st.pool.current_mut() {
                current.was_connected = true;
                current.reconnect_attempts = 0;
                current.auth_required = auth_required;
            }
            st.tasks = vec![
                self.spawn_reader(read_half, parser),
                self.spawn_writer(flush_rx),
                self.spawn_keepalive(),
            ];
            !st.pending.is_empty()
        };

        if reconnecting {
            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            self.fire(&self.opts.on_reconnect);
        }
        if has_pending {
            // flush whatever queued while the transport was down
            let _ = flush_tx.try_send(());
        }
        Ok(())
    }

    // =========================================================================
    // Public operations
    // =========================================================================

    /// Queues a `PUB` and wakes the writer, draining inline past the
    /// backpressure ceiling.
    pub async fn publish(
        self: &Arc<Self>,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
    ) -> Result<(), ClientError> {
        let cmd = Encoder::encode_pub(subject, reply, payload).freeze();
        {
            let mut st = self.state.lock();
            match st.status {
                Status::Closed => return Err(ClientError::ConnectionClosed),
                Status::Disconnected => return Err(ClientError::NotConnected),
                _ => {}
            }
            if let Some(info) = &st.server_info {
                if payload.len() > info.max_payload {
                    return Err(ClientError::MaxPayloadExceeded {
                        size: payload.len(),
                        max: info.max_payload,
                    });
                }
            }
            st.pending.push(cmd);
        }
        self.stats.out_msgs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .out_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.kick_flush().await
    }

    /// Registers a subscription and emits `SUB` (plus the auto-unsubscribe
    /// bookkeeping when a max is set). Returns the subscription id.
    pub async fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        sub_opts: SubscribeOptions,
        handler: Box<dyn FnMut(Message) + Send>,
    ) -> Result<u64, ClientError> {
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel::<Message>(self.opts.subscription_capacity);

        // Dispatcher task: runs the handler without the state lock, strictly
        // in arrival order. Ends when the subscription is removed.
        let mut handler = handler;
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                handler(msg);
            }
        });

        {
            let mut st = self.state.lock();
            match st.status {
                Status::Closed => return Err(ClientError::ConnectionClosed),
                Status::Disconnected => return Err(ClientError::NotConnected),
                _ => {}
            }
            st.subs.insert(
                sid,
                SubEntry {
                    subject: subject.to_string(),
                    queue_group: sub_opts.queue.clone(),
                    received: 0,
                    max: sub_opts.max,
                    deliver: Deliver::Queue(tx),
                },
            );
            st.pending
                .push(Encoder::encode_sub(subject, sub_opts.queue.as_deref(), sid).freeze());
            if let Some(max) = sub_opts.max {
                st.pending.push(Encoder::encode_unsub(sid, Some(max)).freeze());
            }
        }
        self.kick_flush().await?;
        Ok(sid)
    }

    /// Emits `UNSUB <sid> [max]` and applies the registry bookkeeping.
    pub async fn unsubscribe(self: &Arc<Self>, sid: u64, max: Option<u64>) -> Result<(), ClientError> {
        {
            let mut st = self.state.lock();
            if st.status == Status::Closed {
                return Err(ClientError::ConnectionClosed);
            }
            if !st.subs.contains(sid) {
                return Ok(());
            }
            st.pending.push(Encoder::encode_unsub(sid, max).freeze());
            st.subs.apply_unsub(sid, max);
        }
        self.kick_flush().await
    }

    /// Publishes to `subject` with a unique inbox reply subject and blocks on
    /// the single expected delivery. The ephemeral subscription is removed
    /// afterward regardless of outcome.
    pub async fn request(
        self: &Arc<Self>,
        subject: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Message, ClientError> {
        let inbox = new_inbox();
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        {
            let mut st = self.state.lock();
            match st.status {
                Status::Closed => return Err(ClientError::ConnectionClosed),
                Status::Disconnected => return Err(ClientError::NotConnected),
                _ => {}
            }
            if let Some(info) = &st.server_info {
                if payload.len() > info.max_payload {
                    return Err(ClientError::MaxPayloadExceeded {
                        size: payload.len(),
                        max: info.max_payload,
                    });
                }
            }
            st.subs.insert(
                sid,
                SubEntry {
                    subject: inbox.clone(),
                    queue_group: None,
                    received: 0,
                    max: Some(1),
                    deliver: Deliver::Waiter(Some(tx)),
                },
            );
            st.pending.push(Encoder::encode_sub(&inbox, None, sid).freeze());
            st.pending.push(Encoder::encode_unsub(sid, Some(1)).freeze());
            st.pending
                .push(Encoder::encode_pub(subject, Some(&inbox), payload).freeze());
        }
        self.stats.out_msgs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .out_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.kick_flush().await?;

        let result = tokio::time::timeout(timeout, rx).await;

        {
            let mut st = self.state.lock();
            if st.subs.remove(sid).is_some() && st.status != Status::Closed {
                st.pending.push(Encoder::encode_unsub(sid, None).freeze());
            }
        }
        let _ = self.kick_flush().await;

        match result {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Round trip to the server: queues a `PING`, registers a FIFO waiter,
    /// and blocks until the matching `PONG` or the timeout. A late PONG still
    /// pops the expired waiter so ordering stays intact for later callers.
    pub async fn flush(self: &Arc<Self>, timeout: Duration) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.state.lock();
            match st.status {
                Status::Closed => return Err(ClientError::ConnectionClosed),
                Status::Disconnected => return Err(ClientError::NotConnected),
                _ => {}
            }
            st.pending.push(Encoder::encode_ping().freeze());
            st.pongs.push_back(Some(tx));
        }
        self.kick_flush().await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Closes the connection. Terminal: outstanding waiters are resolved,
    /// background tasks stopped, and the close callback fired exactly once.
    pub async fn close(self: &Arc<Self>) -> Result<(), ClientError> {
        let tasks = {
            let mut st = self.state.lock();
            if st.status == Status::Closed {
                return Ok(());
            }
            st.status = Status::Closed;
            st.flush_tx = None;
            std::mem::take(&mut st.tasks)
        };
        for task in tasks {
            task.abort();
        }
        // best-effort write of anything still queued
        let _ = self.drain_pending().await;
        self.finalize_close().await;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    pub fn stats(&self) -> Stats {
        Stats {
            in_msgs: self.stats.in_msgs.load(Ordering::Relaxed),
            out_msgs: self.stats.out_msgs.load(Ordering::Relaxed),
            in_bytes: self.stats.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.stats.out_bytes.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
        }
    }

    /// The most recent fatal error, retained until the next connect attempt.
    pub fn last_error(&self) -> Option<Arc<ClientError>> {
        self.state.lock().last_error.clone()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.state.lock().server_info.clone()
    }

    /// Address of the current (or next) endpoint.
    pub fn connected_server(&self) -> Option<ServerAddr> {
        self.state.lock().pool.current().map(|e| e.addr.clone())
    }

    #[cfg(test)]
    pub(crate) fn pending_bytes(&self) -> usize {
        self.state.lock().pending.size()
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        self.state.lock().subs.len()
    }

    // =========================================================================
    // Outbound pipeline
    // =========================================================================

    /// Post-enqueue accounting: reports fast producers, drains inline past
    /// the flush ceiling, otherwise wakes the writer.
    async fn kick_flush(self: &Arc<Self>) -> Result<(), ClientError> {
        let (size, flush_tx) = {
            let st = self.state.lock();
            (st.pending.size(), st.flush_tx.clone())
        };

        if size > self.opts.pending_size_limit {
            if let Some(tx) = flush_tx {
                let _ = tx.try_send(());
            }
            let err = ClientError::FastProducer { pending: size };
            self.report_error(&err);
            return Err(err);
        }

        if size > self.opts.pending_flush_limit {
            // backpressure valve: the producer drains instead of letting the
            // queue grow unbounded
            if let Err(err) = self.drain_pending().await {
                self.process_op_err(err);
                return Err(ClientError::ConnectionClosed);
            }
        } else if let Some(tx) = flush_tx {
            let _ = tx.try_send(());
        }
        Ok(())
    }

    /// Writes everything queued as one transport write. A missing transport
    /// leaves commands queued for the next reconnect.
    async fn drain_pending(&self) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        let Some(w) = writer.as_mut() else {
            return Ok(());
        };
        loop {
            let Some(buf) = ({
                let mut st = self.state.lock();
                st.pending.take()
            }) else {
                return Ok(());
            };
            w.write_all(&buf).await.map_err(ClientError::Io)?;
        }
    }

    fn spawn_writer(self: &Arc<Self>, mut flush_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            while flush_rx.recv().await.is_some() {
                if let Err(err) = conn.drain_pending().await {
                    conn.process_op_err(err);
                    return;
                }
            }
        })
    }

    // =========================================================================
    // Read loop and dispatch
    // =========================================================================

    fn spawn_reader(self: &Arc<Self>, mut reader: ReadHalf<Transport>, mut parser: Parser) -> JoinHandle<()> {
        let conn = Arc::clone(self);
        let buf_size = self.opts.read_buffer_size;
        tokio::spawn(async move {
            let mut buf = vec![0u8; buf_size];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        conn.process_op_err(ClientError::ConnectionClosed);
                        return;
                    }
                    Ok(n) => {
                        let mut sink = LiveOps {
                            conn: &conn,
                            fatal: None,
                        };
                        let parsed = parser.parse(&buf[..n], &mut sink);
                        let fatal = sink.fatal.take();
                        if let Err(e) = parsed {
                            conn.process_op_err(ClientError::Protocol(e));
                            return;
                        }
                        if let Some(err) = fatal {
                            conn.process_op_err(err);
                            return;
                        }
                    }
                    Err(e) => {
                        conn.process_op_err(ClientError::Io(e));
                        return;
                    }
                }
            }
        })
    }

    /// Hands a `MSG` to its subscription. Unknown sids are dropped silently;
    /// they cover messages in flight for an already-unsubscribed id.
    fn dispatch(&self, subject: &str, sid: u64, reply: Option<&str>, payload: Bytes) {
        self.stats.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .in_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);

        let msg = Message {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
            headers: None,
        };
        let outcome = self.state.lock().subs.deliver(sid, msg);
        match outcome {
            DeliverOutcome::Delivered => {}
            DeliverOutcome::NoSubscription => {
                tracing::trace!(sid, "dropping message for unknown sid");
            }
            DeliverOutcome::QueueFull => {
                tracing::warn!(sid, subject, "subscription queue full, message dropped");
            }
        }
    }

    fn enqueue_pong(&self) {
        let flush_tx = {
            let mut st = self.state.lock();
            st.pending.push(Encoder::encode_pong().freeze());
            st.flush_tx.clone()
        };
        if let Some(tx) = flush_tx {
            let _ = tx.try_send(());
        }
    }

    /// Resolves the oldest open PING/flush waiter, strictly FIFO.
    fn handle_pong(&self) {
        let waiter = {
            let mut st = self.state.lock();
            st.pings_outstanding = st.pings_outstanding.saturating_sub(1);
            st.pongs.pop_front()
        };
        if let Some(Some(tx)) = waiter {
            let _ = tx.send(());
        }
    }

    // =========================================================================
    // Keepalive
    // =========================================================================

    fn spawn_keepalive(self: &Arc<Self>) -> JoinHandle<()> {
        let conn = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(conn.opts.ping_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                let outcome = {
                    let mut st = conn.state.lock();
                    if st.status != Status::Connected {
                        return;
                    }
                    if st.pings_outstanding >= conn.opts.max_outstanding_pings {
                        Err(st.pings_outstanding)
                    } else {
                        st.pings_outstanding += 1;
                        st.pongs.push_back(None);
                        st.pending.push(Encoder::encode_ping().freeze());
                        Ok(st.flush_tx.clone())
                    }
                };
                match outcome {
                    Ok(flush_tx) => {
                        if let Some(tx) = flush_tx {
                            let _ = tx.try_send(());
                        }
                    }
                    Err(outstanding) => {
                        tracing::warn!(outstanding, "stale connection, no PONG received");
                        conn.process_op_err(ClientError::StaleConnection { outstanding });
                        return;
                    }
                }
            }
        })
    }

    // =========================================================================
    // Error funnel, reconnect, close
    // =========================================================================

    /// Single funnel for fatal errors. Errors observed while already
    /// connecting, reconnecting, or closed were handled by whoever got there
    /// first and are ignored.
    fn process_op_err(self: &Arc<Self>, err: ClientError) {
        let err = Arc::new(err);
        enum Next {
            Reconnect(Vec<JoinHandle<()>>),
            Close(Vec<JoinHandle<()>>),
        }
        let next = {
            let mut st = self.state.lock();
            if st.status != Status::Connected {
                tracing::debug!(error = %err, "error while not connected, already handled");
                return;
            }
            st.last_error = Some(Arc::clone(&err));
            st.flush_tx = None;
            let tasks = std::mem::take(&mut st.tasks);
            if self.opts.reconnect {
                st.status = Status::Reconnecting;
                Next::Reconnect(tasks)
            } else {
                st.status = Status::Closed;
                Next::Close(tasks)
            }
        };
        self.report_error(&err);

        match next {
            Next::Reconnect(tasks) => {
                tracing::warn!(error = %err, "connection lost, reconnecting");
                self.fire(&self.opts.on_disconnect);
                let conn = Arc::clone(self);
                tokio::spawn(async move {
                    for task in tasks {
                        task.abort();
                    }
                    *conn.writer.lock().await = None;
                    conn.reconnect_loop().await;
                });
            }
            Next::Close(tasks) => {
                tracing::error!(error = %err, "connection lost, closing");
                self.fire(&self.opts.on_disconnect);
                let conn = Arc::clone(self);
                tokio::spawn(async move {
                    for task in tasks {
                        task.abort();
                    }
                    conn.finalize_close().await;
                });
            }
        }
    }

    /// Walks the pool until an endpoint completes a handshake or the pool
    /// drains. On success subscriptions are replayed and outage-queued
    /// commands flushed; on exhaustion the connection closes terminally with
    /// the sticky last error preserved.
    async fn reconnect_loop(self: Arc<Self>) {
        let (unlimited, max_attempts) = self.reconnect_policy();
        loop {
            let target = {
                let mut st = self.state.lock();
                if st.status != Status::Reconnecting {
                    return;
                }
                st.pool.rotate(true, unlimited, max_attempts);
                match st.pool.current_mut() {
                    None => break,
                    Some(entry) => {
                        entry.reconnect_attempts += 1;
                        entry.clone()
                    }
                }
            };

            if target.was_connected {
                tokio::time::sleep(self.opts.reconnect_time_wait).await;
            }

            tracing::info!(
                server = %target.addr,
                attempt = target.reconnect_attempts,
                "reconnect attempt"
            );
            let attempt = match self.try_endpoint(&target).await {
                Ok(handshake) => self.install(handshake, true).await,
                Err(err) => Err(err),
            };
            match attempt {
                Ok(()) => {
                    tracing::info!(server = %target.addr, "reconnected");
                    return;
                }
                Err(err) => {
                    tracing::debug!(server = %target.addr, error = %err, "reconnect attempt failed");
                    let mut st = self.state.lock();
                    if matches!(err, ClientError::Auth(_)) {
                        if let Some(current) = st.pool.current_mut() {
                            current.error_received = true;
                        }
                    }
                    st.last_error = Some(Arc::new(err));
                }
            }
        }

        // pool exhausted: give up, preserving the sticky last error
        tracing::error!("no servers remaining, giving up");
        let already_closed = {
            let mut st = self.state.lock();
            if st.status == Status::Closed {
                true
            } else {
                st.status = Status::Closed;
                false
            }
        };
        if !already_closed {
            self.finalize_close().await;
        }
    }

    /// Terminal teardown: releases the transport, clears registry and
    /// pending, force-resolves every outstanding waiter, and fires the close
    /// callback.
    async fn finalize_close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        {
            let mut st = self.state.lock();
            st.subs.clear();
            st.pending.clear();
            // dropping the senders wakes every blocked flush and request
            st.pongs.clear();
            st.pings_outstanding = 0;
            st.flush_tx = None;
        }
        self.fire(&self.opts.on_close);
    }

    fn report_error(&self, err: &ClientError) {
        match &self.opts.on_error {
            Some(cb) => cb(err),
            None => tracing::error!(error = %err, "connection error"),
        }
    }

    fn fire(&self, cb: &Option<EventCallback>) {
        if let Some(cb) = cb {
            cb();
        }
    }
}

/// Returns a unique inbox subject for request/reply.
pub(crate) fn new_inbox() -> String {
    format!("_INBOX.{}", uuid::Uuid::new_v4().simple())
}

// =============================================================================
// Parser sinks
// =============================================================================

/// Handler for the live read loop: dispatches messages, answers pings,
/// resolves pong waiters, and records fatal server/protocol conditions.
struct LiveOps<'a> {
    conn: &'a Connection,
    fatal: Option<ClientError>,
}

impl OpHandler for LiveOps<'_> {
    fn on_info(&mut self, info: ServerInfo) {
        self.conn.state.lock().server_info = Some(info);
    }

    fn on_msg(&mut self, subject: &str, sid: u64, reply: Option<&str>, payload: Bytes) {
        self.conn.dispatch(subject, sid, reply, payload);
    }

    fn on_err(&mut self, message: &str) {
        if self.fatal.is_none() {
            let err = ClientError::from_server_err(message);
            if matches!(err, ClientError::Auth(_)) {
                // a terminal authorization error evicts the endpoint
                if let Some(current) = self.conn.state.lock().pool.current_mut() {
                    current.error_received = true;
                }
            }
            self.fatal = Some(err);
        }
    }

    fn on_ping(&mut self) {
        self.conn.enqueue_pong();
    }

    fn on_pong(&mut self) {
        self.conn.handle_pong();
    }

    fn on_unknown(&mut self, line: &str) {
        if self.fatal.is_none() {
            self.fatal = Some(ClientError::Protocol(ProtocolError::UnknownOperation(
                line.to_string(),
            )));
        }
    }
}

/// Handler used during the synchronous handshake; operations are queued and
/// consumed in sequence by [`read_op`].
#[derive(Debug)]
enum HsOp {
    Info(Box<ServerInfo>),
    Msg,
    Ok,
    Err(String),
    Ping,
    Pong,
    Unknown(String),
}

#[derive(Default)]
struct HandshakeOps {
    ops: VecDeque<HsOp>,
}

impl OpHandler for HandshakeOps {
    fn on_info(&mut self, info: ServerInfo) {
        self.ops.push_back(HsOp::Info(Box::new(info)));
    }

    fn on_msg(&mut self, _subject: &str, _sid: u64, _reply: Option<&str>, _payload: Bytes) {
        self.ops.push_back(HsOp::Msg);
    }

    fn on_ok(&mut self) {
        self.ops.push_back(HsOp::Ok);
    }

    fn on_err(&mut self, message: &str) {
        self.ops.push_back(HsOp::Err(message.to_string()));
    }

    fn on_ping(&mut self) {
        self.ops.push_back(HsOp::Ping);
    }

    fn on_pong(&mut self) {
        self.ops.push_back(HsOp::Pong);
    }

    fn on_unknown(&mut self, line: &str) {
        self.ops.push_back(HsOp::Unknown(line.to_string()));
    }
}

async fn read_op(
    stream: &mut Transport,
    parser: &mut Parser,
    ops: &mut HandshakeOps,
    buf_size: usize,
) -> Result<HsOp, ClientError> {
    loop {
        if let Some(op) = ops.ops.pop_front() {
            return Ok(op);
        }
        let mut buf = vec![0u8; buf_size];
        let n = stream.read(&mut buf).await.map_err(ClientError::Io)?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        parser.parse(&buf[..n], ops)?;
    }
}
